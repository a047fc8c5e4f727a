//! Routes and their backends
//!
//! A route owns a set of weighted backends, the strategy that picks among
//! them, an optional switchover, and the loops that keep backend health
//! current. Request serving reads the pre-expanded target distribution
//! without taking a write lock.

mod backend;
pub mod proxy;
mod strategy;
mod switchover;

pub use backend::Backend;
pub use strategy::Strategy;
pub use switchover::{Switchover, SwitchoverStatus};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, Response};
use axum::response::IntoResponse;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::watch;
use url::Url;
use uuid::Uuid;

use crate::condition::{Condition, Operator};
use crate::error::{Error, Result};
use crate::metrics::{Repository, Sample};

use proxy::{ProxyRequest, UpstreamClient, UpstreamResponse};
use strategy::Selection;

/// Condition appended to every monitored backend of a health-checked route,
/// so transport failures feed the alert loop even without user thresholds.
fn implicit_transport_condition() -> Condition {
    Condition::new(
        "6xxRate",
        Operator::Greater,
        0.1,
        Duration::from_secs(5),
        Duration::from_secs(10),
    )
    .unwrap_or_else(|_| unreachable!("static condition is valid"))
}

struct Inner {
    backends: HashMap<Uuid, Arc<Backend>>,
    /// Flat slice with each active backend repeated weight/gcd times.
    distribution: Arc<Vec<Arc<Backend>>>,
    strategy: Strategy,
    switchover: Option<Arc<Switchover>>,
}

pub struct Route {
    pub name: String,
    /// Normalized to end with `/`.
    pub prefix: String,
    pub methods: Vec<String>,
    pub host: String,
    pub rewrite: Option<String>,
    pub cookie_ttl: Duration,
    pub health_check: bool,
    pub healthcheck_interval: Duration,
    pub monitoring_interval: Duration,
    pub scrape_interval: Duration,
    client: UpstreamClient,
    pub(crate) metrics: Arc<Repository>,
    inner: RwLock<Inner>,
    stop_tx: watch::Sender<bool>,
}

impl Route {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        prefix: &str,
        rewrite: Option<&str>,
        host: &str,
        methods: &[String],
        timeout: Duration,
        idle_timeout: Duration,
        scrape_interval: Duration,
        healthcheck_interval: Duration,
        monitoring_interval: Duration,
        cookie_ttl: Duration,
        health_check: bool,
        metrics: Arc<Repository>,
    ) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(Error::Config("route name cannot be empty".into()));
        }
        if !prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "prefix of route {name} must start with '/'"
            )));
        }
        if methods.is_empty() {
            return Err(Error::Config(format!(
                "route {name} must accept at least one method"
            )));
        }
        let normalize = |p: &str| {
            if p.ends_with('/') {
                p.to_string()
            } else {
                format!("{p}/")
            }
        };
        let (stop_tx, _) = watch::channel(false);

        let route = Arc::new(Route {
            name: name.to_string(),
            prefix: normalize(prefix),
            methods: methods.iter().map(|m| m.to_uppercase()).collect(),
            host: if host.is_empty() { "*".into() } else { host.into() },
            rewrite: rewrite.map(normalize),
            cookie_ttl,
            health_check,
            healthcheck_interval,
            monitoring_interval,
            scrape_interval,
            client: UpstreamClient::new(timeout, idle_timeout)?,
            metrics,
            inner: RwLock::new(Inner {
                backends: HashMap::new(),
                distribution: Arc::new(Vec::new()),
                strategy: Strategy::sticky(),
                switchover: None,
            }),
            stop_tx,
        });

        if health_check {
            tokio::spawn(Arc::clone(&route).run_health_checks());
        }
        Ok(route)
    }

    /// Name of the session affinity cookie, `<ROUTE>_SESSIONCOOKIE`.
    pub fn cookie_name(&self) -> String {
        format!("{}_SESSIONCOOKIE", self.name.to_uppercase())
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.read().expect("route lock poisoned").strategy.clone()
    }

    pub fn set_strategy(&self, strategy: Strategy) -> Result<()> {
        strategy.validate(self)?;
        self.inner.write().expect("route lock poisoned").strategy = strategy;
        Ok(())
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        let inner = self.inner.read().expect("route lock poisoned");
        inner.backends.values().cloned().collect()
    }

    pub fn backend_by_id(&self, id: Uuid) -> Option<Arc<Backend>> {
        let inner = self.inner.read().expect("route lock poisoned");
        inner.backends.get(&id).cloned()
    }

    pub fn backend_by_name(&self, name: &str) -> Option<Arc<Backend>> {
        let inner = self.inner.read().expect("route lock poisoned");
        inner.backends.values().find(|b| b.name == name).cloned()
    }

    pub fn switchover(&self) -> Option<Arc<Switchover>> {
        self.inner.read().expect("route lock poisoned").switchover.clone()
    }

    /// Add a backend. Duplicate names are rejected; the backend stays
    /// inactive until [`Route::reload`] registers it and the first health
    /// check passes (routes without health checking activate immediately on
    /// reload).
    pub fn add_backend(&self, backend: Backend) -> Result<Uuid> {
        let mut inner = self.inner.write().expect("route lock poisoned");
        if inner.backends.values().any(|b| b.name == backend.name) {
            return Err(Error::Config(format!(
                "backend with name {} already exists on route {}",
                backend.name, self.name
            )));
        }
        let id = backend.id;
        tracing::info!(backend = %id, name = %backend.name, route = %self.name, "added backend");
        inner.backends.insert(id, Arc::new(backend));
        Ok(id)
    }

    /// Remove a backend: deregister from the metrics repository, stop its
    /// loops, drop it, recompute the distribution.
    pub fn remove_backend(&self, id: Uuid) -> Result<()> {
        let backend = {
            let mut inner = self.inner.write().expect("route lock poisoned");
            inner
                .backends
                .remove(&id)
                .ok_or(Error::BackendNotFound(id))?
        };
        if backend.is_registered() {
            if let Err(err) = self.metrics.remove_backend(id) {
                tracing::debug!(backend = %id, %err, "backend was not monitored");
            }
        }
        backend.stop();
        self.recompute_weights();
        tracing::warn!(backend = %id, route = %self.name, "removed backend");
        Ok(())
    }

    /// Register every not-yet-registered backend with the metrics
    /// repository, start its monitor and alert-consumer loops, and run one
    /// health-check validation.
    pub fn reload(self: &Arc<Self>) -> Result<()> {
        tracing::info!(route = %self.name, "reloading route");
        let backends = self.backends();
        for backend in backends {
            if !backend.is_registered() {
                let mut thresholds = backend.thresholds.clone();
                if self.health_check {
                    thresholds.push(implicit_transport_condition());
                }
                let alert_rx = self.metrics.register_backend(
                    &self.name,
                    backend.id,
                    backend.scrape_url.clone(),
                    backend.scrape_metrics.clone(),
                    self.scrape_interval,
                    thresholds,
                )?;
                self.metrics.monitor(backend.id, self.monitoring_interval)?;
                backend.mark_registered();
                tokio::spawn(backend::consume_alerts(
                    Arc::clone(&backend),
                    alert_rx,
                    Arc::downgrade(self),
                ));
            }

            if self.health_check {
                tokio::spawn(Arc::clone(self).validate_status(backend));
            } else {
                backend.set_active(true);
            }
        }
        self.recompute_weights();
        Ok(())
    }

    /// Rebuild the target distribution from the active backends under the
    /// route lock.
    pub fn recompute_weights(&self) {
        let mut inner = self.inner.write().expect("route lock poisoned");
        let active: Vec<Arc<Backend>> = inner
            .backends
            .values()
            .filter(|b| b.is_active())
            .cloned()
            .collect();
        let weights: Vec<u8> = active.iter().map(|b| b.weight()).collect();
        let gcd = proxy::gcd_all(&weights);

        let distribution = if gcd == 0 {
            Vec::new()
        } else {
            let mut distr = Vec::with_capacity(
                weights.iter().map(|w| (w / gcd) as usize).sum(),
            );
            for backend in &active {
                for _ in 0..backend.weight() / gcd {
                    distr.push(Arc::clone(backend));
                }
            }
            distr
        };
        tracing::debug!(route = %self.name, len = distribution.len(), "recomputed target distribution");
        inner.distribution = Arc::new(distribution);
    }

    /// Draw a backend uniformly from the target distribution.
    pub fn next_backend(&self) -> Result<Arc<Backend>> {
        let distribution = {
            let inner = self.inner.read().expect("route lock poisoned");
            Arc::clone(&inner.distribution)
        };
        if distribution.is_empty() {
            return Err(Error::NoActiveBackend);
        }
        let idx = rand::rng().random_range(0..distribution.len());
        Ok(Arc::clone(&distribution[idx]))
    }

    #[cfg(test)]
    fn distribution_counts(&self) -> HashMap<Uuid, usize> {
        let inner = self.inner.read().expect("route lock poisoned");
        let mut counts = HashMap::new();
        for backend in inner.distribution.iter() {
            *counts.entry(backend.id).or_insert(0) += 1;
        }
        counts
    }

    /// Serve one downstream request through the installed strategy.
    pub async fn serve(
        self: &Arc<Self>,
        req: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> Response<Body> {
        let request = match ProxyRequest::buffer(req, peer).await {
            Ok(request) => request,
            Err(err) => return err.into_response(),
        };
        let strategy = self.strategy();
        let selection = match strategy.select(self, &request) {
            Ok(selection) => selection,
            Err(err) => {
                tracing::debug!(route = %self.name, %err, "no backend for request");
                return err.into_response();
            }
        };

        match selection {
            Selection::Primary { backend, set_cookie } => {
                self.forward(backend, &request, set_cookie).await
            }
            Selection::Shadowed { primary, shadow } => {
                let this = Arc::clone(self);
                let mirrored = request.clone();
                tokio::spawn(async move {
                    // response is consumed for the sample and dropped
                    let _ = this.send_and_record(&shadow, &mirrored).await;
                });
                self.forward(primary, &request, false).await
            }
        }
    }

    async fn forward(
        &self,
        backend: Arc<Backend>,
        request: &ProxyRequest,
        set_cookie: bool,
    ) -> Response<Body> {
        match self.send_and_record(&backend, request).await {
            Ok(upstream) => {
                let mut response = proxy::downstream_response(upstream);
                if set_cookie {
                    if let Some(cookie) = proxy::session_cookie(
                        &self.cookie_name(),
                        &backend.id.to_string(),
                        self.cookie_ttl,
                    ) {
                        response.headers_mut().append(header::SET_COOKIE, cookie);
                    }
                }
                response
            }
            Err(err) => {
                tracing::debug!(route = %self.name, backend = %backend.id, %err, "upstream request failed");
                err.into_response()
            }
        }
    }

    /// Send a request upstream and emit one metric sample either way. A
    /// transport failure is recorded as status 600 with content length −1.
    async fn send_and_record(
        &self,
        backend: &Arc<Backend>,
        request: &ProxyRequest,
    ) -> Result<UpstreamResponse> {
        let url = proxy::upstream_url(
            &backend.addr,
            &request.path_and_query,
            &self.prefix,
            self.rewrite.as_deref(),
        );
        let result = self
            .client
            .send(
                request.method.clone(),
                &url,
                request.upstream_headers(),
                request.body.clone(),
            )
            .await;

        let sample = match &result {
            Ok(upstream) => Sample {
                route: self.name.clone(),
                backend_id: backend.id,
                response_status: upstream.status.as_u16(),
                request_method: request.method.to_string(),
                content_length: upstream.body.len() as i64,
                upstream_response_time: upstream.response_time,
                upstream_connect_time: upstream.connect_time,
                downstream_addr: request.downstream_addr.clone(),
            },
            Err(_) => Sample {
                route: self.name.clone(),
                backend_id: backend.id,
                response_status: 600,
                request_method: request.method.to_string(),
                content_length: -1,
                upstream_response_time: 0.0,
                upstream_connect_time: 0.0,
                downstream_addr: request.downstream_addr.clone(),
            },
        };
        self.metrics.ingest(sample);
        result
    }

    /// One health-check validation of a freshly registered backend. When the
    /// check fails, a synthetic Pending alert is injected so the normal
    /// alarm-resolution path activates the backend once it recovers.
    async fn validate_status(self: Arc<Self>, backend: Arc<Backend>) {
        tracing::debug!(backend = %backend.id, "validating backend status");
        if self.health_check_backend(&backend).await {
            if backend.set_active(true) {
                self.recompute_weights();
            }
            return;
        }
        self.metrics
            .register_alert(backend.id, "6xxRate", 0.0, 1.0)
            .await;
    }

    /// GET the backend's health-check URL and record a sample. Any response
    /// counts as healthy; only transport failures mark the backend down.
    async fn health_check_backend(&self, backend: &Arc<Backend>) -> bool {
        let result = self
            .client
            .send(
                Method::GET,
                backend.healthcheck_url.as_str(),
                Default::default(),
                Bytes::new(),
            )
            .await;
        match result {
            Ok(upstream) => {
                self.metrics.ingest(Sample {
                    route: self.name.clone(),
                    backend_id: backend.id,
                    response_status: upstream.status.as_u16(),
                    request_method: Method::GET.to_string(),
                    content_length: upstream.body.len() as i64,
                    upstream_response_time: upstream.response_time,
                    upstream_connect_time: upstream.connect_time,
                    downstream_addr: String::new(),
                });
                true
            }
            Err(err) => {
                tracing::trace!(backend = %backend.id, %err, "health check failed");
                if backend.set_active(false) {
                    self.recompute_weights();
                }
                self.metrics.ingest(Sample {
                    route: self.name.clone(),
                    backend_id: backend.id,
                    response_status: 600,
                    request_method: Method::GET.to_string(),
                    content_length: 0,
                    upstream_response_time: 0.0,
                    upstream_connect_time: 0.0,
                    downstream_addr: String::new(),
                });
                false
            }
        }
    }

    async fn run_health_checks(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.healthcheck_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    tracing::debug!(route = %self.name, "stopped health-check loop");
                    return;
                }
                _ = ticker.tick() => {
                    for backend in self.backends() {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            this.health_check_backend(&backend).await;
                        });
                    }
                }
            }
        }
    }

    /// Begin a gradual weight shift between two backends of this route.
    ///
    /// With `force` the strategy is replaced by sticky and the weights are
    /// forced to 100/0; otherwise the installed strategy must already be
    /// sticky or slippery. An empty `from` picks any backend at weight 100
    /// other than the target.
    #[allow(clippy::too_many_arguments)]
    pub fn start_switchover(
        self: &Arc<Self>,
        from: Option<&str>,
        to: &str,
        conditions: Vec<Condition>,
        timeout: Duration,
        allowed_failures: u32,
        weight_change: u8,
        force: bool,
        rollback: bool,
    ) -> Result<Arc<Switchover>> {
        if let Some(current) = self.switchover() {
            if current.status() == SwitchoverStatus::Running {
                return Err(Error::Config(format!(
                    "route {} already has a running switchover",
                    self.name
                )));
            }
        }

        let to_backend = self
            .backend_by_name(to)
            .ok_or_else(|| Error::Config(format!("no backend named {to} on route {}", self.name)))?;
        let from_backend = match from {
            Some(name) => self.backend_by_name(name).ok_or_else(|| {
                Error::Config(format!("no backend named {name} on route {}", self.name))
            })?,
            None => self
                .backends()
                .into_iter()
                .find(|b| b.name != to && b.weight() == 100)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no source backend at weight 100 on route {}",
                        self.name
                    ))
                })?,
        };

        if force {
            self.set_strategy(Strategy::sticky())?;
            from_backend.set_weight(100);
            to_backend.set_weight(0);
            self.recompute_weights();
        } else if !self.strategy().is_session_based() {
            return Err(Error::Config(
                "switchover requires the sticky or slippery strategy".into(),
            ));
        }

        let switchover = Arc::new(Switchover::new(
            from_backend,
            to_backend,
            conditions,
            timeout,
            allowed_failures,
            weight_change,
            rollback,
        )?);
        switchover.set_status(SwitchoverStatus::Running);
        self.inner.write().expect("route lock poisoned").switchover =
            Some(Arc::clone(&switchover));
        tokio::spawn(Arc::clone(&switchover).run(Arc::downgrade(self)));
        Ok(switchover)
    }

    /// Stop and drop the switchover, leaving the weights wherever its
    /// rollback policy put them.
    pub fn remove_switchover(&self) {
        let switchover = self
            .inner
            .write()
            .expect("route lock poisoned")
            .switchover
            .take();
        if let Some(switchover) = switchover {
            tracing::warn!(route = %self.name, "stopping switchover");
            switchover.stop(self);
        }
    }

    /// Stop every loop owned by this route and drop its backends.
    pub fn stop_all(&self) {
        let _ = self.stop_tx.send(true);
        self.remove_switchover();
        let ids: Vec<Uuid> = self.backends().iter().map(|b| b.id).collect();
        for id in ids {
            let _ = self.remove_backend(id);
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Build a backend from its raw configuration values.
#[allow(clippy::too_many_arguments)]
pub fn build_backend(
    id: Option<Uuid>,
    name: &str,
    addr: &str,
    weight: u8,
    scrape_url: Option<&str>,
    scrape_metrics: Vec<String>,
    thresholds: Vec<Condition>,
    healthcheck_url: Option<&str>,
) -> Result<Backend> {
    let parse = |raw: &str, what: &str| {
        Url::parse(raw).map_err(|e| Error::Config(format!("{what} of backend {name}: {e}")))
    };
    let addr = parse(addr, "address")?;
    let scrape_url = scrape_url.map(|u| parse(u, "scrape url")).transpose()?;
    let healthcheck_url = healthcheck_url
        .map(|u| parse(u, "healthcheck url"))
        .transpose()?;
    Backend::new(
        id,
        name,
        addr,
        weight,
        scrape_url,
        scrape_metrics,
        thresholds,
        healthcheck_url,
    )
}
