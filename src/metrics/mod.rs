//! Metrics pipeline
//!
//! The [`Repository`] ingests per-request samples and scrape snapshots over
//! bounded channels, persists them into the [`store::MetricStore`], keeps
//! the exported Prometheus families up to date, and runs one monitor loop
//! per backend that turns threshold conditions into Pending / Alarming /
//! Resolved alerts.

pub mod prom;
pub mod scrape;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, watch};
use url::Url;
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::{Error, Result};
pub use prom::PromMetrics;
pub use scrape::ScrapeSnapshot;
pub use store::{Metric, MetricStore};

/// One measured request outcome, emitted by the strategy handlers.
///
/// `response_status` 600 is the synthetic "transport failed" code, carried
/// with `content_length` −1.
#[derive(Debug, Clone)]
pub struct Sample {
    pub route: String,
    pub backend_id: Uuid,
    pub response_status: u16,
    pub request_method: String,
    pub content_length: i64,
    pub upstream_response_time: f64,
    pub upstream_connect_time: f64,
    pub downstream_addr: String,
}

/// Alert lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// The predicate became true; the dwell has not elapsed yet.
    Pending,
    /// The predicate held for `active_for`; the backend should go inactive.
    Alarming,
    /// The predicate was false for `resolve_in`; the alert is over.
    Resolved,
}

/// A stateful signal attached to one (backend, metric) pair
#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub backend_id: Uuid,
    pub metric: String,
    pub threshold: f64,
    pub value: f64,
    pub start_time: Instant,
    pub send_time: Option<Instant>,
    pub end_time: Option<Instant>,
}

/// Per-backend monitoring state owned by the repository
struct MonitoredBackend {
    id: Uuid,
    route: String,
    thresholds: Vec<Condition>,
    alert_tx: mpsc::Sender<Alert>,
    active_alerts: Mutex<HashMap<String, Alert>>,
    /// Latest scrape snapshot, persisted alongside the next sample.
    scrape_buffer: Mutex<Option<HashMap<String, f64>>>,
    stop_tx: watch::Sender<bool>,
}

/// Ingests samples and scrape snapshots, computes rates, drives alerts
pub struct Repository {
    store: Arc<MetricStore>,
    prom: Arc<PromMetrics>,
    in_tx: mpsc::Sender<Sample>,
    scrape_tx: mpsc::Sender<ScrapeSnapshot>,
    backends: RwLock<HashMap<Uuid, Arc<MonitoredBackend>>>,
    client: reqwest::Client,
    stop_tx: watch::Sender<bool>,
}

impl Repository {
    /// Create the repository and start its listen loop.
    pub fn new(
        store: Arc<MetricStore>,
        prom: Arc<PromMetrics>,
        sample_buffer: usize,
        scrape_buffer: usize,
    ) -> Result<Arc<Self>> {
        let (in_tx, in_rx) = mpsc::channel(sample_buffer);
        let (scrape_tx, scrape_rx) = mpsc::channel(scrape_buffer);
        let (stop_tx, _) = watch::channel(false);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("scrape client: {e}")))?;

        let repo = Arc::new(Repository {
            store,
            prom,
            in_tx,
            scrape_tx,
            backends: RwLock::new(HashMap::new()),
            client,
            stop_tx,
        });
        repo.spawn_listen(in_rx, scrape_rx);
        Ok(repo)
    }

    pub fn prom(&self) -> &Arc<PromMetrics> {
        &self.prom
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    /// Queue one request sample. A full channel drops the sample rather than
    /// blocking the request path.
    pub fn ingest(&self, sample: Sample) {
        if let Err(err) = self.in_tx.try_send(sample) {
            tracing::warn!(%err, "ingress channel full, dropping metric sample");
        }
    }

    /// Stop the listen loop and every monitor/scrape loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let backends = self.backends.read().expect("backends lock poisoned");
        for backend in backends.values() {
            let _ = backend.stop_tx.send(true);
        }
        self.store.stop();
    }

    fn spawn_listen(
        self: &Arc<Self>,
        mut in_rx: mpsc::Receiver<Sample>,
        mut scrape_rx: mpsc::Receiver<ScrapeSnapshot>,
    ) {
        let repo = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::debug!("metrics repository listen loop stopped");
                        return;
                    }
                    Some(sample) = in_rx.recv() => repo.persist_sample(sample),
                    Some(snapshot) = scrape_rx.recv() => repo.buffer_snapshot(snapshot),
                }
            }
        });
    }

    fn persist_sample(&self, sample: Sample) {
        self.prom.record_sample(&sample);

        let custom = {
            let backends = self.backends.read().expect("backends lock poisoned");
            backends
                .get(&sample.backend_id)
                .and_then(|b| b.scrape_buffer.lock().expect("scrape buffer poisoned").clone())
        };

        self.store.write(
            &sample.route,
            sample.backend_id,
            custom,
            sample.upstream_response_time,
            sample.content_length as f64,
            sample.response_status,
        );
    }

    fn buffer_snapshot(&self, snapshot: ScrapeSnapshot) {
        let backends = self.backends.read().expect("backends lock poisoned");
        if let Some(backend) = backends.get(&snapshot.backend_id) {
            *backend.scrape_buffer.lock().expect("scrape buffer poisoned") =
                Some(snapshot.metrics);
        }
    }

    /// Register a backend for monitoring: allocates the alert channel,
    /// starts the scrape loop when a scrape target is configured, and
    /// returns the receive end consumed by the backend.
    pub fn register_backend(
        &self,
        route: &str,
        backend_id: Uuid,
        scrape_url: Option<Url>,
        scrape_metrics: Vec<String>,
        scrape_interval: Duration,
        thresholds: Vec<Condition>,
    ) -> Result<mpsc::Receiver<Alert>> {
        let mut backends = self.backends.write().expect("backends lock poisoned");
        if backends.contains_key(&backend_id) {
            return Err(Error::Config(format!(
                "backend {backend_id} is already monitored"
            )));
        }

        let (alert_tx, alert_rx) = mpsc::channel(16);
        let (stop_tx, _) = watch::channel(false);
        let monitored = Arc::new(MonitoredBackend {
            id: backend_id,
            route: route.to_string(),
            thresholds,
            alert_tx,
            active_alerts: Mutex::new(HashMap::new()),
            scrape_buffer: Mutex::new(None),
            stop_tx,
        });

        if let Some(url) = scrape_url {
            if !scrape_metrics.is_empty() {
                tokio::spawn(scrape::run_scrape_loop(
                    self.client.clone(),
                    backend_id,
                    url,
                    scrape_metrics,
                    scrape_interval,
                    self.scrape_tx.clone(),
                    monitored.stop_tx.subscribe(),
                ));
            }
        }

        tracing::info!(backend = %backend_id, route, "registered backend for monitoring");
        backends.insert(backend_id, monitored);
        Ok(alert_rx)
    }

    /// Stop a backend's loops and drop its monitoring state.
    pub fn remove_backend(&self, backend_id: Uuid) -> Result<()> {
        let mut backends = self.backends.write().expect("backends lock poisoned");
        let Some(backend) = backends.remove(&backend_id) else {
            return Err(Error::BackendNotFound(backend_id));
        };
        let _ = backend.stop_tx.send(true);
        self.prom.remove_backend(&backend.route, backend_id);
        tracing::warn!(backend = %backend_id, "removed backend from monitoring");
        Ok(())
    }

    /// Synthetically inject a Pending alert for a backend+metric. Used to
    /// nudge a freshly added backend into the health-check feedback loop so
    /// the normal Resolved path can flip it active later.
    pub async fn register_alert(
        &self,
        backend_id: Uuid,
        metric: &str,
        threshold: f64,
        value: f64,
    ) {
        let entry = {
            let backends = self.backends.read().expect("backends lock poisoned");
            backends.get(&backend_id).map(|backend| {
                let alert = Alert {
                    kind: AlertKind::Pending,
                    backend_id,
                    metric: metric.to_string(),
                    threshold,
                    value,
                    start_time: Instant::now(),
                    send_time: None,
                    end_time: None,
                };
                backend
                    .active_alerts
                    .lock()
                    .expect("alerts lock poisoned")
                    .insert(metric.to_string(), alert.clone());
                (backend.alert_tx.clone(), alert)
            })
        };
        if let Some((tx, alert)) = entry {
            let _ = tx.send(alert).await;
        }
    }

    /// Start the monitor loop of a registered backend.
    ///
    /// Each tick computes rates over the last `2 × interval` and walks the
    /// alert state machine for every configured condition.
    pub fn monitor(self: &Arc<Self>, backend_id: Uuid, interval: Duration) -> Result<()> {
        let monitored = {
            let backends = self.backends.read().expect("backends lock poisoned");
            backends
                .get(&backend_id)
                .cloned()
                .ok_or(Error::BackendNotFound(backend_id))?
        };
        let repo = Arc::clone(self);
        let mut stop_rx = monitored.stop_tx.subscribe();
        tokio::spawn(async move {
            tracing::debug!(backend = %backend_id, "monitor loop started");
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::debug!(backend = %backend_id, "monitor loop stopped");
                        return;
                    }
                    _ = tick.tick() => repo.monitor_tick(&monitored, interval).await,
                }
            }
        });
        Ok(())
    }

    async fn monitor_tick(&self, backend: &MonitoredBackend, interval: Duration) {
        let now = SystemTime::now();
        let rates = self
            .read_rates_of_backend(backend.id, now - 2 * interval, now)
            .unwrap_or_else(|_| Self::rates_of(&Metric::default()));

        let mut emit = Vec::new();
        {
            let mut alerts = backend.active_alerts.lock().expect("alerts lock poisoned");
            let now = Instant::now();
            for condition in &backend.thresholds {
                let reached = condition.is_true(&rates);
                let current = rates.get(&condition.metric).copied().unwrap_or(0.0);

                if let Some(alert) = alerts.get_mut(&condition.metric) {
                    if reached {
                        // still firing: refresh the value, clear any resolve dwell
                        alert.value = current;
                        alert.end_time = None;
                        let dwelled = now.duration_since(alert.start_time) >= condition.active_for;
                        if dwelled && alert.send_time.is_none() {
                            alert.kind = AlertKind::Alarming;
                            alert.send_time = Some(now);
                            emit.push(alert.clone());
                        }
                        continue;
                    }
                    let end = *alert.end_time.get_or_insert(now);
                    // resolve_in of zero means the alert never auto-resolves
                    if !condition.resolve_in.is_zero()
                        && now.duration_since(end) >= condition.resolve_in
                    {
                        alert.kind = AlertKind::Resolved;
                        alert.value = current;
                        emit.push(alert.clone());
                        alerts.remove(&condition.metric);
                    }
                } else if reached {
                    let alert = Alert {
                        kind: AlertKind::Pending,
                        backend_id: backend.id,
                        metric: condition.metric.clone(),
                        threshold: condition.threshold,
                        value: current,
                        start_time: now,
                        send_time: None,
                        end_time: None,
                    };
                    alerts.insert(condition.metric.clone(), alert.clone());
                    emit.push(alert);
                }
            }
            self.prom
                .set_active_alerts(&backend.route, backend.id, alerts.len());
        }

        for alert in emit {
            tracing::info!(
                backend = %backend.id,
                metric = %alert.metric,
                kind = ?alert.kind,
                value = alert.value,
                "alert transition"
            );
            if backend.alert_tx.send(alert).await.is_err() {
                tracing::debug!(backend = %backend.id, "alert consumer gone");
                return;
            }
        }
    }

    /// Derived rates of one backend over `(start, end)`.
    ///
    /// `total_responses` is coerced to 1 when zero so the bucket rates stay
    /// defined. Custom scrape metrics pass through by name.
    pub fn read_rates_of_backend(
        &self,
        backend_id: Uuid,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<HashMap<String, f64>> {
        let metric = self.store.read_backend(backend_id, start, end)?;
        Ok(Self::rates_of(&metric))
    }

    fn rates_of(metric: &Metric) -> HashMap<String, f64> {
        let total = if metric.total_responses == 0 {
            1.0
        } else {
            metric.total_responses as f64
        };
        let mut rates = HashMap::with_capacity(7 + metric.custom_metrics.len());
        rates.insert("2xxRate".into(), metric.response_status_2xx as f64 / total);
        rates.insert("3xxRate".into(), metric.response_status_3xx as f64 / total);
        rates.insert("4xxRate".into(), metric.response_status_4xx as f64 / total);
        rates.insert("5xxRate".into(), metric.response_status_5xx as f64 / total);
        rates.insert("6xxRate".into(), metric.response_status_6xx as f64 / total);
        rates.insert("ResponseTime".into(), metric.response_time);
        rates.insert("ContentLength".into(), metric.content_length);
        for (name, value) in &metric.custom_metrics {
            rates.insert(name.clone(), *value);
        }
        rates
    }

    /// Step through `[start, end]` in `granularity` increments and yield one
    /// aggregate per step for a backend. Steps with no data degrade to an
    /// empty metric instead of failing the whole read.
    pub fn read_backend_granular(
        &self,
        backend_id: Uuid,
        start: SystemTime,
        end: SystemTime,
        granularity: Option<Duration>,
    ) -> Result<BTreeMap<SystemTime, Metric>> {
        self.read_granular(start, end, granularity, |s, e| {
            self.store.read_backend(backend_id, s, e)
        })
    }

    /// Same as [`Repository::read_backend_granular`] for a whole route.
    pub fn read_route_granular(
        &self,
        route: &str,
        start: SystemTime,
        end: SystemTime,
        granularity: Option<Duration>,
    ) -> Result<BTreeMap<SystemTime, Metric>> {
        self.read_granular(start, end, granularity, |s, e| {
            self.store.read_route(route, s, e)
        })
    }

    fn read_granular(
        &self,
        start: SystemTime,
        end: SystemTime,
        granularity: Option<Duration>,
        read: impl Fn(SystemTime, SystemTime) -> Result<Metric>,
    ) -> Result<BTreeMap<SystemTime, Metric>> {
        let granularity = granularity.unwrap_or_else(|| self.store.granularity());
        let timeframe = end
            .duration_since(start)
            .map_err(|_| Error::StoreWindowEmpty)?;
        if timeframe < granularity || granularity.is_zero() {
            return Err(Error::StoreWindowEmpty);
        }

        let mut out = BTreeMap::new();
        if timeframe == granularity {
            out.insert(end, read(start, end).unwrap_or_default());
            return Ok(out);
        }

        let steps = (timeframe.as_nanos() / granularity.as_nanos()) as u32;
        let mut window_start = start;
        for _ in 0..steps {
            let window_end = window_start + granularity;
            out.insert(window_end, read(window_start, window_end).unwrap_or_default());
            window_start = window_end;
        }
        Ok(out)
    }

    /// Snapshot of every backend's currently active alerts.
    pub fn active_alerts(&self) -> HashMap<Uuid, HashMap<String, Alert>> {
        let backends = self.backends.read().expect("backends lock poisoned");
        backends
            .iter()
            .map(|(id, b)| {
                (
                    *id,
                    b.active_alerts.lock().expect("alerts lock poisoned").clone(),
                )
            })
            .collect()
    }
}
