//! Top-level gateway
//!
//! Owns the routes, the per-host router map, and the metrics repository.
//! Request serving is lock-free on the write side: the router map is rebuilt
//! from scratch on every change and swapped in atomically, while all
//! mutators serialize on a single gateway mutex.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, Response, StatusCode};
use futures::FutureExt;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::metrics::Repository;
use crate::route::Route;
use crate::router::Router;

/// Connection timeouts carried from the gateway configuration.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
    /// Bounds one full downstream request, upstream round trip included.
    pub http: Duration,
    pub idle: Duration,
}

pub struct Gateway {
    pub addr: SocketAddr,
    pub timeouts: Timeouts,
    metrics: Arc<Repository>,
    routes: Mutex<HashMap<String, Arc<Route>>>,
    /// Host to router, rebuilt and swapped whole by [`Gateway::reload`].
    routers: RwLock<Arc<HashMap<String, Router<Arc<Route>>>>>,
    stop_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("addr", &self.addr)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(addr: SocketAddr, timeouts: Timeouts, metrics: Arc<Repository>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Gateway {
            addr,
            timeouts,
            metrics,
            routes: Mutex::new(HashMap::new()),
            routers: RwLock::new(Arc::new(HashMap::new())),
            stop_tx,
        }
    }

    pub fn metrics(&self) -> &Arc<Repository> {
        &self.metrics
    }

    pub fn route(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.lock().expect("routes lock poisoned").get(name).cloned()
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes
            .lock()
            .expect("routes lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Register a route and rebuild the router map. Fails on a duplicate
    /// name or on another route claiming the same (prefix, host) pair.
    pub fn register_route(&self, route: Arc<Route>) -> Result<()> {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        if routes.contains_key(&route.name) {
            return Err(Error::Config(format!(
                "route with name {} already exists",
                route.name
            )));
        }
        if routes
            .values()
            .any(|r| r.prefix == route.prefix && r.host == route.host)
        {
            return Err(Error::Config(format!(
                "a route for prefix {} and host {} already exists",
                route.prefix, route.host
            )));
        }
        tracing::info!(route = %route.name, prefix = %route.prefix, host = %route.host, "registering route");
        routes.insert(route.name.clone(), route);
        self.rebuild_routers(&routes)
    }

    /// Stop a route's children and drop it from the gateway.
    pub fn remove_route(&self, name: &str) -> Result<Arc<Route>> {
        let route = {
            let mut routes = self.routes.lock().expect("routes lock poisoned");
            routes
                .remove(name)
                .ok_or_else(|| Error::RouteNotFound(name.to_string()))?
        };
        route.stop_all();
        let routes = self.routes.lock().expect("routes lock poisoned");
        self.rebuild_routers(&routes)?;
        drop(routes);
        tracing::warn!(route = %name, "removed route");
        Ok(route)
    }

    /// Rebuild the per-host router map from the current routes and swap it
    /// in atomically.
    pub fn reload(&self) -> Result<()> {
        let routes = self.routes.lock().expect("routes lock poisoned");
        self.rebuild_routers(&routes)
    }

    fn rebuild_routers(&self, routes: &HashMap<String, Arc<Route>>) -> Result<()> {
        let mut routers: HashMap<String, Router<Arc<Route>>> = HashMap::new();
        for route in routes.values() {
            let router = routers.entry(route.host.clone()).or_default();
            for method in &route.methods {
                router.register(method, &route.prefix, Arc::clone(route))?;
            }
        }
        routers.entry("*".to_string()).or_default();
        *self.routers.write().expect("routers lock poisoned") = Arc::new(routers);
        tracing::debug!(routes = routes.len(), "swapped router map");
        Ok(())
    }

    fn router_for(&self, host: &str) -> Option<Router<Arc<Route>>> {
        let routers = Arc::clone(&self.routers.read().expect("routers lock poisoned"));
        routers.get(host).or_else(|| routers.get("*")).cloned()
    }

    /// Dispatch one request by host, then by method and longest prefix.
    pub async fn serve(
        self: &Arc<Self>,
        req: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> Response<Body> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.split(':').next())
            .unwrap_or("*")
            .to_string();
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();

        let route = self
            .router_for(&host)
            .and_then(|router| router.lookup(&method, &path).cloned());
        let Some(route) = route else {
            tracing::debug!(host, method, path, "no route matched");
            return plain_response(StatusCode::NOT_FOUND, "404 - Not Found");
        };

        let served = std::panic::AssertUnwindSafe(async {
            tokio::time::timeout(self.timeouts.http, route.serve(req, peer)).await
        })
        .catch_unwind()
        .await;

        match served {
            Ok(Ok(response)) => response,
            Ok(Err(_elapsed)) => {
                tracing::warn!(route = %route.name, "request exceeded the gateway http timeout");
                plain_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                tracing::error!(route = %route.name, %message, "recovered handler panic");
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
            }
        }
    }

    /// Bind the listener and serve until the shutdown future resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {}: {e}", self.addr)))?;
        tracing::info!(addr = %self.addr, "gateway listening");

        let app = axum::Router::new()
            .fallback(dispatch)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::clone(&self));
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Config(format!("gateway server: {e}")))
    }

    /// Stop every route and the metrics pipeline.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        for route in self.routes() {
            route.stop_all();
        }
        self.metrics.stop();
        tracing::info!("gateway stopped");
    }
}

async fn dispatch(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    gateway.serve(req, Some(peer)).await
}

fn plain_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricStore, PromMetrics};

    fn gateway() -> Arc<Gateway> {
        let store = Arc::new(MetricStore::new(
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let prom = Arc::new(PromMetrics::new().unwrap());
        let metrics = Repository::new(store, prom, 64, 64).unwrap();
        Arc::new(Gateway::new(
            "127.0.0.1:8080".parse().unwrap(),
            Timeouts {
                read: Duration::from_secs(5),
                write: Duration::from_secs(5),
                http: Duration::from_secs(10),
                idle: Duration::from_secs(30),
            },
            metrics,
        ))
    }

    fn route(gw: &Gateway, name: &str, prefix: &str, host: &str) -> Arc<Route> {
        Route::new(
            name,
            prefix,
            None,
            host,
            &["GET".to_string()],
            Duration::from_secs(5),
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(300),
            false,
            Arc::clone(gw.metrics()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_route_name_is_rejected() {
        let gw = gateway();
        gw.register_route(route(&gw, "orders", "/orders", "*")).unwrap();
        let err = gw
            .register_route(route(&gw, "orders", "/other", "*"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn duplicate_prefix_and_host_is_rejected() {
        let gw = gateway();
        gw.register_route(route(&gw, "orders", "/api", "*")).unwrap();
        let err = gw
            .register_route(route(&gw, "orders-v2", "/api", "*"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        // the same prefix under another host is fine
        gw.register_route(route(&gw, "orders-v3", "/api", "internal"))
            .unwrap();
    }

    #[tokio::test]
    async fn unmatched_request_gets_404() {
        let gw = gateway();
        gw.register_route(route(&gw, "orders", "/orders", "*")).unwrap();

        let req = Request::builder()
            .method("GET")
            .uri("/nothing-here")
            .body(Body::empty())
            .unwrap();
        let res = gw.serve(req, None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn removing_a_route_drops_it_from_dispatch() {
        let gw = gateway();
        gw.register_route(route(&gw, "orders", "/orders", "*")).unwrap();
        gw.remove_route("orders").unwrap();
        assert!(gw.route("orders").is_none());

        let req = Request::builder()
            .method("GET")
            .uri("/orders/1")
            .body(Body::empty())
            .unwrap();
        let res = gw.serve(req, None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(matches!(
            gw.remove_route("orders").unwrap_err(),
            Error::RouteNotFound(_)
        ));
    }
}
