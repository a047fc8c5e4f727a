//! Admin listener
//!
//! A second, optional HTTP listener serving the Prometheus exposition
//! endpoint, a liveness probe, and a JSON view of the current routing
//! state. Kept off the proxy port so scrapes never compete with proxied
//! traffic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::gateway::Gateway;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus))
        .route("/healthz", get(healthz))
        .route("/routes", get(routes))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Serve the admin endpoints until the shutdown future resolves.
pub async fn run<F>(addr: SocketAddr, gateway: Arc<Gateway>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind admin listener {addr}: {e}")))?;
    tracing::info!(%addr, "admin listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Config(format!("admin server: {e}")))
}

async fn prometheus(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.metrics().prom().gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(%err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Current routing state: every route with its backends, weights, active
/// flags, and switchover status.
async fn routes(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let routes: Vec<serde_json::Value> = gateway
        .routes()
        .iter()
        .map(|route| {
            let backends: Vec<serde_json::Value> = route
                .backends()
                .iter()
                .map(|backend| {
                    serde_json::json!({
                        "id": backend.id,
                        "name": backend.name,
                        "addr": backend.addr.as_str(),
                        "weight": backend.weight(),
                        "active": backend.is_active(),
                        "active_alerts": backend
                            .active_alerts()
                            .keys()
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            serde_json::json!({
                "name": route.name,
                "prefix": route.prefix,
                "host": route.host,
                "methods": route.methods,
                "strategy": route.strategy().kind(),
                "switchover": route.switchover().map(|sw| {
                    serde_json::json!({
                        "from": sw.from.name,
                        "to": sw.to.name,
                        "status": sw.status(),
                        "failures": sw.failures(),
                    })
                }),
                "backends": backends,
            })
        })
        .collect();
    Json(serde_json::Value::Array(routes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Timeouts;
    use crate::metrics::{MetricStore, PromMetrics, Repository, Sample};
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn gateway() -> Arc<Gateway> {
        let store = Arc::new(MetricStore::new(
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let prom = Arc::new(PromMetrics::new().unwrap());
        let metrics = Repository::new(store, prom, 64, 64).unwrap();
        Arc::new(Gateway::new(
            "127.0.0.1:0".parse().unwrap(),
            Timeouts {
                read: Duration::from_secs(5),
                write: Duration::from_secs(5),
                http: Duration::from_secs(10),
                idle: Duration::from_secs(30),
            },
            metrics,
        ))
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let res = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = res.status();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let (status, body) = get_text(router(gateway()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_exposition_carries_request_counter() {
        let gw = gateway();
        gw.metrics().prom().record_sample(&Sample {
            route: "orders".to_string(),
            backend_id: Uuid::new_v4(),
            response_status: 200,
            request_method: "GET".to_string(),
            content_length: 12,
            upstream_response_time: 3.5,
            upstream_connect_time: 1.0,
            downstream_addr: String::new(),
        });

        let (status, body) = get_text(router(gw), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ingress_depoy_total_http_requests"));
    }

    #[tokio::test]
    async fn routes_endpoint_reports_empty_gateway() {
        let (status, body) = get_text(router(gateway()), "/routes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }
}
