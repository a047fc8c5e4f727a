//! Exported Prometheus metrics
//!
//! All series live on an owned registry so tests can run several gateways in
//! one process without label collisions. Moving averages for response time
//! and content length are tracked per route+backend and re-exported as
//! gauges on every sample.

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use uuid::Uuid;

use super::Sample;

#[derive(Default)]
struct AvgState {
    count: u64,
    total_response_time: f64,
    total_content_length: f64,
}

/// Prometheus metric family handles plus moving-average state
pub struct PromMetrics {
    registry: Registry,
    total_http_requests: IntCounterVec,
    avg_response_time: GaugeVec,
    avg_content_length: GaugeVec,
    active_alerts: GaugeVec,
    averages: Mutex<HashMap<(String, Uuid), AvgState>>,
}

impl PromMetrics {
    /// Create the registry and register all metric families.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g. duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let total_http_requests = IntCounterVec::new(
            Opts::new(
                "ingress_depoy_total_http_requests",
                "Total number of proxied HTTP requests by route, backend, status code and method",
            ),
            &["route", "backend", "code", "method"],
        )?;

        let avg_response_time = GaugeVec::new(
            Opts::new(
                "ingress_depoy_average_response_time",
                "Moving average of upstream response time in milliseconds",
            ),
            &["route", "backend", "code", "method"],
        )?;

        let avg_content_length = GaugeVec::new(
            Opts::new(
                "ingress_depoy_average_content_length",
                "Moving average of upstream response content length in bytes",
            ),
            &["route", "backend", "code", "method"],
        )?;

        let active_alerts = GaugeVec::new(
            Opts::new(
                "ingress_depoy_active_alerts",
                "Number of currently active alerts per route and backend",
            ),
            &["route", "backend"],
        )?;

        registry.register(Box::new(total_http_requests.clone()))?;
        registry.register(Box::new(avg_response_time.clone()))?;
        registry.register(Box::new(avg_content_length.clone()))?;
        registry.register(Box::new(active_alerts.clone()))?;

        Ok(PromMetrics {
            registry,
            total_http_requests,
            avg_response_time,
            avg_content_length,
            active_alerts,
            averages: Mutex::new(HashMap::new()),
        })
    }

    /// Record one proxied request: bump the counter and refresh both moving
    /// average gauges for the sample's label set.
    pub fn record_sample(&self, sample: &Sample) {
        let code = sample.response_status.to_string();
        let backend = sample.backend_id.to_string();
        let labels = [
            sample.route.as_str(),
            backend.as_str(),
            code.as_str(),
            sample.request_method.as_str(),
        ];

        self.total_http_requests.with_label_values(&labels).inc();

        let (avg_rt, avg_cl) = {
            let mut averages = self.averages.lock().expect("averages lock poisoned");
            let state = averages
                .entry((sample.route.clone(), sample.backend_id))
                .or_default();
            state.count += 1;
            state.total_response_time += sample.upstream_response_time;
            state.total_content_length += sample.content_length.max(0) as f64;
            (
                state.total_response_time / state.count as f64,
                state.total_content_length / state.count as f64,
            )
        };

        self.avg_response_time.with_label_values(&labels).set(avg_rt);
        self.avg_content_length.with_label_values(&labels).set(avg_cl);
    }

    /// Export the current active-alert count of one backend.
    pub fn set_active_alerts(&self, route: &str, backend_id: Uuid, count: usize) {
        self.active_alerts
            .with_label_values(&[route, &backend_id.to_string()])
            .set(count as f64);
    }

    /// Drop moving-average state for a removed backend.
    pub fn remove_backend(&self, route: &str, backend_id: Uuid) {
        let mut averages = self.averages.lock().expect("averages lock poisoned");
        averages.remove(&(route.to_string(), backend_id));
    }

    /// Encode every registered family in Prometheus text format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: u16, rt: f64, cl: i64) -> Sample {
        Sample {
            route: "route1".to_string(),
            backend_id: Uuid::nil(),
            response_status: status,
            request_method: "GET".to_string(),
            content_length: cl,
            upstream_response_time: rt,
            upstream_connect_time: 0.0,
            downstream_addr: String::new(),
        }
    }

    #[test]
    fn counter_increments_per_sample() {
        let prom = PromMetrics::new().unwrap();
        prom.record_sample(&sample(200, 10.0, 100));
        prom.record_sample(&sample(200, 20.0, 300));

        let text = prom.gather().unwrap();
        assert!(text.contains("ingress_depoy_total_http_requests"));
        assert!(text.contains("code=\"200\""));
        assert!(text.contains("} 2"));
    }

    #[test]
    fn moving_average_tracks_both_gauges() {
        let prom = PromMetrics::new().unwrap();
        prom.record_sample(&sample(200, 10.0, 100));
        prom.record_sample(&sample(200, 30.0, 300));

        let text = prom.gather().unwrap();
        // avg rt = 20, avg cl = 200
        assert!(text.contains("ingress_depoy_average_response_time"));
        assert!(text.contains(" 20"));
        assert!(text.contains(" 200"));
    }

    #[test]
    fn negative_content_length_counts_as_zero() {
        let prom = PromMetrics::new().unwrap();
        prom.record_sample(&sample(600, 0.0, -1));
        let text = prom.gather().unwrap();
        assert!(text.contains("ingress_depoy_average_content_length"));
        assert!(text.contains("code=\"600\""));
    }

    #[test]
    fn active_alerts_gauge_settable() {
        let prom = PromMetrics::new().unwrap();
        prom.set_active_alerts("route1", Uuid::nil(), 3);
        let text = prom.gather().unwrap();
        assert!(text.contains("ingress_depoy_active_alerts"));
        assert!(text.contains(" 3"));
    }
}
