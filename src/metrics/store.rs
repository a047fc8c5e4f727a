//! In-memory time-bucketed metric store
//!
//! Two levels: a write buffer of unaggregated samples per route+backend and
//! a data map of `route -> backend -> timestamp -> aggregated metric`. A
//! single job drains the buffer every `granularity` tick and evicts buckets
//! older than the retention period.
//!
//! The buffer and the data map have separate locks. Ingestion writers touch
//! only the buffer; the job takes the data lock first, then the buffer lock,
//! so the two can never deadlock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};

/// One aggregated metric bucket
///
/// Invariant: `total_responses` equals the sum of the five status buckets.
/// A single request sample is represented as a bucket with
/// `total_responses == 1`, which lets buffering and windowed reads share one
/// averaging routine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metric {
    pub total_responses: u64,
    pub response_status_2xx: u64,
    pub response_status_3xx: u64,
    pub response_status_4xx: u64,
    pub response_status_5xx: u64,
    pub response_status_6xx: u64,
    pub content_length: f64,
    pub response_time: f64,
    pub custom_metrics: HashMap<String, f64>,
}

impl Metric {
    /// Build a single-sample bucket from one measured response.
    ///
    /// Status 600 is the synthetic "transport failed" code; anything at or
    /// above lands in the 6xx bucket.
    pub fn sample(
        response_status: u16,
        response_time: f64,
        content_length: f64,
        custom_metrics: Option<HashMap<String, f64>>,
    ) -> Self {
        let mut m = Metric {
            total_responses: 1,
            response_time,
            content_length,
            custom_metrics: custom_metrics.unwrap_or_default(),
            ..Metric::default()
        };
        match response_status {
            s if s < 300 => m.response_status_2xx = 1,
            s if s < 400 => m.response_status_3xx = 1,
            s if s < 500 => m.response_status_4xx = 1,
            s if s < 600 => m.response_status_5xx = 1,
            _ => m.response_status_6xx = 1,
        }
        m
    }

    /// Sum the counters and average the means of a set of buckets.
    ///
    /// Response times of failed requests are recorded as 0 and excluded from
    /// the sum, but the divisor stays the full bucket count so a burst of
    /// failures drags the average down rather than disappearing.
    pub fn average(buckets: &[Metric]) -> Metric {
        let mut out = Metric::default();
        let len = buckets.len();
        if len == 0 {
            return out;
        }

        for b in buckets {
            out.total_responses += b.total_responses;
            out.response_status_2xx += b.response_status_2xx;
            out.response_status_3xx += b.response_status_3xx;
            out.response_status_4xx += b.response_status_4xx;
            out.response_status_5xx += b.response_status_5xx;
            out.response_status_6xx += b.response_status_6xx;
            out.content_length += b.content_length;
            if b.response_time > 0.0 {
                out.response_time += b.response_time;
            }
            for (key, value) in &b.custom_metrics {
                *out.custom_metrics.entry(key.clone()).or_insert(0.0) += value;
            }
        }
        out.content_length /= len as f64;
        out.response_time /= len as f64;
        for value in out.custom_metrics.values_mut() {
            *value /= len as f64;
        }
        out
    }
}

type Buffer = HashMap<String, HashMap<Uuid, Vec<Metric>>>;
type Data = HashMap<String, HashMap<Uuid, BTreeMap<SystemTime, Metric>>>;

/// Ring-style in-memory time series of per-route/per-backend aggregates
pub struct MetricStore {
    buffer: Mutex<Buffer>,
    data: RwLock<Data>,
    retention_period: Duration,
    granularity: Duration,
    stop_tx: watch::Sender<bool>,
}

impl MetricStore {
    /// Create a store and start its aggregation job.
    pub fn start(retention_period: Duration, granularity: Duration) -> Arc<Self> {
        let store = Arc::new(Self::new(retention_period, granularity));
        store.spawn_job();
        store
    }

    /// Create a store without starting the aggregation job. Callers drive
    /// aggregation with [`MetricStore::aggregate_now`] (used by tests).
    pub fn new(retention_period: Duration, granularity: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        MetricStore {
            buffer: Mutex::new(HashMap::new()),
            data: RwLock::new(HashMap::new()),
            retention_period,
            granularity,
            stop_tx,
        }
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Stop the aggregation job.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn spawn_job(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(store.granularity);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::debug!("metric store aggregation job stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        store.aggregate_now(SystemTime::now());
                    }
                }
            }
        });
    }

    /// Record one sample into the write buffer.
    pub fn write(
        &self,
        route: &str,
        backend: Uuid,
        custom_metrics: Option<HashMap<String, f64>>,
        response_time: f64,
        content_length: f64,
        response_status: u16,
    ) {
        let sample = Metric::sample(response_status, response_time, content_length, custom_metrics);
        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        buffer
            .entry(route.to_string())
            .or_default()
            .entry(backend)
            .or_default()
            .push(sample);
    }

    /// Drain the buffer into timestamped aggregates and evict expired
    /// buckets. Data lock first, then buffer lock.
    pub fn aggregate_now(&self, now: SystemTime) {
        let mut data = self.data.write().expect("data lock poisoned");
        {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            for (route, backends) in buffer.iter_mut() {
                for (backend, samples) in backends.iter_mut() {
                    if samples.is_empty() {
                        continue;
                    }
                    let aggregated = Metric::average(samples);
                    samples.clear();
                    data.entry(route.clone())
                        .or_default()
                        .entry(*backend)
                        .or_default()
                        .insert(now, aggregated);
                }
            }
        }

        // retention sweep
        for backends in data.values_mut() {
            for buckets in backends.values_mut() {
                buckets.retain(|timestamp, _| match now.duration_since(*timestamp) {
                    Ok(age) => age <= self.retention_period,
                    Err(_) => true, // bucket from the future, keep it
                });
            }
        }
    }

    /// One aggregate over every bucket of `backend` strictly inside
    /// `(start, end)`.
    pub fn read_backend(&self, backend: Uuid, start: SystemTime, end: SystemTime) -> Result<Metric> {
        let data = self.data.read().expect("data lock poisoned");
        for backends in data.values() {
            if let Some(buckets) = backends.get(&backend) {
                let relevant: Vec<Metric> = buckets
                    .iter()
                    .filter(|(t, _)| **t > start && **t < end)
                    .map(|(_, m)| m.clone())
                    .collect();
                if relevant.is_empty() {
                    return Err(Error::StoreWindowEmpty);
                }
                return Ok(Metric::average(&relevant));
            }
        }
        Err(Error::BackendNotFound(backend))
    }

    /// One aggregate over every bucket of every backend of `route` strictly
    /// inside `(start, end)`.
    pub fn read_route(&self, route: &str, start: SystemTime, end: SystemTime) -> Result<Metric> {
        let data = self.data.read().expect("data lock poisoned");
        let Some(backends) = data.get(route) else {
            return Err(Error::RouteNotFound(route.to_string()));
        };
        let relevant: Vec<Metric> = backends
            .values()
            .flat_map(|buckets| {
                buckets
                    .iter()
                    .filter(|(t, _)| **t > start && **t < end)
                    .map(|(_, m)| m.clone())
            })
            .collect();
        if relevant.is_empty() {
            return Err(Error::StoreWindowEmpty);
        }
        Ok(Metric::average(&relevant))
    }

    /// Snapshot of the whole data map.
    pub fn read_data(&self) -> Data {
        self.data.read().expect("data lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn store() -> MetricStore {
        MetricStore::new(MINUTE, Duration::from_secs(5))
    }

    #[test]
    fn sample_buckets_by_status() {
        assert_eq!(Metric::sample(204, 1.0, 1.0, None).response_status_2xx, 1);
        assert_eq!(Metric::sample(301, 1.0, 1.0, None).response_status_3xx, 1);
        assert_eq!(Metric::sample(404, 1.0, 1.0, None).response_status_4xx, 1);
        assert_eq!(Metric::sample(503, 1.0, 1.0, None).response_status_5xx, 1);
        assert_eq!(Metric::sample(600, 1.0, 1.0, None).response_status_6xx, 1);
    }

    #[test]
    fn total_equals_sum_of_buckets_after_average() {
        let samples: Vec<Metric> = [200, 201, 302, 404, 500, 600]
            .iter()
            .map(|s| Metric::sample(*s, 10.0, 100.0, None))
            .collect();
        let agg = Metric::average(&samples);

        assert_eq!(agg.total_responses, 6);
        assert_eq!(
            agg.total_responses,
            agg.response_status_2xx
                + agg.response_status_3xx
                + agg.response_status_4xx
                + agg.response_status_5xx
                + agg.response_status_6xx
        );
    }

    #[test]
    fn failed_requests_do_not_inflate_response_time() {
        // two successes at 100ms, one transport failure recorded as rt=0
        let samples = vec![
            Metric::sample(200, 100.0, 50.0, None),
            Metric::sample(200, 100.0, 50.0, None),
            Metric::sample(600, 0.0, -1.0, None),
        ];
        let agg = Metric::average(&samples);
        assert!((agg.response_time - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn read_backend_windows_are_exclusive() {
        let st = store();
        let backend = Uuid::new_v4();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        st.write("route1", backend, None, 5.0, 10.0, 200);
        st.aggregate_now(t0);

        // bucket sits exactly at t0; (t0-10, t0+10) contains it
        let metric = st
            .read_backend(backend, t0 - Duration::from_secs(10), t0 + Duration::from_secs(10))
            .unwrap();
        assert_eq!(metric.total_responses, 1);

        // (t0, t0+10) excludes the boundary bucket
        let err = st
            .read_backend(backend, t0, t0 + Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, Error::StoreWindowEmpty));
    }

    #[test]
    fn read_route_averages_across_backends() {
        let st = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        st.write("route1", a, None, 10.0, 100.0, 200);
        st.write("route1", b, None, 30.0, 300.0, 500);
        st.aggregate_now(t0);

        let metric = st
            .read_route("route1", t0 - MINUTE, t0 + MINUTE)
            .unwrap();
        assert_eq!(metric.total_responses, 2);
        assert_eq!(metric.response_status_2xx, 1);
        assert_eq!(metric.response_status_5xx, 1);
        assert!((metric.response_time - 20.0).abs() < 1e-9);
        assert!((metric.content_length - 200.0).abs() < 1e-9);
    }

    #[test]
    fn retention_evicts_old_buckets() {
        let st = store();
        let backend = Uuid::new_v4();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        st.write("route1", backend, None, 5.0, 10.0, 200);
        st.aggregate_now(t0);
        assert!(st.read_backend(backend, t0 - MINUTE, t0 + MINUTE).is_ok());

        // two minutes later the bucket has outlived the 1-minute retention
        st.aggregate_now(t0 + 2 * MINUTE);
        let err = st.read_backend(backend, t0 - MINUTE, t0 + MINUTE).unwrap_err();
        assert!(matches!(err, Error::StoreWindowEmpty));
    }

    #[test]
    fn custom_metrics_are_averaged_per_key() {
        let st = store();
        let backend = Uuid::new_v4();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        let mut scrape = HashMap::new();
        scrape.insert("go_goroutines".to_string(), 10.0);
        st.write("route1", backend, Some(scrape.clone()), 1.0, 1.0, 200);
        scrape.insert("go_goroutines".to_string(), 30.0);
        st.write("route1", backend, Some(scrape), 1.0, 1.0, 200);
        st.aggregate_now(t0);

        let metric = st.read_backend(backend, t0 - MINUTE, t0 + MINUTE).unwrap();
        assert!((metric.custom_metrics["go_goroutines"] - 20.0).abs() < 1e-9);
    }
}
