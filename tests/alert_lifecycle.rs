/// End-to-end test of the alert feedback loop
///
/// Drives samples through the repository, the store aggregation job, the
/// monitor loop, and the backend's alert consumer, and observes the backend
/// leaving and re-entering the target distribution.
///
/// RATIONALE: The alert path is the mechanism that pulls a failing backend
/// out of rotation; a break anywhere along the chain silently keeps traffic
/// flowing to a dead upstream.
use std::sync::Arc;
use std::time::{Duration, Instant};

use depoy::condition::{Condition, Operator};
use depoy::metrics::{MetricStore, PromMetrics, Repository, Sample};
use depoy::route::{build_backend, Route};
use uuid::Uuid;

fn sample(route: &str, backend_id: Uuid, status: u16) -> Sample {
    Sample {
        route: route.to_string(),
        backend_id,
        response_status: status,
        request_method: "GET".to_string(),
        content_length: 100,
        upstream_response_time: 5.0,
        upstream_connect_time: 1.0,
        downstream_addr: String::new(),
    }
}

/// Poll until the predicate holds or the deadline passes.
async fn wait_until(what: &str, deadline: Duration, predicate: impl Fn() -> bool) {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Test the full Alarming and Resolved round trip
///
/// SCENARIO: A backend with a 5xxRate threshold receives only 500s, then
/// only 200s.
///
/// EXPECTED: The backend goes inactive once the alert dwell elapses and
/// becomes active again after the resolve dwell.
#[tokio::test(flavor = "multi_thread")]
async fn failing_backend_leaves_and_rejoins_rotation() {
    // ARRANGE: millisecond cadences so the whole lifecycle fits in seconds
    let store = MetricStore::start(Duration::from_secs(60), Duration::from_millis(25));
    let prom = Arc::new(PromMetrics::new().expect("metrics"));
    let metrics = Repository::new(store, prom, 1024, 64).expect("repository");

    let route = Route::new(
        "orders",
        "/orders",
        None,
        "*",
        &["GET".to_string()],
        Duration::from_secs(5),
        Duration::from_secs(30),
        Duration::from_secs(5),
        Duration::from_secs(5),
        Duration::from_millis(50),
        Duration::from_secs(300),
        false,
        Arc::clone(&metrics),
    )
    .expect("route");

    let threshold = Condition::new(
        "5xxRate",
        Operator::Greater,
        0.5,
        Duration::from_millis(60),
        Duration::from_millis(60),
    )
    .expect("condition");
    let backend_id = route
        .add_backend(
            build_backend(
                None,
                "v1",
                "http://localhost:9090",
                100,
                None,
                vec![],
                vec![threshold],
                None,
            )
            .expect("backend"),
        )
        .expect("add backend");
    route.reload().expect("reload");
    let backend = route.backend_by_id(backend_id).expect("backend exists");
    assert!(backend.is_active(), "backend starts active without health checking");

    // ACT: a steady stream of 500s
    let feeder = {
        let metrics = Arc::clone(&metrics);
        let (tx, mut rx) = tokio::sync::watch::channel(500u16);
        tokio::spawn(async move {
            loop {
                let status = *rx.borrow();
                if status == 0 {
                    return;
                }
                metrics.ingest(sample("orders", backend_id, status));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        tx
    };

    // ASSERT: the alert fires and pulls the backend out of rotation
    wait_until("backend to go inactive", Duration::from_secs(5), || {
        !backend.is_active()
    })
    .await;
    assert!(route.next_backend().is_err(), "distribution must be empty");

    // ACT: recovery, only 200s from here on
    feeder.send(200).expect("feeder alive");

    // ASSERT: the alert resolves and the backend rejoins
    wait_until("backend to become active", Duration::from_secs(5), || {
        backend.is_active()
    })
    .await;
    wait_until("distribution to refill", Duration::from_secs(1), || {
        route.next_backend().is_ok()
    })
    .await;

    feeder.send(0).expect("feeder alive");
    route.stop_all();
    metrics.stop();
}
