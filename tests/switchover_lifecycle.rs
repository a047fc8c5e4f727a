/// Tests for the switchover controller
///
/// Drives a complete weight shift to Success on healthy rate data, and a
/// Failed shift with rollback when the condition never holds.
///
/// RATIONALE: The switchover is the feature operators trust for gradual
/// rollouts; advancing on bad data or failing to roll back would promote a
/// broken release to 100% of traffic.
use std::sync::Arc;
use std::time::{Duration, Instant};

use depoy::condition::{Condition, Operator};
use depoy::metrics::{MetricStore, PromMetrics, Repository, Sample};
use depoy::route::{build_backend, Route, SwitchoverStatus};
use uuid::Uuid;

fn setup() -> (Arc<Repository>, Arc<Route>) {
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
        Duration::from_secs(5),
        Duration::from_secs(300),
        false,
        Arc::clone(&metrics),
    )
    .expect("route");
    route
        .add_backend(
            build_backend(None, "v1", "http://localhost:9090", 100, None, vec![], vec![], None)
                .expect("backend v1"),
        )
        .expect("add v1");
    route
        .add_backend(
            build_backend(None, "v2", "http://localhost:9091", 0, None, vec![], vec![], None)
                .expect("backend v2"),
        )
        .expect("add v2");
    route.reload().expect("reload");
    (metrics, route)
}

fn feed(metrics: &Arc<Repository>, backend_id: Uuid, status: u16) -> tokio::sync::watch::Sender<bool> {
    let metrics = Arc::clone(metrics);
    let (tx, mut rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        while !*rx.borrow() {
            metrics.ingest(Sample {
                route: "orders".to_string(),
                backend_id,
                response_status: status,
                request_method: "GET".to_string(),
                content_length: 100,
                upstream_response_time: 5.0,
                upstream_connect_time: 1.0,
                downstream_addr: String::new(),
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
    tx
}

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

/// Test a switchover that runs to completion
///
/// SCENARIO: The target backend produces only 200s; the condition asks for
/// 6xxRate below 0.1.
///
/// EXPECTED: Weights advance in steps of 50 until 0/100, status Success.
#[tokio::test(flavor = "multi_thread")]
async fn healthy_target_reaches_success() {
    // ARRANGE
    let (metrics, route) = setup();
    let to_id = route.backend_by_name("v2").expect("v2").id;
    let feeder = feed(&metrics, to_id, 200);

    let condition = Condition::new(
        "6xxRate",
        Operator::Less,
        0.1,
        Duration::from_millis(30),
        Duration::from_secs(10),
    )
    .expect("condition");

    // ACT
    let switchover = route
        .start_switchover(
            Some("v1"),
            "v2",
            vec![condition],
            Duration::from_millis(60),
            5,
            50,
            false,
            false,
        )
        .expect("start switchover");
    assert_eq!(switchover.status(), SwitchoverStatus::Running);

    // ASSERT
    wait_until("switchover to succeed", Duration::from_secs(10), || {
        switchover.status() == SwitchoverStatus::Success
    })
    .await;
    assert_eq!(switchover.from.weight(), 0);
    assert_eq!(switchover.to.weight(), 100);

    // every draw now lands on the promoted backend
    for _ in 0..50 {
        assert_eq!(route.next_backend().expect("draw").id, to_id);
    }

    feeder.send(true).expect("feeder alive");
    route.stop_all();
    metrics.stop();
}

/// Test a switchover that fails and rolls back
///
/// SCENARIO: The target backend produces only 500s; the condition asks for
/// 5xxRate below 0.1, which never holds.
///
/// EXPECTED: After the allowed failures are used up the status is Failed
/// and the captured 100/0 weights are restored.
#[tokio::test(flavor = "multi_thread")]
async fn failing_target_rolls_back() {
    // ARRANGE
    let (metrics, route) = setup();
    let to_id = route.backend_by_name("v2").expect("v2").id;
    let feeder = feed(&metrics, to_id, 500);

    let condition = Condition::new(
        "5xxRate",
        Operator::Less,
        0.1,
        Duration::from_millis(30),
        Duration::from_secs(10),
    )
    .expect("condition");

    // ACT
    let switchover = route
        .start_switchover(
            Some("v1"),
            "v2",
            vec![condition],
            Duration::from_millis(60),
            3,
            50,
            false,
            true,
        )
        .expect("start switchover");

    // ASSERT
    wait_until("switchover to fail", Duration::from_secs(10), || {
        switchover.status() == SwitchoverStatus::Failed
    })
    .await;
    assert!(
        switchover.failures() >= 3,
        "failure counter must reach the allowed limit, got {}",
        switchover.failures()
    );
    assert_eq!(switchover.from.weight(), 100, "rollback restores the source");
    assert_eq!(switchover.to.weight(), 0, "rollback restores the target");

    feeder.send(true).expect("feeder alive");
    route.stop_all();
    metrics.stop();
}

/// Test that an explicit stop leaves Stopped status
///
/// SCENARIO: A running switchover with no rollback is stopped by the
/// operator before any step happens.
///
/// EXPECTED: Status Stopped, weights untouched.
#[tokio::test(flavor = "multi_thread")]
async fn explicit_stop_keeps_weights() {
    // ARRANGE
    let (metrics, route) = setup();
    let condition = Condition::new(
        "6xxRate",
        Operator::Less,
        0.1,
        Duration::from_secs(1),
        Duration::from_secs(10),
    )
    .expect("condition");
    let switchover = route
        .start_switchover(
            Some("v1"),
            "v2",
            vec![condition],
            Duration::from_secs(5),
            5,
            10,
            false,
            false,
        )
        .expect("start switchover");

    // ACT
    route.remove_switchover();

    // ASSERT
    assert_eq!(switchover.status(), SwitchoverStatus::Stopped);
    assert_eq!(switchover.from.weight(), 100);
    assert_eq!(switchover.to.weight(), 0);
    assert!(route.switchover().is_none(), "the route slot is cleared");

    route.stop_all();
    metrics.stop();
}
