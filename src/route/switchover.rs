//! Gradual weight switchover
//!
//! Shifts traffic from one backend to another in fixed weight steps, but only
//! while every configured condition holds against the target backend's recent
//! rates. Too many failed evaluation cycles abort the switchover, optionally
//! rolling the weights back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio::sync::watch;

use crate::condition::Condition;
use crate::error::{Error, Result};

use super::{Backend, Route};

/// Window of rate data each evaluation cycle looks at.
const RATE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchoverStatus {
    Registered,
    Running,
    Stopped,
    Failed,
    Success,
}

#[derive(Debug)]
struct CondState {
    condition: Condition,
    /// First instant of the current true streak.
    trigger: Option<Instant>,
    /// Whether the dwell has elapsed in the current cycle.
    latched: bool,
}

/// What one evaluation cycle concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Every condition held for its dwell; the weights may advance.
    Advance,
    /// All predicates hold but at least one dwell is still running.
    Hold,
    /// A predicate was false or the target inactive; counts one failure.
    Failed,
}

#[derive(Debug)]
pub struct Switchover {
    pub from: Arc<Backend>,
    pub to: Arc<Backend>,
    pub timeout: Duration,
    pub weight_change: u8,
    pub allowed_failures: u32,
    pub rollback: bool,
    conditions: Mutex<Vec<CondState>>,
    failures: AtomicU32,
    rollback_weights: (u8, u8),
    status: Mutex<SwitchoverStatus>,
    stop_tx: watch::Sender<bool>,
}

impl Switchover {
    pub fn new(
        from: Arc<Backend>,
        to: Arc<Backend>,
        conditions: Vec<Condition>,
        timeout: Duration,
        allowed_failures: u32,
        weight_change: u8,
        rollback: bool,
    ) -> Result<Self> {
        if from.id == to.id {
            return Err(Error::Config(
                "switchover source and target cannot be the same backend".into(),
            ));
        }
        if from.weight() != 100 || to.weight() != 0 {
            return Err(Error::Config(format!(
                "switchover requires weights 100/0, got {}/{}",
                from.weight(),
                to.weight()
            )));
        }
        if weight_change == 0 || weight_change > 100 {
            return Err(Error::Config(
                "switchover weight change must be in 1..=100".into(),
            ));
        }
        if conditions.is_empty() {
            return Err(Error::Config(
                "switchover requires at least one condition".into(),
            ));
        }
        let rollback_weights = (from.weight(), to.weight());
        let (stop_tx, _) = watch::channel(false);

        Ok(Switchover {
            from,
            to,
            timeout,
            weight_change,
            allowed_failures,
            rollback,
            conditions: Mutex::new(
                conditions
                    .into_iter()
                    .map(|condition| CondState {
                        condition,
                        trigger: None,
                        latched: false,
                    })
                    .collect(),
            ),
            failures: AtomicU32::new(0),
            rollback_weights,
            status: Mutex::new(SwitchoverStatus::Registered),
            stop_tx,
        })
    }

    pub fn status(&self) -> SwitchoverStatus {
        *self.status.lock().expect("switchover status poisoned")
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: SwitchoverStatus) {
        *self.status.lock().expect("switchover status poisoned") = status;
    }

    /// Stop the loop. A running switchover becomes Stopped; when rollback is
    /// set and the shift did not succeed, the captured weights are restored.
    pub fn stop(&self, route: &Route) {
        {
            let mut status = self.status.lock().expect("switchover status poisoned");
            if *status == SwitchoverStatus::Running {
                *status = SwitchoverStatus::Stopped;
            }
            if self.rollback
                && matches!(*status, SwitchoverStatus::Stopped | SwitchoverStatus::Failed)
            {
                tracing::warn!(
                    from = %self.from.id, to = %self.to.id,
                    "rolling back switchover weights"
                );
                self.from.set_weight(self.rollback_weights.0);
                self.to.set_weight(self.rollback_weights.1);
            }
        }
        route.recompute_weights();
        let _ = self.stop_tx.send(true);
    }

    /// Run one evaluation cycle against the given rates.
    fn evaluate(&self, rates: &HashMap<String, f64>, to_active: bool, now: Instant) -> CycleOutcome {
        let mut conds = self.conditions.lock().expect("conditions poisoned");
        let mut failed = false;
        for state in conds.iter_mut() {
            if state.condition.is_true(rates) && to_active {
                match state.trigger {
                    None => state.trigger = Some(now),
                    Some(trigger) => {
                        if now.duration_since(trigger) >= state.condition.active_for {
                            state.latched = true;
                        }
                    }
                }
            } else {
                state.trigger = None;
                state.latched = false;
                failed = true;
            }
        }
        if failed {
            CycleOutcome::Failed
        } else if conds.iter().all(|state| state.latched) {
            CycleOutcome::Advance
        } else {
            CycleOutcome::Hold
        }
    }

    fn reset_conditions(&self) {
        let mut conds = self.conditions.lock().expect("conditions poisoned");
        for state in conds.iter_mut() {
            state.trigger = None;
            state.latched = false;
        }
    }

    /// Weight-shift loop, spawned by the owning route.
    pub(crate) async fn run(self: Arc<Self>, route: Weak<Route>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        tracing::info!(from = %self.from.id, to = %self.to.id, "switchover running");

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    tracing::info!(from = %self.from.id, to = %self.to.id, status = ?self.status(), "switchover loop exited");
                    return;
                }
                _ = ticker.tick() => {
                    let Some(route) = route.upgrade() else { return };
                    let now = SystemTime::now();
                    let rates = match route
                        .metrics
                        .read_rates_of_backend(self.to.id, now - RATE_WINDOW, now)
                    {
                        Ok(rates) => rates,
                        Err(e) => {
                            tracing::trace!(to = %self.to.id, error = %e, "no rate data yet");
                            continue;
                        }
                    };

                    match self.evaluate(&rates, self.to.is_active(), Instant::now()) {
                        CycleOutcome::Hold => continue,
                        CycleOutcome::Failed => {
                            let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                            tracing::debug!(
                                from = %self.from.id, to = %self.to.id,
                                failures, allowed = self.allowed_failures,
                                "switchover cycle failed"
                            );
                            if failures >= self.allowed_failures {
                                self.set_status(SwitchoverStatus::Failed);
                                self.stop(&route);
                            }
                            continue;
                        }
                        CycleOutcome::Advance => {}
                    }

                    let from_weight = self.from.weight().saturating_sub(self.weight_change);
                    let to_weight = (self.to.weight() + self.weight_change).min(100);
                    self.from.set_weight(from_weight);
                    self.to.set_weight(to_weight);
                    route.recompute_weights();
                    self.reset_conditions();
                    tracing::info!(
                        from = %self.from.id, to = %self.to.id,
                        from_weight, to_weight, "advanced switchover weights"
                    );

                    if from_weight == 0 || to_weight == 100 {
                        self.set_status(SwitchoverStatus::Success);
                        let _ = self.stop_tx.send(true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use url::Url;

    fn backend(weight: u8) -> Arc<Backend> {
        Arc::new(
            Backend::new(
                None,
                "b",
                Url::parse("http://localhost:9090").unwrap(),
                weight,
                None,
                vec![],
                vec![],
                None,
            )
            .unwrap(),
        )
    }

    fn condition(metric: &str) -> Condition {
        Condition::new(
            metric,
            Operator::Less,
            0.1,
            Duration::from_millis(1),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn switchover(from: Arc<Backend>, to: Arc<Backend>) -> Result<Switchover> {
        Switchover::new(
            from,
            to,
            vec![condition("6xxRate")],
            Duration::from_millis(50),
            3,
            20,
            true,
        )
    }

    #[test]
    fn rejects_same_backend() {
        let b = backend(100);
        assert!(matches!(
            switchover(b.clone(), b).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn rejects_weights_other_than_100_0() {
        assert!(switchover(backend(80), backend(20)).is_err());
        assert!(switchover(backend(100), backend(1)).is_err());
        assert!(switchover(backend(100), backend(0)).is_ok());
    }

    #[test]
    fn rejects_zero_weight_change() {
        let err = Switchover::new(
            backend(100),
            backend(0),
            vec![condition("6xxRate")],
            Duration::from_millis(50),
            3,
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn condition_latches_only_after_dwell() {
        let sw = switchover(backend(100), backend(0)).unwrap();
        let mut rates = HashMap::new();
        rates.insert("6xxRate".to_string(), 0.0);

        // first true evaluation only stamps the trigger
        assert_eq!(sw.evaluate(&rates, true, Instant::now()), CycleOutcome::Hold);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            sw.evaluate(&rates, true, Instant::now()),
            CycleOutcome::Advance
        );
    }

    #[test]
    fn inactive_target_resets_trigger() {
        let sw = switchover(backend(100), backend(0)).unwrap();
        let mut rates = HashMap::new();
        rates.insert("6xxRate".to_string(), 0.0);

        assert_eq!(sw.evaluate(&rates, true, Instant::now()), CycleOutcome::Hold);
        std::thread::sleep(Duration::from_millis(5));
        // target went inactive, the streak starts over
        assert_eq!(
            sw.evaluate(&rates, false, Instant::now()),
            CycleOutcome::Failed
        );
        assert_eq!(sw.evaluate(&rates, true, Instant::now()), CycleOutcome::Hold);
    }

    #[test]
    fn missing_metric_never_latches() {
        let sw = switchover(backend(100), backend(0)).unwrap();
        let rates = HashMap::new();
        assert_eq!(
            sw.evaluate(&rates, true, Instant::now()),
            CycleOutcome::Failed
        );
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            sw.evaluate(&rates, true, Instant::now()),
            CycleOutcome::Failed
        );
    }
}
