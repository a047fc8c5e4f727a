//! Upstream backend state
//!
//! A backend owns its weight, active flag, and the map of currently active
//! alerts. The alert-consumer loop drains the channel handed out by the
//! metrics repository and flips the active flag, asking the owning route to
//! recompute its target distribution on every transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use tokio::sync::{mpsc, watch};
use url::Url;
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::{Error, Result};
use crate::metrics::{Alert, AlertKind};

use super::Route;

#[derive(Debug)]
struct State {
    weight: u8,
    active: bool,
}

/// One upstream target of a route
#[derive(Debug)]
pub struct Backend {
    pub id: Uuid,
    pub name: String,
    pub addr: Url,
    pub scrape_url: Option<Url>,
    pub scrape_metrics: Vec<String>,
    pub thresholds: Vec<Condition>,
    pub healthcheck_url: Url,
    state: Mutex<State>,
    active_alerts: Mutex<HashMap<String, Alert>>,
    /// Set once the metrics repository has handed out an alert channel.
    registered: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Backend {
    /// Create a backend. New backends start inactive; the first successful
    /// health check (or the first weight recompute on routes without health
    /// checking) activates them.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Option<Uuid>,
        name: &str,
        addr: Url,
        weight: u8,
        scrape_url: Option<Url>,
        scrape_metrics: Vec<String>,
        thresholds: Vec<Condition>,
        healthcheck_url: Option<Url>,
    ) -> Result<Self> {
        if weight > 100 {
            return Err(Error::Config(format!(
                "weight of backend {name} cannot be larger than 100"
            )));
        }
        let id = id.unwrap_or_else(Uuid::new_v4);
        let name = if name.is_empty() {
            id.to_string()
        } else {
            name.to_string()
        };
        let healthcheck_url = match healthcheck_url {
            Some(url) => url,
            None => addr
                .join("/")
                .map_err(|e| Error::Config(format!("healthcheck url for {name}: {e}")))?,
        };
        let (stop_tx, _) = watch::channel(false);

        Ok(Backend {
            id,
            name,
            addr,
            scrape_url,
            scrape_metrics,
            thresholds,
            healthcheck_url,
            state: Mutex::new(State {
                weight,
                active: false,
            }),
            active_alerts: Mutex::new(HashMap::new()),
            registered: AtomicBool::new(false),
            stop_tx,
        })
    }

    pub fn weight(&self) -> u8 {
        self.state.lock().expect("backend state poisoned").weight
    }

    pub fn set_weight(&self, weight: u8) {
        let mut state = self.state.lock().expect("backend state poisoned");
        tracing::debug!(backend = %self.id, from = state.weight, to = weight, "updating weight");
        state.weight = weight;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().expect("backend state poisoned").active
    }

    /// Flip the active flag. Returns false when the flag already had the
    /// requested value, so transitions stay idempotent.
    pub fn set_active(&self, active: bool) -> bool {
        let mut state = self.state.lock().expect("backend state poisoned");
        if state.active == active {
            return false;
        }
        state.active = active;
        if active {
            tracing::info!(backend = %self.id, name = %self.name, "enabling backend");
        } else {
            tracing::info!(backend = %self.id, name = %self.name, "disabling backend");
        }
        true
    }

    pub fn active_alerts(&self) -> HashMap<String, Alert> {
        self.active_alerts.lock().expect("alerts poisoned").clone()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Stop the alert-consumer loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        tracing::debug!(backend = %self.id, "stopped backend");
    }

    fn apply_alert(&self, alert: Alert) -> Option<bool> {
        let mut alerts = self.active_alerts.lock().expect("alerts poisoned");
        match alert.kind {
            AlertKind::Alarming => {
                alerts.insert(alert.metric.clone(), alert);
                Some(false)
            }
            AlertKind::Pending => {
                alerts.insert(alert.metric.clone(), alert);
                None
            }
            AlertKind::Resolved => {
                alerts.remove(&alert.metric);
                alerts.is_empty().then_some(true)
            }
        }
    }
}

/// Alert-consumer loop of one backend.
///
/// Alarming disables the backend, Resolved re-enables it once the alert map
/// is empty, Pending only records. Every flip asks the route to recompute
/// its target distribution.
pub(crate) async fn consume_alerts(
    backend: std::sync::Arc<Backend>,
    mut alert_rx: mpsc::Receiver<Alert>,
    route: Weak<Route>,
) {
    let mut stop_rx = backend.stop_signal();
    tracing::debug!(backend = %backend.id, "listening for alerts");
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            alert = alert_rx.recv() => {
                let Some(alert) = alert else { return };
                tracing::debug!(backend = %backend.id, kind = ?alert.kind, metric = %alert.metric, "alert received");
                if let Some(active) = backend.apply_alert(alert) {
                    if backend.set_active(active) {
                        if let Some(route) = route.upgrade() {
                            route.recompute_weights();
                        }
                    }
                }
            }
        }
    }
}
