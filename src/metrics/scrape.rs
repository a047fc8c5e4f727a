//! Prometheus scrape client
//!
//! Periodically fetches Prometheus text exposition from a backend and
//! extracts the configured series. The parser handles comment lines,
//! scientific notation, and comma-grouped numbers.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

/// One published scrape result for a backend
#[derive(Debug, Clone)]
pub struct ScrapeSnapshot {
    pub backend_id: Uuid,
    pub metrics: HashMap<String, f64>,
}

/// Parse a decimal that may carry comma grouping or an e/E exponent.
pub fn parse_value(raw: &str) -> Result<f64> {
    if let Ok(value) = raw.parse::<f64>() {
        return Ok(value);
    }
    let cleaned = raw.replace(',', "");
    cleaned
        .parse::<f64>()
        .map_err(|_| Error::Scrape(format!("cannot parse value {raw:?}")))
}

/// Find `name` in a Prometheus text body and return its value.
///
/// Each data line is tokenized on the first space; the first token must
/// match the requested name literally. Lines starting with `#` are comments.
pub fn find_metric(body: &str, name: &str) -> Result<f64> {
    for line in body.lines() {
        let mut tokens = line.split(' ');
        let Some(first) = tokens.next() else {
            continue;
        };
        if first.starts_with('#') {
            continue;
        }
        if first == name {
            let value = tokens
                .next()
                .ok_or_else(|| Error::Scrape(format!("no value for metric {name}")))?;
            return parse_value(value);
        }
    }
    Err(Error::Scrape(format!("metric {name} not found in scrape body")))
}

/// Extract every requested metric from one scrape body. Missing series are
/// simply absent from the result.
pub fn extract_metrics(body: &str, names: &[String]) -> HashMap<String, f64> {
    let mut out = HashMap::with_capacity(names.len());
    for name in names {
        match find_metric(body, name) {
            Ok(value) => {
                out.insert(name.clone(), value);
            }
            Err(err) => tracing::debug!(metric = %name, %err, "scrape metric missing"),
        }
    }
    out
}

/// Scrape loop for one backend.
///
/// Transport errors increase a back-off counter N so the next attempt waits
/// N extra seconds; any successful response resets the counter.
pub async fn run_scrape_loop(
    client: reqwest::Client,
    backend_id: Uuid,
    scrape_url: Url,
    metric_names: Vec<String>,
    interval: Duration,
    tx: mpsc::Sender<ScrapeSnapshot>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut errors: u32 = 0;
    tracing::debug!(backend = %backend_id, url = %scrape_url, "scrape loop started");
    loop {
        let backoff = Duration::from_secs(u64::from(errors));
        tokio::select! {
            _ = stop_rx.changed() => {
                tracing::debug!(backend = %backend_id, "scrape loop stopped");
                return;
            }
            _ = tokio::time::sleep(interval + backoff) => {}
        }

        match client.get(scrape_url.clone()).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => {
                    errors = 0;
                    let snapshot = ScrapeSnapshot {
                        backend_id,
                        metrics: extract_metrics(&body, &metric_names),
                    };
                    if tx.send(snapshot).await.is_err() {
                        // repository is gone, nothing left to feed
                        return;
                    }
                }
                Err(err) => {
                    errors += 1;
                    tracing::warn!(backend = %backend_id, %err, errors, "scrape body read failed");
                }
            },
            Err(err) => {
                errors += 1;
                tracing::warn!(backend = %backend_id, %err, errors, "scrape request failed");
            }
        }
    }
}
