//! Threshold conditions
//!
//! A condition compares one named metric (a derived rate, mean, or custom
//! scrape metric) against a threshold. The operator is a plain enum so the
//! predicate is recompiled from data on every load; a compiled form is never
//! persisted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Derived metric names every backend offers without scrape configuration.
pub const DEFAULT_METRICS: [&str; 7] = [
    "ContentLength",
    "ResponseTime",
    "2xxRate",
    "3xxRate",
    "4xxRate",
    "5xxRate",
    "6xxRate",
];

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = ">")]
    Greater,
}

impl Operator {
    /// Apply the operator to a measured value and the configured threshold.
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Less => value < threshold,
            Operator::Equal => value == threshold,
            Operator::Greater => value > threshold,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Less => "<",
            Operator::Equal => "==",
            Operator::Greater => ">",
        };
        f.write_str(s)
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "<" => Ok(Operator::Less),
            "==" => Ok(Operator::Equal),
            ">" => Ok(Operator::Greater),
            other => Err(Error::Config(format!(
                "operator {other:?} not allowed, only <, >, =="
            ))),
        }
    }
}

/// A threshold condition on one metric
///
/// `active_for` is the dwell before an alert fires; `resolve_in` the dwell
/// before it resolves (zero means never auto-resolve). Trigger bookkeeping
/// lives with whoever evaluates the condition (monitor loop or switchover),
/// not here.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    pub active_for: Duration,
    pub resolve_in: Duration,
}

impl Condition {
    pub fn new(
        metric: impl Into<String>,
        operator: Operator,
        threshold: f64,
        active_for: Duration,
        resolve_in: Duration,
    ) -> Result<Self> {
        let metric = metric.into();
        if metric.is_empty() {
            return Err(Error::Config("condition metric cannot be empty".into()));
        }
        if active_for.is_zero() {
            return Err(Error::Config(format!(
                "condition on {metric} needs a non-zero active_for"
            )));
        }
        Ok(Condition {
            metric,
            operator,
            threshold,
            active_for,
            resolve_in,
        })
    }

    /// Evaluate the predicate against a metric mapping. A missing metric is
    /// never a match.
    pub fn is_true(&self, rates: &HashMap<String, f64>) -> bool {
        rates
            .get(&self.metric)
            .is_some_and(|value| self.operator.compare(*value, self.threshold))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.operator, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn operator_parses_all_three() {
        assert_eq!("<".parse::<Operator>().unwrap(), Operator::Less);
        assert_eq!("==".parse::<Operator>().unwrap(), Operator::Equal);
        assert_eq!(">".parse::<Operator>().unwrap(), Operator::Greater);
        assert!(">=".parse::<Operator>().is_err());
    }

    #[test]
    fn greater_matches_above_threshold() {
        let cond = Condition::new(
            "5xxRate",
            Operator::Greater,
            0.5,
            Duration::from_secs(2),
            Duration::ZERO,
        )
        .unwrap();

        assert!(cond.is_true(&rates(&[("5xxRate", 0.8)])));
        assert!(!cond.is_true(&rates(&[("5xxRate", 0.5)])));
        assert!(!cond.is_true(&rates(&[("5xxRate", 0.2)])));
    }

    #[test]
    fn missing_metric_is_never_a_match() {
        let cond = Condition::new(
            "my_custom_metric",
            Operator::Less,
            10.0,
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .unwrap();

        assert!(!cond.is_true(&rates(&[("ResponseTime", 1.0)])));
    }

    #[test]
    fn empty_metric_rejected() {
        let err = Condition::new(
            "",
            Operator::Equal,
            1.0,
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_active_for_rejected() {
        let err = Condition::new("2xxRate", Operator::Equal, 1.0, Duration::ZERO, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
