//! Configuration loading and gateway assembly
//!
//! The TOML file holds one `[gateway]` block plus any number of `[[routes]]`
//! with their backends, threshold conditions, strategy descriptor, and an
//! optional switchover. Durations are plain seconds. `Config::build` turns
//! the parsed file into a running [`Gateway`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::condition::{Condition, DEFAULT_METRICS};
use crate::error::{Error, Result};
use crate::gateway::{Gateway, Timeouts};
use crate::metrics::{MetricStore, PromMetrics, Repository};
use crate::route::{self, Route, Strategy};

/// Samples buffered between the request path and the aggregation job.
const INGRESS_BUFFER: usize = 4096;
/// Scrape snapshots buffered between scrape loops and the listen loop.
const SCRAPE_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
    pub admin_addr: Option<SocketAddr>,
    #[serde(default = "default_rw_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_rw_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_rw_timeout")]
    pub http_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_granularity")]
    pub metrics_granularity: u64,
    #[serde(default = "default_retention")]
    pub metrics_retention: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub name: String,
    pub prefix: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_host")]
    pub host: String,
    pub rewrite: Option<String>,
    #[serde(default = "default_cookie_ttl")]
    pub cookie_ttl: u64,
    #[serde(default = "default_true")]
    pub healthcheck: bool,
    #[serde(default = "default_interval")]
    pub healthcheck_interval: u64,
    #[serde(default = "default_interval")]
    pub monitoring_interval: u64,
    #[serde(default = "default_interval")]
    pub scrape_interval: u64,
    #[serde(default = "default_rw_timeout")]
    pub timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub strategy: StrategyConfig,
    pub backends: Vec<BackendConfig>,
    pub switchover: Option<SwitchoverConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub header_name: Option<String>,
    pub header_value: Option<String>,
    /// Backend name the header or shadow strategy targets.
    pub target: Option<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            kind: "sticky".to_string(),
            header_name: None,
            header_value: None,
            target: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub id: Option<Uuid>,
    pub name: String,
    pub addr: String,
    #[serde(default = "default_weight")]
    pub weight: u8,
    pub scrape_url: Option<String>,
    #[serde(default)]
    pub scrape_metrics: Vec<String>,
    pub healthcheck_url: Option<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub metric: String,
    pub operator: String,
    pub threshold: f64,
    /// Seconds the predicate must hold before an alert fires.
    pub active_for: u64,
    /// Seconds the predicate must be false before the alert resolves;
    /// 0 keeps the alert active indefinitely.
    #[serde(default)]
    pub resolve_in: u64,
}

impl ConditionConfig {
    pub fn build(&self) -> Result<Condition> {
        Condition::new(
            &self.metric,
            self.operator.parse()?,
            self.threshold,
            Duration::from_secs(self.active_for),
            Duration::from_secs(self.resolve_in),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchoverConfig {
    pub from: Option<String>,
    pub to: String,
    #[serde(default = "default_weight_change")]
    pub weight_change: u8,
    #[serde(default = "default_switchover_timeout")]
    pub timeout: u64,
    pub allowed_failures: u32,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub rollback: bool,
    pub conditions: Vec<ConditionConfig>,
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_rw_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_granularity() -> u64 {
    5
}

fn default_retention() -> u64 {
    720
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_host() -> String {
    "*".to_string()
}

fn default_cookie_ttl() -> u64 {
    120
}

fn default_interval() -> u64 {
    5
}

fn default_weight() -> u8 {
    100
}

fn default_weight_change() -> u8 {
    5
}

fn default_switchover_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {path}: {e}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.gateway.metrics_granularity == 0 {
            return Err(Error::Config("metrics_granularity must be non-zero".into()));
        }
        for route in &self.routes {
            if route.backends.is_empty() {
                return Err(Error::Config(format!(
                    "route {} has no backends",
                    route.name
                )));
            }
            if route.healthcheck && route.healthcheck_interval == 0 {
                return Err(Error::Config(format!(
                    "route {} needs a non-zero healthcheck_interval",
                    route.name
                )));
            }
            if route.monitoring_interval == 0 || route.scrape_interval == 0 {
                return Err(Error::Config(format!(
                    "route {} needs non-zero monitoring and scrape intervals",
                    route.name
                )));
            }
        }
        Ok(())
    }

    /// Assemble the metrics pipeline, all routes, and the gateway. Spawns
    /// the background loops, so a runtime must be active.
    pub fn build(&self) -> Result<Arc<Gateway>> {
        let store = MetricStore::start(
            Duration::from_secs(self.gateway.metrics_retention),
            Duration::from_secs(self.gateway.metrics_granularity),
        );
        let prom = Arc::new(PromMetrics::new().map_err(|e| Error::Config(e.to_string()))?);
        let metrics = Repository::new(store, prom, INGRESS_BUFFER, SCRAPE_BUFFER)?;

        let gateway = Arc::new(Gateway::new(
            self.gateway.addr,
            Timeouts {
                read: Duration::from_secs(self.gateway.read_timeout),
                write: Duration::from_secs(self.gateway.write_timeout),
                http: Duration::from_secs(self.gateway.http_timeout),
                idle: Duration::from_secs(self.gateway.idle_timeout),
            },
            metrics,
        ));

        for route_cfg in &self.routes {
            let route = build_route(route_cfg, Arc::clone(gateway.metrics()))?;
            gateway.register_route(Arc::clone(&route))?;
            route.reload()?;

            if let Some(sw) = &route_cfg.switchover {
                let conditions = sw
                    .conditions
                    .iter()
                    .map(ConditionConfig::build)
                    .collect::<Result<Vec<_>>>()?;
                let target_scrapes = route_cfg
                    .backends
                    .iter()
                    .find(|b| b.name == sw.to)
                    .map(|b| b.scrape_metrics.as_slice())
                    .unwrap_or_default();
                for condition in &conditions {
                    check_metric_name(&condition.metric, target_scrapes, &sw.to)?;
                }
                route.start_switchover(
                    sw.from.as_deref(),
                    &sw.to,
                    conditions,
                    Duration::from_secs(sw.timeout),
                    sw.allowed_failures,
                    sw.weight_change,
                    sw.force,
                    sw.rollback,
                )?;
            }
        }
        Ok(gateway)
    }
}

fn build_route(cfg: &RouteConfig, metrics: Arc<Repository>) -> Result<Arc<Route>> {
    let route = Route::new(
        &cfg.name,
        &cfg.prefix,
        cfg.rewrite.as_deref(),
        &cfg.host,
        &cfg.methods,
        Duration::from_secs(cfg.timeout),
        Duration::from_secs(cfg.idle_timeout),
        Duration::from_secs(cfg.scrape_interval),
        Duration::from_secs(cfg.healthcheck_interval),
        Duration::from_secs(cfg.monitoring_interval),
        Duration::from_secs(cfg.cookie_ttl),
        cfg.healthcheck,
        metrics,
    )?;

    for backend_cfg in &cfg.backends {
        let thresholds = backend_cfg
            .conditions
            .iter()
            .map(ConditionConfig::build)
            .collect::<Result<Vec<_>>>()?;
        for condition in &thresholds {
            check_metric_name(&condition.metric, &backend_cfg.scrape_metrics, &backend_cfg.name)?;
        }
        route.add_backend(route::build_backend(
            backend_cfg.id,
            &backend_cfg.name,
            &backend_cfg.addr,
            backend_cfg.weight,
            backend_cfg.scrape_url.as_deref(),
            backend_cfg.scrape_metrics.clone(),
            thresholds,
            backend_cfg.healthcheck_url.as_deref(),
        )?)?;
    }

    route.set_strategy(build_strategy(&cfg.strategy, &route)?)?;
    Ok(route)
}

/// Condition metrics must be one of the derived rates or a metric the
/// backend actually scrapes, otherwise the condition can never fire.
fn check_metric_name(metric: &str, scrape_metrics: &[String], backend: &str) -> Result<()> {
    if DEFAULT_METRICS.contains(&metric) || scrape_metrics.iter().any(|m| m == metric) {
        return Ok(());
    }
    Err(Error::Config(format!(
        "condition metric {metric:?} of backend {backend} is neither a derived rate nor a scraped metric"
    )))
}

fn build_strategy(cfg: &StrategyConfig, route: &Route) -> Result<Strategy> {
    let target = |what: &str| {
        let name = cfg
            .target
            .as_deref()
            .ok_or_else(|| Error::Config(format!("{what} strategy requires a target backend")))?;
        route
            .backend_by_name(name)
            .map(|b| b.id)
            .ok_or_else(|| Error::Config(format!("no backend named {name} on route {}", route.name)))
    };
    match cfg.kind.to_lowercase().as_str() {
        "sticky" => Ok(Strategy::sticky()),
        "slippery" => Ok(Strategy::slippery()),
        "header" => {
            let name = cfg.header_name.as_deref().unwrap_or_default();
            let value = cfg.header_value.as_deref().unwrap_or_default();
            Strategy::header(name, value, target("header")?)
        }
        "shadow" => Ok(Strategy::shadow(target("shadow")?)),
        other => Err(Error::Config(format!(
            "unknown strategy type {other:?}, expected sticky, slippery, header, or shadow"
        ))),
    }
}
