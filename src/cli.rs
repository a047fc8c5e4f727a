//! Command-line interface for depoy
//!
//! Provides argument parsing and subcommand handling for the depoy binary.

use clap::{Parser, Subcommand};

/// Dynamic reverse proxy with weighted traffic shifting
#[derive(Parser)]
#[command(name = "depoy")]
#[command(version)]
#[command(about = "Dynamic reverse proxy with weighted traffic shifting")]
#[command(
    long_about = "depoy terminates client connections, selects an upstream backend per \
    request according to the configured strategy (sticky, slippery, header, shadow), \
    measures every outcome, and shifts traffic between backend versions while the \
    configured metric conditions hold."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# depoy configuration
# ===================

[gateway]
# Address the proxy listens on
addr = "0.0.0.0:8080"

# Optional admin listener (Prometheus exposition + liveness probe)
admin_addr = "127.0.0.1:8081"

# Connection timeouts in seconds
read_timeout = 10
write_timeout = 10
http_timeout = 10
idle_timeout = 30

# Log level when RUST_LOG is not set (trace, debug, info, warn, error)
log_level = "info"

# Seconds between metric-store aggregation ticks
metrics_granularity = 5

# Seconds an aggregated bucket is retained
metrics_retention = 720

[[routes]]
name = "route1"
prefix = "/"
methods = ["GET", "POST"]
host = "*"
# rewrite = "/api/"
cookie_ttl = 120
healthcheck = true
healthcheck_interval = 5
monitoring_interval = 5
scrape_interval = 5
timeout = 10
idle_timeout = 30

[routes.strategy]
# sticky | slippery | header | shadow
type = "sticky"
# header routing only:
# header_name = "X-Canary"
# header_value = "true"
# target = "v2"

[[routes.backends]]
name = "v1"
addr = "http://localhost:9090"
weight = 100
# healthcheck_url = "http://localhost:9090/"
# scrape_url = "http://localhost:9090/metrics"
# scrape_metrics = ["go_goroutines"]

[[routes.backends.conditions]]
metric = "5xxRate"
operator = ">"
threshold = 0.1
active_for = 10
resolve_in = 20

[[routes.backends]]
name = "v2"
addr = "http://localhost:9091"
weight = 0

# Optional automated weight shift for this route
# [routes.switchover]
# from = "v1"
# to = "v2"
# weight_change = 10
# timeout = 30
# allowed_failures = 5
# force = false
# rollback = true
#
# [[routes.switchover.conditions]]
# metric = "4xxRate"
# operator = "<"
# threshold = 0.1
# active_for = 20
"#
}
