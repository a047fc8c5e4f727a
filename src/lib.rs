//! depoy: a dynamic reverse proxy with weighted traffic shifting
//!
//! The gateway dispatches requests by host and longest prefix to routes,
//! each of which selects a weighted backend through a strategy (sticky,
//! slippery, header, shadow), forwards via a pooled upstream client, and
//! emits one metric sample per outcome. The metrics repository aggregates
//! samples, evaluates threshold conditions into alerts that flip backends
//! in and out of the target distribution, and feeds the switchover
//! controller that gradually shifts weights between backend versions.

pub mod admin;
pub mod cli;
pub mod condition;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod route;
pub mod router;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::Gateway;
