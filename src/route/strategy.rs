//! Backend selection strategies
//!
//! A strategy decides which backend serves a request. Sticky pins clients to
//! a backend via a session cookie, slippery redraws on every request, header
//! routes matching requests to a fixed canary target, and shadow mirrors
//! traffic to a target whose responses are discarded.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};

use super::proxy::ProxyRequest;
use super::{Backend, Route};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Weighted draw, pinned per client with a session cookie.
    Sticky,
    /// Weighted draw on every request.
    Slippery,
    /// Requests carrying the header go to the target, the rest follow the
    /// weighted distribution.
    Header {
        header_name: String,
        header_value: String,
        target: Uuid,
    },
    /// Weighted draw for the real response, with a mirrored copy sent to the
    /// target whose response is consumed and recorded but never returned.
    Shadow { target: Uuid },
}

/// What the route should do with one request.
pub(crate) enum Selection {
    Primary {
        backend: Arc<Backend>,
        set_cookie: bool,
    },
    Shadowed {
        primary: Arc<Backend>,
        shadow: Arc<Backend>,
    },
}

impl Strategy {
    pub fn sticky() -> Self {
        Strategy::Sticky
    }

    pub fn slippery() -> Self {
        Strategy::Slippery
    }

    pub fn header(header_name: &str, header_value: &str, target: Uuid) -> Result<Self> {
        if header_name.is_empty() || header_value.is_empty() {
            return Err(Error::Config(
                "header strategy requires a header name and value".into(),
            ));
        }
        Ok(Strategy::Header {
            header_name: header_name.to_string(),
            header_value: header_value.to_string(),
            target,
        })
    }

    pub fn shadow(target: Uuid) -> Self {
        Strategy::Shadow { target }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Strategy::Sticky => "sticky",
            Strategy::Slippery => "slippery",
            Strategy::Header { .. } => "header",
            Strategy::Shadow { .. } => "shadow",
        }
    }

    /// Sticky and slippery both drive the full distribution, which is what a
    /// switchover needs to shift traffic.
    pub fn is_session_based(&self) -> bool {
        matches!(self, Strategy::Sticky | Strategy::Slippery)
    }

    pub fn target(&self) -> Option<Uuid> {
        match self {
            Strategy::Header { target, .. } | Strategy::Shadow { target } => Some(*target),
            _ => None,
        }
    }

    /// Check that the target backend, if any, belongs to the route.
    pub fn validate(&self, route: &Route) -> Result<()> {
        if let Some(target) = self.target() {
            route.backend_by_id(target).ok_or(Error::BackendNotFound(target))?;
        }
        Ok(())
    }

    pub(crate) fn select(&self, route: &Route, request: &ProxyRequest) -> Result<Selection> {
        match self {
            Strategy::Slippery => Ok(Selection::Primary {
                backend: route.next_backend()?,
                set_cookie: false,
            }),
            Strategy::Sticky => {
                if let Some(value) = request.cookie(&route.cookie_name()) {
                    if let Ok(id) = value.parse::<Uuid>() {
                        if let Some(backend) = route.backend_by_id(id).filter(|b| b.is_active()) {
                            return Ok(Selection::Primary {
                                backend,
                                set_cookie: false,
                            });
                        }
                    }
                    tracing::debug!(route = %route.name, "session cookie names no active backend, redrawing");
                }
                Ok(Selection::Primary {
                    backend: route.next_backend()?,
                    set_cookie: true,
                })
            }
            Strategy::Header {
                header_name,
                header_value,
                target,
            } => {
                let matched = request
                    .headers
                    .get(header_name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v == header_value);
                if matched {
                    let backend = route
                        .backend_by_id(*target)
                        .ok_or(Error::BackendNotFound(*target))?;
                    return Ok(Selection::Primary {
                        backend,
                        set_cookie: false,
                    });
                }
                Ok(Selection::Primary {
                    backend: route.next_backend()?,
                    set_cookie: false,
                })
            }
            Strategy::Shadow { target } => {
                let shadow = route
                    .backend_by_id(*target)
                    .ok_or(Error::BackendNotFound(*target))?;
                Ok(Selection::Shadowed {
                    primary: route.next_backend()?,
                    shadow,
                })
            }
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}
