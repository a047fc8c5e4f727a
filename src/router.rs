//! Per-host request router
//!
//! One longest-prefix table per HTTP method. Methods are case-insensitive
//! (normalized to upper case); path matching is case-sensitive. The router
//! is a plain value: the gateway rebuilds the whole per-host map on reload
//! and swaps it in atomically, so no interior mutability is needed here.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Method-scoped longest-prefix dispatch table
#[derive(Debug, Clone)]
pub struct Router<H> {
    trees: HashMap<String, HashMap<String, H>>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Router {
            trees: HashMap::new(),
        }
    }
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(method: &str, prefix: &str) -> Result<String> {
        if method.is_empty() {
            return Err(Error::Config("method cannot be empty".into()));
        }
        if prefix.is_empty() || !prefix.starts_with('/') {
            return Err(Error::Config(
                "prefix cannot be empty and must start with \"/\"".into(),
            ));
        }
        Ok(method.to_uppercase())
    }

    /// Install a handler for `(method, prefix)`. Rejects duplicates.
    pub fn register(&mut self, method: &str, prefix: &str, handler: H) -> Result<()> {
        let method = Self::normalize(method, prefix)?;
        let tree = self.trees.entry(method.clone()).or_default();
        if tree.contains_key(prefix) {
            return Err(Error::Config(format!(
                "handler already exists for method {method} and prefix {prefix}"
            )));
        }
        tree.insert(prefix.to_string(), handler);
        Ok(())
    }

    /// Remove the handler for `(method, prefix)`.
    pub fn remove(&mut self, method: &str, prefix: &str) -> Result<H> {
        let method = Self::normalize(method, prefix)?;
        self.trees
            .get_mut(&method)
            .and_then(|tree| tree.remove(prefix))
            .ok_or_else(|| Error::Config(format!("no handler for method {method} and prefix {prefix}")))
    }

    /// Longest-prefix match of `path` within the method's table.
    pub fn lookup(&self, method: &str, path: &str) -> Option<&H> {
        let tree = self.trees.get(&method.to_uppercase())?;
        // walk the path back to front so the first hit is the longest prefix
        for end in (1..=path.len()).rev() {
            if !path.is_char_boundary(end) {
                continue;
            }
            if let Some(handler) = tree.get(&path[..end]) {
                return Some(handler);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.trees.values().all(|tree| tree.is_empty())
    }

    /// Every registered (method, prefix) pair.
    pub fn handles(&self) -> impl Iterator<Item = (&str, &str, &H)> {
        self.trees.iter().flat_map(|(method, tree)| {
            tree.iter()
                .map(move |(prefix, handler)| (method.as_str(), prefix.as_str(), handler))
        })
    }
}

impl<H: PartialEq> PartialEq for Router<H> {
    fn eq(&self, other: &Self) -> bool {
        self.trees == other.trees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_longest_prefix() {
        let mut router = Router::new();
        router.register("GET", "/", 1).unwrap();
        router.register("GET", "/api/", 2).unwrap();
        router.register("GET", "/api/v2/", 3).unwrap();

        assert_eq!(router.lookup("GET", "/index.html"), Some(&1));
        assert_eq!(router.lookup("GET", "/api/users"), Some(&2));
        assert_eq!(router.lookup("GET", "/api/v2/users"), Some(&3));
    }

    #[test]
    fn method_matching_is_case_insensitive() {
        let mut router = Router::new();
        router.register("get", "/", 1).unwrap();
        assert_eq!(router.lookup("GET", "/x"), Some(&1));
        assert_eq!(router.lookup("get", "/x"), Some(&1));
    }

    #[test]
    fn path_matching_is_case_sensitive() {
        let mut router = Router::new();
        router.register("GET", "/API/", 1).unwrap();
        assert_eq!(router.lookup("GET", "/API/x"), Some(&1));
        assert_eq!(router.lookup("GET", "/api/x"), None);
    }

    #[test]
    fn unknown_method_has_no_match() {
        let mut router = Router::new();
        router.register("GET", "/", 1).unwrap();
        assert_eq!(router.lookup("DELETE", "/x"), None);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut router = Router::new();
        router.register("GET", "/api/", 1).unwrap();
        assert!(router.register("GET", "/api/", 2).is_err());
        // same prefix on another method is fine
        router.register("POST", "/api/", 2).unwrap();
    }

    #[test]
    fn invalid_method_or_prefix_is_rejected() {
        let mut router: Router<i32> = Router::new();
        assert!(router.register("", "/x/", 1).is_err());
        assert!(router.register("GET", "no-slash", 1).is_err());
        assert!(router.register("GET", "", 1).is_err());
    }

    #[test]
    fn remove_restores_prior_shape() {
        let mut router = Router::new();
        router.register("GET", "/", 1).unwrap();
        let before = router.clone();
        router.register("GET", "/api/", 2).unwrap();
        router.remove("GET", "/api/").unwrap();
        assert_eq!(router, before);
        assert!(router.remove("GET", "/api/").is_err());
    }

    #[test]
    fn multibyte_paths_do_not_panic() {
        let mut router = Router::new();
        router.register("GET", "/", 1).unwrap();
        assert_eq!(router.lookup("GET", "/caf\u{e9}/x"), Some(&1));
    }
}
