//! Path based command router.
//!
//! A path such as `machine/manage/start/vm1` is matched against registered
//! keys. Two-segment keys (`machine/manage`) win over one-segment keys
//! (`machine`); the unmatched segments are passed to the handler as
//! arguments. Anything else falls through to the default route `/`, whose
//! handler returns an empty string.

use crate::request::Request;
use qmanager_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_ROUTE: &str = "/";

pub type Handler = Arc<dyn Fn(&Request<'_>, &[String]) -> String + Send + Sync>;

fn default_route(_: &Request<'_>, _: &[String]) -> String {
    String::new()
}

/// Collects routes at startup
pub struct RouterBuilder {
    routes: BTreeMap<String, Handler>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        let mut routes: BTreeMap<String, Handler> = BTreeMap::new();
        routes.insert(DEFAULT_ROUTE.to_string(), Arc::new(default_route));
        Self { routes }
    }

    /// Register a new route; an existing key is an error
    pub fn register<F>(&mut self, key: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Request<'_>, &[String]) -> String + Send + Sync + 'static,
    {
        if self.routes.contains_key(key) {
            return Err(Error::DuplicateRoute(key.to_string()));
        }
        check_key(key)?;
        self.routes.insert(key.to_string(), Arc::new(handler));
        Ok(self)
    }

    /// Replace the handler of `key`, registering it when absent.
    ///
    /// The default route cannot be replaced.
    pub fn overwrite<F>(&mut self, key: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Request<'_>, &[String]) -> String + Send + Sync + 'static,
    {
        if key == DEFAULT_ROUTE {
            return Err(Error::DuplicateRoute(key.to_string()));
        }
        check_key(key)?;
        if self
            .routes
            .insert(key.to_string(), Arc::new(handler))
            .is_some()
        {
            warn!(route = key, "Route handler overwritten");
        }
        Ok(self)
    }

    pub fn build(self) -> CommandRouter {
        info!(routes = self.routes.len(), "Command router ready");
        CommandRouter {
            routes: self.routes,
        }
    }
}

fn check_key(key: &str) -> Result<()> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() > 2 || segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidConfig(format!("invalid route key: {:?}", key)));
    }
    Ok(())
}

/// Result of matching a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub key: String,
    pub args: Vec<String>,
}

/// Immutable route table
pub struct CommandRouter {
    routes: BTreeMap<String, Handler>,
}

impl CommandRouter {
    pub fn resolve(&self, path: &str) -> RouteMatch {
        let segments: Vec<&str> = path
            .trim()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        if segments.len() >= 2 {
            let key = format!("{}/{}", segments[0], segments[1]);
            if self.routes.contains_key(&key) {
                return RouteMatch {
                    key,
                    args: to_args(&segments[2..]),
                };
            }
        }
        if let Some(first) = segments.first() {
            if self.routes.contains_key(*first) {
                return RouteMatch {
                    key: first.to_string(),
                    args: to_args(&segments[1..]),
                };
            }
        }
        RouteMatch {
            key: DEFAULT_ROUTE.to_string(),
            args: Vec::new(),
        }
    }

    /// Resolve `path` and run the selected handler
    pub fn run(&self, request: &Request<'_>, path: &str) -> String {
        let matched = self.resolve(path);
        debug!(route = %matched.key, args = ?matched.args, "Route selected");
        match self.routes.get(&matched.key) {
            Some(handler) => handler(request, &matched.args),
            None => String::new(),
        }
    }

    /// Registered keys starting with `prefix`
    pub fn routes(&self, prefix: &str) -> Vec<&str> {
        self.routes
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.routes.contains_key(key)
    }
}

fn to_args(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}
