use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::http::Method;
use axum::routing::MethodRouter;
use axum::Router;

/// Authorization requirement of one contributed route.
#[derive(Clone, Debug, Default)]
pub struct RouteAuth {
    pub required: bool,
    pub permissions: HashSet<String>,
}

impl RouteAuth {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn required(permissions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: true,
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }
}

/// A route a plugin contributes, mounted under `/plugins/{plugin}{path}`
/// while the plugin is started.
pub struct PluginRoute {
    pub method: Method,
    /// Plugin-local path, e.g. `/notes` or `/notes/{id}`.
    pub path: String,
    pub handler: MethodRouter,
    pub auth: RouteAuth,
}

impl PluginRoute {
    pub fn new(method: Method, path: impl Into<String>, handler: MethodRouter) -> Self {
        Self {
            method,
            path: path.into(),
            handler,
            auth: RouteAuth::open(),
        }
    }

    pub fn with_auth(mut self, auth: RouteAuth) -> Self {
        self.auth = auth;
        self
    }
}

/// Auth rule kept alongside the compiled router for dispatch-time checks.
#[derive(Clone, Debug)]
pub struct RouteRule {
    pub method: Method,
    pub pattern: String,
    pub auth: RouteAuth,
}

/// A started plugin's mounted surface: the compiled router plus the auth
/// rules the front door enforces before dispatching into it.
pub struct MountEntry {
    pub router: Router,
    pub rules: Vec<RouteRule>,
}

impl MountEntry {
    /// Compile contributed routes into one router. Routes sharing a path
    /// are merged into a single method router.
    pub fn compile(routes: Vec<PluginRoute>) -> Arc<Self> {
        let mut rules = Vec::with_capacity(routes.len());
        let mut by_path: HashMap<String, MethodRouter> = HashMap::new();
        for route in routes {
            rules.push(RouteRule {
                method: route.method,
                pattern: route.path.clone(),
                auth: route.auth,
            });
            match by_path.remove(&route.path) {
                Some(existing) => {
                    by_path.insert(route.path, existing.merge(route.handler));
                }
                None => {
                    by_path.insert(route.path, route.handler);
                }
            }
        }
        let mut router = Router::new();
        for (path, handler) in by_path {
            router = router.route(&path, handler);
        }
        Arc::new(Self { router, rules })
    }

    /// The auth requirement matching a plugin-local request, if any rule
    /// matches it.
    pub fn auth_for(&self, method: &Method, path: &str) -> Option<&RouteAuth> {
        self.rules
            .iter()
            .find(|r| &r.method == method && pattern_matches(&r.pattern, path))
            .map(|r| &r.auth)
    }
}

/// Match an axum-style pattern (`/notes/{id}`, `/files/{*rest}`) against a
/// concrete path.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    for (idx, segment) in pattern_segments.iter().enumerate() {
        if segment.starts_with("{*") {
            return true;
        }
        let Some(actual) = path_segments.get(idx) else {
            return false;
        };
        if segment.starts_with('{') && segment.ends_with('}') {
            continue;
        }
        if segment != actual {
            return false;
        }
    }
    pattern_segments.len() == path_segments.len()
}
