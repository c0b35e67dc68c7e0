use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, anyhow};
use http::{Method, Uri};

use crate::config::{PathRewrite, RouteConfig, UpstreamConfig};

pub const UNKNOWN_SERVICE: &str = "unknown";

#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub service: String,
    pub base_url: String,
    pub timeout: Duration,
    pub methods: Vec<Method>,
    /// Narrower method set for the bare prefix path (`/tasks` as opposed to `/tasks/42`).
    pub root_methods: Option<Vec<Method>>,
    pub rewrite: PathRewrite,
}

impl Route {
    pub fn methods_for(&self, path: &str) -> &[Method] {
        match &self.root_methods {
            Some(root) if self.is_bare(path) => root,
            _ => &self.methods,
        }
    }

    pub fn allows(&self, method: &Method, path: &str) -> bool {
        self.methods_for(path).iter().any(|m| m == method)
    }

    fn is_bare(&self, path: &str) -> bool {
        path == self.prefix || path.strip_suffix('/') == Some(self.prefix.as_str())
    }

    /// Backend-relative path for `path`, per the route's rewrite rule.
    pub fn rewrite_path<'a>(&self, path: &'a str) -> &'a str {
        match self.rewrite {
            PathRewrite::Keep => path,
            PathRewrite::StripPrefix if self.prefix == "/" => path,
            PathRewrite::StripPrefix => match path.strip_prefix(self.prefix.as_str()) {
                Some("") | None => "/",
                Some(rest) => rest,
            },
        }
    }

    pub fn target_url(&self, uri: &Uri) -> String {
        let path = self.rewrite_path(uri.path());
        match uri.query() {
            Some(query) => format!("{}{}?{}", self.base_url, path, query),
            None => format!("{}{}", self.base_url, path),
        }
    }
}

/// Static prefix table, built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn from_config(routes: &[RouteConfig], upstreams: &[UpstreamConfig]) -> Result<Self> {
        let upstreams = upstreams
            .iter()
            .map(|u| (u.name.as_str(), u))
            .collect::<HashMap<_, _>>();

        let mut table = Vec::with_capacity(routes.len());
        for route in routes {
            let upstream = upstreams.get(route.upstream.as_str()).ok_or_else(|| {
                anyhow!(
                    "route {} references unknown upstream {}",
                    route.path_prefix,
                    route.upstream
                )
            })?;

            if table.iter().any(|r: &Arc<Route>| r.prefix == route.path_prefix) {
                return Err(anyhow!("duplicate route prefix {}", route.path_prefix));
            }

            table.push(Arc::new(Route {
                prefix: route.path_prefix.clone(),
                service: upstream.name.clone(),
                base_url: upstream.base_url.trim_end_matches('/').to_string(),
                timeout: Duration::from_millis(upstream.timeout_ms),
                methods: route.methods.clone(),
                root_methods: route.root_methods.clone(),
                rewrite: route.rewrite,
            }));
        }

        Ok(Self { routes: table })
    }

    /// Longest segment-aligned prefix match.
    pub fn resolve(&self, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .filter(|route| prefix_matches(&route.prefix, path))
            .max_by_key(|route| route.prefix.len())
            .cloned()
    }

    /// Service attribution for audit records; independent of dispatch outcome.
    pub fn service_name(&self, path: &str) -> String {
        self.resolve(path)
            .map(|route| route.service.clone())
            .unwrap_or_else(|| UNKNOWN_SERVICE.to_string())
    }
}

/// `/tasks` matches `/tasks` and `/tasks/42`, never `/tasksx`.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        let upstreams = vec![
            UpstreamConfig {
                name: "auth-service".into(),
                base_url: "http://auth:5001/".into(),
                timeout_ms: 1_000,
            },
            UpstreamConfig {
                name: "task-service".into(),
                base_url: "http://tasks:5003".into(),
                timeout_ms: 1_000,
            },
            UpstreamConfig {
                name: "admin-service".into(),
                base_url: "http://admin:5009".into(),
                timeout_ms: 1_000,
            },
        ];
        let routes = vec![
            RouteConfig {
                path_prefix: "/auth".into(),
                upstream: "auth-service".into(),
                methods: vec![Method::POST],
                root_methods: None,
                rewrite: PathRewrite::StripPrefix,
            },
            RouteConfig {
                path_prefix: "/auth/admin".into(),
                upstream: "admin-service".into(),
                methods: vec![Method::GET],
                root_methods: None,
                rewrite: PathRewrite::StripPrefix,
            },
            RouteConfig {
                path_prefix: "/tasks".into(),
                upstream: "task-service".into(),
                methods: vec![Method::GET, Method::POST, Method::PUT, Method::DELETE],
                root_methods: Some(vec![Method::GET, Method::POST]),
                rewrite: PathRewrite::Keep,
            },
        ];
        RouteTable::from_config(&routes, &upstreams).unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let table = table();
        assert_eq!(table.resolve("/auth/login").unwrap().service, "auth-service");
        assert_eq!(table.resolve("/auth/admin/users").unwrap().service, "admin-service");
        assert_eq!(table.resolve("/tasks").unwrap().service, "task-service");
    }

    #[test]
    fn prefix_must_end_on_segment_boundary() {
        let table = table();
        assert!(table.resolve("/tasksx").is_none());
        assert!(table.resolve("/unknown/path").is_none());
        assert_eq!(table.service_name("/unknown/path"), UNKNOWN_SERVICE);
        assert!(prefix_matches("/", "/anything"));
    }

    #[test]
    fn strip_and_keep_rewrites() {
        let table = table();

        let auth = table.resolve("/auth/login").unwrap();
        let uri: Uri = "/auth/login".parse().unwrap();
        assert_eq!(auth.target_url(&uri), "http://auth:5001/login");
        let uri: Uri = "/auth".parse().unwrap();
        assert_eq!(auth.target_url(&uri), "http://auth:5001/");

        let tasks = table.resolve("/tasks/42").unwrap();
        let uri: Uri = "/tasks/42?expand=true".parse().unwrap();
        assert_eq!(tasks.target_url(&uri), "http://tasks:5003/tasks/42?expand=true");
    }

    #[test]
    fn method_membership() {
        let table = table();
        let auth = table.resolve("/auth/login").unwrap();
        assert!(auth.allows(&Method::POST, "/auth/login"));
        assert!(!auth.allows(&Method::GET, "/auth/login"));
    }

    #[test]
    fn bare_prefix_uses_narrower_methods() {
        let table = table();
        let tasks = table.resolve("/tasks").unwrap();

        assert!(tasks.allows(&Method::POST, "/tasks"));
        assert!(!tasks.allows(&Method::PUT, "/tasks"));
        assert!(!tasks.allows(&Method::DELETE, "/tasks/"));
        assert_eq!(tasks.methods_for("/tasks"), &[Method::GET, Method::POST]);

        assert!(tasks.allows(&Method::PUT, "/tasks/42"));
        assert!(tasks.allows(&Method::DELETE, "/tasks/42"));
    }

    #[test]
    fn unknown_upstream_is_rejected() {
        let routes = vec![RouteConfig {
            path_prefix: "/logs".into(),
            upstream: "logs-service".into(),
            methods: vec![Method::GET],
            root_methods: None,
            rewrite: PathRewrite::Keep,
        }];
        assert!(RouteTable::from_config(&routes, &[]).is_err());
    }
}
