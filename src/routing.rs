//! Longest-prefix route resolution

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::model::Route;
use crate::store::RouteStore;

/// A resolved route for one request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// The selected route
    pub route: Route,
    /// The prefix that matched
    pub matched_prefix: String,
    /// Path to append to the target base URL
    pub remaining_path: String,
}

/// Resolves request paths against the active route set
#[derive(Clone)]
pub struct RouteMatcher {
    routes: Arc<dyn RouteStore>,
}

impl RouteMatcher {
    /// Create a matcher reading from `routes`
    #[must_use]
    pub fn new(routes: Arc<dyn RouteStore>) -> Self {
        Self { routes }
    }

    /// Resolve `path` to the most specific active route.
    ///
    /// A route store fault resolves to `None`, the same as no match.
    pub async fn resolve(&self, path: &str) -> Option<RouteMatch> {
        let routes = match self.routes.find_active_routes().await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(path, error = %e, "Route store unavailable, treating as no route");
                return None;
            }
        };

        let route = select(routes, path)?;
        debug!(path, route = %route.id, prefix = %route.path_prefix, "Route matched");
        Some(RouteMatch {
            matched_prefix: route.path_prefix.clone(),
            remaining_path: route.remaining_path(path),
            route,
        })
    }
}

/// Longest covering prefix; ties go to the earliest created, then smallest id
fn select(routes: Vec<Route>, path: &str) -> Option<Route> {
    routes
        .into_iter()
        .filter(|r| r.active && r.covers(path))
        .min_by(|a, b| specificity(a, b))
}

fn specificity(a: &Route, b: &Route) -> Ordering {
    b.path_prefix
        .len()
        .cmp(&a.path_prefix.len())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use crate::store::StaticRoutes;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn route(id: &str, prefix: &str, created_secs: i64) -> Route {
        Route::from_config(
            &RouteConfig {
                id: id.to_string(),
                path_prefix: prefix.to_string(),
                target_url: "http://localhost:3000".to_string(),
                ..Default::default()
            },
            Utc.timestamp_opt(created_secs, 0).unwrap(),
        )
        .unwrap()
    }

    fn matcher(routes: Vec<Route>) -> RouteMatcher {
        RouteMatcher::new(Arc::new(StaticRoutes::new(routes)))
    }

    #[tokio::test]
    async fn test_longest_prefix_wins_regardless_of_order() {
        let m = matcher(vec![
            route("short", "/api", 0),
            route("long", "/api/users", 1),
            route("mid", "/api/u", 2),
        ]);
        let resolved = m.resolve("/api/users/42").await.unwrap();
        assert_eq!(resolved.route.id, "long");
        assert_eq!(resolved.matched_prefix, "/api/users");
        assert_eq!(resolved.remaining_path, "/api/users/42");

        // `/api/u` does not end at a segment boundary for `/api/ux`
        assert_eq!(m.resolve("/api/ux").await.unwrap().route.id, "short");
        assert_eq!(m.resolve("/api/u/1").await.unwrap().route.id, "mid");
        assert_eq!(m.resolve("/api/other").await.unwrap().route.id, "short");
    }

    #[tokio::test]
    async fn test_exact_match_and_boundary() {
        let m = matcher(vec![route("users", "/users", 0)]);
        assert!(m.resolve("/users").await.is_some());
        assert!(m.resolve("/users/1").await.is_some());
        assert!(m.resolve("/users2").await.is_none());
        assert!(m.resolve("/").await.is_none());
    }

    #[tokio::test]
    async fn test_root_prefix_catches_everything() {
        let m = matcher(vec![route("root", "/", 0), route("api", "/api", 1)]);
        assert_eq!(m.resolve("/anything").await.unwrap().route.id, "root");
        assert_eq!(m.resolve("/api/x").await.unwrap().route.id, "api");
    }

    #[tokio::test]
    async fn test_tie_break_earliest_created_then_id() {
        let m = matcher(vec![route("b", "/same", 5), route("a", "/same", 9), route("c", "/same", 5)]);
        assert_eq!(m.resolve("/same").await.unwrap().route.id, "b");

        let m = matcher(vec![route("z", "/same", 1), route("y", "/same", 1)]);
        assert_eq!(m.resolve("/same/x").await.unwrap().route.id, "y");
    }

    #[tokio::test]
    async fn test_strip_prefix_remaining_path() {
        let mut r = route("api", "/api", 0);
        r.strip_prefix = true;
        let m = matcher(vec![r]);
        assert_eq!(m.resolve("/api/users").await.unwrap().remaining_path, "/users");
    }

    struct FailingStore;

    #[async_trait]
    impl RouteStore for FailingStore {
        async fn find_active_routes(&self) -> Result<Vec<Route>> {
            Err(Error::Store("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_fault_is_not_found() {
        let m = RouteMatcher::new(Arc::new(FailingStore));
        assert!(m.resolve("/api").await.is_none());
    }
}
