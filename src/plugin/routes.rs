//! Route table for plugin endpoints
//!
//! Plugins never register handlers with the HTTP router directly. Their
//! endpoints are entries in this table, consulted by one dispatch shim per
//! request, so binding and unbinding is a table update rather than a router
//! rebuild. A disabled plugin keeps its entries (nobody else can claim the
//! paths) but lookups report them inactive.

use crate::core::error::LoadError;
use crate::plugin::manifest::{HttpMethod, PluginManifest, normalize_path};
use crate::plugin::middleware::EndpointPolicy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Identifier of one bound route
pub type RouteId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Parsed endpoint path with `{param}` / `:param` captures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    method: HttpMethod,
    path: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        let segments = split(path)
            .map(|segment| {
                if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Segment::Param(name.to_string())
                } else if let Some(name) = segment.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();
        Self {
            method,
            path: path.to_string(),
            segments,
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Two patterns conflict when method and shape are equal
    pub fn conflicts_with(&self, other: &RoutePattern) -> bool {
        self.method == other.method && normalize_path(&self.path) == normalize_path(&other.path)
    }

    /// Captured parameters if `path` matches
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }

    /// Ordering key for overlapping matches: more literal segments first,
    /// then the pattern whose first literal comes earliest
    fn specificity(&self) -> (usize, Vec<bool>) {
        let literals: Vec<bool> = self
            .segments
            .iter()
            .map(|s| matches!(s, Segment::Literal(_)))
            .collect();
        (literals.iter().filter(|l| **l).count(), literals)
    }
}

impl std::fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
struct BoundRoute {
    id: RouteId,
    plugin_id: String,
    pattern: RoutePattern,
    handler: String,
    active: bool,
    policy: Arc<EndpointPolicy>,
}

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route_id: RouteId,
    pub plugin_id: String,
    pub handler: String,
    pub params: HashMap<String, String>,
    pub active: bool,
    /// Declared pattern, e.g. `GET /items/{id}`
    pub pattern: String,
    pub policy: Arc<EndpointPolicy>,
}

/// Public view of a bound route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub id: RouteId,
    pub method: String,
    pub path: String,
    pub handler: String,
    pub active: bool,
}

/// Table of bound plugin routes
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Vec<BoundRoute>>,
    next_id: AtomicU64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with the first endpoint colliding with another plugin's route
    ///
    /// Routes owned by `replacing` are ignored, so a reload can take over
    /// its own paths.
    pub async fn check_conflicts(
        &self,
        manifest: &PluginManifest,
        replacing: Option<&str>,
    ) -> Result<(), LoadError> {
        let routes = self.routes.read().await;
        find_conflict(&routes, manifest, replacing)
    }

    /// Bind every endpoint of a plugin
    pub async fn bind(&self, manifest: &PluginManifest) -> Result<Vec<RouteId>, LoadError> {
        let mut routes = self.routes.write().await;
        find_conflict(&routes, manifest, None)?;
        Ok(self.push_all(&mut routes, manifest))
    }

    /// Swap a plugin's routes for the endpoints of `manifest` in one step
    pub async fn replace(&self, manifest: &PluginManifest) -> Result<Vec<RouteId>, LoadError> {
        let mut routes = self.routes.write().await;
        find_conflict(&routes, manifest, Some(&manifest.id))?;
        routes.retain(|route| route.plugin_id != manifest.id);
        Ok(self.push_all(&mut routes, manifest))
    }

    fn push_all(&self, routes: &mut Vec<BoundRoute>, manifest: &PluginManifest) -> Vec<RouteId> {
        let mut ids = Vec::with_capacity(manifest.endpoints.len());
        for endpoint in &manifest.endpoints {
            // Validated manifests only carry known methods
            let Ok(method) = endpoint.http_method() else {
                continue;
            };
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            routes.push(BoundRoute {
                id,
                plugin_id: manifest.id.clone(),
                pattern: RoutePattern::new(method, &endpoint.path),
                handler: endpoint.handler.clone(),
                active: true,
                policy: Arc::new(EndpointPolicy::for_endpoint(endpoint)),
            });
            ids.push(id);
        }
        debug!(plugin_id = %manifest.id, routes = ids.len(), "Routes bound");
        ids
    }

    /// Remove routes by id; unknown ids are ignored
    pub async fn unbind(&self, ids: &[RouteId]) -> usize {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|route| !ids.contains(&route.id));
        before - routes.len()
    }

    /// Remove every route owned by a plugin
    pub async fn unbind_plugin(&self, plugin_id: &str) -> usize {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|route| route.plugin_id != plugin_id);
        before - routes.len()
    }

    /// Mark a plugin's routes as served or not
    pub async fn set_active(&self, plugin_id: &str, active: bool) {
        for route in self
            .routes
            .write()
            .await
            .iter_mut()
            .filter(|route| route.plugin_id == plugin_id)
        {
            route.active = active;
        }
    }

    /// Find the route serving `method path`
    ///
    /// When several patterns match, the one with more literal segments wins,
    /// then the one whose literals come first (`/a/{x}` over `/{y}/b`), then
    /// the earliest bound.
    pub async fn resolve(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let method: HttpMethod = method.parse().ok()?;
        let routes = self.routes.read().await;
        routes
            .iter()
            .filter(|route| route.pattern.method == method)
            .filter_map(|route| route.pattern.matches(path).map(|params| (route, params)))
            .min_by(|(a, _), (b, _)| {
                b.pattern
                    .specificity()
                    .cmp(&a.pattern.specificity())
                    .then(a.id.cmp(&b.id))
            })
            .map(|(route, params)| RouteMatch {
                route_id: route.id,
                plugin_id: route.plugin_id.clone(),
                handler: route.handler.clone(),
                params,
                active: route.active,
                pattern: route.pattern.to_string(),
                policy: route.policy.clone(),
            })
    }

    /// Routes owned by a plugin, in binding order
    pub async fn routes_for(&self, plugin_id: &str) -> Vec<RouteInfo> {
        self.routes
            .read()
            .await
            .iter()
            .filter(|route| route.plugin_id == plugin_id)
            .map(|route| RouteInfo {
                id: route.id,
                method: route.pattern.method.to_string(),
                path: route.pattern.path.clone(),
                handler: route.handler.clone(),
                active: route.active,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}

fn find_conflict(
    routes: &[BoundRoute],
    manifest: &PluginManifest,
    replacing: Option<&str>,
) -> Result<(), LoadError> {
    for endpoint in &manifest.endpoints {
        let Ok(method) = endpoint.http_method() else {
            continue;
        };
        let candidate = RoutePattern::new(method, &endpoint.path);
        let clash = routes.iter().find(|route| {
            Some(route.plugin_id.as_str()) != replacing && route.pattern.conflicts_with(&candidate)
        });
        if let Some(existing) = clash {
            return Err(LoadError::RouteConflict {
                route: candidate.to_string(),
                owner: existing.plugin_id.clone(),
            });
        }
    }
    Ok(())
}
