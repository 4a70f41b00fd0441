//! REST surface of the plugin host
//!
//! Management endpoints live under `/plugins`; plugin endpoints are served by a
//! single dispatch shim mounted under the configured route prefix, so loading
//! or unloading a plugin never touches the axum router.

pub mod api;
pub mod dispatch;

use crate::core::auth::{Capabilities, Scope};
use crate::core::error::{PluginError, PluginResult};
use crate::plugin::health::HealthReporter;
use crate::plugin::manager::PluginManager;
use axum::Router;
use axum::http::HeaderMap;
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Header carrying `resource=scope` grants, comma separated
pub const SCOPES_HEADER: &str = "x-plugin-scopes";

/// Header marking the caller as administrator
pub const ADMIN_HEADER: &str = "x-plugin-admin";

/// Turns request headers into caller capabilities
///
/// Authentication happens in front of the host; implementations only read
/// what the authenticating proxy attached to the request.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> PluginResult<Capabilities>;
}

/// Reads capabilities from [`SCOPES_HEADER`] and [`ADMIN_HEADER`]
#[derive(Debug, Clone, Default)]
pub struct HeaderAuthorizer;

impl Authorizer for HeaderAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> PluginResult<Capabilities> {
        let mut capabilities = Capabilities::anonymous();
        capabilities.is_admin = headers
            .get(ADMIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        if let Some(value) = headers.get(SCOPES_HEADER) {
            let value = value
                .to_str()
                .map_err(|_| PluginError::permission("scopes header is not valid text"))?;
            for grant in value.split(',').map(str::trim).filter(|g| !g.is_empty()) {
                let (resource, scope) = grant.split_once('=').ok_or_else(|| {
                    PluginError::permission(format!("malformed scope grant '{grant}'"))
                })?;
                capabilities = capabilities.with_permission(resource.trim(), scope.parse::<Scope>()?);
            }
        }
        Ok(capabilities)
    }
}

/// Grants the same capabilities to every request
#[derive(Debug, Clone)]
pub struct StaticAuthorizer(pub Capabilities);

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, _headers: &HeaderMap) -> PluginResult<Capabilities> {
        Ok(self.0.clone())
    }
}

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: PluginManager,
    pub health: Arc<HealthReporter>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// HTTP front of a [`PluginManager`]
pub struct PluginServer {
    state: AppState,
}

impl PluginServer {
    pub fn new(manager: PluginManager, health: Arc<HealthReporter>) -> Self {
        Self {
            state: AppState {
                manager,
                health,
                authorizer: Arc::new(HeaderAuthorizer),
            },
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.state.authorizer = authorizer;
        self
    }

    /// Router with management and plugin routes
    pub fn router(&self) -> Router {
        let prefix = self.state.manager.config().route_prefix.clone();
        let max_upload = usize::try_from(self.state.manager.config().limits.max_archive_bytes)
            .unwrap_or(usize::MAX);

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        api::routes(max_upload)
            .merge(dispatch::routes(&prefix))
            .with_state(self.state.clone())
            .layer(ServiceBuilder::new().layer(cors_layer).into_inner())
    }

    /// Serve until `shutdown` completes
    pub async fn serve<F>(self, bind_addr: &str, shutdown: F) -> PluginResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| PluginError::Config(format!("Failed to bind to {bind_addr}: {e}")))?;
        info!(
            "Plugin host listening on {} (plugin routes under {})",
            bind_addr,
            self.state.manager.config().route_prefix
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| PluginError::internal(format!("HTTP server error: {e}")))
    }
}
