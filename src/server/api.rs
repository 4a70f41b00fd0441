// ! Management endpoints
// !
// ! Reads are open to any caller. Mutating handlers require write scope on
// ! the plugins resource and authorize before they look at the request body.

use super::AppState;
use crate::core::auth::{PLUGINS_RESOURCE, Scope};
use crate::core::error::PluginError;
use crate::plugin::health::{HealthSummary, PluginHealth, ProbeResult};
use crate::plugin::manager::{UninstallReport, UninstallStatus};
use crate::plugin::source::SourceDescriptor;
use crate::plugin::types::{PluginInfo, PluginSummary};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Error response with body `{"error": {"kind", "message"}}`
#[derive(Debug)]
pub struct ApiError(pub PluginError);

impl From<PluginError> for ApiError {
    fn from(error: PluginError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        let mut response = (status, Json(body)).into_response();
        if let PluginError::RateLimited {
            retry_after_secs, ..
        } = self.0
        {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn routes(max_upload: usize) -> Router<AppState> {
    Router::new()
        .route("/plugins", get(list_plugins).post(load_plugin))
        .route(
            "/plugins/upload",
            post(upload_plugin).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/plugins/health", get(health_summary))
        .route("/plugins/{id}", get(get_plugin).delete(uninstall_plugin))
        .route("/plugins/{id}/health", get(plugin_health))
        .route("/plugins/{id}/enable", post(enable_plugin))
        .route("/plugins/{id}/disable", post(disable_plugin))
        .route("/plugins/{id}/reload", post(reload_plugin))
}

fn authorize(state: &AppState, headers: &HeaderMap, scope: Scope) -> ApiResult<()> {
    state
        .authorizer
        .authorize(headers)?
        .require(PLUGINS_RESOURCE, scope)?;
    Ok(())
}

async fn list_plugins(State(state): State<AppState>) -> ApiResult<Json<Vec<PluginSummary>>> {
    Ok(Json(state.manager.list().await))
}

async fn get_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PluginInfo>> {
    Ok(Json(state.manager.get(&id).await?))
}

async fn load_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<PluginInfo>> {
    authorize(&state, &headers, Scope::Write)?;
    let source: SourceDescriptor = serde_json::from_slice(&body).map_err(PluginError::from)?;
    if matches!(source, SourceDescriptor::Archive { .. }) {
        return Err(PluginError::Serialization(
            "archives are uploaded to /plugins/upload".to_string(),
        )
        .into());
    }
    debug!(source = %source.describe(), "Load requested");
    Ok(Json(state.manager.load(source).await?))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: Option<String>,
}

async fn upload_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<Json<PluginInfo>> {
    authorize(&state, &headers, Scope::Write)?;
    let file_name = params.filename.unwrap_or_else(|| "upload".to_string());
    debug!(file_name = %file_name, bytes = body.len(), "Archive uploaded");
    let source = SourceDescriptor::archive(file_name, body.to_vec());
    Ok(Json(state.manager.load(source).await?))
}

async fn uninstall_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<UninstallReport>)> {
    authorize(&state, &headers, Scope::Write)?;
    let report = state.manager.uninstall(&id).await?;
    let status = match report.status {
        UninstallStatus::Completed => StatusCode::OK,
        UninstallStatus::Partial => StatusCode::MULTI_STATUS,
    };
    Ok((status, Json(report)))
}

async fn enable_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<PluginInfo>> {
    authorize(&state, &headers, Scope::Write)?;
    Ok(Json(state.manager.enable(&id).await?))
}

async fn disable_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<PluginInfo>> {
    authorize(&state, &headers, Scope::Write)?;
    Ok(Json(state.manager.disable(&id).await?))
}

async fn reload_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<PluginInfo>> {
    authorize(&state, &headers, Scope::Write)?;
    Ok(Json(state.manager.reload(&id).await?))
}

#[derive(Debug, Serialize)]
struct PluginHealthResponse {
    plugin_id: String,
    probe: ProbeResult,
    health: Option<PluginHealth>,
}

async fn plugin_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PluginHealthResponse>> {
    let probe = state.health.probe(&id).await;
    if probe == ProbeResult::NotFound {
        return Err(PluginError::not_found(id).into());
    }
    Ok(Json(PluginHealthResponse {
        health: state.health.status(&id).await,
        plugin_id: id,
        probe,
    }))
}

async fn health_summary(State(state): State<AppState>) -> ApiResult<Json<HealthSummary>> {
    Ok(Json(state.health.summary().await))
}
