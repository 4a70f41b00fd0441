// ! Plugin endpoint dispatch shim
// !
// ! One catch-all route under the prefix forwards every request to the route
// ! table; the handler is resolved by name at call time.

use super::AppState;
use super::api::ApiError;
use crate::plugin::api::{PluginRequest, PluginResponse};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

pub(crate) fn routes(prefix: &str) -> Router<AppState> {
    let prefix = prefix.trim_end_matches('/');
    Router::new().route(&format!("{prefix}/{{*path}}"), any(dispatch))
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = format!("/{}", path.trim_start_matches('/'));
    let request = PluginRequest {
        method: method.as_str().to_string(),
        path: path.clone(),
        params: HashMap::new(),
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: request_body(&body),
    };

    let response = state
        .manager
        .dispatch(method.as_str(), &path, request)
        .await?;
    Ok(into_http(response))
}

/// JSON when the body parses as JSON, a string otherwise
fn request_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn into_http(response: PluginResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        warn!(status = response.status, "Plugin returned an invalid status code");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    let mut http = (status, Json(response.body)).into_response();
    for (name, value) in response.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid plugin response header"),
        }
    }
    http
}
