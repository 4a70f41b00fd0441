// Copyright (c) 2025 MCP Rust Contributors
// SPDX-License-Identifier: MIT

// ! REST surface tests
// !
// ! Requests go through the assembled router with `tower::ServiceExt::oneshot`,
// ! so no socket is bound.

#![cfg(feature = "http")]

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{Workspace, manifest, tar_gz_bytes};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use prism_plugin_host::prelude::*;
use prism_plugin_host::server::{ADMIN_HEADER, SCOPES_HEADER};
use tower::ServiceExt;

const WRITE: &str = "plugins=write";
const READ: &str = "plugins=read";

struct Harness {
    ws: Workspace,
    router: Router,
}

async fn harness() -> Harness {
    let ws = Workspace::new();
    let manager = ws.manager().await;
    let health = HealthReporter::new(manager.clone(), ws.config().health.clone());
    let router = PluginServer::new(manager, health).router();
    Harness { ws, router }
}

impl Harness {
    async fn send(
        &self,
        method: &str,
        uri: &str,
        scopes: Option<&str>,
        body: Body,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(scopes) = scopes {
            request = request.header(SCOPES_HEADER, scopes);
        }
        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn load_local(&self, id: &str, path: &str) -> (StatusCode, Value) {
        let source = self.ws.plugin(id, "greeter", path);
        let body = serde_json::to_vec(&source).unwrap();
        self.send("POST", "/plugins", Some(WRITE), Body::from(body))
            .await
    }
}

#[tokio::test]
async fn test_load_list_and_dispatch() {
    let h = harness().await;

    let (status, info) = h.load_local("hello", "/hello/{name}").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["id"], "hello");
    assert_eq!(info["status"], "active");

    let (status, list) = h.send("GET", "/plugins", Some(READ), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, body) = h
        .send("GET", "/api/plugins/hello/world", None, Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "hello");
    assert_eq!(body["params"]["name"], "world");
}

#[tokio::test]
async fn test_plugin_response_status_and_headers_pass_through() {
    let h = harness().await;
    h.load_local("hello", "/hello/{name}").await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/plugins/hello/world")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"ping":1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-echo"], "1");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({"ping": 1}));
}

#[tokio::test]
async fn test_authorization_precedes_body_parsing() {
    let h = harness().await;

    let (status, body) = h
        .send("POST", "/plugins", None, Body::from("not json"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "permission_denied");

    let (status, _) = h
        .send("POST", "/plugins", Some(READ), Body::from("not json"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = h
        .send("POST", "/plugins", Some(WRITE), Body::from("not json"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "serialization_error");

    let (status, _) = h
        .send("POST", "/plugins/hello/reload", None, Body::empty())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_reads_are_open_to_anonymous_callers() {
    let h = harness().await;
    h.load_local("hello", "/hello/{name}").await;

    for uri in [
        "/plugins",
        "/plugins/hello",
        "/plugins/hello/health",
        "/plugins/health",
    ] {
        let (status, body) = h.send("GET", uri, None, Body::empty()).await;
        assert_eq!(status, StatusCode::OK, "{uri}: {body}");
    }

    let (status, body) = h
        .send("GET", "/plugins/missing", None, Body::empty())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn test_plugin_metrics_are_reported() {
    let h = harness().await;
    h.load_local("hello", "/hello/{name}").await;
    for _ in 0..3 {
        h.send("GET", "/api/plugins/hello/world", None, Body::empty())
            .await;
    }

    let (_, info) = h.send("GET", "/plugins/hello", None, Body::empty()).await;
    assert_eq!(info["metrics"]["request_count"], 3);
    assert_eq!(info["metrics"]["error_count"], 0);
    assert_eq!(info["metrics"]["recent_errors"], json!([]));

    let (_, summary) = h.send("GET", "/plugins/health", None, Body::empty()).await;
    assert_eq!(summary["metrics"]["total_plugins"], 1);
    assert_eq!(summary["metrics"]["active_plugins"], 1);
    assert_eq!(summary["metrics"]["total_routes"], 2);
    assert_eq!(summary["metrics"]["total_requests"], 3);
}

#[tokio::test]
async fn test_endpoint_quota_answers_too_many_requests() {
    let h = harness().await;
    let dir = h.ws.path().join("src").join("quota");
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = format!(
        "{}    rate_limit:\n      requests: 1\n      window_ms: 60000\n",
        manifest("quota", "1.0.0", "greeter", "/quota")
    );
    std::fs::write(dir.join("plugin.yaml"), manifest).unwrap();
    let body = serde_json::to_vec(&SourceDescriptor::local(&dir)).unwrap();
    let (status, _) = h
        .send("POST", "/plugins", Some(WRITE), Body::from(body))
        .await;
    assert_eq!(status, StatusCode::OK);

    // The quota belongs to the POST endpoint, the last one in the manifest
    let post = || {
        Request::builder()
            .method("POST")
            .uri("/api/plugins/quota")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap()
    };
    let first = h.router.clone().oneshot(post()).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = h.router.clone().oneshot(post()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    let bytes = second.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["kind"], "rate_limited");

    // GET on the same path has no quota
    let (status, _) = h.send("GET", "/api/plugins/quota", None, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_header_grants_everything() {
    let h = harness().await;
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/plugins")
                .header(ADMIN_HEADER, "true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_error_body_shape() {
    let h = harness().await;

    let (status, body) = h
        .send("GET", "/plugins/missing", Some(READ), Body::empty())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
    assert!(body["error"]["message"].as_str().unwrap().contains("missing"));

    h.load_local("hello", "/hello/{name}").await;
    let (status, body) = h.load_local("hello", "/hello/{name}").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "duplicate_id");

    let (status, _) = h
        .send("GET", "/api/plugins/nothing/here", None, Body::empty())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disable_enable_toggles_routes() {
    let h = harness().await;
    h.load_local("hello", "/hello/{name}").await;

    let (status, info) = h
        .send("POST", "/plugins/hello/disable", Some(WRITE), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["status"], "disabled");
    let (status, _) = h
        .send("GET", "/api/plugins/hello/world", None, Body::empty())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = h
        .send("POST", "/plugins/hello/enable", Some(WRITE), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h
        .send("GET", "/api/plugins/hello/world", None, Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_upload_reload_and_uninstall() {
    let h = harness().await;
    let data = tar_gz_bytes(&[("plugin.yaml", &manifest("packed", "2.0.0", "greeter", "/packed"))]);

    let (status, info) = h
        .send(
            "POST",
            "/plugins/upload?filename=packed.tar.gz",
            Some(WRITE),
            Body::from(data),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["version"], "2.0.0");

    let (status, _) = h
        .send("POST", "/plugins/packed/reload", Some(WRITE), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, report) = h
        .send("DELETE", "/plugins/packed", Some(WRITE), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["status"], "completed");
    assert_eq!(report["completed"], json!(["unload", "remove_files", "registry"]));

    let (status, _) = h
        .send("GET", "/plugins/packed", Some(READ), Body::empty())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_archive_descriptor_rejected_on_json_endpoint() {
    let h = harness().await;
    let (status, body) = h
        .send(
            "POST",
            "/plugins",
            Some(WRITE),
            Body::from(r#"{"type":"archive","file_name":"x.zip"}"#),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "serialization_error");
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = harness().await;
    h.load_local("hello", "/hello/{name}").await;

    let (status, body) = h
        .send("GET", "/plugins/hello/health", Some(READ), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["probe"]["result"], "healthy");

    let (status, summary) = h
        .send("GET", "/plugins/health", Some(READ), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["plugins"].as_array().unwrap().len(), 1);

    let (status, _) = h
        .send("GET", "/plugins/ghost/health", Some(READ), Body::empty())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
