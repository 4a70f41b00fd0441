// Copyright (c) 2025 MCP Rust Contributors
// SPDX-License-Identifier: MIT

// ! End-to-end lifecycle tests driven through the public manager API

mod common;

use common::{Workspace, catalog, manifest, tar_gz_bytes, zip_bytes};
use pretty_assertions::assert_eq;
use prism_plugin_host::plugin::manager::UninstallStatus;
use prism_plugin_host::plugin::source::{PluginArtifact, SourceKind, SourceResolver};
use prism_plugin_host::plugin::{LifecycleState, PluginEvent};
use prism_plugin_host::prelude::*;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Local resolver that never returns
struct HangingResolver;

#[async_trait]
impl SourceResolver for HangingResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn resolve(&self, _descriptor: &SourceDescriptor) -> Result<PluginArtifact, SourceError> {
        std::future::pending().await
    }
}

/// Everything under `dir` except the archive scratch area
fn leftovers(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != ".scratch")
        .collect()
}

fn get(path: &str) -> PluginRequest {
    PluginRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_local_plugin_full_lifecycle() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager
        .on_event(move |event| sink.lock().unwrap().push(event))
        .await;

    let info = manager
        .load(ws.plugin("hello", "greeter", "/hello/{name}"))
        .await
        .unwrap();
    assert_eq!(info.status, LifecycleState::Active);
    assert_eq!(manager.list().await.len(), 1);

    let response = manager
        .dispatch("GET", "/hello/world", get("/hello/world"))
        .await
        .unwrap();
    assert_eq!(response.body["params"]["name"], "world");

    manager.disable("hello").await.unwrap();
    assert!(matches!(
        manager.dispatch("GET", "/hello/world", get("/hello/world")).await,
        Err(PluginError::NotFound(_))
    ));
    manager.enable("hello").await.unwrap();

    let reloaded = manager.reload("hello").await.unwrap();
    assert_ne!(reloaded.instance_id, info.instance_id);
    assert_eq!(reloaded.status, LifecycleState::Active);

    let report = manager.uninstall("hello").await.unwrap();
    assert_eq!(report.status, UninstallStatus::Completed);
    assert_eq!(manager.state("hello").await, LifecycleState::Unloaded);
    assert!(manager.registry().get("hello").await.unwrap().is_none());

    let kinds: Vec<&str> = events
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event {
            PluginEvent::Loaded { .. } => "loaded",
            PluginEvent::Disabled { .. } => "disabled",
            PluginEvent::Enabled { .. } => "enabled",
            PluginEvent::Reloaded { .. } => "reloaded",
            PluginEvent::Unloaded { .. } => "unloaded",
            PluginEvent::Uninstalled { .. } => "uninstalled",
            PluginEvent::Error { .. } => "error",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["loaded", "disabled", "enabled", "reloaded", "unloaded", "uninstalled"]
    );
}

#[tokio::test]
async fn test_zip_upload_installs_into_store() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    let data = zip_bytes(&[(
        "zipped-1.0/plugin.yaml",
        &manifest("zipped", "1.0.0", "greeter", "/zipped"),
    )]);
    let info = manager
        .load(SourceDescriptor::archive("zipped.zip", data))
        .await
        .unwrap();
    assert_eq!(info.id, "zipped");

    let installs: Vec<_> = std::fs::read_dir(ws.store().join("zipped-zipped"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != "data")
        .collect();
    assert_eq!(installs.len(), 1);

    // Archive sources are reloaded from their installed copy
    manager.reload("zipped").await.unwrap();
    let response = manager.dispatch("GET", "/zipped", get("/zipped")).await.unwrap();
    assert_eq!(response.body["message"], "hello");
}

#[tokio::test]
async fn test_archive_traversal_leaves_no_trace() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    let data = tar_gz_bytes(&[
        ("plugin.yaml", &manifest("evil", "1.0.0", "greeter", "/evil")),
        ("../../escaped.txt", "pwned"),
    ]);
    let err = manager
        .load(SourceDescriptor::archive("evil.tar.gz", data))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "path_traversal");
    assert!(!ws.path().join("escaped.txt").exists());
    assert!(manager.list().await.is_empty());
    assert!(manager.routes().is_empty().await);
}

#[tokio::test]
async fn test_concurrent_loads_yield_one_instance() {
    let ws = Workspace::new();
    let manager = ws.manager().await;
    let source = ws.plugin("racer", "greeter", "/race");

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let manager = manager.clone();
            let source = source.clone();
            tokio::spawn(async move { manager.load(source).await })
        })
        .collect();

    let mut loaded = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => loaded += 1,
            Err(PluginError::Load(LoadError::DuplicateId(id))) => {
                assert_eq!(id, "racer");
                duplicates += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((loaded, duplicates), (1, 4));
    assert_eq!(manager.routes().len().await, 2);
}

#[tokio::test]
async fn test_hung_initialization_times_out_and_releases_lock() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    let err = manager
        .load(ws.plugin("stuck", "stuck", "/stuck"))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Timeout { .. }));
    assert_eq!(err.to_string(), "Operation 'load' timed out after 1000ms");
    assert_eq!(manager.state("stuck").await, LifecycleState::Unloaded);
    assert!(manager.instance("stuck").await.is_none());

    // The lock is free again
    manager
        .load(ws.plugin("after", "greeter", "/after"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_hung_source_resolution_times_out_without_residue() {
    let ws = Workspace::new();
    let config = ws.config();
    let ceiling = config.limits.operation_timeout() + config.limits.cancel_grace();
    let manager = PluginManager::builder(config)
        .builtins(catalog())
        .resolver(Arc::new(HangingResolver))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = manager
        .load(ws.plugin("never", "greeter", "/never"))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Timeout { .. }), "{err}");
    assert!(started.elapsed() < ceiling + Duration::from_millis(500));

    assert!(manager.list().await.is_empty());
    assert!(manager.routes().is_empty().await);
    assert_eq!(manager.state("never").await, LifecycleState::Unloaded);
    assert_eq!(leftovers(&ws.store()), Vec::<String>::new());
    assert_eq!(leftovers(&ws.store().join(".scratch")), Vec::<String>::new());
}

#[tokio::test]
async fn test_unparsable_local_manifest_is_malformed() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    let dir = ws.path().join("src").join("broken");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.yaml"), "id: [unterminated").unwrap();

    let err = manager.load(SourceDescriptor::local(dir)).await.unwrap_err();
    assert_eq!(err.kind(), "malformed_manifest");
    assert!(matches!(err, PluginError::Manifest(ManifestError::Malformed(_))));
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn test_route_conflict_keeps_first_owner() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    manager
        .load(ws.plugin("first", "greeter", "/items/{id}"))
        .await
        .unwrap();
    let err = manager
        .load(ws.plugin("second", "greeter", "/items/{key}"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "route_conflict");

    let response = manager
        .dispatch("GET", "/items/7", get("/items/7"))
        .await
        .unwrap();
    assert_eq!(response.body["params"]["id"], "7");
    assert!(manager.instance("second").await.is_none());
}

#[tokio::test]
async fn test_faulting_plugin_is_contained_and_unloadable() {
    let ws = Workspace::new();
    let manager = ws.manager().await;
    manager
        .load(ws.plugin("faulty", "faulty", "/faulty"))
        .await
        .unwrap();

    let err = manager
        .dispatch("GET", "/faulty", get("/faulty"))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::RuntimeFault(_)));
    assert_eq!(manager.state("faulty").await, LifecycleState::Active);

    // Shutdown hook fails but routes and instance are still released
    manager.unload("faulty").await.unwrap();
    assert!(manager.routes().is_empty().await);
    let record = manager.registry().get("faulty").await.unwrap().unwrap();
    assert!(record.last_error.is_some());
}

#[tokio::test]
async fn test_restart_restores_registry() {
    let ws = Workspace::new();
    {
        let manager = ws.manager().await;
        manager
            .load(ws.plugin("keep", "greeter", "/keep"))
            .await
            .unwrap();
        manager
            .load(ws.plugin("paused", "greeter", "/paused"))
            .await
            .unwrap();
        manager.disable("paused").await.unwrap();
    }

    let manager = ws.manager().await;
    let report = manager.restore().await;
    assert_eq!(report.failed, Vec::<(String, String)>::new());
    assert_eq!(report.restored.len(), 2);
    assert_eq!(manager.state("keep").await, LifecycleState::Active);
    assert_eq!(manager.state("paused").await, LifecycleState::Disabled);
    manager.shutdown().await;
}
