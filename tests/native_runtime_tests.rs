// Copyright (c) 2025 MCP Rust Contributors
// SPDX-License-Identifier: MIT

// ! Native dynamic library plugins
// !
// ! The round-trip test needs the fixture in `tests/plugin_fixtures/echo`
// ! built first:
// !
// ! ```text
// ! cargo build --manifest-path tests/plugin_fixtures/echo/Cargo.toml
// ! cargo test --test native_runtime_tests -- --ignored
// ! ```

#![cfg(all(feature = "native", target_os = "linux"))]

mod common;

use common::Workspace;
use pretty_assertions::assert_eq;
use prism_plugin_host::plugin::LifecycleState;
use prism_plugin_host::plugin::runtime::UnloadSemantics;
use prism_plugin_host::prelude::*;
use std::path::{Path, PathBuf};

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/plugin_fixtures/echo");

fn stage_fixture(dest: &Path, library: &Path) -> SourceDescriptor {
    std::fs::create_dir_all(dest).unwrap();
    std::fs::copy(Path::new(FIXTURE).join("plugin.yaml"), dest.join("plugin.yaml")).unwrap();
    std::fs::copy(library, dest.join("libecho_plugin.so")).unwrap();
    SourceDescriptor::local(dest)
}

fn built_fixture() -> PathBuf {
    Path::new(FIXTURE).join("target/debug/libecho_plugin.so")
}

#[tokio::test]
async fn test_invalid_library_fails_cleanly() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    let bogus = ws.path().join("bogus.so");
    std::fs::write(&bogus, b"not an ELF file").unwrap();
    let err = manager
        .load(stage_fixture(&ws.path().join("echo"), &bogus))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "load_failure");
    // Never installed, so nothing is left to mark as failed
    assert_eq!(manager.state("echo").await, LifecycleState::Unloaded);
    assert!(manager.routes().is_empty().await);
}

#[tokio::test]
#[ignore = "requires the echo fixture to be built"]
async fn test_native_echo_round_trip() {
    let ws = Workspace::new();
    let manager = ws.manager().await;

    let info = manager
        .load(stage_fixture(&ws.path().join("echo"), &built_fixture()))
        .await
        .unwrap();
    assert_eq!(info.unload_semantics, UnloadSemantics::Released);

    let response = manager
        .dispatch(
            "GET",
            "/echo/ping",
            PluginRequest {
                method: "GET".to_string(),
                path: "/echo/ping".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.body, json!({"plugin": "echo", "echo": "echo: ping"}));

    manager.reload("echo").await.unwrap();
    manager.unload("echo").await.unwrap();
}
