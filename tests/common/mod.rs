// Copyright (c) 2025 MCP Rust Contributors
// SPDX-License-Identifier: MIT

// ! Shared fixtures for the integration tests

#![allow(dead_code)]

use prism_plugin_host::plugin::runtime::BuiltinCatalog;
use prism_plugin_host::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Echoes its configured greeting together with the matched parameters
#[derive(Default)]
pub struct Greeter {
    greeting: String,
}

#[async_trait]
impl PluginModule for Greeter {
    fn handlers(&self) -> Vec<String> {
        vec!["greet".to_string(), "echo".to_string()]
    }

    async fn initialize(&mut self, context: PluginContext) -> PluginResult<()> {
        self.greeting = context
            .config_value("greeting")
            .and_then(|v| v.as_str())
            .unwrap_or("hello")
            .to_string();
        Ok(())
    }

    async fn handle(&self, handler: &str, request: PluginRequest) -> PluginResult<PluginResponse> {
        match handler {
            "echo" => Ok(PluginResponse::with_status(201, request.body).with_header("x-echo", "1")),
            _ => Ok(PluginResponse::ok(json!({
                "message": self.greeting,
                "params": request.params,
            }))),
        }
    }
}

/// Never finishes initializing
#[derive(Default)]
pub struct Stuck;

#[async_trait]
impl PluginModule for Stuck {
    fn handlers(&self) -> Vec<String> {
        vec!["greet".to_string(), "echo".to_string()]
    }

    async fn initialize(&mut self, _context: PluginContext) -> PluginResult<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    async fn handle(&self, _handler: &str, _request: PluginRequest) -> PluginResult<PluginResponse> {
        Ok(PluginResponse::ok(Value::Null))
    }
}

/// Panics while serving and fails to shut down
#[derive(Default)]
pub struct Faulty;

#[async_trait]
impl PluginModule for Faulty {
    fn handlers(&self) -> Vec<String> {
        vec!["greet".to_string(), "echo".to_string()]
    }

    async fn handle(&self, _handler: &str, _request: PluginRequest) -> PluginResult<PluginResponse> {
        panic!("handler bug");
    }

    async fn shutdown(&mut self) -> PluginResult<()> {
        Err(PluginError::runtime_fault("socket already closed"))
    }
}

pub fn catalog() -> BuiltinCatalog {
    BuiltinCatalog::new()
        .with_default::<Greeter>("greeter")
        .with_default::<Stuck>("stuck")
        .with_default::<Faulty>("faulty")
}

pub fn config(workspace: &Path) -> HostConfig {
    let mut config = HostConfig {
        plugin_dir: workspace.join("store"),
        registry_path: Some(workspace.join("registry.json")),
        ..Default::default()
    };
    config.limits.operation_timeout_secs = 1;
    config.limits.shutdown_timeout_secs = 1;
    config.limits.track_memory = false;
    config
}

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> HostConfig {
        config(self.path())
    }

    pub fn store(&self) -> PathBuf {
        self.path().join("store")
    }

    pub async fn manager(&self) -> PluginManager {
        PluginManager::open(self.config(), catalog()).await.unwrap()
    }

    /// Write a builtin plugin under `src/{id}` and return its source
    pub fn plugin(&self, id: &str, builtin: &str, path: &str) -> SourceDescriptor {
        let dir = self.path().join("src").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plugin.yaml"), manifest(id, "1.0.0", builtin, path)).unwrap();
        SourceDescriptor::local(dir)
    }
}

pub fn manifest(id: &str, version: &str, builtin: &str, path: &str) -> String {
    format!(
        r#"id: {id}
name: {id}
version: {version}
author: acme
runtime:
  kind: builtin
  entrypoint: {builtin}
endpoints:
  - path: {path}
    method: GET
    handler: greet
  - path: {path}
    method: POST
    handler: echo
"#
    )
}

pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn tar_gz_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        // set_path refuses `..`, so write the raw name bytes
        let raw = &mut header.as_old_mut().name;
        raw[..name.len()].copy_from_slice(name.as_bytes());
        header.set_cksum();
        builder.append(&header, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
