// Copyright (c) 2025 MCP Rust Contributors
// SPDX-License-Identifier: MIT

//! # Prism Plugin Host
//!
//! A dynamic plugin runtime for long-running servers. Third-party code is
//! loaded at runtime, kept alive behind a fault-isolating execution boundary,
//! wired into the live HTTP router and unloaded or reloaded without restarting
//! the host.
//!
//! ## Features
//!
//! - **Interchangeable sources**: local directories, uploaded archives
//!   (`.zip`, `.tar.gz`) and remote repositories (git or archive URLs)
//! - **Several runtimes**: native dynamic libraries, WASM modules, supervised
//!   subprocesses and statically linked builtins
//! - **Safe execution**: a single mutating-operation lock, bounded time,
//!   panics converted into typed errors and cancellation on timeout
//! - **Route binding**: plugin endpoints served through one dispatch shim, so
//!   reloads never re-wire the router
//! - **Durable registry**: installed plugins survive restarts
//! - **Health reporting**: on-demand and periodic probes with thresholds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use prism_plugin_host::prelude::*;
//!
//! # async fn run() -> PluginResult<()> {
//! let manager = PluginManager::builder(HostConfig::default()).build()?;
//! let info = manager
//!     .load(SourceDescriptor::local("./plugins/hello"))
//!     .await?;
//! println!("loaded {} v{}", info.id, info.version);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod plugin;

#[cfg(feature = "http")]
pub mod server;

/// Commonly used types and traits
pub mod prelude {
    pub use crate::core::auth::{Capabilities, Scope};
    pub use crate::core::config::HostConfig;
    pub use crate::core::error::{
        LoadError, ManifestError, PluginError, PluginResult, SourceError,
    };
    pub use crate::plugin::api::{PluginContext, PluginModule, PluginRequest, PluginResponse};
    pub use crate::plugin::health::{HealthReporter, ProbeResult};
    pub use crate::plugin::manager::{PluginInfo, PluginManager, PluginSummary};
    pub use crate::plugin::manifest::PluginManifest;
    pub use crate::plugin::registry::{FileRegistry, InMemoryRegistry, RegistryStore};
    pub use crate::plugin::source::SourceDescriptor;

    #[cfg(feature = "http")]
    pub use crate::server::PluginServer;

    pub use async_trait::async_trait;
    pub use serde_json::{Value, json};
    pub use std::collections::HashMap;
}

pub use crate::core::error::{PluginError, PluginResult};
