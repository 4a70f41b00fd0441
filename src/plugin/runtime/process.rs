//! Subprocess runtime
//!
//! The plugin runs as a child process speaking newline-delimited JSON on
//! stdio. The host writes one request per line:
//!
//! ```json
//! {"id":7,"method":"invoke","params":{"handler":"greet","request":{...}}}
//! ```
//!
//! and reads lines until it finds the matching response
//! (`{"id":7,"result":...}` or `{"id":7,"error":"..."}`). Responses carrying a
//! smaller id belong to an abandoned call and are skipped. Methods are
//! `initialize`, `invoke`, `health` and `shutdown`. A crash of the child
//! never affects the host; the process is killed when the handle drops.
//!
//! A call abandoned while its request line is only partly written leaves a
//! fragment on the child's stdin. The handle is then poisoned: every later
//! call fails until the plugin is reloaded into a fresh process.

use super::{ExecutionHandle, UnloadSemantics};
use crate::core::error::{LoadError, PluginError, PluginResult};
use crate::plugin::api::{PluginContext, PluginRequest, PluginResponse};
use crate::plugin::manifest::{PluginManifest, RuntimeKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use std::process::Stdio;
use std::sync::RwLock as StdRwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct ProcessIo {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Plugin running in a supervised child process
pub struct ProcessHandle {
    plugin_id: String,
    io: Mutex<ProcessIo>,
    next_id: AtomicU64,
    handlers: StdRwLock<Option<Vec<String>>>,
    poisoned: AtomicBool,
}

/// Poisons the handle unless disarmed once the request line is complete
struct WriteGuard<'a> {
    poisoned: &'a AtomicBool,
    armed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }
}

impl ProcessHandle {
    /// Start the plugin process
    pub async fn spawn(manifest: &PluginManifest, entrypoint: &Path) -> Result<Self, LoadError> {
        let workdir = entrypoint.parent().unwrap_or(Path::new("."));
        let mut command = match &manifest.runtime.command {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(entrypoint);
                command
            }
            None => Command::new(entrypoint),
        };
        command
            .args(&manifest.runtime.args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            LoadError::OpenFailed(format!("failed to spawn {}: {e}", entrypoint.display()))
        })?;
        info!(plugin_id = %manifest.id, pid = child.id(), "Plugin process started");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LoadError::OpenFailed("plugin stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoadError::OpenFailed("plugin stdout unavailable".to_string()))?;

        Ok(Self {
            plugin_id: manifest.id.clone(),
            io: Mutex::new(ProcessIo {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
            }),
            next_id: AtomicU64::new(0),
            handlers: StdRwLock::new(None),
            poisoned: AtomicBool::new(false),
        })
    }

    async fn call(&self, method: &str, params: Value) -> PluginResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let line = serde_json::to_string(&json!({
            "id": id,
            "method": method,
            "params": params,
        }))?;

        let mut io = self.io.lock().await;
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(PluginError::runtime_fault(format!(
                "plugin process '{}' stream corrupted by an abandoned call; reload required",
                self.plugin_id
            )));
        }
        let closed = |e: std::io::Error| {
            PluginError::runtime_fault(format!("plugin process pipe closed: {e}"))
        };
        let mut guard = WriteGuard {
            poisoned: &self.poisoned,
            armed: true,
        };
        io.stdin.write_all(line.as_bytes()).await.map_err(closed)?;
        io.stdin.write_all(b"\n").await.map_err(closed)?;
        io.stdin.flush().await.map_err(closed)?;
        guard.armed = false;

        loop {
            let Some(line) = io.stdout.next_line().await.map_err(closed)? else {
                return Err(PluginError::runtime_fault(format!(
                    "plugin process '{}' exited",
                    self.plugin_id
                )));
            };
            let response: WireResponse = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(_) => {
                    debug!(plugin_id = %self.plugin_id, %line, "Ignoring non-protocol output");
                    continue;
                }
            };
            if response.id.is_some_and(|rid| rid < id) {
                debug!(plugin_id = %self.plugin_id, "Discarding response to abandoned call");
                continue;
            }
            if let Some(error) = response.error {
                return Err(PluginError::runtime_fault(error_message(&error)));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[async_trait]
impl ExecutionHandle for ProcessHandle {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Process
    }

    fn unload_semantics(&self) -> UnloadSemantics {
        UnloadSemantics::Released
    }

    fn handlers(&self) -> Option<Vec<String>> {
        self.handlers.read().ok().and_then(|h| h.clone())
    }

    async fn initialize(&self, context: PluginContext) -> PluginResult<()> {
        let result = self.call("initialize", serde_json::to_value(&context)?).await?;
        if let Some(handlers) = result.get("handlers").and_then(Value::as_array) {
            let names = handlers
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if let Ok(mut slot) = self.handlers.write() {
                *slot = Some(names);
            }
        }
        Ok(())
    }

    async fn invoke(&self, handler: &str, request: PluginRequest) -> PluginResult<PluginResponse> {
        let result = self
            .call("invoke", json!({ "handler": handler, "request": request }))
            .await?;
        match serde_json::from_value::<PluginResponse>(result.clone()) {
            Ok(response) if result.get("body").is_some() || result.get("status").is_some() => {
                Ok(response)
            }
            _ => Ok(PluginResponse::ok(result)),
        }
    }

    async fn health(&self) -> PluginResult<()> {
        self.call("health", Value::Null).await.map(|_| ())
    }

    async fn shutdown(&self) -> PluginResult<()> {
        let hook = self.call("shutdown", Value::Null).await;
        let mut io = self.io.lock().await;
        if let Err(e) = io.child.kill().await {
            warn!(plugin_id = %self.plugin_id, "Failed to kill plugin process: {}", e);
        }
        info!(plugin_id = %self.plugin_id, "Plugin process stopped");
        hook.map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugin::manifest::RuntimeSpec;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    const SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*) echo "starting up"; printf '{"id":%s,"result":{"handlers":["echo"]}}\n' "$id" ;;
    *'"method":"invoke"'*) printf '{"id":%s,"result":{"status":201,"body":{"echo":true}}}\n' "$id" ;;
    *'"method":"health"'*) printf '{"id":%s,"error":"database unreachable"}\n' "$id" ;;
    *'"method":"shutdown"'*) printf '{"id":%s,"result":null}\n' "$id"; exit 0 ;;
  esac
done
"#;

    fn manifest() -> PluginManifest {
        PluginManifest {
            id: "proc-echo".to_string(),
            name: "Process Echo".to_string(),
            version: "1.0.0".to_string(),
            runtime: RuntimeSpec {
                kind: RuntimeKind::Process,
                entrypoint: "plugin.sh".to_string(),
                command: Some("sh".to_string()),
                args: Vec::new(),
            },
            ..Default::default()
        }
    }

    fn context() -> PluginContext {
        PluginContext {
            plugin_id: "proc-echo".to_string(),
            instance_id: "i-1".to_string(),
            version: "1.0.0".to_string(),
            host_version: "0.1.0".to_string(),
            permissions: Vec::new(),
            configuration: HashMap::new(),
            data_dir: PathBuf::from("/tmp"),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("plugin.sh");
        std::fs::write(&script, SCRIPT).unwrap();

        let handle = ProcessHandle::spawn(&manifest(), &script).await.unwrap();
        assert_eq!(handle.handlers(), None);

        handle.initialize(context()).await.unwrap();
        assert_eq!(handle.handlers(), Some(vec!["echo".to_string()]));

        let response = handle
            .invoke("echo", PluginRequest::default())
            .await
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, json!({"echo": true}));

        match handle.health().await {
            Err(PluginError::RuntimeFault(reason)) => assert_eq!(reason, "database unreachable"),
            other => panic!("Expected RuntimeFault, got {other:?}"),
        }

        handle.shutdown().await.unwrap();
        assert!(handle.health().await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_partial_write_poisons_handle() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("plugin.sh");
        // Never drains stdin, so a large request blocks mid-write
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        let handle = ProcessHandle::spawn(&manifest(), &script).await.unwrap();

        let request = PluginRequest {
            body: json!({ "blob": "x".repeat(1 << 20) }),
            ..Default::default()
        };
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            handle.invoke("echo", request),
        )
        .await;
        assert!(abandoned.is_err());

        match handle.health().await {
            Err(PluginError::RuntimeFault(reason)) => {
                assert!(reason.contains("reload required"), "{reason}")
            }
            other => panic!("Expected RuntimeFault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abandoned_read_keeps_handle_usable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("plugin.sh");
        let slow = SCRIPT.replace(
            r#"*'"method":"invoke"'*) printf"#,
            r#"*'"method":"invoke"'*) sleep 1; printf"#,
        );
        std::fs::write(&script, slow).unwrap();
        let handle = ProcessHandle::spawn(&manifest(), &script).await.unwrap();

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            handle.invoke("echo", PluginRequest::default()),
        )
        .await;
        assert!(abandoned.is_err());

        // The late invoke response is skipped, not mistaken for this one
        match handle.health().await {
            Err(PluginError::RuntimeFault(reason)) => assert_eq!(reason, "database unreachable"),
            other => panic!("Expected RuntimeFault, got {other:?}"),
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let mut manifest = manifest();
        manifest.runtime.command = None;
        let result = ProcessHandle::spawn(&manifest, Path::new("/nonexistent/plugin")).await;
        assert!(matches!(result, Err(LoadError::OpenFailed(_))));
    }
}
