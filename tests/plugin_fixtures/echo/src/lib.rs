//! Native echo plugin used by the native runtime tests

use async_trait::async_trait;
use prism_plugin_host::export_plugin;
use prism_plugin_host::plugin::api::{PluginContext, PluginModule, PluginRequest, PluginResponse};
use prism_plugin_host::PluginResult;
use serde_json::json;

#[derive(Default)]
pub struct EchoPlugin {
    prefix: String,
    plugin_id: String,
}

#[async_trait]
impl PluginModule for EchoPlugin {
    fn handlers(&self) -> Vec<String> {
        vec!["echo".to_string(), "echo_body".to_string()]
    }

    async fn initialize(&mut self, context: PluginContext) -> PluginResult<()> {
        self.prefix = context
            .config_value("prefix")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.plugin_id = context.plugin_id;
        Ok(())
    }

    async fn handle(&self, _handler: &str, request: PluginRequest) -> PluginResult<PluginResponse> {
        let word = request
            .params
            .get("word")
            .cloned()
            .unwrap_or_else(|| request.body.to_string());
        Ok(PluginResponse::ok(json!({
            "plugin": self.plugin_id,
            "echo": format!("{}{}", self.prefix, word),
        })))
    }
}

export_plugin!(EchoPlugin);
