use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::agent::subagent::SubagentManager;
use crate::router::OriginAware;
use crate::tools::Tool;

/// Tool for spawning background subagent tasks.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
    origin_channel: Arc<RwLock<String>>,
    origin_chat_id: Arc<RwLock<String>>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self {
            manager,
            origin_channel: Arc::new(RwLock::new(String::new())),
            origin_chat_id: Arc::new(RwLock::new(String::new())),
        }
    }
}

#[async_trait]
impl OriginAware for SpawnTool {
    async fn set_origin(&self, channel: &str, chat_id: &str) {
        *self.origin_channel.write().await = channel.to_string();
        *self.origin_chat_id.write().await = chat_id.to_string();
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Hand a task to a background subagent that works on it independently. The subagent \
         has its own session and a file/shell/web tool set, and its result is delivered back \
         to this conversation when it finishes. Good for research, file processing, or other \
         work that can proceed while you keep talking."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Full description of what the subagent should do"
                },
                "label": {
                    "type": "string",
                    "description": "Short identifier for this subagent (e.g. 'research-api')"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let task = params
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task"))?;

        let label = params.get("label").and_then(|v| v.as_str()).unwrap_or("");

        let channel = self.origin_channel.read().await.clone();
        let chat_id = self.origin_chat_id.read().await.clone();

        if channel.is_empty() || chat_id.is_empty() {
            return Ok("Error: No context set for subagent result delivery. Cannot spawn.".into());
        }

        match self.manager.spawn(task, label, &channel, &chat_id).await {
            Ok(subagent_id) => {
                let label_display = if label.is_empty() {
                    format!("subagent-{subagent_id}")
                } else {
                    label.to_string()
                };
                Ok(format!(
                    "Subagent '{label_display}' started (ID: {subagent_id}). \
                     Its result will arrive in this conversation when it finishes."
                ))
            }
            Err(e) => Ok(format!("Failed to spawn subagent: {e}")),
        }
    }
}
