use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::bus::{MessageBus, OutboundMessage};
use crate::router::OriginAware;
use crate::tools::Tool;

/// Tool for sending messages to chat channels.
pub struct MessageTool {
    bus: Arc<MessageBus>,
    origin_channel: Arc<RwLock<String>>,
    origin_chat_id: Arc<RwLock<String>>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            origin_channel: Arc::new(RwLock::new(String::new())),
            origin_chat_id: Arc::new(RwLock::new(String::new())),
        }
    }
}

#[async_trait]
impl OriginAware for MessageTool {
    async fn set_origin(&self, channel: &str, chat_id: &str) {
        *self.origin_channel.write().await = channel.to_string();
        *self.origin_chat_id.write().await = chat_id.to_string();
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user via a chat channel. Use this to proactively send messages \
         or notifications. The message will be delivered to the current channel/chat unless \
         overridden with explicit channel and chat_id parameters."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message content to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Target channel (e.g. 'telegram', 'cli'). Defaults to current channel."
                },
                "chat_id": {
                    "type": "string",
                    "description": "Target chat ID. Defaults to current chat."
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        let channel = match params.get("channel").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.origin_channel.read().await.clone(),
        };

        let chat_id = match params.get("chat_id").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.origin_chat_id.read().await.clone(),
        };

        if channel.is_empty() || chat_id.is_empty() {
            return Ok(
                "Error: No target channel/chat specified and no default context set.".into(),
            );
        }

        let delivered = self
            .bus
            .publish_outbound(OutboundMessage::new(&channel, &chat_id, content))
            .await;

        if delivered > 0 {
            info!("Message sent to {channel}:{chat_id}");
            Ok(format!("Message sent to {channel}:{chat_id}"))
        } else {
            // No receivers (e.g. CLI mode) — message is logged but not delivered
            info!("Message logged (no active channel receivers): {channel}:{chat_id}");
            Ok(format!(
                "Message logged to {channel}:{chat_id} (no active channel receivers)"
            ))
        }
    }
}
