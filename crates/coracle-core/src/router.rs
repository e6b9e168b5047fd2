use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::agent::r#loop::AgentLoop;
use crate::bus::{BusMessage, InboundMessage, MessageBus, OutboundMessage};

const HELP_TEXT: &str = "Hi! I'm Coracle.\n\nSend me a message and I'll respond.\n\nCommands:\n/new - Start a new conversation\n/help - Show this help";

/// Tools that route their output to the conversation currently being
/// processed (message, spawn, cron). The router updates them before each turn.
#[async_trait]
pub trait OriginAware: Send + Sync {
    async fn set_origin(&self, channel: &str, chat_id: &str);
}

/// Routes inbound bus messages to per-conversation workers.
///
/// One worker task (and one unbounded queue) per conversation key. A worker
/// fully processes a message — turn, response publish, any due consolidation —
/// before pulling the next one for that key, which is what upholds the
/// single-writer rule on each session. Distinct keys run concurrently.
pub struct ConversationRouter {
    agent: Arc<AgentLoop>,
    bus: Arc<MessageBus>,
    origin_tools: Vec<Arc<dyn OriginAware>>,
    workers: DashMap<String, mpsc::UnboundedSender<InboundMessage>>,
}

impl ConversationRouter {
    pub fn new(agent: Arc<AgentLoop>, bus: Arc<MessageBus>) -> Self {
        Self {
            agent,
            bus,
            origin_tools: Vec::new(),
            workers: DashMap::new(),
        }
    }

    pub fn add_origin_tool(&mut self, tool: Arc<dyn OriginAware>) {
        self.origin_tools.push(tool);
    }

    /// Consume the inbound topic until it closes. This is the only inbound
    /// consumer; per-key ordering holds because dispatch happens from this
    /// single loop in delivery order.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe_inbound().await;
        info!("Conversation router started");

        loop {
            match rx.recv().await {
                Ok(BusMessage::Inbound(msg)) => self.dispatch(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Router lagged behind inbound topic, missed {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Inbound topic closed, router shutting down");
                    break;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, msg: InboundMessage) {
        let routed = resolve_route(msg);
        let key = routed.conversation_key();

        let tx = match self.workers.get(&key) {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.workers.insert(key.clone(), tx.clone());
                let router = self.clone();
                let worker_key = key.clone();
                tokio::spawn(async move {
                    router.worker_loop(&worker_key, rx).await;
                });
                tx
            }
        };

        if tx.send(routed).is_err() {
            warn!("Worker for '{key}' is gone, dropping message");
            self.workers.remove(&key);
        }
    }

    async fn worker_loop(&self, key: &str, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(msg) = rx.recv().await {
            self.process_one(key, msg).await;
        }
    }

    async fn process_one(&self, key: &str, msg: InboundMessage) {
        for tool in &self.origin_tools {
            tool.set_origin(&msg.channel, &msg.chat_id).await;
        }

        let content = msg.content.trim();

        if content == "/new" {
            if let Err(e) = self.agent.consolidate(key, true).await {
                warn!("Archival consolidation for '{key}' failed: {e}");
            }
            if let Err(e) = self.agent.sessions.clear(key).await {
                warn!("Failed to clear session '{key}': {e}");
            }
            self.reply(
                &msg,
                "New session started. Previous conversation has been saved to memory.",
            )
            .await;
            return;
        }

        if content == "/help" || content == "/start" {
            self.reply(&msg, HELP_TEXT).await;
            return;
        }

        let media = (!msg.media.is_empty()).then_some(msg.media.as_slice());
        match self.agent.process_message(key, content, media).await {
            Ok(outcome) => {
                let mut out = OutboundMessage::new(&msg.channel, &msg.chat_id, &outcome.response);
                out.metadata = msg.metadata.clone();
                self.bus.publish_outbound(out).await;

                // Consolidation runs here, after the response but before this
                // worker pulls its next message — so a trim can never race a
                // new turn on the same conversation.
                if outcome.needs_consolidation {
                    if let Err(e) = self.agent.consolidate(key, false).await {
                        warn!("Consolidation for '{key}' failed: {e}");
                    }
                }
            }
            Err(e) => {
                error!("Error processing message for '{key}': {e}");
                self.reply(&msg, &format!("Sorry, I encountered an error: {e}"))
                    .await;
            }
        }
    }

    async fn reply(&self, msg: &InboundMessage, content: &str) {
        self.bus
            .publish_outbound(OutboundMessage::new(&msg.channel, &msg.chat_id, content))
            .await;
    }
}

/// System-originated messages (cron, heartbeat, subagent reports) carry their
/// destination in the chat id as "origin_channel:origin_chat_id". Rewrite them
/// so they land in the originating conversation.
fn resolve_route(msg: InboundMessage) -> InboundMessage {
    if msg.channel != "system" {
        return msg;
    }

    let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
        Some((ch, cid)) => (ch.to_string(), cid.to_string()),
        None => ("cli".to_string(), msg.chat_id.clone()),
    };

    InboundMessage {
        channel: origin_channel,
        chat_id: origin_chat_id,
        content: format!("[System: {}] {}", msg.sender_id, msg.content),
        ..msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_messages_route_unchanged() {
        let msg = InboundMessage::new("telegram", "alice", "42", "hello");
        let routed = resolve_route(msg);
        assert_eq!(routed.conversation_key(), "telegram:42");
        assert_eq!(routed.content, "hello");
    }

    #[test]
    fn system_messages_route_to_origin_conversation() {
        let msg = InboundMessage::new("system", "heartbeat", "telegram:42", "check tasks");
        let routed = resolve_route(msg);
        assert_eq!(routed.channel, "telegram");
        assert_eq!(routed.chat_id, "42");
        assert_eq!(routed.content, "[System: heartbeat] check tasks");
    }

    #[test]
    fn system_messages_without_origin_default_to_cli() {
        let msg = InboundMessage::new("system", "cron", "reminders", "ping");
        let routed = resolve_route(msg);
        assert_eq!(routed.conversation_key(), "cli:reminders");
    }
}
