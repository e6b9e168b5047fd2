use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Topic carrying messages from channel adapters to the agent.
pub const INBOUND_TOPIC: &str = "inbound";
/// Topic carrying agent responses back to channel adapters.
pub const OUTBOUND_TOPIC: &str = "outbound";

/// Ring-buffer size per topic. Inbound traffic is human-message-scale, so a
/// subscriber lagging this far behind loses the oldest messages (logged).
const TOPIC_BUFFER: usize = 1024;

/// Message received from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub media: Vec<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Stable conversation identity: the unit of ordering and persistence.
    pub fn conversation_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Message to send to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            reply_to: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn conversation_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Payload delivered on a bus topic.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Inbound(InboundMessage),
    Outbound(OutboundMessage),
}

/// In-process publish/subscribe bus connecting channels, schedulers, and the
/// agent.
///
/// Each topic is a single ordered broadcast channel, so two messages published
/// on one topic are delivered to every subscriber in publish order — which
/// gives per-conversation FIFO for free, since all conversations share the
/// inbound topic. Delivery is at-most-once per subscriber and in-process only:
/// publishing to a topic with no subscribers drops the message.
pub struct MessageBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a topic, creating it if needed. Only messages published
    /// after this call are delivered.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .subscribe()
    }

    /// Publish a message to a topic. Returns the number of subscribers the
    /// message was delivered to (0 means it was dropped).
    pub async fn publish(&self, topic: &str, msg: BusMessage) -> usize {
        let topics = self.topics.read().await;
        match topics.get(topic).map(|tx| tx.send(msg)) {
            Some(Ok(n)) => n,
            _ => {
                debug!("No subscribers on topic '{topic}', message dropped");
                0
            }
        }
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) -> usize {
        self.publish(INBOUND_TOPIC, BusMessage::Inbound(msg)).await
    }

    pub async fn publish_outbound(&self, msg: OutboundMessage) -> usize {
        self.publish(OUTBOUND_TOPIC, BusMessage::Outbound(msg))
            .await
    }

    pub async fn subscribe_inbound(&self) -> broadcast::Receiver<BusMessage> {
        self.subscribe(INBOUND_TOPIC).await
    }

    pub async fn subscribe_outbound(&self) -> broadcast::Receiver<BusMessage> {
        self.subscribe(OUTBOUND_TOPIC).await
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
