use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use coracle_core::bus::{MessageBus, OutboundMessage};

/// Trait that all chat channel implementations must satisfy.
///
/// Adapters own everything platform-specific: transport, formatting, and the
/// allow-list check — `is_allowed` must be consulted before a sender's
/// message is published to the bus.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "telegram", "discord").
    fn name(&self) -> &str;

    /// Start listening for messages, publishing inbound messages to the bus.
    async fn start(&self, bus: Arc<MessageBus>) -> Result<()>;

    /// Stop the channel and clean up resources.
    async fn stop(&self) -> Result<()>;

    /// Send a message through this channel.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Check if a sender is allowed to use this bot.
    fn is_allowed(&self, sender_id: &str) -> bool;
}
