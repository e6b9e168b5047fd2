pub mod agent;
pub mod bus;
pub mod cron;
pub mod heartbeat;
pub mod provider;
pub mod router;
pub mod session;
pub mod tools;

// Re-export key types
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use provider::{ChatProvider, ModelPool, ProviderError};
pub use router::ConversationRouter;
pub use session::{Session, SessionMessage, SessionStore};
pub use tools::ToolRegistry;
