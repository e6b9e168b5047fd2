pub mod context;
pub mod r#loop;
pub mod memory;
pub mod skills;
pub mod subagent;

pub use context::ContextBuilder;
pub use memory::{Consolidator, MemoryStore};
pub use r#loop::{AgentLoop, TurnOutcome};
pub use skills::SkillsLoader;
pub use subagent::SubagentManager;
