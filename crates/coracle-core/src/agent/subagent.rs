use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::context::ContextBuilder;
use crate::agent::memory::Consolidator;
use crate::agent::r#loop::AgentLoop;
use crate::bus::{MessageBus, OutboundMessage};
use crate::provider::ModelPool;
use crate::session::SessionStore;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};
use crate::tools::ToolRegistry;

/// Info about a running subagent.
struct SubagentInfo {
    label: String,
    handle: JoinHandle<()>,
}

/// Spawns isolated background agent instances.
///
/// Each subagent runs its own agent loop over its own session (derived from
/// the parent conversation plus a unique suffix) and shares nothing with the
/// parent besides the bus. On completion it publishes an outbound message
/// addressed back to the parent conversation.
pub struct SubagentManager {
    running: Arc<Mutex<HashMap<String, SubagentInfo>>>,
    models: ModelPool,
    workspace: PathBuf,
    sessions_dir: PathBuf,
    bus: Arc<MessageBus>,
    config: coracle_config::Config,
}

impl SubagentManager {
    pub fn new(
        models: ModelPool,
        workspace: PathBuf,
        sessions_dir: PathBuf,
        bus: Arc<MessageBus>,
        config: coracle_config::Config,
    ) -> Self {
        Self {
            running: Arc::new(Mutex::new(HashMap::new())),
            models,
            workspace,
            sessions_dir,
            bus,
            config,
        }
    }

    /// Spawn a background agent task. Returns the subagent id.
    pub async fn spawn(
        &self,
        task: &str,
        label: &str,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> Result<String> {
        let subagent_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let label_str = if label.is_empty() {
            format!("subagent-{subagent_id}")
        } else {
            label.to_string()
        };

        info!("Spawning subagent {subagent_id} ({label_str}): {task}");

        let agent = self.build_worker_loop()?;

        // Session identity derives from the parent conversation.
        let session_key = format!("{origin_channel}:{origin_chat_id}:sub-{subagent_id}");
        let task_owned = task.to_string();
        let label_owned = label_str.clone();
        let id_owned = subagent_id.clone();
        let origin_channel = origin_channel.to_string();
        let origin_chat_id = origin_chat_id.to_string();
        let bus = self.bus.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let result = agent.process_message(&session_key, &task_owned, None).await;

            let (announcement, status) = match &result {
                Ok(outcome) => (
                    format!(
                        "[Subagent '{label_owned}' completed]\n\
                         Task: {task_owned}\n\
                         Result: {}",
                        outcome.response
                    ),
                    "completed",
                ),
                Err(e) => (
                    format!(
                        "[Subagent '{label_owned}' failed]\n\
                         Task: {task_owned}\n\
                         Error: {e}"
                    ),
                    "error",
                ),
            };

            // Deliver the result to the parent conversation.
            let mut msg = OutboundMessage::new(&origin_channel, &origin_chat_id, &announcement);
            msg.metadata.insert(
                "subagent_id".to_string(),
                serde_json::Value::String(id_owned.clone()),
            );
            msg.metadata.insert(
                "status".to_string(),
                serde_json::Value::String(status.to_string()),
            );

            if bus.publish_outbound(msg).await == 0 {
                warn!("Subagent {id_owned} result had no outbound consumer");
            }

            running.lock().await.remove(&id_owned);
            info!("Subagent {id_owned} finished");
        });

        self.running.lock().await.insert(
            subagent_id.clone(),
            SubagentInfo {
                label: label_str,
                handle,
            },
        );

        Ok(subagent_id)
    }

    /// List running subagents as (id, label) pairs.
    pub async fn list(&self) -> Vec<(String, String)> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(id, info)| (id.clone(), info.label.clone()))
            .collect()
    }

    /// Cancel a running subagent.
    pub async fn cancel(&self, subagent_id: &str) -> bool {
        if let Some(info) = self.running.lock().await.remove(subagent_id) {
            info.handle.abort();
            info!("Cancelled subagent {subagent_id}");
            true
        } else {
            false
        }
    }

    /// Build an isolated agent loop with the worker preamble and a
    /// restricted tool set (no message, spawn, or cron tools).
    fn build_worker_loop(&self) -> Result<AgentLoop> {
        let defaults = &self.config.agents.defaults;
        let sessions = Arc::new(SessionStore::new(self.sessions_dir.clone()));

        let worker_prompt = format!(
            "You are a focused background worker agent (subagent). \
             Your workspace is: {}\n\n\
             IMPORTANT RULES:\n\
             - Stay focused ONLY on your assigned task\n\
             - Do NOT start conversations or ask questions\n\
             - Do NOT work on anything besides your task\n\
             - Be concise but thorough in your work\n\
             - When done, provide a clear summary of what you accomplished",
            self.workspace.display()
        );
        let context = ContextBuilder::with_preamble(
            &self.workspace,
            worker_prompt,
            defaults.memory_window,
        );

        let mut tools = ToolRegistry::new();
        let allowed_dir: Option<PathBuf> = if self.config.tools.restrict_to_workspace {
            Some(self.workspace.clone())
        } else {
            None
        };
        tools.register(Box::new(ReadFileTool::new(allowed_dir.clone())))?;
        tools.register(Box::new(WriteFileTool::new(allowed_dir.clone())))?;
        tools.register(Box::new(EditFileTool::new(allowed_dir.clone())))?;
        tools.register(Box::new(ListDirTool::new(allowed_dir)))?;
        tools.register(Box::new(ExecTool::new(
            self.workspace.clone(),
            self.config.tools.exec.timeout_secs,
            self.config.tools.restrict_to_workspace,
        )))?;

        let brave_api_key = if self.config.tools.web.search.api_key.is_empty() {
            std::env::var("BRAVE_API_KEY").unwrap_or_default()
        } else {
            self.config.tools.web.search.api_key.clone()
        };
        tools.register(Box::new(WebSearchTool::new(
            brave_api_key,
            self.config.tools.web.search.max_results,
        )))?;
        tools.register(Box::new(WebFetchTool::new(50_000)))?;

        Ok(AgentLoop {
            models: self.models.clone(),
            sessions,
            context,
            tools: Arc::new(tools),
            consolidator: Consolidator::new(&self.workspace, defaults.memory_window / 2),
            max_iterations: 15, // Lower limit for subagents
            temperature: defaults.temperature as f64,
            max_tokens: defaults.max_tokens as u64,
            provider_retries: defaults.provider_retries,
        })
    }
}
