use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::agent::memory::MemoryStore;
use crate::agent::skills::SkillsLoader;
use crate::provider::PromptMessage;
use crate::session::SessionMessage;

/// Bootstrap files loaded into the system prompt.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// Builds the model-facing prompt from persona, memory, skills, and history.
///
/// Deterministic for a given workspace state and history. Consolidation is
/// only signalled from here (`consolidation_due`); the agent loop decides
/// when to act on it.
pub struct ContextBuilder {
    workspace: PathBuf,
    memory: MemoryStore,
    skills: SkillsLoader,
    /// Optional override for the system prompt (used by subagents).
    preamble_override: Option<String>,
    /// Session messages kept in the prompt; also the consolidation threshold.
    history_window: usize,
}

impl ContextBuilder {
    pub fn new(workspace: &Path, history_window: usize) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            memory: MemoryStore::new(workspace),
            skills: SkillsLoader::new(workspace),
            preamble_override: None,
            history_window,
        }
    }

    /// Create a ContextBuilder with a custom preamble (for subagents).
    pub fn with_preamble(workspace: &Path, preamble: String, history_window: usize) -> Self {
        Self {
            preamble_override: Some(preamble),
            ..Self::new(workspace, history_window)
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Whether the unconsolidated session tail has outgrown the context
    /// budget. The caller performs the consolidation, not this builder.
    pub fn consolidation_due(&self, session_len: usize) -> bool {
        session_len > self.history_window
    }

    /// Build the full system prompt from identity, bootstrap files, memory,
    /// and skills.
    pub fn build_system_prompt(&self) -> Result<String> {
        if let Some(ref preamble) = self.preamble_override {
            return Ok(preamble.clone());
        }

        let mut parts = Vec::new();

        parts.push(self.get_identity());

        let bootstrap = self.load_bootstrap_files();
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        let memory = self.memory.read_long_term().unwrap_or_default();
        if !memory.is_empty() {
            parts.push(format!("# Memory\n\n{memory}"));
        }

        // Always-loaded skills (full content)
        let always_skills = self.skills.get_always_skills();
        if !always_skills.is_empty() {
            let always_content = self.skills.load_skills_for_context(&always_skills);
            if !always_content.is_empty() {
                parts.push(format!("# Active Skills\n\n{always_content}"));
            }
        }

        // Skills summary (progressive loading — agent uses read_file to load full content)
        let skills_summary = self.skills.build_skills_summary();
        if !skills_summary.is_empty() {
            parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. To use a skill, \
                 read its SKILL.md file using the read_file tool.\n\
                 Skills with missing requirements need those installed first.\n\n\
                 {skills_summary}"
            ));
        }

        Ok(parts.join("\n\n---\n\n"))
    }

    fn get_identity(&self) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
        let tz = chrono::Local::now().format("%Z");
        let workspace_path = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone())
            .display()
            .to_string();
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;

        format!(
            r#"# Coracle

You are Coracle, a helpful AI assistant. You have access to tools that allow you to:
- Read, write, and edit files
- Execute shell commands
- Search the web and fetch web pages
- Send messages to users on chat channels
- Schedule reminders and spawn background workers

## Current Time
{now} ({tz})

## Runtime
{os} {arch}, Rust

## Workspace
Your workspace is at: {workspace_path}
- Long-term memory: {workspace_path}/memory/MEMORY.md
- History log: {workspace_path}/memory/HISTORY.md (grep-searchable)
- Custom skills: {workspace_path}/skills/{{skill-name}}/SKILL.md

IMPORTANT: When responding to direct questions or conversations, reply directly with your text response.
Only use the 'message' tool when you need to send a message to a specific chat channel.
For normal conversation, just respond with text - do not call the message tool.

Always be helpful, accurate, and concise. When using tools, think step by step.
When remembering something important, write to {workspace_path}/memory/MEMORY.md
To recall past events, grep {workspace_path}/memory/HISTORY.md"#
        )
    }

    fn load_bootstrap_files(&self) -> String {
        let mut parts = Vec::new();

        for filename in BOOTSTRAP_FILES {
            let file_path = self.workspace.join(filename);
            if file_path.exists() {
                if let Ok(content) = std::fs::read_to_string(&file_path) {
                    parts.push(format!("## {filename}\n\n{content}"));
                }
            }
        }

        parts.join("\n\n")
    }

    /// Build the complete prompt for a model call: system first, recent
    /// history oldest-first, the just-arrived user message last.
    pub fn build_messages(
        &self,
        history: &[SessionMessage],
        current_message: &str,
        media: Option<&[String]>,
    ) -> Result<Vec<PromptMessage>> {
        let mut messages = Vec::new();

        messages.push(PromptMessage::System(self.build_system_prompt()?));

        for msg in history {
            match msg.role.as_str() {
                "user" => messages.push(PromptMessage::User(msg.content.clone())),
                "assistant" => messages.push(PromptMessage::Assistant(msg.content.clone())),
                // Persisted tool transcripts are summarized by consolidation;
                // they don't replay into the prompt.
                _ => {}
            }
        }

        let mut current = current_message.to_string();
        if let Some(media) = media {
            for path in media {
                current.push_str(&format!("\n[attachment: {path}]"));
            }
        }
        messages.push(PromptMessage::User(current));

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_override_replaces_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::with_preamble(dir.path(), "worker prompt".into(), 10);
        assert_eq!(ctx.build_system_prompt().unwrap(), "worker prompt");
    }

    #[test]
    fn bootstrap_files_are_injected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "Be kind.").unwrap();

        let ctx = ContextBuilder::new(dir.path(), 10);
        let prompt = ctx.build_system_prompt().unwrap();
        assert!(prompt.contains("## SOUL.md"));
        assert!(prompt.contains("Be kind."));
    }

    #[test]
    fn memory_section_appears_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), 10);
        ctx.memory().write_long_term("user prefers metric").unwrap();

        let prompt = ctx.build_system_prompt().unwrap();
        assert!(prompt.contains("# Memory"));
        assert!(prompt.contains("user prefers metric"));
    }

    #[test]
    fn messages_end_with_current_user_message() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), 10);

        let history = vec![
            SessionMessage::new("user", "earlier question"),
            SessionMessage::new("assistant", "earlier answer"),
            SessionMessage::new("tool", "[list_dir] a b c"),
        ];
        let messages = ctx.build_messages(&history, "new question", None).unwrap();

        assert!(matches!(messages[0], PromptMessage::System(_)));
        // Tool transcript entries don't replay into the prompt
        assert_eq!(messages.len(), 4);
        match messages.last().unwrap() {
            PromptMessage::User(text) => assert_eq!(text, "new question"),
            other => panic!("expected user message last, got {other:?}"),
        }
    }

    #[test]
    fn media_paths_are_noted_in_current_message() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), 10);
        let media = vec!["/tmp/photo.jpg".to_string()];
        let messages = ctx.build_messages(&[], "look at this", Some(&media)).unwrap();
        match messages.last().unwrap() {
            PromptMessage::User(text) => {
                assert!(text.contains("look at this"));
                assert!(text.contains("[attachment: /tmp/photo.jpg]"));
            }
            other => panic!("expected user message last, got {other:?}"),
        }
    }

    #[test]
    fn consolidation_due_past_window() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), 50);
        assert!(!ctx.consolidation_due(50));
        assert!(ctx.consolidation_due(51));
    }
}
