use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::provider::{ChatProvider, CompletionParams, PromptMessage};
use crate::session::{SessionMessage, SessionStore};

/// Two-layer memory: MEMORY.md holds consolidated long-term facts
/// (overwritten wholesale on each consolidation), HISTORY.md is an
/// append-only event log that is never rewritten.
pub struct MemoryStore {
    memory_path: PathBuf,
    history_path: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            memory_path: workspace.join("memory").join("MEMORY.md"),
            history_path: workspace.join("memory").join("HISTORY.md"),
        }
    }

    pub fn read_long_term(&self) -> Result<String> {
        if self.memory_path.exists() {
            Ok(std::fs::read_to_string(&self.memory_path)?)
        } else {
            Ok(String::new())
        }
    }

    pub fn write_long_term(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.memory_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::write(&self.memory_path, content)?)
    }

    pub fn append_history(&self, entry: &str) -> Result<()> {
        use std::io::Write;
        if let Some(parent) = self.history_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)?;
        writeln!(file, "\n{entry}")?;
        Ok(())
    }

    pub fn read_history(&self) -> Result<String> {
        if self.history_path.exists() {
            Ok(std::fs::read_to_string(&self.history_path)?)
        } else {
            Ok(String::new())
        }
    }
}

/// Folds old session messages into long-term memory.
///
/// One extra model call summarizes the span being trimmed. The write order is
/// fixed: history entry first, fact file second, session trim last. A crash
/// between those steps leaves the tail un-trimmed, and the next run simply
/// re-summarizes it; once the trim has landed, re-running against the
/// shortened tail is a no-op, so history entries are never duplicated.
pub struct Consolidator {
    store: MemoryStore,
    /// Messages left in the session after a threshold-triggered consolidation.
    keep_recent: usize,
}

impl Consolidator {
    pub fn new(workspace: &Path, keep_recent: usize) -> Self {
        Self {
            store: MemoryStore::new(workspace),
            keep_recent,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Consolidate the session prefix beyond the keep-window. With
    /// `archive_all`, the whole session is folded in (used by `/new`).
    /// Returns whether anything was consolidated.
    pub async fn consolidate(
        &self,
        provider: &Arc<dyn ChatProvider>,
        sessions: &SessionStore,
        session_key: &str,
        archive_all: bool,
    ) -> Result<bool> {
        let session = sessions.load(session_key).await?;
        let keep = if archive_all { 0 } else { self.keep_recent };

        let total = session.messages.len();
        if total <= keep {
            return Ok(false);
        }
        let cut = total - keep;
        let span = &session.messages[..cut];

        let conversation = render_transcript(span);
        let current_memory = self.store.read_long_term()?;

        let prompt = format!(
            r#"You are a memory consolidation agent. Process this conversation and return a JSON object with exactly two keys:

1. "history_entry": A paragraph (2-5 sentences) summarizing the key events/decisions/topics. Start with a timestamp like [YYYY-MM-DD HH:MM]. Include enough detail to be useful when found by grep search later.

2. "memory_update": The updated long-term memory content. Add any new facts: user location, preferences, personal info, habits, project context, technical decisions, tools/services used. If nothing new, return the existing content unchanged.

## Current Long-term Memory
{current_memory}

## Conversation to Process
{conversation}

Respond with ONLY valid JSON, no markdown fences."#
        );

        let outcome = provider
            .complete(CompletionParams {
                messages: vec![PromptMessage::User(prompt)],
                tools: Vec::new(),
                temperature: 0.3,
                max_tokens: 2048,
            })
            .await
            .map_err(|e| anyhow::anyhow!("consolidation model call failed: {e}"))?;

        debug!("Consolidation model response: {}", outcome.text);
        let json_str = strip_markdown_fences(&outcome.text);

        let parsed: serde_json::Value = match serde_json::from_str(json_str) {
            Ok(v) => v,
            Err(e) => {
                warn!("Consolidation: failed to parse model response as JSON: {e}");
                return Ok(false);
            }
        };

        // History first, fact second, trim last. Trimming is the commit
        // point; everything before it is safe to repeat.
        if let Some(entry) = parsed.get("history_entry").and_then(|e| e.as_str()) {
            self.store.append_history(entry)?;
            info!("Consolidation: appended history entry for '{session_key}'");
        }
        if let Some(update) = parsed.get("memory_update").and_then(|u| u.as_str()) {
            self.store.write_long_term(update)?;
            info!("Consolidation: updated long-term memory");
        }
        sessions.trim(session_key, cut).await?;

        Ok(true)
    }
}

/// Render session messages for the consolidation prompt.
fn render_transcript(messages: &[SessionMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        let ts = msg.timestamp.as_deref().unwrap_or("unknown");
        let role = msg.role.to_uppercase();
        let tools_info = match &msg.tools_used {
            Some(tools) if !tools.is_empty() => {
                format!(" [tools: {}]", tools.join(", "))
            }
            _ => String::new(),
        };
        out.push_str(&format!("[{ts}] {role}{tools_info}: {}\n", msg.content));
    }
    out
}

/// Strip markdown code fences from a model response to extract raw content.
/// Handles ```json, ```, and plain text (no fences).
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_fences_json() {
        let input = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_markdown_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn strip_fences_plain() {
        let input = "```\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_markdown_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn strip_fences_none() {
        let input = "{\"key\": \"value\"}";
        assert_eq!(strip_markdown_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn strip_fences_unclosed() {
        let input = "```json\n{\"key\": \"value\"}";
        assert_eq!(strip_markdown_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn transcript_includes_roles_and_tools() {
        let messages = vec![
            SessionMessage::new("user", "list my files"),
            SessionMessage::with_tools("assistant", "done", vec!["list_dir".into()]),
        ];
        let rendered = render_transcript(&messages);
        assert!(rendered.contains("USER: list my files"));
        assert!(rendered.contains("ASSISTANT [tools: list_dir]: done"));
    }

    #[test]
    fn memory_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        assert_eq!(store.read_long_term().unwrap(), "");
        store.write_long_term("user lives in Lisbon").unwrap();
        assert_eq!(store.read_long_term().unwrap(), "user lives in Lisbon");

        store.append_history("[2025-01-01 10:00] first entry").unwrap();
        store.append_history("[2025-01-02 11:00] second entry").unwrap();
        let history = store.read_history().unwrap();
        assert!(history.contains("first entry"));
        assert!(history.contains("second entry"));
        let first = history.find("first entry").unwrap();
        let second = history.find("second entry").unwrap();
        assert!(first < second);
    }

    #[test]
    fn long_term_memory_is_overwritten_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.write_long_term("old facts").unwrap();
        store.write_long_term("new facts").unwrap();
        assert_eq!(store.read_long_term().unwrap(), "new facts");
    }
}
