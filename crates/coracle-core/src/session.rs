use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A single message in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<String>>,
}

impl SessionMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Some(Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            tools_used: None,
        }
    }

    pub fn with_tools(role: &str, content: &str, tools: Vec<String>) -> Self {
        Self {
            tools_used: if tools.is_empty() { None } else { Some(tools) },
            ..Self::new(role, content)
        }
    }
}

/// JSONL metadata line (first line of session file).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionHeader {
    #[serde(rename = "_type")]
    type_field: String,
    created_at: String,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    /// Total messages folded into long-term memory over this session's life.
    #[serde(default)]
    consolidated_count: usize,
}

impl SessionHeader {
    fn new() -> Self {
        Self {
            type_field: "metadata".into(),
            created_at: Utc::now().to_rfc3339(),
            metadata: HashMap::new(),
            consolidated_count: 0,
        }
    }
}

/// A conversation session: the ordered message log for one conversation key.
pub struct Session {
    pub key: String,
    pub messages: Vec<SessionMessage>,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub consolidated_count: usize,
}

impl Session {
    pub fn new(key: String) -> Self {
        Self {
            key,
            messages: Vec::new(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
            consolidated_count: 0,
        }
    }

    /// The most recent messages, oldest first, capped at `max_messages`.
    pub fn recent(&self, max_messages: usize) -> &[SessionMessage] {
        let start = self.messages.len().saturating_sub(max_messages);
        &self.messages[start..]
    }
}

/// Append-only session persistence: one JSONL file per conversation key.
///
/// Appends are durable at message granularity — a line is flushed and synced
/// before `append` returns, and `load` skips a torn final line, so a crash
/// never loses an acknowledged message or resurrects a partial one. Trimming
/// (the only prefix removal, done by memory consolidation) rewrites through a
/// temp file and an atomic rename.
///
/// Writers for one key serialize on a per-key lock; distinct keys proceed
/// concurrently.
pub struct SessionStore {
    sessions_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionStore {
    pub fn new(sessions_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&sessions_dir).ok();
        Self {
            sessions_dir,
            locks: DashMap::new(),
        }
    }

    /// Get the file path for a session key.
    fn session_path(&self, key: &str) -> PathBuf {
        // Replace : with _ for filesystem safety
        let safe_key = key.replace(':', "_");
        self.sessions_dir.join(format!("{safe_key}.jsonl"))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one message to a session, creating the session on first use.
    pub async fn append(&self, key: &str, message: &SessionMessage) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let path = self.session_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let is_new = !path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open session '{key}'"))?;

        if is_new {
            writeln!(file, "{}", serde_json::to_string(&SessionHeader::new())?)?;
        }
        writeln!(file, "{}", serde_json::to_string(message)?)?;
        file.sync_data()
            .with_context(|| format!("failed to sync session '{key}'"))?;
        Ok(())
    }

    /// Load a session, returning an empty one if it has never been written.
    pub async fn load(&self, key: &str) -> Result<Session> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        Ok(self.read_session(key))
    }

    /// Remove the oldest `count` messages after they have been folded into
    /// memory. Trimming more than exists clamps to everything; trimming an
    /// already-trimmed prefix again is a no-op on the remaining tail.
    pub async fn trim(&self, key: &str, count: usize) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut session = self.read_session(key);
        let removed = count.min(session.messages.len());
        if removed == 0 {
            return Ok(());
        }
        session.messages.drain(..removed);
        session.consolidated_count += removed;
        self.rewrite(key, &session)
    }

    /// Delete all messages, preserving the consolidated count.
    pub async fn clear(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut session = self.read_session(key);
        session.consolidated_count += session.messages.len();
        session.messages.clear();
        self.rewrite(key, &session)
    }

    fn read_session(&self, key: &str) -> Session {
        let path = self.session_path(key);
        let mut session = Session::new(key.into());
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return session,
        };

        for line in std::io::BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let data: serde_json::Value = match serde_json::from_str(line) {
                Ok(d) => d,
                Err(e) => {
                    // A torn final line after a crash lands here.
                    tracing::warn!("Skipping malformed session line in '{key}': {e}");
                    continue;
                }
            };

            if data.get("_type").and_then(|v| v.as_str()) == Some("metadata") {
                if let Some(ca) = data.get("created_at").and_then(|v| v.as_str()) {
                    if let Ok(dt) = DateTime::parse_from_rfc3339(ca) {
                        session.created_at = dt.with_timezone(&Utc);
                    }
                }
                if let Some(m) = data.get("metadata").and_then(|v| v.as_object()) {
                    session.metadata = m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                }
                if let Some(cc) = data.get("consolidated_count").and_then(|v| v.as_u64()) {
                    session.consolidated_count = cc as usize;
                }
            } else if let Ok(msg) = serde_json::from_value::<SessionMessage>(data) {
                session.messages.push(msg);
            }
        }

        session
    }

    /// Rewrite a session file in full (trim/clear). Temp file + rename keeps
    /// the old file intact until the new one is durable.
    fn rewrite(&self, key: &str, session: &Session) -> Result<()> {
        let path = self.session_path(key);
        let tmp = path.with_extension("jsonl.tmp");

        let header = SessionHeader {
            type_field: "metadata".into(),
            created_at: session.created_at.to_rfc3339(),
            metadata: session.metadata.clone(),
            consolidated_count: session.consolidated_count,
        };

        {
            let mut file = std::fs::File::create(&tmp)?;
            writeln!(file, "{}", serde_json::to_string(&header)?)?;
            for msg in &session.messages {
                writeln!(file, "{}", serde_json::to_string(msg)?)?;
            }
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace session '{key}'"))?;
        Ok(())
    }

    /// List all persisted sessions by reading metadata lines.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();

        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(_) => return sessions,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }

            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut reader = std::io::BufReader::new(file);
            let mut first_line = String::new();
            if reader.read_line(&mut first_line).is_err() || first_line.is_empty() {
                continue;
            }

            let data: serde_json::Value = match serde_json::from_str(first_line.trim()) {
                Ok(d) => d,
                Err(_) => continue,
            };

            if data.get("_type").and_then(|v| v.as_str()) == Some("metadata") {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("")
                    .replace('_', ":");
                sessions.push(SessionInfo {
                    key,
                    created_at: data
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    path: path.to_string_lossy().to_string(),
                });
            }
        }

        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }
}

/// Summary info for a session (for listing).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let (_dir, store) = store();
        store
            .append("cli:1", &SessionMessage::new("user", "hello"))
            .await
            .unwrap();
        store
            .append("cli:1", &SessionMessage::new("assistant", "hi there"))
            .await
            .unwrap();

        let session = store.load("cli:1").await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, "user");
        assert_eq!(session.messages[0].content, "hello");
        assert_eq!(session.messages[1].role, "assistant");
        assert_eq!(session.consolidated_count, 0);
    }

    #[tokio::test]
    async fn load_missing_session_is_empty() {
        let (_dir, store) = store();
        let session = store.load("cli:none").await.unwrap();
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn trim_removes_oldest_prefix() {
        let (_dir, store) = store();
        for i in 0..5 {
            store
                .append("cli:1", &SessionMessage::new("user", &format!("m{i}")))
                .await
                .unwrap();
        }

        store.trim("cli:1", 3).await.unwrap();

        let session = store.load("cli:1").await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "m3");
        assert_eq!(session.messages[1].content, "m4");
        assert_eq!(session.consolidated_count, 3);
    }

    #[tokio::test]
    async fn trim_clamps_and_repeats_safely() {
        let (_dir, store) = store();
        store
            .append("cli:1", &SessionMessage::new("user", "only"))
            .await
            .unwrap();

        store.trim("cli:1", 10).await.unwrap();
        store.trim("cli:1", 10).await.unwrap();

        let session = store.load("cli:1").await.unwrap();
        assert!(session.messages.is_empty());
        assert_eq!(session.consolidated_count, 1);
    }

    #[tokio::test]
    async fn append_survives_trim() {
        let (_dir, store) = store();
        for i in 0..3 {
            store
                .append("cli:1", &SessionMessage::new("user", &format!("m{i}")))
                .await
                .unwrap();
        }
        store.trim("cli:1", 2).await.unwrap();
        store
            .append("cli:1", &SessionMessage::new("user", "after"))
            .await
            .unwrap();

        let session = store.load("cli:1").await.unwrap();
        let contents: Vec<_> = session.messages.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["m2", "after"]);
    }

    #[tokio::test]
    async fn torn_final_line_is_ignored() {
        let (dir, store) = store();
        store
            .append("cli:1", &SessionMessage::new("user", "complete"))
            .await
            .unwrap();

        // Simulate a crash mid-append: a partial JSON line at EOF.
        let path = dir.path().join("cli_1.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"role\":\"user\",\"cont").unwrap();
        drop(file);

        let session = store.load("cli:1").await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "complete");
    }

    #[tokio::test]
    async fn distinct_keys_are_isolated() {
        let (_dir, store) = store();
        store
            .append("cli:a", &SessionMessage::new("user", "for a"))
            .await
            .unwrap();
        store
            .append("tg:b", &SessionMessage::new("user", "for b"))
            .await
            .unwrap();

        assert_eq!(store.load("cli:a").await.unwrap().messages.len(), 1);
        assert_eq!(store.load("tg:b").await.unwrap().messages.len(), 1);

        let keys: Vec<_> = store.list_sessions().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["cli:a", "tg:b"]);
    }

    #[tokio::test]
    async fn clear_preserves_consolidated_count() {
        let (_dir, store) = store();
        for i in 0..4 {
            store
                .append("cli:1", &SessionMessage::new("user", &format!("m{i}")))
                .await
                .unwrap();
        }
        store.clear("cli:1").await.unwrap();

        let session = store.load("cli:1").await.unwrap();
        assert!(session.messages.is_empty());
        assert_eq!(session.consolidated_count, 4);
    }
}
