use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dchat_tool_runtime::{ConversationMessage, Role};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persisted session metadata and conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier (creation timestamp)
    pub id: String,
    /// Human-readable session name
    pub name: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Full part-based history, including settled tool calls
    pub messages: Vec<ConversationMessage>,
}

impl Session {
    /// Create a new session with auto-generated ID.
    pub fn new(model: String, system_prompt: Option<String>) -> Self {
        let now = Utc::now();
        let id = now.format("%Y%m%d-%H%M%S").to_string();
        Self {
            id: id.clone(),
            name: id,
            model,
            system_prompt,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Update the session name based on the first user message.
    pub fn update_name_from_first_message(&mut self) {
        if let Some(first) = self.messages.iter().find(|m| m.role == Role::User) {
            let sanitized = sanitize_session_name(&first.text());
            if !sanitized.is_empty() {
                self.name = sanitized;
            }
        }
    }

    fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.id))
    }

    /// Save the session into `dir`.
    pub fn save(&mut self, dir: &Path) -> Result<PathBuf> {
        self.updated_at = Utc::now();
        let path = self.file_path(dir);
        let json = serde_json::to_string_pretty(self).context("failed to serialize session")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write session: {}", path.display()))?;
        debug!(id = %self.id, path = %path.display(), "Session saved");
        Ok(path)
    }

    /// Load a session from `dir` by ID or name prefix.
    pub fn load(dir: &Path, id_or_name: &str) -> Result<Self> {
        let exact_path = dir.join(format!("{}.json", id_or_name));
        if exact_path.exists() {
            return Self::load_from_path(&exact_path);
        }

        let needle = id_or_name.to_lowercase();
        let mut matches: Vec<Self> = Self::read_all(dir)?
            .into_iter()
            .filter(|s| s.id.starts_with(id_or_name) || s.name.to_lowercase().contains(&needle))
            .collect();

        match matches.len() {
            0 => anyhow::bail!("no session found matching '{}'", id_or_name),
            1 => Ok(matches.remove(0)),
            n => anyhow::bail!(
                "ambiguous session '{}': {} matches found. Use a more specific identifier.",
                id_or_name,
                n
            ),
        }
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session: {}", path.display()))?;
        let session: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse session: {}", path.display()))?;
        Ok(session)
    }

    /// Every readable session file in `dir`; unparseable files are skipped.
    fn read_all(dir: &Path) -> Result<Vec<Self>> {
        let entries = std::fs::read_dir(dir).context("failed to read sessions directory")?;
        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::load_from_path(&path) {
                    Ok(session) => sessions.push(session),
                    Err(e) => debug!(path = %path.display(), error = %e, "Skipping session file"),
                }
            }
        }
        Ok(sessions)
    }

    /// List all saved sessions, sorted by most recent first.
    pub fn list_all(dir: &Path) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = Self::read_all(dir)?
            .into_iter()
            .map(|session| SessionSummary {
                id: session.id,
                name: session.name,
                model: session.model,
                updated_at: session.updated_at,
                message_count: session.messages.len(),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

/// Lightweight summary of a session for listing.
#[derive(Debug)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub model: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Sanitize a user message into a valid session name.
/// Takes the first ~50 chars, replaces non-alphanumeric with dashes, lowercases.
fn sanitize_session_name(text: &str) -> String {
    let truncated: String = text.chars().take(50).collect();
    let mut result = String::new();
    let mut prev_dash = false;
    for c in truncated.chars() {
        if c.is_alphanumeric() || c == '_' {
            result.extend(c.to_lowercase());
            prev_dash = false;
        } else {
            // collapse runs; no leading dash
            if !prev_dash && !result.is_empty() {
                result.push('-');
            }
            prev_dash = true;
        }
    }
    result.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dchat_tool_runtime::{ToolCall, TrackedCall};
    use serde_json::json;

    #[test]
    fn test_sanitize_session_name() {
        assert_eq!(sanitize_session_name("Hello World!"), "hello-world");
        assert_eq!(
            sanitize_session_name("What is 5000 + 2?"),
            "what-is-5000-2"
        );
        assert_eq!(
            sanitize_session_name("   lots   of   spaces   "),
            "lots-of-spaces"
        );
        assert_eq!(sanitize_session_name("simple"), "simple");
    }

    #[test]
    fn test_sanitize_long_name() {
        let long = "a".repeat(100);
        let result = sanitize_session_name(&long);
        assert!(result.len() <= 50);
    }

    #[test]
    fn test_name_from_first_user_message() {
        let mut session = Session::new("claude-test".to_string(), None);
        session.messages.push(ConversationMessage::system("be brief"));
        session.messages.push(ConversationMessage::user("Weather in Berlin?"));
        session.update_name_from_first_message();
        assert_eq!(session.name, "weather-in-berlin");
    }

    #[test]
    fn test_save_and_load_keeps_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("claude-test".to_string(), Some("be brief".to_string()));
        session.messages.push(ConversationMessage::user("What is 5000 + 2?"));
        let mut assistant = ConversationMessage::assistant();
        let mut call = TrackedCall::available(ToolCall {
            id: "toolu_01".to_string(),
            name: "calculate".to_string(),
            input: json!({"a": 5000, "b": 2, "operator": "+"}),
        });
        call.gate(true).unwrap();
        call.reject("Tool call was denied by the operator").unwrap();
        assistant.upsert_tool_call(call);
        session.messages.push(assistant);
        session.update_name_from_first_message();
        session.save(dir.path()).unwrap();

        let loaded = Session::load(dir.path(), &session.id).unwrap();
        assert_eq!(loaded.messages, session.messages);
        assert_eq!(loaded.system_prompt.as_deref(), Some("be brief"));

        let by_name = Session::load(dir.path(), "5000").unwrap();
        assert_eq!(by_name.id, session.id);
    }

    #[test]
    fn test_load_missing_and_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Session::load(dir.path(), "nothing").is_err());

        for (id, text) in [("a-1", "weather today"), ("a-2", "weather tomorrow")] {
            let mut session = Session::new("claude-test".to_string(), None);
            session.id = id.to_string();
            session.messages.push(ConversationMessage::user(text));
            session.update_name_from_first_message();
            session.save(dir.path()).unwrap();
        }
        let err = Session::load(dir.path(), "weather").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
        assert_eq!(Session::load(dir.path(), "a-2").unwrap().name, "weather-tomorrow");
    }

    #[test]
    fn test_list_all_sorted_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let mut older = Session::new("m".to_string(), None);
        older.id = "older".to_string();
        older.save(dir.path()).unwrap();
        let mut newer = Session::new("m".to_string(), None);
        newer.id = "newer".to_string();
        newer.messages.push(ConversationMessage::user("hi"));
        newer.save(dir.path()).unwrap();

        let list = Session::list_all(dir.path()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "newer");
        assert_eq!(list[0].message_count, 1);
    }
}
