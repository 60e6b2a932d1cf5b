//! Conversation Memory: per-sender short-term history (`spec.md` §4.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Hard ceiling on `max_turns`, regardless of configuration
/// (`spec.md` §4.3, `original_source/memory.py` `MAX_TURNS_HARD_CAP`).
pub const MAX_TURNS_HARD_CAP: usize = 50;
const DEFAULT_MAX_TURNS: usize = 10;
const DEFAULT_MEMORY_TTL_SECONDS: i64 = 3600;

/// One exchange in a sender's history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-sender ring buffer of recent turns, capped and TTL-expired
/// (`spec.md` §4.3). Guarded by its own mutex.
pub struct ConversationMemory {
    turns: Mutex<HashMap<String, Vec<Turn>>>,
    max_turns: usize,
    ttl_seconds: i64,
    store_file: PathBuf,
}

impl ConversationMemory {
    /// Loads persisted history from `cache_dir/conversation_memory.json`.
    /// `max_turns` is clamped to [`MAX_TURNS_HARD_CAP`].
    pub async fn load(cache_dir: impl Into<PathBuf>, max_turns: usize) -> Self {
        let max_turns = max_turns.clamp(1, MAX_TURNS_HARD_CAP);
        let ttl_seconds = DEFAULT_MEMORY_TTL_SECONDS;
        let store_file = cache_dir.into().join("conversation_memory.json");
        let turns: HashMap<String, Vec<Turn>> = match tokio::fs::read(&store_file).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        let memory = Self {
            turns: Mutex::new(turns),
            max_turns,
            ttl_seconds,
            store_file,
        };
        memory.cleanup_locked();
        memory
    }

    /// Overrides the TTL (seconds); defaults to
    /// [`DEFAULT_MEMORY_TTL_SECONDS`] otherwise.
    #[must_use]
    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Appends a turn for `sender`, trimming to `max_turns` from the
    /// front. Persists best-effort.
    pub async fn add_turn(&self, sender: &str, question: &str, answer: &str) {
        {
            let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            let entry = turns.entry(sender.to_string()).or_default();
            entry.push(Turn {
                question: question.to_string(),
                answer: answer.to_string(),
                timestamp: Utc::now(),
            });
            let max_turns = self.max_turns;
            if entry.len() > max_turns {
                let drop = entry.len() - max_turns;
                entry.drain(0..drop);
            }
        }
        self.persist().await;
    }

    /// Returns `sender`'s unexpired history, oldest first.
    pub fn get_history(&self, sender: &str) -> Vec<Turn> {
        let turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = turns.get(sender) else {
            return Vec::new();
        };
        entry
            .iter()
            .filter(|t| !self.expired(t))
            .cloned()
            .collect()
    }

    /// Renders unexpired history as `User: ...` / `Assistant: ...`
    /// lines prefixed by a fixed header, ready to embed in a prompt
    /// (`spec.md` §4.3 `format_for_prompt`).
    pub fn format_for_prompt(&self, sender: &str) -> Option<String> {
        let history = self.get_history(sender);
        if history.is_empty() {
            return None;
        }
        let mut lines = vec!["Recent conversation with this user:".to_string()];
        for t in &history {
            lines.push(format!("User: {}", t.question));
            lines.push(format!("Assistant: {}", t.answer));
        }
        Some(lines.join("\n"))
    }

    /// Clears one sender's history (`!forget`, `spec.md` §4.7.2).
    pub async fn clear(&self, sender: &str) -> bool {
        let removed = {
            let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            turns.remove(sender).is_some()
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Clears every sender's history.
    pub async fn clear_all(&self) {
        {
            let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            turns.clear();
        }
        self.persist().await;
    }

    /// Count of senders with any retained turns.
    pub fn sender_count(&self) -> usize {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drops expired turns and empty sender entries; persists if
    /// anything changed.
    pub async fn cleanup(&self) {
        let changed = self.cleanup_locked();
        if changed {
            self.persist().await;
        }
    }

    fn cleanup_locked(&self) -> bool {
        let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        turns.retain(|_, entry| {
            let before = entry.len();
            entry.retain(|t| !self.expired(t));
            changed |= entry.len() != before;
            !entry.is_empty()
        });
        changed
    }

    fn expired(&self, turn: &Turn) -> bool {
        (Utc::now() - turn.timestamp).num_seconds() > self.ttl_seconds
    }

    async fn persist(&self) {
        let snapshot = {
            let turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            turns.clone()
        };
        if let Some(parent) = self.store_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&self.store_file, bytes).await {
                    warn!(error = %e, "memory: could not persist conversation history");
                }
            }
            Err(e) => warn!(error = %e, "memory: could not serialize conversation history"),
        }
    }
}

/// Minimal greeting detector used by the dispatcher to skip RAG on
/// bare pleasantries (`spec.md` §4.7.3, `original_source/router.py`
/// `GREETINGS`).
pub fn is_greeting(text: &str) -> bool {
    const GREETINGS: &[&str] = &["hi", "hello", "hey", "yo", "sup", "howdy", "hola", "greetings"];
    let normalized = text.trim().trim_end_matches(['.', '!', '?']).to_lowercase();
    GREETINGS.contains(&normalized.as_str())
}

impl Drop for ConversationMemory {
    fn drop(&mut self) {
        info!(senders = self.sender_count(), "memory: dropping conversation memory");
    }
}
