use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const PROTOCOL_VERSION: u32 = 1;
const WIRE_PREFIX: &str = "DEL-FI:";

/// A node's self-description as last heard via an announcement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GossipEntry {
    pub name: String,
    pub version: u32,
    pub last_seen: i64,
    pub fields: HashMap<String, String>,
}

impl GossipEntry {
    fn topics(&self) -> Vec<String> {
        self.fields
            .get("topics")
            .map(|csv| csv.split(',').map(str::to_string).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Parses a `DEL-FI:<version>:ANNOUNCE:<name>[:key=value]*` wire
/// message. Returns `None` for anything malformed or carrying an
/// unsupported protocol version — both are silently ignored per
/// `spec.md` §6/§7 ("Malformed gossip" / "Unknown versions are
/// silently ignored").
pub fn parse_announcement(text: &str) -> Option<GossipEntry> {
    let text = text.trim();
    if !text.starts_with(WIRE_PREFIX) {
        return None;
    }
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() < 4 {
        return None;
    }
    let version: u32 = parts.get(1)?.parse().ok()?;
    if version != PROTOCOL_VERSION {
        debug!(version, "ignoring gossip announcement with unsupported protocol version");
        return None;
    }
    if parts.get(2) != Some(&"ANNOUNCE") {
        return None;
    }
    let name = (*parts.get(3)?).to_string();
    if name.is_empty() {
        return None;
    }

    let mut fields = HashMap::new();
    for kv in parts.iter().skip(4) {
        if let Some((k, v)) = kv.split_once('=') {
            fields.insert(k.to_string(), v.to_string());
        }
    }

    Some(GossipEntry {
        name,
        version,
        last_seen: now_unix(),
        fields,
    })
}

/// Builds this node's own announcement string.
pub fn format_announcement(node_name: &str, model: &str, topics: &[String]) -> String {
    format!(
        "{WIRE_PREFIX}{PROTOCOL_VERSION}:ANNOUNCE:{node_name}:topics={}:model={model}",
        topics.join(",")
    )
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// File-backed node directory (component 6, Tier 3). Guarded by its
/// own mutex per `spec.md` §5.
pub struct GossipDirectory {
    entries: Mutex<HashMap<String, GossipEntry>>,
    path: PathBuf,
    directory_ttl: i64,
}

impl GossipDirectory {
    pub async fn load(path: impl AsRef<Path>, directory_ttl: u64) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Self {
            entries: Mutex::new(entries),
            path,
            directory_ttl: directory_ttl as i64,
        }
    }

    /// Parses and stores an inbound announcement under `node_id`,
    /// then prunes stale entries and persists. Silently does nothing
    /// for malformed input.
    pub async fn handle_announcement(&self, node_id: &str, text: &str) {
        let Some(entry) = parse_announcement(text) else {
            return;
        };
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.insert(node_id.to_string(), entry);
            let cutoff = now_unix() - self.directory_ttl;
            entries.retain(|_, e| e.last_seen > cutoff);
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let snapshot = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.clone()
        };
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&self.path, bytes).await {
                    warn!(error = %e, "failed to persist gossip directory");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize gossip directory"),
        }
    }

    /// Tier 3 → user: if any known node advertises a topic whose word
    /// set intersects the query's, return a referral string naming it.
    pub fn find_referral(&self, query: &str) -> Option<String> {
        let query_words: std::collections::HashSet<String> = tokenize(query);
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values() {
            let topics = entry.topics();
            if topics.is_empty() {
                continue;
            }
            let topic_words: std::collections::HashSet<String> = topics
                .iter()
                .flat_map(|t| t.replace('-', " ").split_whitespace().map(str::to_string).collect::<Vec<_>>())
                .collect();
            if query_words.intersection(&topic_words).next().is_some() {
                let topics_str = topics.join(",");
                return Some(format!(
                    "I don't have docs on that. {} advertises: {topics_str}. Try DMing them directly.",
                    entry.name
                ));
            }
        }
        None
    }

    /// Renders the `!peers` nearby (non-configured) section: gossip
    /// entries whose node id isn't one of the configured peer ids.
    pub fn nearby_peers(&self, configured_ids: &[String]) -> Vec<(String, Vec<String>)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(id, _)| !configured_ids.contains(id))
            .map(|(_, e)| (e.name.clone(), e.topics()))
            .collect()
    }
}

fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_announcement() {
        let entry = parse_announcement("DEL-FI:1:ANNOUNCE:MARINA:topics=fishing,tides:model=llama3")
            .expect("should parse");
        assert_eq!(entry.name, "MARINA");
        assert_eq!(entry.fields.get("topics"), Some(&"fishing,tides".to_string()));
    }

    #[test]
    fn rejects_unsupported_version() {
        assert!(parse_announcement("DEL-FI:99:ANNOUNCE:MARINA:topics=fishing").is_none());
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(parse_announcement("not a gossip message").is_none());
        assert!(parse_announcement("DEL-FI:1:ANNOUNCE").is_none());
    }

    #[test]
    fn format_announcement_round_trips_topics() {
        let wire = format_announcement("OUTPOST", "llama3", &["weather".into(), "tides".into()]);
        let parsed = parse_announcement(&wire).expect("should parse own announcement");
        assert_eq!(parsed.name, "OUTPOST");
        assert_eq!(parsed.fields.get("topics"), Some(&"weather,tides".to_string()));
    }

    #[tokio::test]
    async fn referral_matches_on_topic_word_overlap() {
        let dir_file = tempfile::NamedTempFile::new().expect("tempfile");
        let dir = GossipDirectory::load(dir_file.path(), 86_400).await;
        dir.handle_announcement(
            "node-1",
            "DEL-FI:1:ANNOUNCE:MARINA:topics=fishing,tides:model=llama3",
        )
        .await;

        let referral = dir.find_referral("what are the tides today").expect("should refer");
        assert!(referral.contains("MARINA"));
        assert!(referral.contains("fishing,tides"));
    }

    #[tokio::test]
    async fn no_referral_without_overlap() {
        let dir_file = tempfile::NamedTempFile::new().expect("tempfile");
        let dir = GossipDirectory::load(dir_file.path(), 86_400).await;
        dir.handle_announcement(
            "node-1",
            "DEL-FI:1:ANNOUNCE:MARINA:topics=fishing,tides:model=llama3",
        )
        .await;

        assert!(dir.find_referral("tell me about elk migration").is_none());
    }
}
