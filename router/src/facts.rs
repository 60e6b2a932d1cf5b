//! Fact Store: freshness-aware sensor readings (`spec.md` §4.2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use common::error::OracleError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

const REQUIRED_FIELDS: [&str; 3] = ["value", "timestamp", "source"];
const DEFAULT_STALE_AFTER_SECONDS: i64 = 3600;

/// A single stored sensor fact (`spec.md` §3 "Fact").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fact {
    pub value: Value,
    #[serde(default)]
    pub unit: String,
    pub timestamp: String,
    pub source: String,
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: i64,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub ingested_at: f64,
}

fn default_stale_after() -> i64 {
    DEFAULT_STALE_AFTER_SECONDS
}

/// A fact enriched with freshness info, as returned by [`FactStore::get`].
#[derive(Clone, Debug)]
pub struct FactView {
    pub fact: Fact,
    pub is_stale: bool,
    pub age_seconds: i64,
}

/// Freshness-aware sensor fact store, backed by a JSON file
/// (`spec.md` §4.2, §6 "facts.json"). Guarded by its own mutex.
pub struct FactStore {
    facts: Mutex<HashMap<String, Fact>>,
    store_file: PathBuf,
}

impl FactStore {
    /// Loads any persisted facts from `cache_dir/facts.json`.
    pub async fn load(cache_dir: impl AsRef<Path>) -> Self {
        let store_file = cache_dir.as_ref().join("facts.json");
        let facts = match tokio::fs::read(&store_file).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        if !facts.is_empty() {
            info!(count = facts.len(), "facts: loaded persisted facts");
        }
        Self {
            facts: Mutex::new(facts),
            store_file,
        }
    }

    /// Upserts facts from a payload map. Returns `(count_updated, errors)`;
    /// partial success is possible — valid keys are ingested, invalid
    /// ones are reported (`spec.md` §4.2, §7 "Ingest payload error").
    pub async fn ingest(&self, payload: &HashMap<String, Value>) -> (usize, Vec<String>) {
        let mut errors = Vec::new();
        let mut count = 0usize;

        for (key, data) in payload {
            let Value::Object(obj) = data else {
                errors.push(format!("{key}: value must be a JSON object"));
                continue;
            };

            let missing: Vec<&str> = REQUIRED_FIELDS
                .iter()
                .filter(|f| !obj.contains_key(**f))
                .copied()
                .collect();
            if !missing.is_empty() {
                errors.push(format!("{key}: missing required fields {missing:?}"));
                continue;
            }

            let Some(timestamp) = obj.get("timestamp").and_then(Value::as_str) else {
                errors.push(format!("{key}: timestamp must be a string"));
                continue;
            };
            let Some(source) = obj.get("source").and_then(Value::as_str) else {
                errors.push(format!("{key}: source must be a string"));
                continue;
            };

            let fact = Fact {
                value: obj.get("value").cloned().unwrap_or(Value::Null),
                unit: obj
                    .get("unit")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                timestamp: timestamp.to_string(),
                source: source.to_string(),
                stale_after_seconds: obj
                    .get("stale_after_seconds")
                    .and_then(Value::as_i64)
                    .unwrap_or(DEFAULT_STALE_AFTER_SECONDS),
                confidence: obj.get("confidence").and_then(Value::as_f64),
                ingested_at: now_unix(),
            };

            self.facts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.clone(), fact);
            count += 1;
        }

        for err in &errors {
            warn!(error = %err, "facts: ingest error");
        }

        if count > 0 {
            info!(count, "facts: ingested fact(s)");
            self.persist().await;
        }

        (count, errors)
    }

    /// Returns a single fact enriched with staleness, or `None` if unknown.
    pub fn get(&self, key: &str) -> Option<FactView> {
        let fact = self
            .facts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()?;
        let age_seconds = age_seconds(&fact.timestamp);
        let is_stale = age_seconds > fact.stale_after_seconds;
        Some(FactView { fact, is_stale, age_seconds })
    }

    /// A snapshot of every fact, enriched with freshness, sorted by key.
    pub fn get_all(&self) -> Vec<(String, FactView)> {
        let keys: Vec<String> = {
            let facts = self.facts.lock().unwrap_or_else(|e| e.into_inner());
            facts.keys().cloned().collect()
        };
        let mut out: Vec<(String, FactView)> = keys
            .into_iter()
            .filter_map(|k| self.get(&k).map(|v| (k, v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Human-readable single-fact line (`spec.md` §4.2 `format_value`).
    pub fn format_value(&self, key: &str) -> Option<String> {
        let view = self.get(key)?;
        let val = value_display(&view.fact.value);
        let unit = if view.fact.unit.is_empty() {
            String::new()
        } else {
            format!(" {}", view.fact.unit)
        };
        let source = &view.fact.source;
        let age_str = format_age(view.age_seconds);
        let conf_str = view
            .fact
            .confidence
            .map(|c| format!(", {}% conf", (c * 100.0).round() as i64))
            .unwrap_or_default();
        let label = title_case(&key.replace('_', " "));

        Some(if view.is_stale {
            let ts_human = format_ts(&view.fact.timestamp);
            format!(
                "{label}: {val}{unit} ({source}, as of {ts_human} \u{2014} {age_str} ago{conf_str} \u{2014} may not be current)"
            )
        } else {
            format!("{label}: {val}{unit} ({source}, {age_str} ago{conf_str})")
        })
    }

    /// Compact multi-line summary (`!data` command, `spec.md` §4.2
    /// `format_snapshot`): one line per key, ascending, `[STALE]` tag
    /// appended when appropriate.
    pub fn format_snapshot(&self) -> String {
        let all = self.get_all();
        if all.is_empty() {
            return "No sensor data available.".to_string();
        }
        all.iter()
            .map(|(key, view)| {
                let val = value_display(&view.fact.value);
                let unit = if view.fact.unit.is_empty() {
                    String::new()
                } else {
                    format!(" {}", view.fact.unit)
                };
                let age_str = format_age(view.age_seconds);
                let stale_tag = if view.is_stale { " [STALE]" } else { "" };
                format!("{key}: {val}{unit} ({age_str} ago){stale_tag}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_facts(&self) -> bool {
        !self.facts.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Keys whose token set intersects the query's tokens
    /// (`spec.md` §4.7.3 tier 0): non-word → space, `_` → space.
    pub fn matching_keys(&self, query: &str) -> Vec<String> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let facts = self.facts.lock().unwrap_or_else(|e| e.into_inner());
        let mut matches: Vec<String> = facts
            .keys()
            .filter(|key| {
                let key_tokens = tokenize(&key.replace('_', " "));
                key_tokens.iter().any(|t| query_tokens.contains(t))
            })
            .cloned()
            .collect();
        matches.sort();
        matches
    }

    async fn persist(&self) {
        let snapshot = {
            let facts = self.facts.lock().unwrap_or_else(|e| e.into_inner());
            facts.clone()
        };
        if let Some(parent) = self.store_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&self.store_file, bytes).await {
                    warn!(error = %e, "facts: could not persist facts");
                }
            }
            Err(e) => warn!(error = %e, "facts: could not serialize facts"),
        }
    }

    /// Polls the feed file by mtime; ingests it when changed. Read
    /// errors are logged and leave the store unchanged (`spec.md`
    /// §4.2 `watch`/`_poll_feed`).
    pub async fn poll_feed(&self, feed_file: &Path, last_mtime: &mut Option<SystemTime>) {
        let metadata = match tokio::fs::metadata(feed_file).await {
            Ok(m) => m,
            Err(_) => return,
        };
        let mtime = match metadata.modified() {
            Ok(m) => m,
            Err(_) => return,
        };
        if last_mtime.map(|last| mtime <= last).unwrap_or(false) {
            return;
        }
        *last_mtime = Some(mtime);

        let bytes = match tokio::fs::read(feed_file).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "facts: feed poll error");
                return;
            }
        };
        let payload: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "facts: invalid JSON in feed file");
                return;
            }
        };
        let Value::Object(obj) = payload else {
            warn!("facts: sensor_feed.json root must be a JSON object");
            return;
        };
        let payload: HashMap<String, Value> = obj.into_iter().collect();
        let (count, _) = self.ingest(&payload).await;
        if count > 0 {
            info!(count, "facts: feed updated, fact(s) ingested");
        }
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn age_seconds(timestamp: &str) -> i64 {
    parse_timestamp(timestamp)
        .map(|dt| (Utc::now() - dt).num_seconds())
        .unwrap_or(0)
}

fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    let normalized = if let Some(stripped) = timestamp.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        timestamp.to_string()
    };
    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn format_age(age_seconds: i64) -> String {
    let s = age_seconds.max(0);
    if s < 60 {
        format!("{s} sec")
    } else if s < 3600 {
        format!("{} min", s / 60)
    } else if s < 86400 {
        format!("{} hr", s / 3600)
    } else {
        format!("{} day(s)", s / 86400)
    }
}

fn format_ts(timestamp: &str) -> String {
    parse_timestamp(timestamp)
        .map(|dt| dt.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn value_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase()
        .replace('_', " ")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_fresh() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(
            "temperature_f".to_string(),
            json!({
                "value": -4.2,
                "unit": "\u{b0}F",
                "timestamp": Utc::now().to_rfc3339(),
                "source": "weather-station",
                "stale_after_seconds": 3600,
            }),
        );
        map
    }

    async fn setup() -> (FactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FactStore::load(dir.path()).await;
        (store, dir)
    }

    #[tokio::test]
    async fn ingest_missing_field_is_reported_and_skipped() {
        let (store, _dir) = setup().await;
        let mut payload = HashMap::new();
        payload.insert("bad_key".to_string(), json!({"value": 1}));
        let (count, errors) = store.ingest(&payload).await;
        assert_eq!(count, 0);
        assert_eq!(errors.len(), 1);
        assert!(store.get("bad_key").is_none());
    }

    #[tokio::test]
    async fn fresh_fact_has_no_stale_caveat() {
        let (store, _dir) = setup().await;
        store.ingest(&payload_fresh()).await;
        let line = store.format_value("temperature_f").expect("should exist");
        assert!(line.contains("-4.2"));
        assert!(line.contains("weather-station"));
        assert!(!line.contains("may not be current"));
    }

    #[tokio::test]
    async fn stale_fact_carries_caveat() {
        let (store, _dir) = setup().await;
        let mut payload = HashMap::new();
        payload.insert(
            "temperature_f".to_string(),
            json!({
                "value": -4.2,
                "unit": "\u{b0}F",
                "timestamp": (Utc::now() - chrono::Duration::hours(48)).to_rfc3339(),
                "source": "weather-station",
                "stale_after_seconds": 3600,
            }),
        );
        store.ingest(&payload).await;
        let line = store.format_value("temperature_f").expect("should exist");
        assert!(line.contains("may not be current"));
    }

    #[tokio::test]
    async fn matching_keys_tokenizes_query_and_keys() {
        let (store, _dir) = setup().await;
        store.ingest(&payload_fresh()).await;
        let matches = store.matching_keys("what is the temperature right now");
        assert_eq!(matches, vec!["temperature_f".to_string()]);
        assert!(store.matching_keys("tell me about elk migration").is_empty());
    }

    #[tokio::test]
    async fn snapshot_lists_keys_sorted_with_stale_tag() {
        let (store, _dir) = setup().await;
        store.ingest(&payload_fresh()).await;
        let snapshot = store.format_snapshot();
        assert!(snapshot.contains("temperature_f"));
        assert!(!snapshot.contains("[STALE]"));
    }

    #[tokio::test]
    async fn persists_and_reloads_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = FactStore::load(dir.path()).await;
            store.ingest(&payload_fresh()).await;
        }
        let reloaded = FactStore::load(dir.path()).await;
        assert!(reloaded.has_facts());
    }
}
