use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::OracleError;

fn default_personality() -> String {
    "Helpful and concise community assistant.".to_string()
}
fn default_knowledge_folder() -> String {
    "~/del-fi/knowledge".to_string()
}
fn default_max_response_bytes() -> u32 {
    230
}
fn default_radio_connection() -> String {
    "serial".to_string()
}
fn default_radio_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_rate_limit_seconds() -> u64 {
    30
}
fn default_response_cache_ttl() -> u64 {
    300
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_timeout() -> u64 {
    120
}
fn default_num_ctx() -> u32 {
    2048
}
fn default_num_predict() -> u32 {
    128
}
fn default_auto_send_chunks() -> u32 {
    3
}
fn default_memory_ttl() -> u64 {
    3600
}
fn default_board_max_posts() -> u32 {
    50
}
fn default_board_post_ttl() -> u64 {
    86400
}
fn default_board_show_count() -> u32 {
    5
}
fn default_board_rate_limit() -> u32 {
    3
}
fn default_board_rate_window() -> u64 {
    3600
}
fn default_fact_watch_interval_seconds() -> u64 {
    30
}
fn default_sync_window_start() -> String {
    "02:00".to_string()
}
fn default_sync_window_end() -> String {
    "05:00".to_string()
}
fn default_max_cache_age() -> String {
    "7d".to_string()
}
fn default_max_cache_entries() -> u32 {
    500
}
fn default_announce_interval() -> u64 {
    14_400
}
fn default_directory_ttl() -> u64 {
    86_400
}

/// The `gossip` sub-block of `mesh_knowledge`.
#[derive(Clone, Debug, Deserialize)]
pub struct GossipConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_announce_interval")]
    pub announce_interval: u64,
    #[serde(default = "default_directory_ttl")]
    pub directory_ttl: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            announce_interval: default_announce_interval(),
            directory_ttl: default_directory_ttl(),
        }
    }
}

/// A single trusted peer entry.
#[derive(Clone, Debug, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub name: String,
}

/// The `sync` sub-block of `mesh_knowledge`.
#[derive(Clone, Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sync_window_start")]
    pub window_start: String,
    #[serde(default = "default_sync_window_end")]
    pub window_end: String,
    #[serde(default = "default_max_cache_age")]
    pub max_cache_age: String,
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_start: default_sync_window_start(),
            window_end: default_sync_window_end(),
            max_cache_age: default_max_cache_age(),
            max_cache_entries: default_max_cache_entries(),
        }
    }
}

/// Optional peer/gossip subsystem configuration. Absence disables
/// component 6 entirely (no-op per `spec.md` §4.6).
#[derive(Clone, Debug, Deserialize, Default)]
pub struct MeshKnowledgeConfig {
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub serve_to_peers: bool,
    #[serde(default = "default_true")]
    pub tag_responses: bool,
    #[serde(default = "default_true")]
    pub reject_contradictions: bool,
}

fn default_true() -> bool {
    true
}

/// Fully validated oracle configuration. Loading the raw file/env
/// layers is an external concern (out of scope per `spec.md` §1);
/// this struct is what the rest of the crate consumes.
#[derive(Clone, Debug, Deserialize)]
pub struct OracleConfig {
    pub node_name: String,
    pub model: String,
    #[serde(default = "default_personality")]
    pub personality: String,
    #[serde(default = "default_knowledge_folder")]
    pub knowledge_folder: String,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u32,
    #[serde(default = "default_radio_connection")]
    pub radio_connection: String,
    #[serde(default = "default_radio_port")]
    pub radio_port: String,
    #[serde(default = "default_rate_limit_seconds")]
    pub rate_limit_seconds: u64,
    #[serde(default = "default_response_cache_ttl")]
    pub response_cache_ttl: u64,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_ollama_host")]
    pub ollama_host: String,
    #[serde(default = "default_ollama_timeout")]
    pub ollama_timeout: u64,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
    #[serde(default = "default_true")]
    pub persistent_cache: bool,
    #[serde(default = "default_true")]
    pub busy_notice: bool,
    #[serde(default = "default_auto_send_chunks")]
    pub auto_send_chunks: u32,
    #[serde(default)]
    pub memory_max_turns: u32,
    #[serde(default = "default_memory_ttl")]
    pub memory_ttl: u64,
    #[serde(default)]
    pub persistent_memory: bool,
    #[serde(default)]
    pub board_enabled: bool,
    #[serde(default = "default_board_max_posts")]
    pub board_max_posts: u32,
    #[serde(default = "default_board_post_ttl")]
    pub board_post_ttl: u64,
    #[serde(default = "default_board_show_count")]
    pub board_show_count: u32,
    #[serde(default = "default_board_rate_limit")]
    pub board_rate_limit: u32,
    #[serde(default = "default_board_rate_window")]
    pub board_rate_window: u64,
    #[serde(default)]
    pub board_persist: bool,
    #[serde(default)]
    pub board_blocked_patterns: Vec<String>,
    #[serde(default)]
    pub fact_feed_file: String,
    #[serde(default = "default_fact_watch_interval_seconds")]
    pub fact_watch_interval_seconds: u64,
    #[serde(default)]
    pub fact_query_keywords: Vec<String>,
    pub mesh_knowledge: Option<MeshKnowledgeConfig>,

    /// Embedded-SurrealDB connection string, e.g. `rocksdb://<dir>/vectorstore`.
    #[serde(default = "default_surrealdb_address")]
    pub surrealdb_address: String,
}

fn default_surrealdb_address() -> String {
    "mem://".to_string()
}

const VALID_RADIO_CONNECTIONS: [&str; 3] = ["serial", "tcp", "ble"];
const VALID_LOG_LEVELS: [&str; 4] = ["debug", "info", "warning", "error"];

impl OracleConfig {
    /// Validates the fully-merged configuration. This is the one
    /// legitimate crash path (`spec.md` §7): the caller is expected to
    /// print the error and exit on failure.
    pub fn validate(&self) -> Result<(), OracleError> {
        if self.node_name.trim().is_empty() {
            return Err(OracleError::Config("node_name is required".into()));
        }
        if self.model.trim().is_empty() {
            return Err(OracleError::Config("model is required".into()));
        }
        if !VALID_RADIO_CONNECTIONS.contains(&self.radio_connection.as_str()) {
            return Err(OracleError::Config(format!(
                "radio_connection must be one of {VALID_RADIO_CONNECTIONS:?}, got {:?}",
                self.radio_connection
            )));
        }
        if self.max_response_bytes < 50 {
            return Err(OracleError::Config(
                "max_response_bytes must be >= 50".into(),
            ));
        }
        if self.ollama_timeout == 0 {
            return Err(OracleError::Config(
                "ollama_timeout must be a positive number".into(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(OracleError::Config(format!(
                "log_level must be one of {VALID_LOG_LEVELS:?}, got {:?}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Expands `~` in `knowledge_folder` and returns the directory it
    /// resolves to.
    pub fn knowledge_folder_path(&self) -> PathBuf {
        expand_tilde(&self.knowledge_folder)
    }

    fn base_dir(&self) -> PathBuf {
        self.knowledge_folder_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn vectorstore_dir(&self) -> PathBuf {
        self.base_dir().join("vectorstore")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir().join("cache")
    }

    pub fn gossip_dir(&self) -> PathBuf {
        self.base_dir().join("gossip")
    }

    pub fn seen_senders_file(&self) -> PathBuf {
        self.cache_dir().join("seen_senders.txt")
    }

    pub fn fact_feed_path(&self) -> PathBuf {
        if self.fact_feed_file.is_empty() {
            self.cache_dir().join("sensor_feed.json")
        } else {
            expand_tilde(&self.fact_feed_file)
        }
    }
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Assembles configuration from `config.yaml` (if present) layered
/// with environment variables, following the same `config`-crate
/// source order the rest of the workspace uses. Loading itself is out
/// of scope for correctness per `spec.md` §1; only the resulting
/// struct's validity is this crate's concern.
pub fn load_config(path: Option<&str>) -> Result<OracleConfig, OracleError> {
    let mut builder = Config::builder();
    builder = builder.add_source(File::with_name(path.unwrap_or("config")).required(false));
    builder = builder.add_source(Environment::default().separator("__"));
    let config = builder
        .build()
        .map_err(|e| OracleError::Config(e.to_string()))?;
    let cfg: OracleConfig = config
        .try_deserialize()
        .map_err(|e| OracleError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> OracleConfig {
        OracleConfig {
            node_name: "outpost".into(),
            model: "llama3".into(),
            personality: default_personality(),
            knowledge_folder: "~/del-fi/knowledge".into(),
            max_response_bytes: default_max_response_bytes(),
            radio_connection: default_radio_connection(),
            radio_port: default_radio_port(),
            rate_limit_seconds: default_rate_limit_seconds(),
            response_cache_ttl: default_response_cache_ttl(),
            embedding_model: default_embedding_model(),
            channels: vec![],
            log_level: default_log_level(),
            ollama_host: default_ollama_host(),
            ollama_timeout: default_ollama_timeout(),
            num_ctx: default_num_ctx(),
            num_predict: default_num_predict(),
            persistent_cache: true,
            busy_notice: true,
            auto_send_chunks: default_auto_send_chunks(),
            memory_max_turns: 0,
            memory_ttl: default_memory_ttl(),
            persistent_memory: false,
            board_enabled: false,
            board_max_posts: default_board_max_posts(),
            board_post_ttl: default_board_post_ttl(),
            board_show_count: default_board_show_count(),
            board_rate_limit: default_board_rate_limit(),
            board_rate_window: default_board_rate_window(),
            board_persist: false,
            board_blocked_patterns: vec![],
            fact_feed_file: String::new(),
            fact_watch_interval_seconds: default_fact_watch_interval_seconds(),
            fact_query_keywords: vec![],
            mesh_knowledge: None,
            surrealdb_address: default_surrealdb_address(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn missing_node_name_fails() {
        let mut cfg = minimal();
        cfg.node_name = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_radio_connection_fails() {
        let mut cfg = minimal();
        cfg.radio_connection = "wifi".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn undersized_response_budget_fails() {
        let mut cfg = minimal();
        cfg.max_response_bytes = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_log_level_fails() {
        let mut cfg = minimal();
        cfg.log_level = "verbose".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn derived_paths_share_base_dir() {
        let mut cfg = minimal();
        cfg.knowledge_folder = "/opt/del-fi/knowledge".into();
        assert_eq!(
            cfg.vectorstore_dir(),
            PathBuf::from("/opt/del-fi/vectorstore")
        );
        assert_eq!(cfg.cache_dir(), PathBuf::from("/opt/del-fi/cache"));
    }
}
