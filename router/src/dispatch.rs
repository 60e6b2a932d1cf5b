//! Router + Dispatcher: classification, commands, and the query
//! pipeline (`spec.md` §4.7).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_openai::config::OpenAIConfig;
use async_openai::Client as OpenAiClient;
use common::error::OracleError;
use common::formatter::format_response;
use common::storage::chunk::count as doc_count;
use common::storage::db::SurrealDbClient;
use peer_service::{check_peer_cache, store_peer_answer, GossipDirectory};
use retrieval_pipeline::{generate, retrieve, GenerationContext};
use tracing::warn;

use crate::board::Board;
use crate::facts::FactStore;
use crate::memory::{is_greeting, ConversationMemory};

const MORE_BUFFER_TTL_SECONDS: i64 = 600;
const DEFAULT_AUTO_SEND_CHUNKS: usize = 3;

const REFUSAL_MESSAGE: &str =
    "I don't have anything in my knowledge base about that. Try !topics to see what I know.";
const WARMING_UP_MESSAGE: &str = "I'm still warming up, try again in a minute.";
const TROUBLE_THINKING_MESSAGE: &str = "I'm having trouble thinking right now. Try again in a minute.";

/// What kind of handling an inbound message gets (`spec.md` §4.7.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Empty,
    Command,
    Gossip,
    Query,
}

/// Classifies inbound text. `gossip_enabled` mirrors whether
/// `mesh_knowledge` is configured.
pub fn classify(text: &str, gossip_enabled: bool) -> MessageKind {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        MessageKind::Empty
    } else if trimmed.starts_with('!') {
        MessageKind::Command
    } else if gossip_enabled && trimmed.starts_with("DEL-FI:") {
        MessageKind::Gossip
    } else {
        MessageKind::Query
    }
}

/// Next-chunk cursor for a sender's truncated response
/// (`spec.md` §3 "MoreBuffer", §4.7.4).
#[derive(Clone, Debug)]
struct MoreBuffer {
    chunks: Vec<String>,
    cursor: usize,
    created_at: Instant,
}

impl MoreBuffer {
    fn expired(&self) -> bool {
        self.created_at.elapsed().as_secs() as i64 > MORE_BUFFER_TTL_SECONDS
    }

    fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Advances the cursor and returns the next chunk, or `None` if
    /// exhausted. `index` is 1-based when `Some`, selecting `!more N`.
    fn next_chunk(&mut self, index: Option<usize>) -> Result<Option<String>, ()> {
        if let Some(n) = index {
            if n == 0 || n > self.chunks.len() {
                return Err(());
            }
            self.cursor = n;
        } else {
            if self.cursor >= self.chunks.len() {
                return Ok(None);
            }
            self.cursor += 1;
        }
        Ok(self.chunks.get(self.cursor - 1).cloned())
    }
}

#[derive(Clone, Debug)]
struct CachedResponse {
    text: String,
    ts: Instant,
}

/// Configuration the dispatcher needs beyond its component
/// dependencies (`spec.md` §6).
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub node_name: String,
    pub model: String,
    pub personality: String,
    pub embedding_model: String,
    pub num_ctx: u32,
    pub num_predict: u32,
    pub max_response_bytes: usize,
    pub response_cache_ttl_seconds: i64,
    pub busy_notice: bool,
    pub auto_send_chunks: usize,
    pub fact_query_keywords: Vec<String>,
    pub top_k: usize,
    pub peer_cache_ttl_seconds: u64,
    pub trusted_peer_ids: Vec<String>,
    pub max_peer_cache_entries: usize,
    pub cache_dir: PathBuf,
}

/// The Router + Dispatcher (`spec.md` §4.7): owns every in-memory
/// collection the concurrency model requires to be mutex-guarded
/// (more_buffers, response_cache, seen_senders, pending_senders).
pub struct Router {
    config: RouterConfig,
    db: Arc<SurrealDbClient>,
    openai: OpenAiClient<OpenAIConfig>,
    facts: FactStore,
    memory: Option<ConversationMemory>,
    board: Option<Board>,
    gossip: Option<GossipDirectory>,
    more_buffers: Mutex<HashMap<String, MoreBuffer>>,
    response_cache: Mutex<HashMap<String, CachedResponse>>,
    last_query: Mutex<HashMap<String, String>>,
    seen_senders: Mutex<HashSet<String>>,
    pending_senders: Mutex<HashSet<String>>,
    worker_busy: AtomicBool,
    llm_available: AtomicBool,
    query_count: AtomicU64,
    started_at: Instant,
}

impl Router {
    /// Builds a router, loading `seen_senders.txt` from `cache_dir`.
    pub async fn new(
        config: RouterConfig,
        db: Arc<SurrealDbClient>,
        openai: OpenAiClient<OpenAIConfig>,
        facts: FactStore,
        memory: Option<ConversationMemory>,
        board: Option<Board>,
        gossip: Option<GossipDirectory>,
    ) -> Self {
        let seen_senders = load_seen_senders(&config.cache_dir).await;
        Self {
            config,
            db,
            openai,
            facts,
            memory,
            board,
            gossip,
            more_buffers: Mutex::new(HashMap::new()),
            response_cache: Mutex::new(HashMap::new()),
            last_query: Mutex::new(HashMap::new()),
            seen_senders: Mutex::new(seen_senders),
            pending_senders: Mutex::new(HashSet::new()),
            worker_busy: AtomicBool::new(false),
            llm_available: AtomicBool::new(true),
            query_count: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// The fact store, for the fact feed watcher background task
    /// (`spec.md` §4.2 `watch`, §5).
    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn set_llm_available(&self, available: bool) {
        self.llm_available.store(available, Ordering::Relaxed);
    }

    pub fn llm_available(&self) -> bool {
        self.llm_available.load(Ordering::Relaxed)
    }

    pub fn set_worker_busy(&self, busy: bool) {
        self.worker_busy.store(busy, Ordering::Relaxed);
    }

    /// Truncates `text` to `max_response_bytes` at the best sentence
    /// boundary available (`spec.md` §4.7.2 `_enforce_limit`).
    fn enforce_limit(&self, text: &str) -> String {
        let (first, _all, _truncated) =
            format_response(text, self.config.max_response_bytes, None);
        first
    }

    /// Handles a `!`-prefixed command (`spec.md` §4.7.2). Returns the
    /// single reply, already byte-limited.
    pub async fn handle_command(&self, sender: &str, text: &str) -> String {
        let trimmed = text.trim();
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("").to_lowercase();
        let rest = parts.next().unwrap_or("").trim();

        let reply = match command.as_str() {
            "!help" => self.help_text().await,
            "!status" => self.status_text().await,
            "!topics" => self.topics_text().await,
            "!ping" => format!("pong from {}", self.config.node_name),
            "!peers" => self.peers_text(),
            "!more" => self.handle_more(sender, rest),
            "!retry" => self.handle_retry(sender).await,
            "!forget" => self.handle_forget(sender).await,
            "!board" => self.handle_board(rest),
            "!post" => self.handle_post(sender, rest).await,
            "!unpost" => self.handle_unpost(sender).await,
            "!data" => self.facts.format_snapshot(),
            other => format!("Unknown command: {other}. Try !help"),
        };

        self.enforce_limit(&reply)
    }

    async fn help_text(&self) -> String {
        let docs = doc_count(&self.db).await.unwrap_or(0);
        format!(
            "{} \u{2014} {docs} docs indexed. Ask me a question, or use: \
             !help !status !topics !ping !peers !more !retry !forget !board !post !unpost !data",
            self.config.node_name
        )
    }

    async fn status_text(&self) -> String {
        let docs = doc_count(&self.db).await.unwrap_or(0);
        let uptime = format_uptime(self.started_at.elapsed().as_secs());
        let queries = self.query_count.load(Ordering::Relaxed);
        let llm_check = if self.llm_available() { "\u{2713}" } else { "\u{2717}" };
        let rag_check = if docs > 0 { "\u{2713}" } else { "\u{2717}" };
        format!(
            "{} up {uptime} | model={} | docs={docs} | queries={queries} | LLM {llm_check} RAG {rag_check}",
            self.config.node_name, self.config.model
        )
    }

    async fn topics_text(&self) -> String {
        match common::storage::chunk::all_filepaths(&self.db).await {
            Ok(paths) => {
                let mut topics: Vec<String> = paths
                    .iter()
                    .filter_map(|p| {
                        std::path::Path::new(p)
                            .file_stem()
                            .map(|s| s.to_string_lossy().replace(['_', '.'], "-"))
                    })
                    .collect();
                topics.sort();
                topics.dedup();
                if topics.is_empty() {
                    "No topics indexed yet.".to_string()
                } else {
                    topics.join(", ")
                }
            }
            Err(e) => {
                warn!(error = %e, "router: could not load topics");
                "No topics indexed yet.".to_string()
            }
        }
    }

    fn peers_text(&self) -> String {
        let Some(gossip) = &self.gossip else {
            return "Peering is not enabled on this node.".to_string();
        };
        let nearby = gossip.nearby_peers(&self.config.trusted_peer_ids);
        if nearby.is_empty() {
            "No peers known.".to_string()
        } else {
            nearby
                .iter()
                .map(|(name, topics)| {
                    if topics.is_empty() {
                        name.clone()
                    } else {
                        format!("{name} ({})", topics.join(","))
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        }
    }

    fn handle_more(&self, sender: &str, arg: &str) -> String {
        let index: Option<usize> = if arg.is_empty() {
            None
        } else {
            match arg.parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => return "Usage: !more [N]".to_string(),
            }
        };

        let mut buffers = self.more_buffers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(buffer) = buffers.get_mut(sender) else {
            return "No more chunks. Ask me something first.".to_string();
        };
        if buffer.expired() {
            buffers.remove(sender);
            return "No more chunks. Ask me something first.".to_string();
        }

        match buffer.next_chunk(index) {
            Err(()) => format!("Invalid chunk number. Use 1-{}.", buffer.total_chunks()),
            Ok(None) => "End of response. No more chunks.".to_string(),
            Ok(Some(chunk)) => {
                if buffer.cursor < buffer.chunks.len() {
                    format!("{chunk}{}", common::formatter::MORE_TAG)
                } else {
                    chunk
                }
            }
        }
    }

    async fn handle_retry(&self, sender: &str) -> String {
        let last = {
            let last_query = self.last_query.lock().unwrap_or_else(|e| e.into_inner());
            last_query.get(sender).cloned()
        };
        let Some(query) = last else {
            return "No previous query to retry.".to_string();
        };
        {
            let mut cache = self.response_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.remove(&query.to_lowercase());
        }
        self.handle_query(sender, &query).await
    }

    async fn handle_forget(&self, sender: &str) -> String {
        if let Some(memory) = &self.memory {
            memory.clear(sender).await;
            "Conversation history cleared.".to_string()
        } else {
            "Conversation memory is not enabled on this node.".to_string()
        }
    }

    fn handle_board(&self, query: &str) -> String {
        let Some(board) = &self.board else {
            return "The board is not enabled on this node.".to_string();
        };
        board.read(if query.is_empty() { None } else { Some(query) })
    }

    async fn handle_post(&self, sender: &str, message: &str) -> String {
        let Some(board) = &self.board else {
            return "The board is not enabled on this node.".to_string();
        };
        if message.is_empty() {
            return "Usage: !post <message>".to_string();
        }
        match board.post(sender, message).await {
            Ok(count) => format!("Posted to board ({count} messages total)."),
            Err(crate::board::PostRejection::Empty) => "Usage: !post <message>".to_string(),
            Err(crate::board::PostRejection::RateLimited) => {
                format!(
                    "Slow down \u{2014} max {} posts per {} min.",
                    board.rate_limit(),
                    board.rate_window_seconds() / 60
                )
            }
            Err(crate::board::PostRejection::TooLong) => {
                format!(
                    "Post too long ({} chars). Keep it under {}.",
                    message.chars().count(),
                    crate::board::MAX_POST_LENGTH
                )
            }
            Err(crate::board::PostRejection::Blocked) => {
                "Post rejected by content filter.".to_string()
            }
        }
    }

    async fn handle_unpost(&self, sender: &str) -> String {
        let Some(board) = &self.board else {
            return "The board is not enabled on this node.".to_string();
        };
        let removed = board.unpost(sender).await;
        if removed > 0 {
            format!("Removed {removed} of your posts from the board.")
        } else {
            "You have no posts on the board.".to_string()
        }
    }

    /// Runs the slow-path query pipeline (`spec.md` §4.7.3) and
    /// finalizes the first chunk; remaining chunks are held in the
    /// sender's `MoreBuffer` for `!more` (`spec.md` §4.7.4). The
    /// dispatcher hands this to the worker, separately from
    /// command/gossip handling, so a query in flight never blocks
    /// those fast paths (`spec.md` §5).
    pub async fn handle_query(&self, sender: &str, text: &str) -> String {
        let chunks = self.query_pipeline(sender, text).await;
        chunks.into_iter().next().unwrap_or_default()
    }

    /// Whether this node has gossip/peering configured, i.e. whether
    /// inbound `DEL-FI:` text should classify as gossip rather than a
    /// query (`spec.md` §4.7.1).
    pub fn has_gossip(&self) -> bool {
        self.gossip.is_some()
    }

    /// `classify` bound to this router's gossip configuration, for the
    /// dispatcher loop to decide fast-path-inline vs enqueue-to-worker
    /// (`spec.md` §4.7.1, §5).
    pub fn classify(&self, text: &str) -> MessageKind {
        classify(text, self.has_gossip())
    }

    /// Handles an inbound gossip announcement inline on the dispatcher
    /// thread (`spec.md` §4.6); a no-op when gossip isn't configured.
    pub async fn handle_gossip(&self, sender: &str, text: &str) {
        if let Some(gossip) = &self.gossip {
            gossip.handle_announcement(sender, text).await;
        }
    }

    /// Records a busy ack for `sender` if the worker is busy, this is
    /// their first outstanding query, and busy notices are enabled
    /// (`spec.md` §4.7.6). Must be called before the query is
    /// enqueued so the ack is emitted first.
    pub fn maybe_busy_notice(&self, sender: &str, queue_size: usize) -> Option<String> {
        if !self.config.busy_notice || !self.worker_busy.load(Ordering::Relaxed) {
            return None;
        }
        let mut pending = self.pending_senders.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains(sender) {
            return None;
        }
        pending.insert(sender.to_string());
        let position = queue_size + 1;
        Some(if position <= 1 {
            format!("{}: Working on another question, yours is next.", self.config.node_name)
        } else {
            format!(
                "{}: {position} questions ahead of yours, hang tight.",
                self.config.node_name
            )
        })
    }

    /// Clears `sender` from `pending_senders` once their query
    /// completes, allowing a fresh busy ack for their next query.
    pub fn clear_pending(&self, sender: &str) {
        let mut pending = self.pending_senders.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(sender);
    }

    async fn query_pipeline(&self, sender: &str, text: &str) -> Vec<String> {
        {
            let mut last_query = self.last_query.lock().unwrap_or_else(|e| e.into_inner());
            last_query.insert(sender.to_string(), text.to_string());
        }
        self.query_count.fetch_add(1, Ordering::Relaxed);

        if is_greeting(text) && self.mark_seen_if_new(sender).await {
            return vec![self.finalize(sender, &welcome_text(&self.config.node_name), None).await];
        }

        if let Some(facts_reply) = self.tier0_facts(text) {
            return vec![self.finalize(sender, &facts_reply, None).await];
        }

        let normalized = text.trim().to_lowercase();
        if let Some(cached) = self.cached_response(&normalized) {
            return vec![self.finalize(sender, &cached, None).await];
        }

        if !self.llm_available() {
            return vec![self.finalize(sender, WARMING_UP_MESSAGE, None).await];
        }

        let history = self.memory.as_ref().and_then(|m| m.format_for_prompt(sender));
        let board_context = self.board.as_ref().and_then(Board::format_for_context);

        let local_chunks = match retrieve(
            text,
            self.config.top_k,
            &self.openai,
            &self.config.embedding_model,
            &self.db,
        )
        .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "router: retrieval failed");
                Vec::new()
            }
        };

        let (answer, had_context, provenance) = if !local_chunks.is_empty() {
            let ctx = GenerationContext {
                local_chunks: &local_chunks,
                peer_context: None,
                history: history.as_deref(),
                board_context: board_context.as_deref(),
            };
            let answer = self.generate(text, &ctx).await;
            (answer, true, None)
        } else if let Some(hit) = self.peer_cache_lookup(text).await {
            let ctx = GenerationContext {
                local_chunks: &[],
                peer_context: Some(hit.response.as_str()),
                history: history.as_deref(),
                board_context: board_context.as_deref(),
            };
            let answer = self.generate(text, &ctx).await;
            (answer, true, Some(hit.peer_name))
        } else if let Some(referral) = self.gossip.as_ref().and_then(|g| g.find_referral(text)) {
            return vec![self.finalize(sender, &referral, None).await];
        } else {
            return vec![self.finalize(sender, REFUSAL_MESSAGE, None).await];
        };

        let Some(answer) = answer else {
            return vec![self.finalize(sender, TROUBLE_THINKING_MESSAGE, None).await];
        };

        if had_context {
            self.cache_response(&normalized, &answer).await;
        }
        if let Some(memory) = &self.memory {
            memory.add_turn(sender, text, &answer).await;
        }

        vec![self.finalize(sender, &answer, provenance.as_deref()).await]
    }

    async fn generate(&self, query: &str, ctx: &GenerationContext<'_>) -> Option<String> {
        generate(
            &self.openai,
            &self.config.model,
            &self.config.node_name,
            &self.config.personality,
            self.config.max_response_bytes,
            query,
            ctx,
            self.config.num_ctx,
            self.config.num_predict,
        )
        .await
    }

    /// Tier 0: fact-store lookups that bypass the LLM entirely
    /// (`spec.md` §4.7.3 step 4, scenarios S3/S4).
    fn tier0_facts(&self, text: &str) -> Option<String> {
        if !self.facts.has_facts() {
            return None;
        }
        let lowered = text.to_lowercase();
        if !self.config.fact_query_keywords.is_empty()
            && !self.config.fact_query_keywords.iter().any(|kw| lowered.contains(kw.as_str()))
        {
            return None;
        }
        let matches = self.facts.matching_keys(text);
        if matches.is_empty() {
            return None;
        }
        let formatted: Vec<String> = matches
            .iter()
            .filter_map(|k| self.facts.format_value(k))
            .collect();
        if formatted.is_empty() {
            return None;
        }
        Some(format!("{}: {}", self.config.node_name, formatted.join(" | ")))
    }

    fn cached_response(&self, normalized_query: &str) -> Option<String> {
        let cache = self.response_cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(normalized_query)?;
        if entry.ts.elapsed().as_secs() as i64 <= self.config.response_cache_ttl_seconds {
            Some(entry.text.clone())
        } else {
            None
        }
    }

    async fn cache_response(&self, normalized_query: &str, text: &str) {
        let mut cache = self.response_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            normalized_query.to_string(),
            CachedResponse {
                text: text.to_string(),
                ts: Instant::now(),
            },
        );
    }

    async fn peer_cache_lookup(&self, query: &str) -> Option<peer_service::peer_cache::PeerCacheHit> {
        match check_peer_cache(query, &self.db).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, "router: peer cache lookup failed");
                None
            }
        }
    }

    /// Records a peer's cached answer, honoring the trusted-peer gate
    /// (`spec.md` §4.6).
    pub async fn record_peer_answer(
        &self,
        peer_id: &str,
        peer_name: &str,
        query: &str,
        response: &str,
    ) -> Result<(), OracleError> {
        store_peer_answer(
            peer_id,
            peer_name,
            query,
            response,
            self.config.peer_cache_ttl_seconds,
            &self.config.trusted_peer_ids,
            self.config.max_peer_cache_entries,
            &self.db,
        )
        .await
    }

    /// `_finalize` (`spec.md` §4.7.4): formats, appends a first-time
    /// footer when it still fits, marks the sender seen, and stores a
    /// MoreBuffer when the response was truncated.
    async fn finalize(&self, sender: &str, text: &str, provenance: Option<&str>) -> String {
        let (mut first, all, truncated) =
            format_response(text, self.config.max_response_bytes, provenance);

        if self.mark_seen_if_new(sender).await {
            let docs = doc_count(&self.db).await.unwrap_or(0);
            let footer = format!("\n---\nDel-Fi oracle \u{b7} {docs} docs \u{b7} !help !topics");
            let candidate = format!("{first}{footer}");
            if common::formatter::byte_len(&candidate) <= self.config.max_response_bytes {
                first = candidate;
            }
        }

        if truncated {
            let mut buffers = self.more_buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers.insert(
                sender.to_string(),
                MoreBuffer {
                    chunks: all,
                    cursor: 1,
                    created_at: Instant::now(),
                },
            );
        }

        self.clear_pending(sender);
        first
    }

    /// Returns `true` and persists the sender as seen only the first
    /// time it's called for that sender (`spec.md` §8 invariant 10).
    async fn mark_seen_if_new(&self, sender: &str) -> bool {
        let is_new = {
            let mut seen = self.seen_senders.lock().unwrap_or_else(|e| e.into_inner());
            seen.insert(sender.to_string())
        };
        if is_new {
            self.persist_seen_senders().await;
        }
        is_new
    }

    async fn persist_seen_senders(&self) {
        let snapshot: Vec<String> = {
            let seen = self.seen_senders.lock().unwrap_or_else(|e| e.into_inner());
            let mut v: Vec<String> = seen.iter().cloned().collect();
            v.sort();
            v
        };
        let path = self.config.cache_dir.join("seen_senders.txt");
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&path, snapshot.join("\n")).await {
            warn!(error = %e, "router: could not persist seen senders");
        }
    }

    /// `auto_send_chunks`: splits a finalized multi-chunk response
    /// into at most `auto_send_chunks` outbound messages, stripping
    /// the `[!more]` sentinel from every intermediate message and
    /// retaining it only on the final slot when chunks remain beyond
    /// the window (`spec.md` §4.7.5).
    pub fn auto_send(&self, sender: &str, first_message: String) -> Vec<String> {
        if self.config.auto_send_chunks <= 1 {
            return vec![first_message];
        }
        let mut messages = vec![strip_more_tag(&first_message)];
        let mut more_remaining = first_message.ends_with(common::formatter::MORE_TAG);

        while messages.len() < self.config.auto_send_chunks && more_remaining {
            let next = self.handle_more(sender, "");
            more_remaining = next.ends_with(common::formatter::MORE_TAG);
            let is_last_slot = messages.len() + 1 == self.config.auto_send_chunks;
            if is_last_slot && more_remaining {
                messages.push(next);
            } else {
                messages.push(strip_more_tag(&next));
            }
        }
        messages
    }

    /// `busy_message(position)`, split out for direct testing
    /// (`original_source/tests/test_router.py`).
    pub fn busy_message(&self, position: usize) -> String {
        if position <= 1 {
            format!("{}: Working on another question, yours is next.", self.config.node_name)
        } else {
            format!(
                "{}: {position} questions ahead of yours, hang tight.",
                self.config.node_name
            )
        }
    }
}

fn strip_more_tag(text: &str) -> String {
    text.strip_suffix(common::formatter::MORE_TAG).unwrap_or(text).to_string()
}

fn welcome_text(node_name: &str) -> String {
    format!("Hi from {node_name}. I answer questions using local docs.\nTry asking something, or send !help \u{b7} !topics")
}

fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

async fn load_seen_senders(cache_dir: &std::path::Path) -> HashSet<String> {
    let path = cache_dir.join("seen_senders.txt");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents.lines().map(str::to_string).filter(|l| !l.is_empty()).collect(),
        Err(_) => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::config::OpenAIConfig;
    use uuid::Uuid;

    fn fake_openai() -> OpenAiClient<OpenAIConfig> {
        let config = OpenAIConfig::new()
            .with_api_base("http://127.0.0.1:0")
            .with_api_key("unused");
        OpenAiClient::with_config(config)
    }

    async fn setup_router(cache_dir: &std::path::Path) -> Router {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        db.ensure_indexes(3).await.expect("indexes");
        let facts = FactStore::load(cache_dir).await;
        let memory = Some(ConversationMemory::load(cache_dir, 10).await);
        let board = Some(Board::load(cache_dir, crate::board::BoardConfig::default()).await);
        let config = RouterConfig {
            node_name: "OUTPOST".to_string(),
            model: "llama3".to_string(),
            personality: "Be concise.".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            num_ctx: 4096,
            num_predict: 256,
            max_response_bytes: 200,
            response_cache_ttl_seconds: 600,
            busy_notice: true,
            auto_send_chunks: 3,
            fact_query_keywords: vec![],
            top_k: 4,
            peer_cache_ttl_seconds: 604_800,
            trusted_peer_ids: vec![],
            max_peer_cache_entries: 500,
            cache_dir: cache_dir.to_path_buf(),
        };
        Router::new(config, db, fake_openai(), facts, memory, board, None).await
    }

    #[test]
    fn classify_distinguishes_message_kinds() {
        assert_eq!(classify("", true), MessageKind::Empty);
        assert_eq!(classify("   ", true), MessageKind::Empty);
        assert_eq!(classify("!help", true), MessageKind::Command);
        assert_eq!(classify("DEL-FI:1:ANNOUNCE:X", true), MessageKind::Gossip);
        assert_eq!(classify("DEL-FI:1:ANNOUNCE:X", false), MessageKind::Query);
        assert_eq!(classify("what's the weather", true), MessageKind::Query);
    }

    #[tokio::test]
    async fn ping_command_replies_with_node_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        let reply = router.handle_command("alice", "!ping").await;
        assert_eq!(reply, "pong from OUTPOST");
    }

    #[tokio::test]
    async fn unknown_command_points_to_help() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        let reply = router.handle_command("alice", "!frobnicate").await;
        assert!(reply.contains("Unknown command"));
        assert!(reply.contains("!help"));
    }

    #[tokio::test]
    async fn more_without_prior_response_is_a_friendly_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        let reply = router.handle_command("alice", "!more").await;
        assert!(reply.contains("No more chunks"));
    }

    #[tokio::test]
    async fn more_buffer_cursor_is_monotonic_until_exhausted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        {
            let mut buffers = router.more_buffers.lock().expect("lock");
            buffers.insert(
                "alice".to_string(),
                MoreBuffer {
                    chunks: vec!["A".to_string(), "B".to_string(), "C".to_string()],
                    cursor: 1,
                    created_at: Instant::now(),
                },
            );
        }
        assert_eq!(router.handle_more("alice", ""), format!("B{}", common::formatter::MORE_TAG));
        assert_eq!(router.handle_more("alice", ""), "C");
        assert_eq!(router.handle_more("alice", ""), "End of response. No more chunks.");
    }

    #[tokio::test]
    async fn more_n_out_of_range_is_rejected_without_mutating_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        {
            let mut buffers = router.more_buffers.lock().expect("lock");
            buffers.insert(
                "alice".to_string(),
                MoreBuffer {
                    chunks: vec!["A".to_string(), "B".to_string()],
                    cursor: 1,
                    created_at: Instant::now(),
                },
            );
        }
        let reply = router.handle_more("alice", "99");
        assert!(reply.contains("Invalid chunk number"));
        let buffers = router.more_buffers.lock().expect("lock");
        assert_eq!(buffers.get("alice").expect("buffer").cursor, 1);
    }

    #[tokio::test]
    async fn tier0_fact_is_answered_without_llm_and_not_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        let mut payload = HashMap::new();
        payload.insert(
            "temperature_f".to_string(),
            serde_json::json!({
                "value": -4.2,
                "unit": "\u{b0}F",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "source": "weather-station",
                "stale_after_seconds": 3600,
            }),
        );
        router.facts.ingest(&payload).await;

        let messages = router
            .query_pipeline("bob", "what is the temperature right now")
            .await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("-4.2"));
        assert!(messages[0].contains("weather-station"));
        assert!(!messages[0].contains("may not be current"));
        assert!(router.cached_response("what is the temperature right now").is_none());
    }

    #[tokio::test]
    async fn refusal_on_empty_knowledge_base_does_not_populate_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        let messages = router
            .query_pipeline("carol", "tell me about elk migration patterns")
            .await;
        assert_eq!(messages, vec![REFUSAL_MESSAGE.to_string()]);
        assert!(router.cached_response("tell me about elk migration patterns").is_none());
    }

    #[tokio::test]
    async fn gossip_referral_is_returned_directly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        db.ensure_indexes(3).await.expect("indexes");
        let facts = FactStore::load(dir.path()).await;
        let gossip_file = dir.path().join("node-directory.json");
        let gossip = GossipDirectory::load(&gossip_file, 86_400).await;
        gossip
            .handle_announcement(
                "node-1",
                "DEL-FI:1:ANNOUNCE:MARINA:topics=fishing,tides:model=llama3",
            )
            .await;
        let config = RouterConfig {
            node_name: "OUTPOST".to_string(),
            model: "llama3".to_string(),
            personality: String::new(),
            embedding_model: "nomic-embed-text".to_string(),
            num_ctx: 4096,
            num_predict: 256,
            max_response_bytes: 200,
            response_cache_ttl_seconds: 600,
            busy_notice: true,
            auto_send_chunks: 3,
            fact_query_keywords: vec![],
            top_k: 4,
            peer_cache_ttl_seconds: 604_800,
            trusted_peer_ids: vec![],
            max_peer_cache_entries: 500,
            cache_dir: dir.path().to_path_buf(),
        };
        let router = Router::new(config, db, fake_openai(), facts, None, None, Some(gossip)).await;

        let messages = router.query_pipeline("dave", "what are the tides today").await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("MARINA"));
        assert!(messages[0].contains("fishing,tides"));
    }

    #[tokio::test]
    async fn first_time_sender_gets_welcome_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        let first = router.query_pipeline("erin", "hello").await;
        assert_eq!(first.len(), 1);
        assert!(first[0].contains("Hi from"));

        let second = router.query_pipeline("erin", "hello").await;
        assert_eq!(second, vec![REFUSAL_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn busy_message_wording_depends_on_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        assert_eq!(
            router.busy_message(1),
            "OUTPOST: Working on another question, yours is next."
        );
        assert_eq!(router.busy_message(3), "OUTPOST: 3 questions ahead of yours, hang tight.");
    }

    #[tokio::test]
    async fn busy_notice_fires_at_most_once_per_outstanding_query() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = setup_router(dir.path()).await;
        router.set_worker_busy(true);
        let first = router.maybe_busy_notice("alice", 0);
        assert!(first.is_some());
        let second = router.maybe_busy_notice("alice", 0);
        assert!(second.is_none());
        router.clear_pending("alice");
        let third = router.maybe_busy_notice("alice", 0);
        assert!(third.is_some());
    }
}
