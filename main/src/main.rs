//! Del-Fi oracle daemon entry point (`spec.md` §5, grounded on
//! `original_source/delfi.py::main`).

mod banner;

use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::Client as OpenAiClient;
use common::config::{load_config, OracleConfig};
use common::error::OracleError;
use common::storage::chunk::count as doc_count;
use common::storage::db::SurrealDbClient;
use ingestion_pipeline::Indexer;
use mesh::create_adapter;
use peer_service::GossipDirectory;
use retrieval_pipeline::check_llm_available;
use router::{Board, BoardConfig, ConversationMemory, FactStore, Router, RouterConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use banner::{render_banner, BannerInfo};

const KNOWLEDGE_WATCH_INTERVAL: Duration = Duration::from_secs(60);
const LLM_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(500);
const FALLBACK_EMBEDDING_DIMENSION: u32 = 768;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = match load_config(None) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "del-fi exited with an error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: OracleConfig) -> Result<(), OracleError> {
    info!(node_name = %config.node_name, "starting del-fi oracle");

    let db = Arc::new(
        SurrealDbClient::new(&config.surrealdb_address, "del_fi", &config.node_name).await?,
    );

    let openai = OpenAiClient::with_config(
        OpenAIConfig::new().with_api_base(&config.ollama_host).with_api_key("ollama"),
    );

    let dimension = probe_embedding_dimension(&openai, &config.embedding_model).await;
    let rag_available = match dimension {
        Some(dim) => match db.ensure_indexes(dim).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "vector index init failed, disabling RAG for this run");
                false
            }
        },
        None => {
            warn!("could not determine embedding dimension, disabling RAG for this run");
            false
        }
    };

    let indexer = Arc::new(Indexer::new(config.embedding_model.clone()));
    if rag_available {
        let folder = config.knowledge_folder_path();
        match indexer.index_folder(&folder, &openai, &db).await {
            Ok(n) => info!(files = n, "initial knowledge index complete"),
            Err(e) => warn!(error = %e, "initial knowledge index failed"),
        }
    }

    let llm_available = check_llm_available(&openai).await;

    let facts = FactStore::load(config.cache_dir()).await;
    let memory = if config.memory_max_turns > 0 {
        let mem = ConversationMemory::load(config.cache_dir(), config.memory_max_turns as usize)
            .await
            .with_ttl_seconds(config.memory_ttl as i64);
        Some(mem)
    } else {
        None
    };

    let board = if config.board_enabled {
        let board_config = BoardConfig {
            max_posts: Some(config.board_max_posts as usize),
            post_ttl_seconds: Some(config.board_post_ttl as i64),
            show_count: Some(config.board_show_count as usize),
            rate_limit: Some(config.board_rate_limit as usize),
            rate_window_seconds: Some(config.board_rate_window as i64),
            blocked_patterns: config.board_blocked_patterns.clone(),
        };
        Some(Board::load(config.cache_dir(), board_config).await)
    } else {
        None
    };

    let (gossip, trusted_peer_ids, peer_names) = match &config.mesh_knowledge {
        Some(mk) if mk.gossip.enabled => {
            let dir = GossipDirectory::load(
                config.gossip_dir().join("node-directory.json"),
                mk.gossip.directory_ttl,
            )
            .await;
            let ids: Vec<String> = mk.peers.iter().map(|p| p.node_id.clone()).collect();
            let names: Vec<String> = mk.peers.iter().map(|p| p.name.clone()).collect();
            (Some(dir), ids, names)
        }
        _ => (None, Vec::new(), Vec::new()),
    };

    let router_config = RouterConfig {
        node_name: config.node_name.clone(),
        model: config.model.clone(),
        personality: config.personality.clone(),
        embedding_model: config.embedding_model.clone(),
        num_ctx: config.num_ctx,
        num_predict: config.num_predict,
        max_response_bytes: config.max_response_bytes as usize,
        response_cache_ttl_seconds: config.response_cache_ttl as i64,
        busy_notice: config.busy_notice,
        auto_send_chunks: config.auto_send_chunks as usize,
        fact_query_keywords: config.fact_query_keywords.clone(),
        top_k: 4,
        peer_cache_ttl_seconds: 604_800,
        trusted_peer_ids,
        max_peer_cache_entries: 500,
        cache_dir: config.cache_dir(),
    };
    let router = Arc::new(
        Router::new(router_config, db.clone(), openai.clone(), facts, memory, board, gossip).await,
    );
    router.set_llm_available(llm_available);

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<(String, String)>();
    let adapter = Arc::new(create_adapter(
        &config.radio_connection,
        true,
        config.max_response_bytes as usize,
        config.rate_limit_seconds,
        inbound_tx,
    )?);
    adapter.connect().await;

    let banner_info = BannerInfo {
        node_name: config.node_name.clone(),
        model: config.model.clone(),
        doc_count: doc_count(&db).await.unwrap_or(0),
        rag_available,
        llm_available,
        protocol_name: adapter.protocol_name().to_string(),
        peer_names,
    };
    println!("{}", render_banner(&banner_info));

    let stop = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(spawn_knowledge_watcher(
        stop.clone(),
        indexer.clone(),
        openai.clone(),
        db.clone(),
        config.knowledge_folder_path(),
        rag_available,
    ));
    tasks.push(spawn_llm_health_watcher(stop.clone(), router.clone(), openai.clone()));
    tasks.push(spawn_reconnect_loop(stop.clone(), adapter.clone()));
    tasks.push(spawn_fact_feed_watcher(
        stop.clone(),
        router.clone(),
        config.fact_feed_path(),
        Duration::from_secs(config.fact_watch_interval_seconds),
    ));

    let query_queue_len = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let (query_tx, query_rx) = mpsc::unbounded_channel::<(String, String)>();

    tasks.push(spawn_dispatcher(
        stop.clone(),
        router.clone(),
        adapter.clone(),
        inbound_rx,
        query_tx,
        query_queue_len.clone(),
    ));
    tasks.push(spawn_worker(stop.clone(), router.clone(), adapter.clone(), query_rx, query_queue_len));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping background tasks");
    stop.cancel();
    adapter.close().await;
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

async fn probe_embedding_dimension(
    openai: &OpenAiClient<OpenAIConfig>,
    model: &str,
) -> Option<u32> {
    match common::embedding::generate_embedding(openai, "dimension probe", model).await {
        Ok(vec) => Some(vec.len() as u32),
        Err(e) => {
            warn!(error = %e, "embedding probe failed, falling back to default dimension");
            Some(FALLBACK_EMBEDDING_DIMENSION)
        }
    }
}

fn spawn_knowledge_watcher(
    stop: CancellationToken,
    indexer: Arc<Indexer>,
    openai: OpenAiClient<OpenAIConfig>,
    db: Arc<SurrealDbClient>,
    folder: std::path::PathBuf,
    rag_available: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !rag_available {
            return;
        }
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(KNOWLEDGE_WATCH_INTERVAL) => {
                    match indexer.index_folder(&folder, &openai, &db).await {
                        Ok(n) => info!(files = n, "knowledge watcher: re-indexed"),
                        Err(e) => warn!(error = %e, "knowledge watcher: index pass failed"),
                    }
                }
            }
        }
    })
}

fn spawn_llm_health_watcher(
    stop: CancellationToken,
    router: Arc<Router>,
    openai: OpenAiClient<OpenAIConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(LLM_HEALTH_INTERVAL) => {
                    if !router.llm_available() {
                        let available = check_llm_available(&openai).await;
                        router.set_llm_available(available);
                        if available {
                            info!("llm health watcher: language model is back online");
                        }
                    }
                }
            }
        }
    })
}

/// Fact feed watcher (`spec.md` §4.2 `watch`, §5): polls the sensor
/// feed file by mtime every `fact_watch_interval_seconds` and ingests
/// it on change.
fn spawn_fact_feed_watcher(
    stop: CancellationToken,
    router: Arc<Router>,
    feed_file: std::path::PathBuf,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime = None;
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    router.facts().poll_feed(&feed_file, &mut last_mtime).await;
                }
            }
        }
    })
}

fn spawn_reconnect_loop(
    stop: CancellationToken,
    adapter: Arc<Box<dyn mesh::MeshAdapter>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = adapter.reconnect_loop() => break,
            }
        }
    })
}

/// The dispatcher thread (`spec.md` §5, §4.7.1): drains the inbound
/// mesh queue and handles commands/gossip inline without ever
/// blocking on language-model inference. Queries are handed off to the
/// worker's query queue, emitting at most one busy ack per sender
/// first so the ack always precedes the query response (§4.7.6).
fn spawn_dispatcher(
    stop: CancellationToken,
    router: Arc<Router>,
    adapter: Arc<Box<dyn mesh::MeshAdapter>>,
    mut inbound: mpsc::UnboundedReceiver<(String, String)>,
    query_tx: mpsc::UnboundedSender<(String, String)>,
    query_queue_len: Arc<std::sync::atomic::AtomicUsize>,
) -> tokio::task::JoinHandle<()> {
    use std::sync::atomic::Ordering;
    tokio::spawn(async move {
        loop {
            let (sender, text) = tokio::select! {
                () = stop.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };

            match router.classify(&text) {
                router::MessageKind::Empty => {}
                router::MessageKind::Command => {
                    let reply = router.handle_command(&sender, &text).await;
                    if !adapter.send_dm(&sender, &reply).await {
                        warn!(sender = %sender, "dispatcher: send_dm failed");
                    }
                }
                router::MessageKind::Gossip => {
                    router.handle_gossip(&sender, &text).await;
                }
                router::MessageKind::Query => {
                    let qsize = query_queue_len.load(Ordering::Relaxed);
                    if let Some(ack) = router.maybe_busy_notice(&sender, qsize) {
                        if !adapter.send_dm(&sender, &ack).await {
                            warn!(sender = %sender, "dispatcher: busy ack send_dm failed");
                        }
                    }
                    query_queue_len.fetch_add(1, Ordering::Relaxed);
                    if query_tx.send((sender, text)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// The worker thread (`spec.md` §5, §4.7.3): a single dedicated task
/// draining the query queue and running the slow (language-model)
/// path, one query at a time, so `worker_busy` is a meaningful signal
/// for the dispatcher's busy-notice protocol.
fn spawn_worker(
    stop: CancellationToken,
    router: Arc<Router>,
    adapter: Arc<Box<dyn mesh::MeshAdapter>>,
    mut query_rx: mpsc::UnboundedReceiver<(String, String)>,
    query_queue_len: Arc<std::sync::atomic::AtomicUsize>,
) -> tokio::task::JoinHandle<()> {
    use std::sync::atomic::Ordering;
    tokio::spawn(async move {
        loop {
            let (sender, text) = tokio::select! {
                () = stop.cancelled() => break,
                msg = query_rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            query_queue_len.fetch_sub(1, Ordering::Relaxed);

            router.set_worker_busy(true);
            let first = router.handle_query(&sender, &text).await;
            router.set_worker_busy(false);
            let outbound = router.auto_send(&sender, first);

            for (i, message) in outbound.iter().enumerate() {
                if message.is_empty() {
                    continue;
                }
                if !adapter.send_dm(&sender, message).await {
                    warn!(sender = %sender, "worker: send_dm failed");
                }
                if i + 1 < outbound.len() {
                    tokio::time::sleep(INTER_CHUNK_DELAY).await;
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
