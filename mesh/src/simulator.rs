use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapter::MeshAdapter;

const DEFAULT_SENDER: &str = "!sim00001";

/// Stdin/stdout mesh adapter for local development and the test
/// scenarios in `spec.md` §8. Grounded on
/// `original_source/mesh/simulator.py`: optional `!nodeID> ` sender
/// override, always connected, and a byte-limit *warning* rather than
/// silent truncation on send (so an operator testing locally sees
/// when a real radio would have had to chunk the message).
pub struct SimulatorAdapter {
    max_response_bytes: usize,
    rate_limit_seconds: u64,
    rate_limits: Mutex<HashMap<String, Vec<Instant>>>,
    connected: AtomicBool,
    inbound: mpsc::UnboundedSender<(String, String)>,
}

impl SimulatorAdapter {
    pub fn new(
        max_response_bytes: usize,
        rate_limit_seconds: u64,
        inbound: mpsc::UnboundedSender<(String, String)>,
    ) -> Self {
        Self {
            max_response_bytes,
            rate_limit_seconds,
            rate_limits: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            inbound,
        }
    }

    /// Splits an optional `!nodeID> message` prefix off a raw input
    /// line. Returns `(sender, text)`.
    fn parse_line(line: &str) -> (String, String) {
        if let Some(stripped) = line.strip_prefix('!') {
            if let Some(arrow) = stripped.find("> ") {
                let (id_part, rest) = stripped.split_at(arrow);
                if !id_part.is_empty() && id_part.chars().all(|c| c.is_alphanumeric()) {
                    let sender = format!("!{id_part}");
                    let text = rest.trim_start_matches("> ").to_string();
                    return (sender, text);
                }
            }
        }
        (DEFAULT_SENDER.to_string(), line.to_string())
    }

    fn rate_limited(&self, sender: &str) -> bool {
        if self.rate_limit_seconds == 0 {
            return false;
        }
        let window = Duration::from_secs(self.rate_limit_seconds);
        let now = Instant::now();
        let mut limits = self.rate_limits.lock().unwrap_or_else(|e| e.into_inner());
        let times = limits.entry(sender.to_string()).or_default();
        times.retain(|t| now.duration_since(*t) < window);
        if !times.is_empty() {
            return true;
        }
        times.push(now);
        false
    }
}

#[async_trait]
impl MeshAdapter for SimulatorAdapter {
    async fn connect(&self) -> bool {
        self.connected.store(true, Ordering::SeqCst);
        info!("simulator adapter connected; type messages, prefix with !nodeID> to impersonate a sender");
        let tx = self.inbound.clone();
        let rate_limit_seconds = self.rate_limit_seconds;
        tokio::task::spawn_blocking(move || {
            // Rate limiting here is re-derived per blocking task since
            // the adapter's own state isn't Send across the blocking
            // boundary cleanly; this mirrors the per-sender window the
            // adapter enforces for async sends.
            let mut limits: HashMap<String, Vec<Instant>> = HashMap::new();
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let (sender, text) = SimulatorAdapter::parse_line(&line);
                let text = text.trim().to_string();
                if !text.starts_with('!') && rate_limit_seconds > 0 {
                    let window = Duration::from_secs(rate_limit_seconds);
                    let now = Instant::now();
                    let times = limits.entry(sender.clone()).or_default();
                    times.retain(|t| now.duration_since(*t) < window);
                    if !times.is_empty() {
                        println!("(rate limited, wait a moment)");
                        continue;
                    }
                    times.push(now);
                }
                if tx.send((sender, text)).is_err() {
                    break;
                }
            }
        });
        true
    }

    async fn send_dm(&self, dest_id: &str, text: &str) -> bool {
        let size = text.len();
        if size > self.max_response_bytes {
            warn!(
                dest_id,
                size,
                limit = self.max_response_bytes,
                "message exceeds byte limit"
            );
            println!("\u{26a0} {size}B exceeds {}B limit", self.max_response_bytes);
        }
        println!("-> {dest_id}: {text}");
        let _ = std::io::stdout().flush();
        true
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn protocol_name(&self) -> &'static str {
        "Simulator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_extracts_sender_override() {
        let (sender, text) = SimulatorAdapter::parse_line("!node7> what time is it");
        assert_eq!(sender, "!node7");
        assert_eq!(text, "what time is it");
    }

    #[test]
    fn parse_line_defaults_without_prefix() {
        let (sender, text) = SimulatorAdapter::parse_line("hello there");
        assert_eq!(sender, DEFAULT_SENDER);
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn send_dm_always_succeeds() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = SimulatorAdapter::new(230, 30, tx);
        assert!(adapter.send_dm("!node1", "short message").await);
    }

    #[tokio::test]
    async fn connect_marks_adapter_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = SimulatorAdapter::new(230, 30, tx);
        assert!(!adapter.connected());
        adapter.connect().await;
        assert!(adapter.connected());
    }
}
