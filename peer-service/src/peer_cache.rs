use std::collections::HashSet;

use common::error::OracleError;
use common::storage::db::SurrealDbClient;
use serde::{Deserialize, Serialize};

const TABLE: &str = "peer_cache";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PeerCacheRow {
    peer_id: String,
    peer_name: String,
    query: String,
    response: String,
    ts: f64,
    ttl: u64,
}

/// A peer cache hit surfaced to the router (Tier 2).
#[derive(Clone, Debug, PartialEq)]
pub struct PeerCacheHit {
    pub peer_name: String,
    pub query: String,
    pub response: String,
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Stores an answer attributed to `peer_id`, but only when that peer
/// is in the configured trusted set — untrusted submissions are
/// silently ignored per `spec.md` §7 ("Untrusted peer answer →
/// Silently ignore"). Enforces `max_cache_entries` by evicting the
/// oldest rows.
pub async fn store_peer_answer(
    peer_id: &str,
    peer_name: &str,
    query: &str,
    response: &str,
    ttl: u64,
    trusted_peer_ids: &[String],
    max_cache_entries: usize,
    db: &SurrealDbClient,
) -> Result<(), OracleError> {
    if !trusted_peer_ids.iter().any(|id| id == peer_id) {
        tracing::debug!(peer_id, "ignoring peer answer from untrusted node");
        return Ok(());
    }

    let row = PeerCacheRow {
        peer_id: peer_id.to_string(),
        peer_name: peer_name.to_string(),
        query: query.to_string(),
        response: response.to_string(),
        ts: now_unix(),
        ttl,
    };
    let _: Option<PeerCacheRow> = db
        .client
        .create(TABLE)
        .content(row)
        .await?;

    enforce_cache_limit(max_cache_entries, db).await
}

async fn enforce_cache_limit(max_entries: usize, db: &SurrealDbClient) -> Result<(), OracleError> {
    let rows: Vec<surrealdb::sql::Thing> = db.client.select(TABLE).await?;
    if rows.len() <= max_entries {
        return Ok(());
    }
    let overflow = rows.len() - max_entries;
    let stmt = format!(
        "DELETE {TABLE} WHERE id IN (SELECT VALUE id FROM {TABLE} ORDER BY ts ASC LIMIT {overflow});"
    );
    db.client.query(stmt).await?.check()?;
    Ok(())
}

/// Scans the most recent up-to-100 cached peer answers and returns
/// the single best Jaccard-scoring match above 0.5, honoring `ttl` at
/// read time (Open Question (a), resolved in `SPEC_FULL.md` §0.1).
pub async fn check_peer_cache(
    query: &str,
    db: &SurrealDbClient,
) -> Result<Option<PeerCacheHit>, OracleError> {
    let stmt = format!("SELECT * FROM {TABLE} ORDER BY ts DESC LIMIT 100;");
    let mut response = db.client.query(stmt).await?.check()?;
    let rows: Vec<PeerCacheRow> = response.take(0)?;

    let query_words = tokenize(query);
    let now = now_unix();

    let mut best: Option<(f64, PeerCacheRow)> = None;
    for row in rows {
        if now - row.ts > row.ttl as f64 {
            continue;
        }
        let cached_words = tokenize(&row.query);
        if query_words.is_empty() || cached_words.is_empty() {
            continue;
        }
        let overlap = query_words.intersection(&cached_words).count();
        let score = overlap as f64 / query_words.len().max(cached_words.len()) as f64;
        if score > 0.5 && best.as_ref().map(|(b, _)| score > *b).unwrap_or(true) {
            best = Some((score, row));
        }
    }

    Ok(best.map(|(_, row)| PeerCacheHit {
        peer_name: row.peer_name,
        query: row.query,
        response: row.response,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db")
    }

    #[tokio::test]
    async fn untrusted_peer_is_ignored() {
        let db = setup().await;
        store_peer_answer(
            "unknown-node",
            "Nobody",
            "what are the tides",
            "they are high",
            604_800,
            &["trusted-node".to_string()],
            500,
            &db,
        )
        .await
        .expect("should not error");

        let hit = check_peer_cache("what are the tides", &db).await.expect("query");
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn trusted_peer_answer_is_cached_and_matched() {
        let db = setup().await;
        store_peer_answer(
            "marina-node",
            "MARINA",
            "what are the tides today",
            "tides peak at noon",
            604_800,
            &["marina-node".to_string()],
            500,
            &db,
        )
        .await
        .expect("store");

        let hit = check_peer_cache("what are the tides today", &db)
            .await
            .expect("query")
            .expect("should hit");
        assert_eq!(hit.peer_name, "MARINA");
        assert_eq!(hit.response, "tides peak at noon");
    }

    #[tokio::test]
    async fn dissimilar_query_does_not_match() {
        let db = setup().await;
        store_peer_answer(
            "marina-node",
            "MARINA",
            "what are the tides today",
            "tides peak at noon",
            604_800,
            &["marina-node".to_string()],
            500,
            &db,
        )
        .await
        .expect("store");

        let hit = check_peer_cache("tell me about elk migration", &db)
            .await
            .expect("query");
        assert!(hit.is_none());
    }
}
