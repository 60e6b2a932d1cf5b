//! Hybrid keyword-adjusted vector retrieval (`spec.md` §4.5.3).

use std::collections::HashSet;

use common::embedding::generate_embedding;
use common::error::OracleError;
use common::storage::chunk::{count, nearest};
use common::storage::db::SurrealDbClient;
use tracing::debug;

/// Similarity floor (adjusted distance ceiling) below which a
/// candidate is not returned to the caller.
pub const DISTANCE_THRESHOLD: f32 = 0.5;

/// Per-keyword-match reduction applied to raw cosine distance.
const KEYWORD_BOOST: f32 = 0.15;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "and", "or", "but",
    "if", "of", "at", "by", "for", "with", "about", "against", "between", "into", "through",
    "during", "to", "from", "up", "down", "in", "out", "on", "off", "over", "under", "again",
    "further", "then", "once", "there", "when", "where", "why", "how", "all", "any", "both",
    "each", "few", "more", "most", "other", "some", "such", "no", "nor", "not", "only", "own",
    "same", "so", "than", "too", "very", "can", "will", "just", "should", "now", "do", "does",
    "did", "it", "its", "this", "that", "these", "those", "i", "you", "he", "she", "we", "they",
    "what", "which", "who", "whom", "me", "my", "your", "our", "their",
];

/// A retrieval result surfaced to the generation stage.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievedChunk {
    pub text: String,
    pub source: String,
    pub file: String,
    pub similarity: f32,
}

/// Splits `text` into lowercase alphanumeric keyword tokens, dropping
/// stopwords and tokens shorter than 2 characters.
fn extract_keywords(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn matched_keyword_count(chunk_text: &str, keywords: &[String]) -> usize {
    let lower = chunk_text.to_lowercase();
    keywords.iter().filter(|kw| lower.contains(kw.as_str())).count()
}

/// Retrieves up to `top_k` relevant chunks for `query`. Returns an
/// empty vec (never an error path the caller must special-case) when
/// the store is empty, matching `spec.md` §4.5.5 ("retrieval is
/// permanently disabled" / "empty chunks" contract) — callers that
/// know the store is unavailable should skip calling this at all.
pub async fn retrieve(
    query: &str,
    top_k: usize,
    openai: &async_openai::Client<async_openai::config::OpenAIConfig>,
    embedding_model: &str,
    db: &SurrealDbClient,
) -> Result<Vec<RetrievedChunk>, OracleError> {
    let doc_count = count(db).await?;
    if doc_count == 0 {
        return Ok(Vec::new());
    }

    let query_embedding = generate_embedding(openai, query, embedding_model).await?;
    let keywords = extract_keywords(query);

    let fetch_k = (top_k.max(1) * 3).max(10).clamp(1, doc_count);
    let candidates = nearest(query_embedding, fetch_k, db).await?;

    let mut scored: Vec<(f32, RetrievedChunk)> = candidates
        .into_iter()
        .map(|c| {
            let matched = matched_keyword_count(&c.chunk.text, &keywords);
            let adjusted = (c.raw_distance - KEYWORD_BOOST * matched as f32).max(0.0);
            (
                adjusted,
                RetrievedChunk {
                    text: c.chunk.text,
                    source: c.chunk.source,
                    file: c.chunk.file,
                    similarity: round2(1.0 - adjusted),
                },
            )
        })
        .collect();

    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let results: Vec<RetrievedChunk> = scored
        .into_iter()
        .filter(|(adjusted, _)| *adjusted <= DISTANCE_THRESHOLD)
        .take(top_k)
        .map(|(_, chunk)| chunk)
        .collect();

    if results.is_empty() {
        debug!(query, "rag: no relevant chunks found");
    } else {
        debug!(query, n = results.len(), "rag: chunks retrieved");
    }

    Ok(results)
}

fn round2(x: f32) -> f32 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_keywords_drops_stopwords_and_short_tokens() {
        let kws = extract_keywords("What is the temperature right now?");
        assert!(kws.contains(&"temperature".to_string()));
        assert!(!kws.contains(&"the".to_string()));
        assert!(!kws.contains(&"is".to_string()));
    }

    #[test]
    fn matched_keyword_count_is_substring_based() {
        let kws = vec!["elk".to_string(), "migration".to_string()];
        assert_eq!(matched_keyword_count("elk migration patterns in autumn", &kws), 2);
        assert_eq!(matched_keyword_count("trail guide basics", &kws), 0);
    }

    #[tokio::test]
    async fn empty_store_returns_no_chunks() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.ensure_indexes(3).await.expect("indexes");
        let openai = async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new().with_api_base("http://127.0.0.1:0"),
        );
        let results = retrieve("anything", 3, &openai, "nomic-embed-text", &db)
            .await
            .expect("should not error on empty store");
        assert!(results.is_empty());
    }
}
