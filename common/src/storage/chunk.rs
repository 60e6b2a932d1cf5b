use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use super::db::SurrealDbClient;
use crate::error::OracleError;

/// A single indexed passage of a knowledge-folder document. `id`
/// follows the `<filepath>::chunk<N>` scheme `spec.md` §3 mandates so
/// re-indexing a file can address and replace exactly its own chunks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentChunk {
    pub id: String,
    pub source: String,
    pub file: String,
    pub filepath: String,
    pub chunk_index: u32,
    pub text: String,
}

impl DocumentChunk {
    pub fn new(filepath: &str, file: &str, chunk_index: u32, text: String) -> Self {
        Self {
            id: format!("{filepath}::chunk{chunk_index}"),
            source: "local".to_string(),
            file: file.to_string(),
            filepath: filepath.to_string(),
            chunk_index,
            text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    chunk_id: DocumentChunk,
    score: f32,
}

/// A retrieval candidate with its raw cosine distance (0 = identical).
#[derive(Clone, Debug)]
pub struct ChunkCandidate {
    pub chunk: DocumentChunk,
    pub raw_distance: f32,
}

const CHUNK_TABLE: &str = "chunk";
const EMBEDDING_TABLE: &str = "chunk_embedding";

/// Stores a chunk and its embedding atomically, mirroring the
/// teacher's two-table chunk/embedding split (`store_with_embedding`
/// in `common::storage::types::text_chunk`).
pub async fn store_with_embedding(
    chunk: DocumentChunk,
    embedding: Vec<f32>,
    db: &SurrealDbClient,
) -> Result<(), OracleError> {
    let chunk_id = chunk.id.clone();
    let embedding_id = format!("{chunk_id}::embedding");

    let query = format!(
        "BEGIN TRANSACTION;
         CREATE type::thing('{CHUNK_TABLE}', $chunk_id) CONTENT $chunk;
         CREATE type::thing('{EMBEDDING_TABLE}', $embedding_id) CONTENT {{
             chunk_id: type::thing('{CHUNK_TABLE}', $chunk_id),
             embedding: $embedding
         }};
         COMMIT TRANSACTION;"
    );

    db.client
        .query(query)
        .bind(("chunk_id", chunk_id))
        .bind(("embedding_id", embedding_id))
        .bind(("chunk", chunk))
        .bind(("embedding", embedding))
        .await?
        .check()?;
    Ok(())
}

/// Removes every chunk (and its embedding) belonging to `filepath`.
/// Best-effort from the caller's perspective: a missing filepath is
/// not an error.
pub async fn delete_by_filepath(filepath: &str, db: &SurrealDbClient) -> Result<(), OracleError> {
    db.client
        .query(format!(
            "DELETE {EMBEDDING_TABLE} WHERE chunk_id.filepath = $filepath;
             DELETE {CHUNK_TABLE} WHERE filepath = $filepath;"
        ))
        .bind(("filepath", filepath.to_string()))
        .await?
        .check()?;
    Ok(())
}

/// Returns the distinct set of filepaths currently indexed.
pub async fn all_filepaths(db: &SurrealDbClient) -> Result<HashSet<String>, OracleError> {
    let chunks: Vec<DocumentChunk> = db.client.select(CHUNK_TABLE).await?;
    Ok(chunks.into_iter().map(|c| c.filepath).collect())
}

/// Total number of indexed chunks (the RAG engine's `doc_count`).
pub async fn count(db: &SurrealDbClient) -> Result<usize, OracleError> {
    let chunks: Vec<Thing> = db.client.select(CHUNK_TABLE).await?;
    Ok(chunks.len())
}

/// Fetches the `fetch_k` nearest chunks to `query_embedding` by
/// cosine distance (0 = identical), using SurrealDB's native HNSW
/// index, matching the approximate-KNN + `vector::similarity::cosine`
/// pattern from `common::storage::types::text_chunk::vector_search`
/// in the teacher. The adjusted-distance keyword boost (`spec.md`
/// §4.5.3 step 4) is applied by the caller, which needs the raw
/// distance and chunk text together.
pub async fn nearest(
    query_embedding: Vec<f32>,
    fetch_k: usize,
    db: &SurrealDbClient,
) -> Result<Vec<ChunkCandidate>, OracleError> {
    let query = format!(
        "SELECT chunk_id, vector::similarity::cosine(embedding, $embedding) AS score
         FROM {EMBEDDING_TABLE}
         WHERE embedding <|{fetch_k},100|> $embedding
         ORDER BY score DESC
         LIMIT {fetch_k}
         FETCH chunk_id;"
    );

    let mut response = db
        .client
        .query(query)
        .bind(("embedding", query_embedding))
        .await?
        .check()?;

    let rows: Vec<EmbeddingRow> = response.take(0)?;
    Ok(rows
        .into_iter()
        .map(|row| ChunkCandidate {
            chunk: row.chunk_id,
            raw_distance: (1.0 - row.score).max(0.0),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::SurrealDbClient;
    use uuid::Uuid;

    async fn setup() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.ensure_indexes(3).await.expect("indexes");
        db
    }

    #[tokio::test]
    async fn store_and_search_roundtrip() {
        let db = setup().await;
        let chunk = DocumentChunk::new("docs/weather.md", "weather.md", 0, "it is cold".into());
        store_with_embedding(chunk.clone(), vec![1.0, 0.0, 0.0], &db)
            .await
            .expect("store");

        assert_eq!(count(&db).await.expect("count"), 1);

        let hits = nearest(vec![1.0, 0.0, 0.0], 5, &db).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, chunk.id);
        assert!(hits[0].raw_distance < 0.01);
    }

    #[tokio::test]
    async fn delete_by_filepath_removes_all_its_chunks() {
        let db = setup().await;
        let c0 = DocumentChunk::new("docs/a.md", "a.md", 0, "alpha".into());
        let c1 = DocumentChunk::new("docs/a.md", "a.md", 1, "beta".into());
        let other = DocumentChunk::new("docs/b.md", "b.md", 0, "gamma".into());
        store_with_embedding(c0, vec![1.0, 0.0, 0.0], &db).await.expect("store c0");
        store_with_embedding(c1, vec![0.0, 1.0, 0.0], &db).await.expect("store c1");
        store_with_embedding(other, vec![0.0, 0.0, 1.0], &db).await.expect("store other");

        delete_by_filepath("docs/a.md", &db).await.expect("delete");

        let remaining = all_filepaths(&db).await.expect("filepaths");
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains("docs/b.md"));
        assert_eq!(count(&db).await.expect("count"), 1);
    }
}
