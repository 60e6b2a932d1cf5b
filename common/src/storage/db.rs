use std::ops::Deref;

use surrealdb::engine::any::{connect, Any};
use surrealdb::Surreal;

use crate::error::OracleError;

/// Thin wrapper around an embedded SurrealDB connection. Production
/// use points `address` at a `rocksdb://<path>` store so the document
/// index survives restarts; tests use the in-memory `mem://` engine
/// via [`SurrealDbClient::memory`].
#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(address: &str, namespace: &str, database: &str) -> Result<Self, OracleError> {
        let db = connect(address).await?;
        db.use_ns(namespace).use_db(database).await?;
        Ok(SurrealDbClient { client: db })
    }

    /// Defines the HNSW vector indexes used by document-chunk
    /// retrieval. `dimension` must match the embedding model in use;
    /// callers re-invoke this (via `OVERWRITE`) when the configured
    /// embedding model changes dimension.
    pub async fn ensure_indexes(&self, dimension: u32) -> Result<(), OracleError> {
        let stmt = format!(
            "DEFINE INDEX OVERWRITE idx_chunk_embedding ON chunk_embedding FIELDS embedding HNSW DIMENSION {dimension}"
        );
        self.client.query(stmt).await?.check()?;
        self.client
            .query("DEFINE INDEX OVERWRITE idx_peer_cache_ts ON peer_cache FIELDS ts")
            .await?
            .check()?;
        Ok(())
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Creates an in-memory SurrealDB client for tests. Each caller
    /// should pass a fresh, unique `database` (e.g. a `Uuid`) so
    /// parallel tests never share state.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, OracleError> {
        let db = connect("mem://").await?;
        db.use_ns(namespace).use_db(database).await?;
        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn ensure_indexes_succeeds_on_fresh_db() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");
        db.ensure_indexes(3).await.expect("failed to build indexes");
    }
}
