//! Knowledge-folder indexing: change-detecting file scan, re-chunk,
//! embed, and delete-on-removal (`spec.md` §4.5.1).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use common::embedding::generate_embedding;
use common::error::OracleError;
use common::storage::chunk::{delete_by_filepath, store_with_embedding};
use common::storage::db::SurrealDbClient;
use common::storage::chunk::DocumentChunk;
use md5::{Digest, Md5};
use tracing::{error, info, warn};

use crate::chunker::{chunk_document, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};

/// Tracks the per-file content hash the indexer last saw, so unchanged
/// files are skipped on every subsequent pass (`spec.md` §3 "Document
/// chunk" invariant: chunks are fully replaced only when the content
/// hash changes).
pub struct Indexer {
    file_hashes: Mutex<std::collections::HashMap<String, String>>,
    embedding_model: String,
}

impl Indexer {
    pub fn new(embedding_model: String) -> Self {
        Self {
            file_hashes: Mutex::new(std::collections::HashMap::new()),
            embedding_model,
        }
    }

    /// Scans `folder` recursively for `.txt`/`.md` files, re-indexing
    /// any that are new or whose content hash changed, and removes
    /// chunks belonging to files no longer present. Individual file
    /// errors are logged and isolated (`spec.md` §7 "Individual file
    /// index error").
    pub async fn index_folder(
        &self,
        folder: &Path,
        openai: &async_openai::Client<async_openai::config::OpenAIConfig>,
        db: &SurrealDbClient,
    ) -> Result<usize, OracleError> {
        if !folder.exists() {
            warn!(folder = %folder.display(), "knowledge folder not found");
            return Ok(0);
        }

        let mut indexed = 0usize;
        let mut current_files: HashSet<String> = HashSet::new();

        let mut entries = Vec::new();
        collect_files(folder, &mut entries)?;

        for path in entries {
            let file_key = path.to_string_lossy().to_string();
            current_files.insert(file_key.clone());
            match self.index_file(&path, &file_key, openai, db).await {
                Ok(true) => indexed += 1,
                Ok(false) => {}
                Err(e) => error!(file = %path.display(), error = %e, "failed to index file"),
            }
        }

        self.remove_deleted(&current_files, db).await?;
        Ok(indexed)
    }

    async fn index_file(
        &self,
        path: &Path,
        file_key: &str,
        openai: &async_openai::Client<async_openai::config::OpenAIConfig>,
        db: &SurrealDbClient,
    ) -> Result<bool, OracleError> {
        let content = match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                error!(file = %path.display(), error = %e, "can't read file");
                return Ok(false);
            }
        };

        let content_hash = format!("{:x}", Md5::digest(content.as_bytes()));

        {
            let mut hashes = self.file_hashes.lock().unwrap_or_else(|e| e.into_inner());
            if hashes.get(file_key) == Some(&content_hash) {
                return Ok(false);
            }
            hashes.insert(file_key.to_string(), content_hash);
        }

        delete_by_filepath(file_key, db).await?;

        let sections = chunk_document(&content, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
        if sections.is_empty() {
            return Ok(false);
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_key.to_string());

        for (i, text) in sections.into_iter().enumerate() {
            let embedding = generate_embedding(openai, &text, &self.embedding_model).await?;
            let chunk = DocumentChunk::new(file_key, &file_name, i as u32, text);
            store_with_embedding(chunk, embedding, db).await?;
        }

        info!(file = %file_name, "indexed file");
        Ok(true)
    }

    async fn remove_deleted(
        &self,
        current_files: &HashSet<String>,
        db: &SurrealDbClient,
    ) -> Result<(), OracleError> {
        let deleted: Vec<String> = {
            let hashes = self.file_hashes.lock().unwrap_or_else(|e| e.into_inner());
            hashes
                .keys()
                .filter(|k| !current_files.contains(k.as_str()))
                .cloned()
                .collect()
        };
        for file_key in &deleted {
            delete_by_filepath(file_key, db).await?;
        }
        if !deleted.is_empty() {
            let mut hashes = self.file_hashes.lock().unwrap_or_else(|e| e.into_inner());
            for key in &deleted {
                hashes.remove(key);
            }
        }
        Ok(())
    }

    /// Topic names derived from indexed file stems (`spec.md` §4.5.5
    /// `get_topics`): `_` and `.` normalized to `-`.
    pub fn topics(&self) -> Vec<String> {
        let hashes = self.file_hashes.lock().unwrap_or_else(|e| e.into_inner());
        let mut topics: Vec<String> = hashes
            .keys()
            .map(|file_key| {
                let stem = Path::new(file_key)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file_key.clone());
                stem.replace('_', "-").replace('.', "-")
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        topics.sort();
        topics
    }
}

fn collect_files(folder: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<(), OracleError> {
    let read_dir = match std::fs::read_dir(folder) {
        Ok(rd) => rd,
        Err(e) => {
            warn!(folder = %folder.display(), error = %e, "could not read knowledge folder");
            return Ok(());
        }
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("txt") || e.eq_ignore_ascii_case("md"))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}
