pub mod chunker;
pub mod indexer;

pub use chunker::chunk_document;
pub use indexer::Indexer;
