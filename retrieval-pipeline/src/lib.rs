pub mod generation;
pub mod health;
pub mod retrieval;

pub use generation::{build_prompt, build_system_prompt, generate, GenerationContext};
pub use health::check_llm_available;
pub use retrieval::{retrieve, RetrievedChunk, DISTANCE_THRESHOLD};
