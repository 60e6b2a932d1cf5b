//! LLM liveness probing (`spec.md` §4.5.5 `check_ollama`).

use tracing::{debug, warn};

/// Probes the configured LLM endpoint. Used both at startup (as a
/// non-blocking check) and periodically by the health thread while
/// the daemon believes the LLM is unavailable (`spec.md` §5).
pub async fn check_llm_available(
    openai: &async_openai::Client<async_openai::config::OpenAIConfig>,
) -> bool {
    match openai.models().list().await {
        Ok(_) => {
            debug!("llm health check ok");
            true
        }
        Err(e) => {
            warn!(error = %e, "llm not available (will retry)");
            false
        }
    }
}
