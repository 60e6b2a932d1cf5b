use async_openai::types::CreateEmbeddingRequestArgs;
use tracing::debug;

use crate::error::OracleError;

/// Generates an embedding vector for `input` using the configured
/// model. `client` is expected to point at an OpenAI-compatible
/// endpoint (Ollama exposes one), the same construction pattern used
/// throughout this workspace for LLM calls.
pub async fn generate_embedding(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    input: &str,
    model: &str,
) -> Result<Vec<f32>, OracleError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .input([input])
        .build()?;

    let response = client.embeddings().create(request).await?;

    let embedding: Vec<f32> = response
        .data
        .first()
        .ok_or_else(|| OracleError::Processing("no embedding data received".into()))?
        .embedding
        .clone();

    debug!(dimensions = embedding.len(), "generated embedding");
    Ok(embedding)
}
