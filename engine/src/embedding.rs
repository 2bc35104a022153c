//! Embedding provider client.
//!
//! Turns text into vectors by calling an external HTTP service. Never holds
//! a library lock: callers resolve text to an embedding first and only then
//! enter a critical section. Provider failures surface as Upstream errors
//! and abort the operation; nothing is retried here.

use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, Result};
use crate::metrics;

#[derive(Serialize)]
struct EmbedPayload<'a> {
    texts: &'a [String],
    model: &'a str,
    input_type: &'static str,
}

#[derive(Deserialize)]
struct EmbedReply {
    embeddings: Vec<Vec<f32>>,
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Upstream(format!("embedding client init: {e}")))?;
        Ok(Self { http, config })
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_many(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| EngineError::Upstream("provider returned no embedding".into()))
    }

    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(EngineError::Validation(
                "texts must contain at least one entry".into(),
            ));
        }
        if texts.len() > self.config.max_texts {
            return Err(EngineError::Validation(format!(
                "too many texts: {} > {}",
                texts.len(),
                self.config.max_texts
            )));
        }
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            EngineError::Upstream("embedding api key is not configured".into())
        })?;

        metrics::EMBED_REQUESTS_TOTAL.inc();
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&EmbedPayload {
                texts,
                model: &self.config.model,
                input_type: "search_document",
            })
            .send()
            .await
            .map_err(|e| EngineError::Upstream(format!("embedding provider: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Validation(format!(
                "embedding provider rejected request ({status}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(EngineError::Upstream(format!(
                "embedding provider error: {status}"
            )));
        }

        let reply: EmbedReply = response
            .json()
            .await
            .map_err(|e| EngineError::Upstream(format!("embedding provider reply: {e}")))?;
        if reply.embeddings.len() != texts.len() {
            return Err(EngineError::Upstream(format!(
                "provider returned {} embeddings for {} texts",
                reply.embeddings.len(),
                texts.len()
            )));
        }
        Ok(reply.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> EmbeddingClient {
        EmbeddingClient::new(EmbeddingConfig {
            api_key: Some("k".into()),
            ..EmbeddingConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_batches() {
        let c = client();
        assert_eq!(c.embed_many(&[]).await.unwrap_err().kind(), "validation");
        let too_many: Vec<String> = (0..200).map(|i| format!("t{i}")).collect();
        assert_eq!(
            c.embed_many(&too_many).await.unwrap_err().kind(),
            "validation"
        );
    }

    #[tokio::test]
    async fn missing_key_is_upstream() {
        let c = EmbeddingClient::new(EmbeddingConfig::default()).unwrap();
        let err = c.embed_many(&["x".into()]).await.unwrap_err();
        assert_eq!(err.kind(), "upstream");
    }
}
