use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Options forwarded to the extraction service alongside the artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Original file name of the artifact, for diagnostics and content
    /// sniffing on the service side.
    pub source_name: String,
}

/// One named output produced by processing an input artifact.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("extraction request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("extraction service error: {0}")]
    Service(String),

    #[error("malformed extraction response: {0}")]
    Decode(String),
}

/// The external processing collaborator: an opaque call that turns one input
/// artifact into a set of named output artifacts. The orchestrator never
/// interprets the outputs, only persists them.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        input: &[u8],
        options: &ProcessingOptions,
    ) -> Result<Vec<OutputArtifact>, ProcessorError>;
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    source_name: &'a str,
    archive: String,
}

#[derive(Deserialize)]
struct ExtractResponse {
    outputs: Vec<ExtractOutput>,
}

#[derive(Deserialize)]
struct ExtractOutput {
    name: String,
    content: String,
}

/// HTTP client for the extraction service.
pub struct ExtractionClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl ExtractionClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_token,
        }
    }
}

#[async_trait]
impl Processor for ExtractionClient {
    async fn process(
        &self,
        input: &[u8],
        options: &ProcessingOptions,
    ) -> Result<Vec<OutputArtifact>, ProcessorError> {
        let url = format!("{}/v1/extract", self.base_url.trim_end_matches('/'));
        let body = ExtractRequest {
            source_name: &options.source_name,
            archive: base64::engine::general_purpose::STANDARD.encode(input),
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ProcessorError::Service(format!(
                "extraction service returned {status}: {detail}"
            )));
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .map_err(|e| ProcessorError::Decode(e.to_string()))?;

        parsed
            .outputs
            .into_iter()
            .map(|output| {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&output.content)
                    .map_err(|e| {
                        ProcessorError::Decode(format!(
                            "output `{}` is not valid base64: {e}",
                            output.name
                        ))
                    })?;
                Ok(OutputArtifact {
                    name: output.name,
                    bytes,
                })
            })
            .collect()
    }
}
