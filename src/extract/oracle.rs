//! Extraction oracle seam and its rig-core implementations.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! The oracle is the only networked step in the pipeline. Everything after it
//! treats the answer as untrusted text: JSON is re-parsed, every field is
//! re-normalized, and nothing from the answer reaches the store unvalidated.

use std::sync::Arc;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::ExposeSecret;
use tracing::info;

use crate::error::ExtractionError;

/// Sampling temperature for extraction (deterministic-ish).
const EXTRACT_TEMPERATURE: f64 = 0.1;

/// A model that turns one bank-SMS body into a raw JSON answer.
///
/// Implementations must not retry internally; retry policy belongs to the
/// caller, which knows what is transient.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Model identifier for logging and cache bookkeeping.
    fn model_name(&self) -> &str;

    /// Ask the oracle to extract transaction fields from `body`.
    ///
    /// Transport failures map to `ExtractionError::Oracle` (retryable).
    async fn extract(&self, body: &str) -> Result<String, ExtractionError>;
}

/// Supported oracle backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleBackend {
    Anthropic,
    OpenAi,
}

impl OracleBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

/// Configuration for creating an oracle.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub backend: OracleBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an oracle from configuration.
pub fn create_oracle(config: &OracleConfig) -> Result<Arc<dyn Oracle>, ExtractionError> {
    match config.backend {
        OracleBackend::Anthropic => create_anthropic_oracle(config),
        OracleBackend::OpenAi => create_openai_oracle(config),
    }
}

fn create_anthropic_oracle(config: &OracleConfig) -> Result<Arc<dyn Oracle>, ExtractionError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ExtractionError::Oracle(format!("failed to create Anthropic client: {e}"))
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(EXTRACTION_SYSTEM_PROMPT)
        .temperature(EXTRACT_TEMPERATURE)
        .build();
    info!("Using Anthropic extraction oracle (model: {})", config.model);
    Ok(Arc::new(RigOracle::new(agent, &config.model)))
}

fn create_openai_oracle(config: &OracleConfig) -> Result<Arc<dyn Oracle>, ExtractionError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ExtractionError::Oracle(format!("failed to create OpenAI client: {e}"))
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(EXTRACTION_SYSTEM_PROMPT)
        .temperature(EXTRACT_TEMPERATURE)
        .build();
    info!("Using OpenAI extraction oracle (model: {})", config.model);
    Ok(Arc::new(RigOracle::new(agent, &config.model)))
}

/// Oracle backed by a rig-core agent.
pub struct RigOracle<M: CompletionModel> {
    agent: Agent<M>,
    model: String,
}

impl<M: CompletionModel> RigOracle<M> {
    pub fn new(agent: Agent<M>, model: &str) -> Self {
        Self {
            agent,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl<M: CompletionModel> Oracle for RigOracle<M> {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn extract(&self, body: &str) -> Result<String, ExtractionError> {
        self.agent
            .prompt(body)
            .await
            .map_err(|e| ExtractionError::Oracle(format!("completion failed: {e}")))
    }
}

/// System prompt demanding strict single-object JSON output.
const EXTRACTION_SYSTEM_PROMPT: &str = "\
You are a bank SMS parser. Extract transaction fields from the message.\n\n\
Respond with ONLY a JSON object, no markdown, no commentary:\n\
{\"transaction_type\": \"debit|credit|unknown\", \"date\": \"...\", \"amount\": \"...\", \
\"currency\": \"...\", \"card\": \"...\", \"merchant\": \"...\", \"city\": \"...\", \
\"address\": \"...\", \"balance\": \"...\"}\n\n\
Rules:\n\
- Copy values verbatim from the message; never invent or reformat them\n\
- \"date\" is the date/time printed in the message, exactly as written\n\
- \"amount\" and \"balance\" are numeric strings exactly as written\n\
- \"card\" is the masked card number as written (e.g. ***0018)\n\
- Use null for any field the message does not contain\n\
- If the message is not a financial transaction, set every field to null";

/// Extract a JSON object from oracle output (handles markdown wrapping).
pub(crate) fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in a markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
