use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::RuleError;
use crate::models::FieldValue;

// --- Provider trait ---

pub trait LlmProvider: Send + Sync {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenRouter,
    OpenAI,
    Anthropic,
}

impl ProviderKind {
    /// Environment variable holding the API key for this provider.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub const DEFAULT_MODEL: &str = "mistral-small";

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    let spec = |provider, model_id: &str, short_name: &str| ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    };

    match name {
        // OpenRouter (requires OPENROUTER_API_KEY)
        "mistral-small" | "mistral" => Ok(spec(
            ProviderKind::OpenRouter,
            "mistralai/mistral-small-3.2-24b-instruct:free",
            "mistral-small",
        )),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o" => Ok(spec(ProviderKind::OpenAI, "gpt-4o", "gpt-4o")),
        "gpt-4o-mini" => Ok(spec(ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini")),
        // Direct Anthropic API (requires ANTHROPIC_API_KEY)
        "api-haiku" | "haiku" => Ok(spec(
            ProviderKind::Anthropic,
            "claude-haiku-4-5-20251001",
            "api-haiku",
        )),
        "api-sonnet" | "sonnet" => Ok(spec(
            ProviderKind::Anthropic,
            "claude-sonnet-4-5-20250929",
            "api-sonnet",
        )),
        // Raw OpenRouter model ids look like "vendor/model"
        raw if raw.contains('/') => Ok(spec(ProviderKind::OpenRouter, raw, raw)),
        _ => Err(anyhow!(
            "Unknown model '{}'. Available: mistral-small (default), gpt-4o, gpt-4o-mini, \
             api-haiku, api-sonnet, or any OpenRouter model id (vendor/model)",
            name
        )),
    }
}

pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.model.provider {
        ProviderKind::OpenRouter => Ok(Box::new(OpenAICompatibleProvider::new(
            config,
            OPENROUTER_API_URL,
        )?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAICompatibleProvider::new(
            config,
            OPENAI_API_URL,
        )?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(config)?)),
    }
}

// --- Shared HTTP plumbing ---

/// Request body shared by the Messages and Chat Completions APIs.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [UserMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> CompletionRequest<'a> {
    fn single_turn(model: &'a str, prompt: &'a str, max_tokens: u32) -> Self {
        Self {
            model,
            max_tokens,
            messages: [UserMessage {
                role: "user",
                content: prompt,
            }],
        }
    }
}

/// One provider URL plus the credentials and client used to call it.
#[derive(Debug)]
struct Endpoint {
    kind: ProviderKind,
    url: String,
    api_key: Option<String>,
    model_id: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl Endpoint {
    fn new(config: &LlmConfig, url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            kind: config.model.provider,
            url: url.into(),
            api_key: config.api_key.clone(),
            model_id: config.model.model_id.clone(),
            timeout: config.timeout,
            client,
        })
    }

    /// Key presence is checked per request so a missing key only matters once
    /// an LLM condition is actually evaluated.
    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("{} environment variable not set", self.kind.api_key_var()))
    }

    fn label(&self) -> &'static str {
        match self.kind {
            ProviderKind::OpenRouter => "OpenRouter API",
            ProviderKind::OpenAI => "OpenAI API",
            ProviderKind::Anthropic => "Anthropic API",
        }
    }

    /// Posts one single-turn completion and decodes the JSON reply.
    fn post_completion<R: DeserializeOwned>(&self, prompt: &str, max_tokens: u32) -> Result<R> {
        let api_key = self.api_key()?;
        let body = CompletionRequest::single_turn(&self.model_id, prompt, max_tokens);

        let request = match self.kind {
            ProviderKind::Anthropic => self
                .client
                .post(&self.url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ProviderKind::OpenAI | ProviderKind::OpenRouter => self.client.post(&self.url).bearer_auth(api_key),
        };

        let response = request.json(&body).send().map_err(|err| {
            if err.is_timeout() {
                anyhow!("{} request timed out after {:?}", self.label(), self.timeout)
            } else {
                anyhow!(err).context(format!("Failed to send request to {}", self.label()))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "{} request failed with status {}: {}",
                self.label(),
                status,
                error_text
            ));
        }

        response
            .json()
            .with_context(|| format!("Failed to parse {} response", self.label()))
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

/// Joins the text blocks of a Messages reply, ignoring other block types.
fn extract_message_text(response: MessagesResponse) -> Result<String> {
    let text: Vec<String> = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .map(|block| block.text)
        .collect();
    if text.is_empty() {
        return Err(anyhow!("No text content in Anthropic API response"));
    }
    Ok(text.concat())
}

#[derive(Debug)]
pub struct AnthropicProvider {
    endpoint: Endpoint,
}

impl AnthropicProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(config, ANTHROPIC_API_URL)?,
        })
    }
}

impl LlmProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        extract_message_text(self.endpoint.post_completion(prompt, max_tokens)?)
    }

    fn model_name(&self) -> &str {
        &self.endpoint.model_id
    }
}

// --- OpenAI-compatible provider (OpenAI and OpenRouter) ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    // Some OpenRouter backends answer in `text` instead of `content`
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

fn extract_choice_text(response: ChatResponse) -> Result<String> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No choices in chat completion response"))?;
    choice
        .message
        .content
        .or(choice.message.text)
        .ok_or_else(|| anyhow!("Empty message in chat completion response"))
}

#[derive(Debug)]
pub struct OpenAICompatibleProvider {
    endpoint: Endpoint,
}

impl OpenAICompatibleProvider {
    pub fn new(config: &LlmConfig, url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(config, url)?,
        })
    }
}

impl LlmProvider for OpenAICompatibleProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        extract_choice_text(self.endpoint.post_completion(prompt, max_tokens)?)
    }

    fn model_name(&self) -> &str {
        &self.endpoint.model_id
    }
}

// --- LLM predicate resolution ---

const PREDICATE_MAX_TOKENS: u32 = 32;

pub fn build_predicate_prompt(question: &str, target_object: &str, value: &FieldValue) -> String {
    format!(
        "Context:\n{}: {}\n\nQuestion: {}\nAnswer with \"true\" or \"false\" only.",
        target_object, value, question
    )
}

/// Strict reading of a yes/no answer.
pub fn parse_boolean_answer(answer: &str) -> Result<bool, RuleError> {
    let normalized = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim_end_matches(|c: char| c == '.' || c == '!')
        .trim()
        .to_lowercase();

    match normalized.as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(RuleError::LlmResponseUnparseable(answer.to_string())),
    }
}

/// Answers yes/no questions about a company field through an [`LlmProvider`].
/// No caching and no retries happen here.
#[derive(Clone, Copy)]
pub struct LlmResolver<'a> {
    provider: &'a dyn LlmProvider,
}

impl<'a> LlmResolver<'a> {
    pub fn new(provider: &'a dyn LlmProvider) -> Self {
        Self { provider }
    }

    pub fn ask(
        &self,
        question: &str,
        target_object: &str,
        value: &FieldValue,
    ) -> Result<bool, RuleError> {
        let prompt = build_predicate_prompt(question, target_object, value);
        debug!(model = self.provider.model_name(), target_object, "asking LLM predicate");
        let answer = self
            .provider
            .complete(&prompt, PREDICATE_MAX_TOKENS)
            .map_err(|err| RuleError::LlmProviderError(format!("{:#}", err)))?;
        parse_boolean_answer(&answer)
    }
}
