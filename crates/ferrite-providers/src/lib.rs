use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// The one interface the core consumes. Legacy providers are adapted here at
/// construction, never at call sites.
#[async_trait]
pub trait Llm: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;

    async fn generate_messages(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.generate(&prompt).await
    }
}

/// Typed provider configuration; every recognized option is enumerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_s: u64,
    pub max_retries: u32,
    pub retry_backoff_s: u64,
    pub max_prompt_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "stub".to_string(),
            api_key: None,
            base_url: None,
            model: None,
            timeout_s: 60,
            max_retries: 2,
            retry_backoff_s: 1,
            max_prompt_chars: 32_000,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let get = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Self {
            provider: get("LLM_PROVIDER").unwrap_or(defaults.provider),
            api_key: get("LLM_API_KEY"),
            base_url: get("LLM_BASE_URL"),
            model: get("LLM_MODEL"),
            timeout_s: get("LLM_TIMEOUT_S")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_s),
            max_retries: get("LLM_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_backoff_s: get("LLM_RETRY_BACKOFF_S")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_backoff_s),
            max_prompt_chars: get("LLM_MAX_PROMPT_CHARS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_prompt_chars),
        }
    }
}

/// Build the configured provider. Unknown provider names log and fall back
/// to the stub so a misconfigured deployment keeps serving.
pub fn build_llm(config: &LlmConfig) -> Arc<dyn Llm> {
    match config.provider.as_str() {
        "stub" => Arc::new(StubLlm::default()),
        "openai" => Arc::new(OpenAiCompatLlm::new(
            "openai",
            config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            config,
        )),
        "qwen" => Arc::new(OpenAiCompatLlm::new(
            "qwen",
            config.base_url.clone().unwrap_or_else(|| {
                "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
            }),
            config,
        )),
        "ollama" => Arc::new(OllamaLlm::new(config)),
        other => {
            tracing::warn!(provider = other, "unknown LLM provider, using stub");
            Arc::new(StubLlm::default())
        }
    }
}

pub fn build_llm_from_env() -> Arc<dyn Llm> {
    build_llm(&LlmConfig::from_env())
}

/// Deterministic provider for tests and offline operation.
#[derive(Debug, Default, Clone)]
pub struct StubLlm;

#[async_trait]
impl Llm for StubLlm {
    fn provider_id(&self) -> &str {
        "stub"
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let head: String = prompt.chars().take(120).collect();
        Ok(format!("[stub] {head}"))
    }
}

fn clip_prompt(prompt: &str, max_chars: usize) -> String {
    if prompt.chars().count() <= max_chars {
        return prompt.to_string();
    }
    prompt.chars().take(max_chars).collect()
}

/// OpenAI-compatible chat completion client (`openai`, `qwen`).
pub struct OpenAiCompatLlm {
    provider_id: &'static str,
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
    max_retries: u32,
    retry_backoff_s: u64,
    max_prompt_chars: usize,
}

impl OpenAiCompatLlm {
    fn new(provider_id: &'static str, base_url: String, config: &LlmConfig) -> Self {
        Self {
            provider_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_s))
                .build()
                .unwrap_or_default(),
            max_retries: config.max_retries,
            retry_backoff_s: config.retry_backoff_s,
            max_prompt_chars: config.max_prompt_chars,
        }
    }

    async fn chat(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(
                    self.retry_backoff_s * u64::from(attempt),
                ))
                .await;
            }
            let mut request = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .json(&body);
            if let Some(key) = self.api_key.as_deref() {
                request = request.bearer_auth(key);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(anyhow::anyhow!("HTTP {}", resp.status()));
                }
                Ok(resp) => {
                    let resp = resp.error_for_status()?;
                    let value: serde_json::Value = resp.json().await?;
                    let content = value["choices"][0]["message"]["content"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    return Ok(content);
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    last_err = Some(err.into());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("llm request failed")))
    }
}

#[async_trait]
impl Llm for OpenAiCompatLlm {
    fn provider_id(&self) -> &str {
        self.provider_id
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let clipped = clip_prompt(prompt, self.max_prompt_chars);
        self.chat(&[ChatMessage::new("user", clipped)]).await
    }

    async fn generate_messages(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        self.chat(messages).await
    }
}

/// Local Ollama generate endpoint.
pub struct OllamaLlm {
    base_url: String,
    model: String,
    client: Client,
    max_prompt_chars: usize,
}

impl OllamaLlm {
    fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone().unwrap_or_else(|| "llama3".to_string()),
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_s))
                .build()
                .unwrap_or_default(),
            max_prompt_chars: config.max_prompt_chars,
        }
    }
}

#[async_trait]
impl Llm for OllamaLlm {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let clipped = clip_prompt(prompt, self.max_prompt_chars);
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({"model": self.model, "prompt": clipped, "stream": false}))
            .send()
            .await?
            .error_for_status()?;
        let value: serde_json::Value = resp.json().await?;
        Ok(value["response"].as_str().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_is_deterministic() {
        let llm = StubLlm;
        let a = llm.generate("summarize this").await.unwrap();
        let b = llm.generate("summarize this").await.unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("[stub]"));
    }

    #[tokio::test]
    async fn generate_messages_defaults_to_joined_prompt() {
        let llm = StubLlm;
        let out = llm
            .generate_messages(&[
                ChatMessage::new("system", "be brief"),
                ChatMessage::new("user", "hello"),
            ])
            .await
            .unwrap();
        assert!(out.contains("system: be brief"));
    }

    #[test]
    fn unknown_provider_falls_back_to_stub() {
        let llm = build_llm(&LlmConfig {
            provider: "mystery".to_string(),
            ..LlmConfig::default()
        });
        assert_eq!(llm.provider_id(), "stub");
    }

    #[test]
    fn prompt_clipping_respects_char_limit() {
        let clipped = clip_prompt(&"x".repeat(100), 10);
        assert_eq!(clipped.len(), 10);
    }
}
