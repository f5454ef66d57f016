//! Completion providers: `complete(prompt) -> text`.
//!
//! Completions are never retried: trigger detection runs exactly once per
//! successful completion.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmProviderError;
use crate::http::{build_client, send_json, Auth, HttpFailure};

/// A large language model consumed as an opaque capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt`. An empty completion is an error.
    async fn complete(&self, prompt: &str) -> Result<String, LlmProviderError>;
}

/// Always fails; used when no completion provider is configured.
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &str) -> Result<String, LlmProviderError> {
        Err(LlmProviderError::Disabled)
    }
}

#[derive(Debug, Clone, Copy)]
enum Dialect {
    OpenAi,
    Ollama,
    Gemini,
}

impl Dialect {
    fn name(self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Ollama => "ollama",
            Dialect::Gemini => "gemini",
        }
    }
}

/// A completion provider reached over HTTP.
pub struct RemoteModel {
    dialect: Dialect,
    model: String,
    base: String,
    temperature: f32,
    timeout_secs: u64,
}

impl RemoteModel {
    fn new(dialect: Dialect, config: &LlmConfig, default_base: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for {} provider", dialect.name()))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        Ok(Self {
            dialect,
            model,
            base: base.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }

    fn provider(&self) -> String {
        self.dialect.name().to_string()
    }

    fn map_failure(&self, failure: HttpFailure) -> LlmProviderError {
        let provider = self.provider();
        match failure {
            HttpFailure::Timeout => LlmProviderError::Timeout {
                provider,
                secs: self.timeout_secs,
            },
            HttpFailure::Status { status, body } => LlmProviderError::Http {
                provider,
                status,
                body,
            },
            HttpFailure::Network(message) => LlmProviderError::Network { provider, message },
            HttpFailure::Decode(message) => LlmProviderError::InvalidResponse { provider, message },
        }
    }

    fn api_key(&self, var: &str) -> Result<String, LlmProviderError> {
        std::env::var(var).map_err(|_| LlmProviderError::Auth {
            provider: self.provider(),
            message: format!("{} environment variable not set", var),
        })
    }

    fn invalid(&self, message: &str) -> LlmProviderError {
        LlmProviderError::InvalidResponse {
            provider: self.provider(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl LanguageModel for RemoteModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmProviderError> {
        let client = build_client(self.timeout_secs).map_err(|f| self.map_failure(f))?;

        let request = match self.dialect {
            Dialect::OpenAi => {
                let api_key = self.api_key("OPENAI_API_KEY")?;
                client
                    .post(format!("{}/v1/chat/completions", self.base))
                    .bearer_auth(api_key)
                    .json(&serde_json::json!({
                        "model": self.model,
                        "messages": [{ "role": "user", "content": prompt }],
                        "temperature": self.temperature,
                    }))
            }
            Dialect::Ollama => client
                .post(format!("{}/api/generate", self.base))
                .json(&serde_json::json!({
                    "model": self.model,
                    "prompt": prompt,
                    "stream": false,
                    "options": { "temperature": self.temperature },
                })),
            Dialect::Gemini => {
                let api_key = self.api_key("GOOGLE_API_KEY")?;
                let model = if self.model.starts_with("models/") {
                    self.model.clone()
                } else {
                    format!("models/{}", self.model)
                };
                Auth::GoogleApiKey(&api_key).apply(
                    client
                        .post(format!("{}/v1beta/{}:generateContent", self.base, model))
                        .json(&serde_json::json!({
                            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
                            "generationConfig": { "temperature": self.temperature },
                        })),
                )
            }
        };

        let json = send_json(request).await.map_err(|f| self.map_failure(f))?;
        let text = match self.dialect {
            Dialect::OpenAi => parse_openai_completion(&json),
            Dialect::Ollama => json
                .get("response")
                .and_then(|r| r.as_str())
                .map(str::to_string),
            Dialect::Gemini => parse_gemini_completion(&json),
        }
        .ok_or_else(|| self.invalid("missing completion text"))?;

        if text.trim().is_empty() {
            return Err(self.invalid("empty completion"));
        }
        Ok(text)
    }
}

fn parse_openai_completion(json: &serde_json::Value) -> Option<String> {
    json.get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// Concatenate the text parts of the first candidate.
fn parse_gemini_completion(json: &serde_json::Value) -> Option<String> {
    let parts = json
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    Some(text)
}

/// Create the [`LanguageModel`] named by `llm.provider`.
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(RemoteModel::new(
            Dialect::OpenAi,
            config,
            "https://api.openai.com",
        )?)),
        "ollama" => Ok(Arc::new(RemoteModel::new(
            Dialect::Ollama,
            config,
            "http://localhost:11434",
        )?)),
        "gemini" => Ok(Arc::new(RemoteModel::new(
            Dialect::Gemini,
            config,
            "https://generativelanguage.googleapis.com",
        )?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_completion() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hello!" } }]
        });
        assert_eq!(parse_openai_completion(&json).as_deref(), Some("Hello!"));
        assert_eq!(parse_openai_completion(&serde_json::json!({ "choices": [] })), None);
    }

    #[test]
    fn parses_gemini_parts() {
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hostel fee is " }, { "text": "45000." }] }
            }]
        });
        assert_eq!(
            parse_gemini_completion(&json).as_deref(),
            Some("Hostel fee is 45000.")
        );
    }

    #[test]
    fn remote_provider_requires_model() {
        let config = LlmConfig {
            provider: "ollama".to_string(),
            ..LlmConfig::default()
        };
        assert!(create_language_model(&config).is_err());
    }

    #[test]
    fn unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "carrier-pigeon".to_string(),
            ..LlmConfig::default()
        };
        assert!(create_language_model(&config).is_err());
    }

    #[tokio::test]
    async fn gemini_errors_do_not_carry_the_api_key() {
        std::env::set_var("GOOGLE_API_KEY", "test-google-key-4821");
        let config = LlmConfig {
            provider: "gemini".to_string(),
            model: Some("gemini-2.5-flash".to_string()),
            url: Some("http://127.0.0.1:1".to_string()),
            ..LlmConfig::default()
        };
        let model = create_language_model(&config).unwrap();
        let err = model.complete("hi").await.unwrap_err();
        assert!(matches!(err, LlmProviderError::Network { .. }), "{:?}", err);
        let message = err.to_string();
        assert!(!message.contains("test-google-key-4821"), "{}", message);
        assert!(!message.contains("?key="), "{}", message);
    }

    #[tokio::test]
    async fn disabled_model_fails() {
        let err = DisabledModel.complete("hi").await.unwrap_err();
        assert!(matches!(err, LlmProviderError::Disabled));
    }
}
