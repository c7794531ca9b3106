use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::types::{CompletionClient, VisionClient};
use super::CompletionError;
use crate::config::ModelConfig;

/// Ollama HTTP client for local completion and vision models.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, CompletionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CompletionError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, CompletionError> {
        Self::new(&config.base_url, config.timeout_secs)
    }

    pub fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().map_err(|e| self.map_send_error(e))?;
        let response = check_status(response)?;

        let parsed: OllamaTagsResponse = response
            .json()
            .map_err(|e| CompletionError::ResponseParsing(e.to_string()))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn map_send_error(&self, e: reqwest::Error) -> CompletionError {
        if e.is_connect() {
            CompletionError::OllamaConnection(self.base_url.clone())
        } else if e.is_timeout() {
            CompletionError::HttpClient(format!("Request timed out after {}s", self.timeout_secs))
        } else {
            CompletionError::HttpClient(e.to_string())
        }
    }
}

fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, CompletionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(CompletionError::OllamaError {
        status: status.as_u16(),
        body,
    })
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    /// Constrain output to valid JSON.
    format: &'a str,
    options: GenerationOptions,
}

/// Request body for Ollama /api/chat
#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: GenerationOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [String]>,
}

/// Deterministic decoding for repeatable repairs.
#[derive(Serialize)]
struct GenerationOptions {
    temperature: f32,
}

const DETERMINISTIC: GenerationOptions = GenerationOptions { temperature: 0.0 };

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatMessage,
}

#[derive(Deserialize)]
struct OllamaChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

impl CompletionClient for OllamaClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, CompletionError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model,
            prompt,
            system,
            stream: false,
            format: "json",
            options: DETERMINISTIC,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        let response = check_status(response)?;

        let parsed: OllamaGenerateResponse = response
            .json()
            .map_err(|e| CompletionError::ResponseParsing(e.to_string()))?;
        Ok(parsed.response)
    }

    fn is_model_available(&self, model: &str) -> Result<bool, CompletionError> {
        let models = self.list_models()?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }
}

impl VisionClient for OllamaClient {
    fn chat_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
        system: Option<&str>,
    ) -> Result<String, CompletionError> {
        let url = format!("{}/api/chat", self.base_url);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
                images: None,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
            images: Some(images),
        });

        let body = OllamaChatRequest {
            model,
            messages,
            stream: false,
            options: DETERMINISTIC,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        let response = check_status(response)?;

        let parsed: OllamaChatResponse = response
            .json()
            .map_err(|e| CompletionError::ResponseParsing(e.to_string()))?;
        Ok(parsed.message.content)
    }
}

// ──────────────────────────────────────────────
// Mocks
// ──────────────────────────────────────────────

type Responder = Box<dyn Fn(&str) -> Result<String, CompletionError> + Send + Sync>;

/// Mock completion client for testing. Answers every prompt through a
/// closure and counts calls.
pub struct MockCompletionClient {
    responder: Responder,
    available_models: Vec<String>,
    calls: AtomicUsize,
}

impl MockCompletionClient {
    pub fn new(response: &str) -> Self {
        let response = response.to_string();
        Self::from_fn(move |_| Ok(response.clone()))
    }

    pub fn from_fn(
        f: impl Fn(&str) -> Result<String, CompletionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(f),
            available_models: vec!["qwen2.5:14b".to_string(), "qwen2.5:7b".to_string()],
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails as if Ollama were down.
    pub fn unreachable() -> Self {
        Self::from_fn(|_| Err(CompletionError::OllamaConnection("http://localhost:11434".into())))
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.available_models = models;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CompletionClient for MockCompletionClient {
    fn generate(
        &self,
        _model: &str,
        prompt: &str,
        _system: &str,
    ) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(prompt)
    }

    fn is_model_available(&self, model: &str) -> Result<bool, CompletionError> {
        Ok(self.available_models.iter().any(|m| m.starts_with(model)))
    }
}

/// Mock vision client returning a fixed transcription.
pub struct MockVisionClient {
    response: String,
}

impl MockVisionClient {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
        }
    }
}

impl VisionClient for MockVisionClient {
    fn chat_with_images(
        &self,
        _model: &str,
        _prompt: &str,
        _images: &[String],
        _system: Option<&str>,
    ) -> Result<String, CompletionError> {
        Ok(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_client_returns_configured_response() {
        let client = MockCompletionClient::new("{\"headers\": []}");
        assert_eq!(client.generate("m", "p", "s").unwrap(), "{\"headers\": []}");
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn mock_client_answers_per_prompt() {
        let client = MockCompletionClient::from_fn(|prompt| {
            Ok(if prompt.contains("section 80") { "yes" } else { "no" }.to_string())
        });
        assert_eq!(client.generate("m", "find section 80", "").unwrap(), "yes");
        assert_eq!(client.generate("m", "find section 81", "").unwrap(), "no");
    }

    #[test]
    fn unreachable_mock_reports_connection_error() {
        let client = MockCompletionClient::unreachable();
        assert!(matches!(
            client.generate("m", "p", "s"),
            Err(CompletionError::OllamaConnection(_))
        ));
    }

    #[test]
    fn mock_client_model_availability() {
        let client = MockCompletionClient::new("").with_models(vec!["llama3:8b".into()]);
        assert!(client.is_model_available("llama3").unwrap());
        assert!(!client.is_model_available("qwen2.5").unwrap());
    }

    #[test]
    fn ollama_client_trims_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/", 60).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.timeout_secs, 60);
    }

    #[test]
    fn ollama_client_from_config() {
        let client = OllamaClient::from_config(&ModelConfig::default()).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.timeout_secs, 120);
    }

    #[test]
    fn unreachable_server_maps_to_connection_error() {
        // Port 9 (discard) is closed on test machines.
        let client = OllamaClient::new("http://127.0.0.1:9", 2).unwrap();
        let err = client.generate("m", "p", "s").unwrap_err();
        assert!(
            matches!(err, CompletionError::OllamaConnection(_) | CompletionError::HttpClient(_)),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn chat_request_serializes_images_only_for_user() {
        let images = vec!["aGVsbG8=".to_string()];
        let body = OllamaChatRequest {
            model: "llama3.2-vision",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "s",
                    images: None,
                },
                ChatMessage {
                    role: "user",
                    content: "u",
                    images: Some(&images),
                },
            ],
            stream: false,
            options: DETERMINISTIC,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["messages"][0].get("images").is_none());
        assert_eq!(json["messages"][1]["images"][0], "aGVsbG8=");
        assert_eq!(json["options"]["temperature"], 0.0);
    }
}
