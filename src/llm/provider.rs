use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{VisionConfig, VisionProviderType};
use crate::error::AnalysisError;

/// An image ready to send: base64 data plus its media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub base64: String,
    pub media_type: &'static str,
}

/// A model endpoint that answers a text prompt about one image.
pub trait VisionBackend: Send + Sync {
    /// Send one request and return the model's raw text answer.
    fn analyze(&self, image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError>;

    /// Get the backend name for display
    fn backend_name(&self) -> &'static str;
}

/// Generation settings shared by every backend.
#[derive(Debug, Clone)]
struct Generation {
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl Generation {
    fn from_config(config: &VisionConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new().timeout(self.timeout).build()
    }
}

/// Sort an HTTP failure into retryable or not. Rate limits, server errors
/// and transport problems are worth another try; anything else is the
/// request's fault.
pub(crate) fn map_http_error(err: ureq::Error, backend: &str) -> AnalysisError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let detail = format!("{} returned HTTP {}: {}", backend, code, body.trim());
            match code {
                408 | 429 | 500..=599 => AnalysisError::Unavailable(detail),
                _ => AnalysisError::Rejected(detail),
            }
        }
        ureq::Error::Transport(t) => AnalysisError::Unavailable(format!("{}: {}", backend, t)),
    }
}

fn malformed(backend: &str, e: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::MalformedResponse(format!("{} response unreadable: {}", backend, e))
}

// ============================================================================
// OpenAI-compatible backend (LM Studio, OpenAI and compatible APIs)
// ============================================================================

pub struct OpenAICompatibleBackend {
    endpoint: String,
    api_key: Option<String>,
    generation: Generation,
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAIContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAICompatibleBackend {
    fn new(endpoint: &str, api_key: Option<&str>, generation: Generation) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
            generation,
        }
    }
}

impl VisionBackend for OpenAICompatibleBackend {
    fn analyze(&self, image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError> {
        let data_url = format!("data:{};base64,{}", image.media_type, image.base64);

        let request = OpenAIChatRequest {
            model: self.generation.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: vec![
                    OpenAIContentPart::Text {
                        text: prompt.to_string(),
                    },
                    OpenAIContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: self.generation.max_tokens,
            temperature: self.generation.temperature,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = self
            .generation
            .agent()
            .post(&url)
            .set("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        let response = req
            .send_json(&request)
            .map_err(|e| map_http_error(e, self.backend_name()))?;

        let chat_response: OpenAIChatResponse = response
            .into_json()
            .map_err(|e| malformed(self.backend_name(), e))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AnalysisError::MalformedResponse("no choices in response".to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "OpenAI-compatible"
    }
}

// ============================================================================
// Anthropic Claude backend
// ============================================================================

pub struct AnthropicBackend {
    api_key: String,
    generation: Generation,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseContent {
    text: Option<String>,
}

impl AnthropicBackend {
    fn new(api_key: &str, generation: Generation) -> Self {
        Self {
            api_key: api_key.to_string(),
            generation,
        }
    }
}

impl VisionBackend for AnthropicBackend {
    fn analyze(&self, image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError> {
        if self.api_key.is_empty() {
            return Err(AnalysisError::Rejected(
                "no Anthropic API key configured".to_string(),
            ));
        }

        let request = AnthropicRequest {
            model: self.generation.model.clone(),
            max_tokens: self.generation.max_tokens,
            temperature: self.generation.temperature,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: vec![
                    AnthropicContent::Image {
                        source: AnthropicImageSource {
                            source_type: "base64".to_string(),
                            media_type: image.media_type.to_string(),
                            data: image.base64.clone(),
                        },
                    },
                    AnthropicContent::Text {
                        text: prompt.to_string(),
                    },
                ],
            }],
        };

        let response = self
            .generation
            .agent()
            .post("https://api.anthropic.com/v1/messages")
            .set("Content-Type", "application/json")
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", "2023-06-01")
            .send_json(&request)
            .map_err(|e| map_http_error(e, self.backend_name()))?;

        let anthropic_response: AnthropicResponse = response
            .into_json()
            .map_err(|e| malformed(self.backend_name(), e))?;

        anthropic_response
            .content
            .into_iter()
            .find_map(|c| c.text)
            .ok_or_else(|| AnalysisError::MalformedResponse("no text in Anthropic response".to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "Anthropic Claude"
    }
}

// ============================================================================
// Ollama backend
// ============================================================================

pub struct OllamaBackend {
    endpoint: String,
    generation: Generation,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaBackend {
    fn new(endpoint: &str, generation: Generation) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            generation,
        }
    }
}

impl VisionBackend for OllamaBackend {
    fn analyze(&self, image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError> {
        let request = OllamaRequest {
            model: self.generation.model.clone(),
            prompt: prompt.to_string(),
            images: vec![image.base64.clone()],
            stream: false,
            options: OllamaOptions {
                temperature: self.generation.temperature,
                num_predict: self.generation.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.endpoint);

        let response = self
            .generation
            .agent()
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&request)
            .map_err(|e| map_http_error(e, self.backend_name()))?;

        let ollama_response: OllamaResponse = response
            .into_json()
            .map_err(|e| malformed(self.backend_name(), e))?;

        Ok(ollama_response.response)
    }

    fn backend_name(&self) -> &'static str {
        "Ollama"
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create a vision backend based on configuration
pub fn create_backend(config: &VisionConfig) -> Box<dyn VisionBackend> {
    let generation = Generation::from_config(config);

    match config.provider {
        VisionProviderType::LmStudio => Box::new(OpenAICompatibleBackend::new(
            &config.endpoint,
            config.api_key.as_deref(),
            generation,
        )),
        VisionProviderType::OpenAI => Box::new(OpenAICompatibleBackend::new(
            "https://api.openai.com/v1",
            config.api_key.as_deref(),
            generation,
        )),
        VisionProviderType::Anthropic => {
            let api_key = config.api_key.as_deref().unwrap_or("");
            Box::new(AnthropicBackend::new(api_key, generation))
        }
        VisionProviderType::Ollama => Box::new(OllamaBackend::new(&config.endpoint, generation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status = |code: u16| {
            let response = ureq::Response::new(code, "status", "body").unwrap();
            map_http_error(ureq::Error::Status(code, response), "test")
        };
        assert!(matches!(status(429), AnalysisError::Unavailable(_)));
        assert!(matches!(status(503), AnalysisError::Unavailable(_)));
        assert!(matches!(status(401), AnalysisError::Rejected(_)));
        assert!(matches!(status(402), AnalysisError::Rejected(_)));
        assert!(matches!(status(400), AnalysisError::Rejected(_)));
    }

    #[test]
    fn test_factory_picks_backend() {
        let mut config = VisionConfig::default();
        assert_eq!(create_backend(&config).backend_name(), "OpenAI-compatible");
        config.provider = VisionProviderType::Anthropic;
        assert_eq!(create_backend(&config).backend_name(), "Anthropic Claude");
        config.provider = VisionProviderType::Ollama;
        assert_eq!(create_backend(&config).backend_name(), "Ollama");
    }

    #[test]
    fn test_anthropic_without_key_is_rejected() {
        let mut config = VisionConfig::default();
        config.provider = VisionProviderType::Anthropic;
        let backend = create_backend(&config);
        let image = EncodedImage {
            base64: String::new(),
            media_type: "image/jpeg",
        };
        assert!(matches!(backend.analyze(&image, "hi"), Err(AnalysisError::Rejected(_))));
    }
}
