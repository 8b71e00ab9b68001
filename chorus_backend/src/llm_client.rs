//! Text and image generation over the OpenAI-compatible API
//! (Ollama, LM Studio, vLLM, OpenAI, ...).

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::messaging::ImageData;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("generation backend unreachable: {0}")]
    Connectivity(String),
    #[error("generation backend rate limited: {0}")]
    RateLimit(String),
    #[error("generation failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 800,
        }
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;

    async fn generate_image(&self, prompt: &str, size: &str) -> Result<ImageData, GenerationError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    n: u32,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    image_model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        image_model: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            image_model: image_model.into(),
            client,
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, GenerationError>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.api_url, path);
        let mut req = self.client.post(&url).json(body);

        // Local models don't need a key
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(map_status_error(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GenerationError::Other(format!("failed to parse response: {}", e)))
    }
}

#[async_trait]
impl GenerationBackend for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let completion: ChatCompletionResponse =
            self.post_json("chat/completions", &request).await?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| strip_reasoning(&c))
            .unwrap_or_default();

        if content.is_empty() {
            return Err(GenerationError::Other("empty completion".to_string()));
        }
        Ok(content)
    }

    async fn generate_image(&self, prompt: &str, size: &str) -> Result<ImageData, GenerationError> {
        let request = ImageRequest {
            model: &self.image_model,
            prompt,
            size,
            n: 1,
        };
        let response: ImageResponse = self.post_json("images/generations", &request).await?;
        let datum = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::Other("no image returned".to_string()))?;
        decode_image(datum)
    }
}

fn decode_image(datum: ImageDatum) -> Result<ImageData, GenerationError> {
    if let Some(encoded) = datum.b64_json {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| GenerationError::Other(format!("invalid image payload: {}", e)))?;
        return Ok(ImageData::Bytes {
            data,
            mime: "image/png".to_string(),
        });
    }
    match datum.url {
        Some(url) => Ok(ImageData::Url(url)),
        None => Err(GenerationError::Other(
            "image response had neither url nor b64_json".to_string(),
        )),
    }
}

/// Drop a leading `<think>...</think>` block some local models emit.
fn strip_reasoning(content: &str) -> String {
    let visible = match content.rfind("</think>") {
        Some(end) => &content[end + "</think>".len()..],
        None => content,
    };
    visible.trim().to_string()
}

fn map_transport_error(e: reqwest::Error) -> GenerationError {
    if e.is_connect() || e.is_timeout() {
        GenerationError::Connectivity(e.to_string())
    } else {
        GenerationError::Other(e.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &str) -> GenerationError {
    let detail: String = body.chars().take(300).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimit(detail),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            GenerationError::Connectivity(format!("HTTP {}: {}", status, detail))
        }
        _ => GenerationError::Other(format!("HTTP {}: {}", status, detail)),
    }
}
