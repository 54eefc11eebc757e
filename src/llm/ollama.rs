use super::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Ollama provider implementation (local vision models for photo scoring)
pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
    /// Whether this model supports vision (e.g., llava, bakllava, moondream)
    supports_vision: bool,
}

impl OllamaProvider {
    /// Create a new Ollama provider with the given base URL and model
    pub fn new(base_url: String, model: String) -> LlmResult<Self> {
        let supports_vision = Self::is_vision_model(&model);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
            supports_vision,
        })
    }

    /// Check if a model name indicates vision support
    fn is_vision_model(model: &str) -> bool {
        let model_lower = model.to_lowercase();
        model_lower.contains("llava")
            || model_lower.contains("bakllava")
            || model_lower.contains("moondream")
            || model_lower.contains("minicpm-v")
            || model_lower.contains("qwen2-vl")
            || model_lower.contains("qwen2.5-vl")
    }

    /// Fetch image from URL and encode as base64
    async fn fetch_image_as_base64(&self, url: &str) -> LlmResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LlmError::ApiError(format!("Failed to fetch image: {}", e)))?;

        if !response.status().is_success() {
            return Err(LlmError::ApiError(format!(
                "Failed to fetch image, status: {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| LlmError::ApiError(format!("Failed to read image bytes: {}", e)))?;

        use base64::{engine::general_purpose::STANDARD, Engine as _};
        Ok(STANDARD.encode(&bytes))
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse> {
        let start = Instant::now();

        let images = if request.image_urls.is_empty() {
            None
        } else {
            if !self.supports_vision {
                return Err(LlmError::ConfigError(format!(
                    "Model {} does not support vision. Use a vision model like llava or moondream.",
                    self.model
                )));
            }

            // Ollama requires base64-encoded images
            let mut encoded = Vec::with_capacity(request.image_urls.len());
            for url in &request.image_urls {
                encoded.push(self.fetch_image_as_base64(url).await?);
            }
            Some(encoded)
        };

        let ollama_request = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: request.prompt,
            stream: false,
            system: request.system_prompt,
            options: Some(OllamaOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            }),
            images,
        };

        let url = format!("{}/api/generate", self.base_url);

        let response = tokio::time::timeout(
            request.timeout,
            self.client.post(&url).json(&ollama_request).send(),
        )
        .await
        .map_err(|_| LlmError::Timeout(request.timeout))?
        .map_err(|e| LlmError::ApiError(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimit);
        }
        if !response.status().is_success() {
            return Err(LlmError::ApiError(format!(
                "Ollama API returned status: {}",
                response.status()
            )));
        }

        let ollama_response: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        Ok(GenerateResponse {
            text: ollama_response.response.trim().to_string(),
            metadata: ResponseMetadata {
                provider: "ollama".to_string(),
                model: self.model.clone(),
                tokens_used: ollama_response.eval_count,
                latency_ms: start.elapsed().as_millis() as u64,
            },
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn supports_vision(&self) -> bool {
        self.supports_vision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_model_detection() {
        assert!(OllamaProvider::is_vision_model("llava:13b"));
        assert!(OllamaProvider::is_vision_model("Qwen2.5-VL"));
        assert!(!OllamaProvider::is_vision_model("llama3.2"));
    }

    #[tokio::test]
    async fn test_text_model_refuses_images() {
        let provider =
            OllamaProvider::new("http://localhost:11434".to_string(), "llama3.2".to_string())
                .unwrap();
        let result = provider
            .generate(GenerateRequest {
                system_prompt: None,
                prompt: "compare".to_string(),
                image_urls: vec!["http://localhost/a.jpg".to_string()],
                max_tokens: None,
                temperature: None,
                timeout: Duration::from_secs(1),
            })
            .await;
        assert!(matches!(result, Err(LlmError::ConfigError(_))));
    }

    #[tokio::test]
    #[ignore] // Only run with Ollama running locally
    async fn test_ollama_generate() {
        let provider =
            OllamaProvider::new("http://localhost:11434".to_string(), "llava".to_string()).unwrap();

        let request = GenerateRequest {
            system_prompt: None,
            prompt: "Say hello in French".to_string(),
            image_urls: vec![],
            max_tokens: Some(20),
            temperature: None,
            timeout: Duration::from_secs(30),
        };

        let response = provider.generate(request).await.unwrap();

        assert!(!response.text.is_empty());
        assert_eq!(response.metadata.provider, "ollama");
    }
}
