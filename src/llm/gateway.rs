use super::*;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImage, ChatCompletionRequestMessageContentPartText,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Instant;

use crate::types::ChatRole;

/// OpenAI-compatible hosted gateway (chat completions over HTTPS).
///
/// Requests are built with the async-openai types and sent with reqwest so the
/// HTTP status stays visible: 429 and 402 mean different things to callers.
pub struct GatewayProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GatewayProvider {
    pub fn new(base_url: String, api_key: String, model: String) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(
        &self,
        body: &CreateChatCompletionRequest,
        timeout: Duration,
    ) -> LlmResult<reqwest::Response> {
        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(self.completions_url())
                .bearer_auth(&self.api_key)
                .json(body)
                .send(),
        )
        .await
        .map_err(|_| LlmError::Timeout(timeout))?
        .map_err(|e| LlmError::ApiError(e.to_string()))?;

        check_status(response).await
    }
}

/// Turn gateway error statuses into the matching `LlmError`
pub(crate) async fn check_status(response: reqwest::Response) -> LlmResult<reqwest::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::TOO_MANY_REQUESTS => Err(LlmError::RateLimit),
        StatusCode::PAYMENT_REQUIRED => Err(LlmError::InsufficientCredits),
        status => {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("AI gateway error: {} {}", status, body);
            Err(LlmError::ApiError(format!("gateway returned {}", status)))
        }
    }
}

fn system_message(content: &str) -> LlmResult<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(content)
        .build()
        .map_err(|e| LlmError::ApiError(e.to_string()))?
        .into())
}

/// User turn with the prompt text followed by every attached image
fn user_message(prompt: &str, image_urls: &[String]) -> ChatCompletionRequestUserMessage {
    if image_urls.is_empty() {
        return ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
            name: None,
        };
    }

    let mut content_parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
    content_parts.push(ChatCompletionRequestUserMessageContentPart::Text(
        ChatCompletionRequestMessageContentPartText {
            text: prompt.to_string(),
        },
    ));
    for url in image_urls {
        content_parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
            ChatCompletionRequestMessageContentPartImage {
                image_url: ImageUrl {
                    url: url.clone(),
                    detail: Some(ImageDetail::Auto),
                },
            },
        ));
    }

    ChatCompletionRequestUserMessage {
        content: ChatCompletionRequestUserMessageContent::Array(content_parts),
        name: None,
    }
}

fn conversation_message(message: &ChatMessage) -> LlmResult<ChatCompletionRequestMessage> {
    match message.role {
        ChatRole::System => system_message(&message.content),
        ChatRole::User => Ok(user_message(&message.content, &[]).into()),
        ChatRole::Assistant => Ok(ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?
            .into()),
    }
}

// Gateways in front of non-OpenAI models omit fields the typed async-openai
// response requires, so only the fields read here are decoded.
#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    total_tokens: Option<u32>,
}

#[async_trait]
impl LlmProvider for GatewayProvider {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse> {
        let start = Instant::now();

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(system_message(system)?);
        }
        messages.push(user_message(&request.prompt, &request.image_urls).into());

        let mut req_builder = CreateChatCompletionRequestArgs::default();
        req_builder.model(&self.model).messages(messages);
        if let Some(max_tokens) = request.max_tokens {
            req_builder.max_tokens(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            req_builder.temperature(temperature);
        }
        let chat_request = req_builder
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let response = self.post(&chat_request, request.timeout).await?;
        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ParseError("No content in response".to_string()))?;

        Ok(GenerateResponse {
            text: text.trim().to_string(),
            metadata: ResponseMetadata {
                provider: "gateway".to_string(),
                model: self.model.clone(),
                tokens_used: body.usage.and_then(|u| u.total_tokens),
                latency_ms: start.elapsed().as_millis() as u64,
            },
        })
    }

    async fn stream_chat(&self, request: ChatRequest) -> LlmResult<ByteStream> {
        let mut messages = vec![system_message(&request.system_prompt)?];
        for message in &request.messages {
            messages.push(conversation_message(message)?);
        }

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(true)
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let response = self.post(&chat_request, request.timeout).await?;
        tracing::debug!("Guide chat stream opened on {}", self.model);

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| LlmError::ApiError(e.to_string())))
            .boxed())
    }

    fn name(&self) -> &str {
        "gateway"
    }

    fn supports_vision(&self) -> bool {
        // Gemini and GPT-4o class models behind the gateway all accept images
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_puts_text_before_images() {
        let message = user_message(
            "compare",
            &["https://a/1.jpg".to_string(), "https://a/2.jpg".to_string()],
        );
        match message.content {
            ChatCompletionRequestUserMessageContent::Array(parts) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(
                    parts[0],
                    ChatCompletionRequestUserMessageContentPart::Text(_)
                ));
                assert!(matches!(
                    parts[2],
                    ChatCompletionRequestUserMessageContentPart::ImageUrl(_)
                ));
            }
            _ => panic!("expected multimodal content"),
        }
    }

    #[test]
    fn test_completion_body_tolerates_sparse_payload() {
        let body: CompletionBody =
            serde_json::from_str(r#"{"choices":[{"message":{"content":" 0.85 "}}]}"#).unwrap();
        assert_eq!(
            body.choices[0].message.content.as_deref(),
            Some(" 0.85 ")
        );
        assert!(body.usage.is_none());
    }

    fn response(status: u16) -> reqwest::Response {
        reqwest::Response::from(
            axum::http::Response::builder()
                .status(status)
                .body("{\"error\":\"upstream\"}")
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_check_status_maps_quota_and_rate_limit() {
        assert!(matches!(
            check_status(response(429)).await,
            Err(LlmError::RateLimit)
        ));
        assert!(matches!(
            check_status(response(402)).await,
            Err(LlmError::InsufficientCredits)
        ));
        assert!(matches!(
            check_status(response(500)).await,
            Err(LlmError::ApiError(msg)) if msg.contains("500")
        ));
        assert!(check_status(response(200)).await.is_ok());
    }

    #[tokio::test]
    #[ignore] // Only run with an actual gateway key
    async fn test_gateway_generate() {
        let api_key = std::env::var("AI_GATEWAY_API_KEY").expect("AI_GATEWAY_API_KEY not set");
        let provider = GatewayProvider::new(
            "https://ai.gateway.lovable.dev/v1".to_string(),
            api_key,
            "google/gemini-2.5-flash".to_string(),
        )
        .unwrap();

        let response = provider
            .generate(GenerateRequest {
                system_prompt: None,
                prompt: "Réponds par un seul mot : bonjour".to_string(),
                image_urls: vec![],
                max_tokens: Some(20),
                temperature: None,
                timeout: Duration::from_secs(30),
            })
            .await
            .unwrap();

        assert!(!response.text.is_empty());
        assert_eq!(response.metadata.provider, "gateway");
    }
}
