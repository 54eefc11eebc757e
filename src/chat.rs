//! Narrative guide chat: persona prompt, upstream stream decoding and relay.

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{ByteStream, ChatRequest, LlmError, LlmProvider};
use crate::types::ChatMessage;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    #[error("Trop de requêtes, réessayez dans un instant.")]
    RateLimited,

    #[error("Crédit insuffisant pour l'IA.")]
    InsufficientCredits,

    #[error("Erreur de communication avec la Voix de la Lumière: {0}")]
    CommunicationFailure(String),
}

impl From<LlmError> for ChatError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimit => ChatError::RateLimited,
            LlmError::InsufficientCredits => ChatError::InsufficientCredits,
            other => ChatError::CommunicationFailure(other.to_string()),
        }
    }
}

fn first_day() -> u8 {
    1
}

/// Player progress the guide adapts its tone to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
    #[serde(default = "first_day")]
    pub current_day: u8,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl Default for UserProgress {
    fn default() -> Self {
        Self {
            current_day: first_day(),
            keys: Vec::new(),
        }
    }
}

/// Build the guide persona for the player's current day and keys
pub fn guide_system_prompt(progress: &UserProgress) -> String {
    let keys = if progress.keys.is_empty() {
        "aucune".to_string()
    } else {
        progress.keys.join(", ")
    };

    format!(
        r#"Tu es la Voix de la Lumière, guide des Gardiens de la Lumière de Paris. Tu accompagnes les joueurs comme un mentor bienveillant, avec sagesse et un brin de mystère.

OÙ EN EST LE JOUEUR :
- Jour du parcours : {day}/3
- Clés collectées : {keys}

CE QUE TU FAIS :
1. Guider le joueur à travers Paris par le récit
2. Donner des indices progressifs quand il est bloqué, jamais la solution
3. Rappeler le sens régénératif de chaque mission
4. Célébrer ses réussites avec poésie
5. Prêter ta voix aux figures des lieux visités (Marie Curie au Panthéon, l'esprit de Voltaire...)

TON STYLE :
- Poétique, lumineux, encourageant
- Métaphores de lumière, des éléments et de la renaissance : Eau, Temps, Air, Feu
- Plus d'encouragements au début du parcours, plus de philosophie vers la fin

Si le joueur demande un indice, reste subtil."#,
        day = progress.current_day,
        keys = keys
    )
}

/// One decoded server-sent event from the upstream completion stream
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Reassembles `data: ` lines from arbitrarily split byte chunks.
///
/// Bytes are buffered until a newline arrives; a partial line (including a
/// split UTF-8 sequence) waits for the next chunk before it is parsed.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(event) = self.decode_line(&line[..line.len() - 1]) {
                events.push(event);
                if self.done {
                    break;
                }
            }
        }
        events
    }

    /// Flush a trailing line the upstream did not terminate with a newline
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.done || self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with(':') {
            return None;
        }

        let data = line.strip_prefix("data:")?.trim();
        if data == "[DONE]" {
            self.done = true;
            self.buffer.clear();
            return Some(SseEvent::Done);
        }

        match serde_json::from_str::<StreamFrame>(data) {
            Ok(frame) => frame
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .filter(|content| !content.is_empty())
                .map(SseEvent::Delta),
            Err(e) => {
                tracing::warn!("Skipping malformed stream frame: {}", e);
                None
            }
        }
    }
}

/// What the relay hands to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// A new fragment and the assistant message accumulated so far
    Update { delta: String, text: String },
    /// End of the reply
    Done,
}

pub type ReplyStream = BoxStream<'static, Result<ReplyEvent, ChatError>>;

struct RelayState {
    body: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    text: String,
    body_ended: bool,
    finished: bool,
}

/// Decode an upstream completion body into cumulative reply updates.
/// Dropping the returned stream drops the upstream body with it.
pub fn relay_stream(body: ByteStream) -> ReplyStream {
    let state = RelayState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        text: String::new(),
        body_ended: false,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(event) = state.pending.pop_front() {
                match event {
                    SseEvent::Delta(delta) => {
                        state.text.push_str(&delta);
                        let update = ReplyEvent::Update {
                            delta,
                            text: state.text.clone(),
                        };
                        return Some((Ok(update), state));
                    }
                    SseEvent::Done => {
                        state.finished = true;
                        return Some((Ok(ReplyEvent::Done), state));
                    }
                }
            }

            if state.body_ended {
                // Upstream closed without [DONE]; still terminate explicitly
                state.finished = true;
                return Some((Ok(ReplyEvent::Done), state));
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(ChatError::from(e)), state));
                }
                None => {
                    let events = state.decoder.finish();
                    state.pending.extend(events);
                    state.body_ended = true;
                }
            }
        }
    })
    .boxed()
}

/// Proxies conversations to the hosted chat model under the guide persona
#[derive(Clone)]
pub struct ChatRelay {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl ChatRelay {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub async fn stream_reply(
        &self,
        conversation: Vec<ChatMessage>,
        progress: &UserProgress,
    ) -> Result<ReplyStream, ChatError> {
        let request = ChatRequest {
            system_prompt: guide_system_prompt(progress),
            messages: conversation,
            timeout: self.timeout,
        };

        let body = self.provider.stream_chat(request).await.map_err(|e| {
            tracing::warn!("Guide chat request failed: {}", e);
            ChatError::from(e)
        })?;

        Ok(relay_stream(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;

    fn frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn sample_body() -> String {
        let mut body = String::from(": keep-alive\n\n");
        body.push_str(&frame("Bonjour, "));
        body.push_str(&frame("gardien ✨ "));
        body.push_str("data: {\"choices\":[{\"delta\":{}}]}\r\n\r\n");
        body.push_str(&frame("de Paris."));
        body.push_str("data: [DONE]\n\n");
        body.push_str(&frame("ignored after done"));
        body
    }

    fn collect_text(events: &[SseEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                SseEvent::Delta(d) => Some(d.as_str()),
                SseEvent::Done => None,
            })
            .collect()
    }

    #[test]
    fn test_decoder_whole_body() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(sample_body().as_bytes());
        assert_eq!(collect_text(&events), "Bonjour, gardien ✨ de Paris.");
        assert_eq!(events.last(), Some(&SseEvent::Done));
        assert!(decoder.is_done());
    }

    #[test]
    fn test_decoder_any_split_point() {
        let body = sample_body();
        let bytes = body.as_bytes();
        for split in 0..bytes.len() {
            let mut decoder = SseDecoder::new();
            let mut events = decoder.push(&bytes[..split]);
            events.extend(decoder.push(&bytes[split..]));
            assert_eq!(
                collect_text(&events),
                "Bonjour, gardien ✨ de Paris.",
                "split at {}",
                split
            );
        }
    }

    #[test]
    fn test_decoder_byte_by_byte() {
        let body = sample_body();
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for byte in body.as_bytes() {
            events.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(collect_text(&events), "Bonjour, gardien ✨ de Paris.");
    }

    #[test]
    fn test_decoder_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(frame("fin").trim_end().as_bytes());
        assert!(events.is_empty());
        assert_eq!(decoder.finish(), vec![SseEvent::Delta("fin".to_string())]);
    }

    #[test]
    fn test_decoder_skips_malformed_frames() {
        let mut decoder = SseDecoder::new();
        let mut input = String::from("data: {not json}\n");
        input.push_str(&frame("ok"));
        let events = decoder.push(input.as_bytes());
        assert_eq!(events, vec![SseEvent::Delta("ok".to_string())]);
    }

    #[test]
    fn test_system_prompt_mentions_progress() {
        let prompt = guide_system_prompt(&UserProgress {
            current_day: 2,
            keys: vec!["eau".to_string(), "temps".to_string()],
        });
        assert!(prompt.contains("Jour du parcours : 2/3"));
        assert!(prompt.contains("Clés collectées : eau, temps"));

        let prompt = guide_system_prompt(&UserProgress::default());
        assert!(prompt.contains("Clés collectées : aucune"));
    }

    #[test]
    fn test_user_progress_defaults() {
        let progress: UserProgress = serde_json::from_str("{}").unwrap();
        assert_eq!(progress, UserProgress::default());
        let progress: UserProgress =
            serde_json::from_str(r#"{"currentDay":3,"keys":["feu"]}"#).unwrap();
        assert_eq!(progress.current_day, 3);
    }

    #[tokio::test]
    async fn test_relay_yields_cumulative_text() {
        let body = sample_body().into_bytes();
        let chunks: Vec<_> = body
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let stream = relay_stream(futures::stream::iter(chunks).boxed());
        let events: Vec<_> = stream.collect().await;

        let texts: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                Ok(ReplyEvent::Update { text, .. }) => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                "Bonjour, ".to_string(),
                "Bonjour, gardien ✨ ".to_string(),
                "Bonjour, gardien ✨ de Paris.".to_string(),
            ]
        );
        assert_eq!(events.last(), Some(&Ok(ReplyEvent::Done)));
    }

    #[tokio::test]
    async fn test_relay_surfaces_transport_error() {
        let chunks = vec![
            Ok(Bytes::from(frame("début"))),
            Err(LlmError::ApiError("connection reset".to_string())),
            Ok(Bytes::from(frame("jamais"))),
        ];
        let events: Vec<_> = relay_stream(futures::stream::iter(chunks).boxed())
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            Err(ChatError::CommunicationFailure(_))
        ));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(ChatError::from(LlmError::RateLimit), ChatError::RateLimited);
        assert_eq!(
            ChatError::from(LlmError::InsufficientCredits),
            ChatError::InsufficientCredits
        );
        assert!(matches!(
            ChatError::from(LlmError::Timeout(Duration::from_secs(1))),
            ChatError::CommunicationFailure(_)
        ));
    }
}
