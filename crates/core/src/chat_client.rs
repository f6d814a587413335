//! Chat-completion client trait and its HTTP implementation.
//!
//! The insight features talk to a chat-completion-style endpoint that takes
//! `{model, messages}` and answers either with a single JSON document or a
//! line-framed streamed body. The trait hides which; implementations feed
//! both shapes through the assembler so callers always observe the same
//! update/complete event sequence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::assembler::{AssemblerEvent, StreamAssembler, assemble_stream, extract_delta};
use crate::error::{CoreError, CoreResult};

/// One entry of the `messages` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// The request body accepted by chat-completion-style endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
        }
    }
}

/// A client able to stream a chat completion as accumulating text.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Sends `request` and assembles the response body, publishing progress
    /// on `events`. Returns the final accumulated text; `Aborted` when the
    /// token fired first.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
        events: mpsc::Sender<AssemblerEvent>,
    ) -> CoreResult<String>;
}

/// `ChatClient` over plain HTTP, for any endpoint speaking the
/// `{model, messages}` request shape (Ollama-style proxies included).
pub struct HttpChatClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChatClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
        events: mpsc::Sender<AssemblerEvent>,
    ) -> CoreResult<String> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Aborted),
            sent = self.client.post(&self.endpoint).json(request).send() => {
                sent.map_err(|e| CoreError::Network(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "(no body)".into());
            return Err(CoreError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }

        // A plain `application/json` reply is one finished document, not a
        // line-framed stream; read it whole and complete in one step.
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if content_type.starts_with("application/json") {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Aborted),
                body = response.text() => {
                    body.map_err(|e| CoreError::Stream(e.to_string()))?
                }
            };
            let text = complete_text(&body);
            if !text.is_empty() {
                let _ = events.send(AssemblerEvent::Update(text.clone())).await;
            }
            let _ = events.send(AssemblerEvent::Complete(text.clone())).await;
            return Ok(text);
        }

        debug!(content_type = %content_type, "assembling streamed chat response");
        assemble_stream(response.bytes_stream(), &cancel, &events).await
    }
}

/// Normalizes a non-streamed response body into message text: a JSON
/// document is probed for the known content fields, anything else passes
/// through as-is.
fn complete_text(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(delta) = extract_delta(&value) {
            return delta.to_string();
        }
    }
    let mut assembler = StreamAssembler::new();
    assembler.push(body.as_bytes());
    assembler.finish().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_serializes_to_the_wire_shape() {
        let request = ChatRequest::new("fincoach", "分析這檔股票");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "fincoach");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "分析這檔股票");
    }

    #[test]
    fn complete_text_extracts_from_a_json_document() {
        let body = "{\"message\":{\"content\":\"趨勢偏多\"}}";
        assert_eq!(complete_text(body), "趨勢偏多");
    }

    #[test]
    fn complete_text_passes_plain_bodies_through() {
        assert_eq!(complete_text("趨勢偏多\n風險中性"), "趨勢偏多風險中性");
    }

    #[test]
    fn complete_text_handles_json_without_known_fields() {
        assert_eq!(complete_text("{\"done\":true}"), "");
    }
}
