//! Questionnaire backend contract and its HTTP implementation.
//!
//! The session state machine only ever talks to the [`QuestionnaireBackend`]
//! trait; the HTTP implementation below maps it onto the remote service's
//! three operations (`start`, `stream-question`, `answer`). Keeping the
//! transport behind a trait keeps the machine testable with `mockall`.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::assembler::LineDecoder;
use crate::error::{CoreError, CoreResult};
use crate::profile::InvestorProfile;
use crate::question::QuestionMeta;

/// Reply to the session-start operation.
#[derive(Debug, Clone, Deserialize)]
pub struct StartReply {
    pub session_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub question_meta: Option<QuestionMeta>,
    #[serde(default)]
    pub question_number: Option<u32>,
    #[serde(default)]
    pub total_questions: Option<u32>,
}

/// Reply to the answer operation.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerReply {
    pub has_next_question: bool,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub question_meta: Option<QuestionMeta>,
    #[serde(default)]
    pub question_number: Option<u32>,
    #[serde(default)]
    pub total_questions: Option<u32>,
    #[serde(default)]
    pub advice: Option<String>,
    #[serde(default)]
    pub profile: Option<InvestorProfile>,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub investor_type: Option<String>,
}

/// One server-sent event of a question stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuestionEvent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub meta: Option<QuestionMeta>,
}

/// A pinned stream of question events, ending at the `done` event.
pub type QuestionStream = Pin<Box<dyn Stream<Item = CoreResult<QuestionEvent>> + Send>>;

/// Remote questionnaire service contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuestionnaireBackend: Send + Sync {
    /// Creates a new session.
    async fn start(&self) -> CoreResult<StartReply>;

    /// Opens a streamed request for the question at `question_number`.
    ///
    /// The returned stream stops yielding promptly once `cancel` fires.
    async fn stream_question(
        &self,
        session_id: &str,
        question_number: u32,
        cancel: CancellationToken,
    ) -> CoreResult<QuestionStream>;

    /// Submits an answer for the session's current question.
    async fn answer(&self, session_id: &str, answer: &str) -> CoreResult<AnswerReply>;
}

/// `QuestionnaireBackend` over plain HTTP.
pub struct HttpQuestionnaireBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuestionnaireBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_json<T>(&self, path: &str, body: serde_json::Value) -> CoreResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "(no body)".into());
            return Err(CoreError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| CoreError::Decode(e.to_string()))
    }
}

/// Parses one SSE line into a question event. Non-`data:` lines, keepalive
/// markers, and malformed payloads all yield `None` and are skipped.
fn parse_question_event(line: &str) -> Option<QuestionEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<QuestionEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, "skipping malformed question event");
            None
        }
    }
}

#[async_trait]
impl QuestionnaireBackend for HttpQuestionnaireBackend {
    async fn start(&self) -> CoreResult<StartReply> {
        self.post_json("start", json!({})).await
    }

    async fn stream_question(
        &self,
        session_id: &str,
        question_number: u32,
        cancel: CancellationToken,
    ) -> CoreResult<QuestionStream> {
        let response = self
            .client
            .post(self.url("stream-question"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({
                "session_id": session_id,
                "question_number": question_number,
            }))
            .send()
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "(no body)".into());
            return Err(CoreError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(32);
        let mut body = response.bytes_stream();
        tokio::spawn(async move {
            let mut lines = LineDecoder::new();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for line in lines.push(&bytes) {
                            let Some(event) = parse_question_event(&line) else {
                                continue;
                            };
                            let done = event.done;
                            if tx.send(Ok(event)).await.is_err() || done {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(CoreError::Stream(e.to_string()))).await;
                        return;
                    }
                    None => break,
                }
            }
            // Flush an unterminated trailing event before closing.
            if let Some(rest) = lines.finish() {
                if let Some(event) = parse_question_event(&rest) {
                    let _ = tx.send(Ok(event)).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn answer(&self, session_id: &str, answer: &str) -> CoreResult<AnswerReply> {
        self.post_json(
            "answer",
            json!({ "session_id": session_id, "answer": answer }),
        )
        .await
    }
}
