//! The questionnaire session state machine.
//!
//! One [`QuestionnaireSession`] drives one run of the investor-psychology
//! questionnaire against an injected [`QuestionnaireBackend`]. The machine
//! owns all mutable session state behind a mutex, enforces the
//! cancel-before-replace rule for question streams, and broadcasts state
//! changes to an optional event channel for the owning UI.
//!
//! Failure policy: network errors store a user-visible message and leave
//! the machine in its prior stable phase so the operation can be retried
//! with the same session id and question number. Cancellation is silent.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{AnswerReply, QuestionnaireBackend, StartReply};
use crate::error::{CoreError, CoreResult};
use crate::profile::{InvestorProfile, compute_profile};
use crate::question::{
    QuestionMeta, QuestionRecord, QuestionType, ResponseRecord, likert_descriptor,
    normalize_question,
};
use crate::throttle::Throttle;

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Starting,
    /// A question stream is in flight (or failed and awaits a retry).
    AwaitingQuestion,
    AwaitingAnswer,
    Submitting,
    Finished,
}

/// Snapshot of everything the owner renders for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    /// Server-authoritative question number, 1-based.
    pub question_index: u32,
    pub total_questions: Option<u32>,
    pub current_question: Option<QuestionRecord>,
    /// One record per accepted answer, in submission order.
    pub responses: Vec<ResponseRecord>,
    pub advice: Option<String>,
    pub analysis: Option<String>,
    pub profile: Option<InvestorProfile>,
    pub investor_type: Option<String>,
    pub last_error: Option<String>,
}

impl SessionState {
    pub fn finished(&self) -> bool {
        self.phase == SessionPhase::Finished
    }
}

/// State changes pushed to the owning UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Throttled cumulative text of the question currently streaming in.
    QuestionStreaming(String),
    /// The current question finished streaming and is answerable.
    QuestionReady(QuestionRecord),
    /// The questionnaire completed; advice and profile are available.
    Finished,
    /// A recoverable failure; the previous stable state was kept.
    Error(String),
}

/// What the UI has collected for the current question.
#[derive(Debug, Clone)]
pub struct AnswerDraft {
    /// Free text, used for open questions.
    pub text: String,
    /// Selected option index, required for single-choice questions.
    pub selected: Option<usize>,
    /// Likert rating, 1..=5.
    pub likert_value: u8,
}

impl Default for AnswerDraft {
    fn default() -> Self {
        Self {
            text: String::new(),
            selected: None,
            likert_value: 3,
        }
    }
}

impl AnswerDraft {
    pub fn open(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn choice(index: usize) -> Self {
        Self {
            selected: Some(index),
            ..Default::default()
        }
    }

    pub fn likert(value: u8) -> Self {
        Self {
            likert_value: value,
            ..Default::default()
        }
    }
}

/// Interval at which streaming question text reaches the event channel.
const DEFAULT_STREAM_THROTTLE: Duration = Duration::from_millis(100);

/// Drives one questionnaire run against an injected backend.
pub struct QuestionnaireSession {
    backend: Arc<dyn QuestionnaireBackend>,
    state: Arc<Mutex<SessionState>>,
    events: Option<mpsc::Sender<SessionEvent>>,
    stream_cancel: Mutex<Option<CancellationToken>>,
    stream_throttle: Duration,
}

impl QuestionnaireSession {
    pub fn new(backend: Arc<dyn QuestionnaireBackend>) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(SessionState::default())),
            events: None,
            stream_cancel: Mutex::new(None),
            stream_throttle: DEFAULT_STREAM_THROTTLE,
        }
    }

    /// Broadcasts state changes to `events` as the session advances.
    pub fn with_events(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Overrides the throttle interval for streaming-text events.
    pub fn with_stream_throttle(mut self, interval: Duration) -> Self {
        self.stream_throttle = interval;
        self
    }

    /// A clone of the current session state.
    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Starts a fresh session, discarding any previous one.
    pub async fn start(&self) -> CoreResult<()> {
        self.cancel_stream().await;
        {
            let mut state = self.state.lock().await;
            *state = SessionState {
                phase: SessionPhase::Starting,
                ..SessionState::default()
            };
        }
        info!("starting questionnaire session");

        match self.backend.start().await {
            Ok(reply) => self.adopt_start(reply).await,
            Err(e) => {
                self.fail(SessionPhase::Idle, &e).await;
                Err(e)
            }
        }
    }

    /// Streams the question at `question_number`, cancelling any stream
    /// already in flight for this session first.
    pub async fn stream_question(&self, session_id: &str, question_number: u32) -> CoreResult<()> {
        let cancel = self.replace_stream_token().await;
        {
            let mut state = self.state.lock().await;
            state.phase = SessionPhase::AwaitingQuestion;
            state.question_index = question_number;
            state.current_question = Some(QuestionRecord::streaming_placeholder());
        }
        debug!(question_number, "streaming question");

        match self
            .consume_question_stream(session_id, question_number, cancel.clone())
            .await
        {
            Ok(Some((text, meta))) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                self.install_question(text, meta.as_ref()).await;
                Ok(())
            }
            // Cancelled mid-stream: a newer operation owns the state now.
            Ok(None) => Ok(()),
            Err(e) if e.is_abort() => Ok(()),
            Err(e) => {
                {
                    let mut state = self.state.lock().await;
                    state.current_question = None;
                }
                self.fail(SessionPhase::AwaitingQuestion, &e).await;
                Err(e)
            }
        }
    }

    /// Re-issues the stream for the current question. This is the retry
    /// half of the malformed-question advisory and of stream failures.
    pub async fn regenerate(&self) -> CoreResult<()> {
        let (session_id, question_number) = {
            let mut state = self.state.lock().await;
            state.last_error = None;
            let session_id = state
                .session_id
                .clone()
                .ok_or_else(|| CoreError::Validation("no active session".into()))?;
            (session_id, state.question_index)
        };
        self.stream_question(&session_id, question_number).await
    }

    /// Validates and submits the answer for the current question.
    ///
    /// Validation happens synchronously before any network call; the
    /// response log only records answers the server accepted.
    pub async fn submit_answer(&self, draft: &AnswerDraft) -> CoreResult<()> {
        let (session_id, question) = {
            let state = self.state.lock().await;
            let session_id = state
                .session_id
                .clone()
                .ok_or_else(|| CoreError::Validation("no active session".into()))?;
            let question = state
                .current_question
                .clone()
                .ok_or_else(|| CoreError::Validation("no question to answer".into()))?;
            (session_id, question)
        };
        if !question.is_answerable() {
            return Err(CoreError::Validation("question is still streaming".into()));
        }

        let (answer, value) = compose_answer(&question, draft)?;
        {
            let mut state = self.state.lock().await;
            state.phase = SessionPhase::Submitting;
            state.last_error = None;
        }
        debug!(answer = %answer, "submitting answer");

        match self.backend.answer(&session_id, &answer).await {
            Ok(reply) => {
                {
                    let mut state = self.state.lock().await;
                    state.responses.push(ResponseRecord {
                        question: question.text.clone(),
                        answer,
                        question_type: question.question_type,
                        value,
                    });
                }
                self.adopt_answer(session_id, reply).await
            }
            Err(e) => {
                self.fail(SessionPhase::AwaitingAnswer, &e).await;
                Err(e)
            }
        }
    }

    /// Cancels in-flight work and returns to the pristine idle state.
    pub async fn reset(&self) {
        self.cancel_stream().await;
        let mut state = self.state.lock().await;
        *state = SessionState::default();
    }

    async fn adopt_start(&self, reply: StartReply) -> CoreResult<()> {
        let session_id = reply.session_id.clone();
        let question_number = reply.question_number.unwrap_or(1);
        {
            let mut state = self.state.lock().await;
            state.session_id = Some(session_id.clone());
            state.question_index = question_number;
            state.total_questions = reply.total_questions;
            state.last_error = None;
        }
        info!(session_id = %session_id, question_number, "session started");

        match reply.question {
            // The start reply may already embed the first question.
            Some(text) => {
                self.install_question(text, reply.question_meta.as_ref())
                    .await;
                Ok(())
            }
            None => self.stream_question(&session_id, question_number).await,
        }
    }

    async fn adopt_answer(&self, session_id: String, reply: AnswerReply) -> CoreResult<()> {
        if !reply.has_next_question {
            {
                let mut state = self.state.lock().await;
                state.phase = SessionPhase::Finished;
                state.current_question = None;
                state.advice = reply.advice;
                state.analysis = reply.analysis;
                state.investor_type = reply.investor_type;
                // The server profile wins; otherwise score the log locally.
                state.profile = reply
                    .profile
                    .or_else(|| Some(compute_profile(&state.responses)));
            }
            info!("questionnaire finished");
            self.emit(SessionEvent::Finished).await;
            return Ok(());
        }

        let next = {
            let mut state = self.state.lock().await;
            // The server's numbering is authoritative; local +1 is only a
            // fallback when it reports nothing.
            let next = reply.question_number.unwrap_or(state.question_index + 1);
            state.question_index = next;
            if state.total_questions.is_none() {
                state.total_questions = reply.total_questions;
            }
            next
        };

        match reply.question {
            Some(text) => {
                self.install_question(text, reply.question_meta.as_ref())
                    .await;
                Ok(())
            }
            None => self.stream_question(&session_id, next).await,
        }
    }

    /// Consumes one question stream to its `done` event, publishing
    /// throttled text updates along the way. Returns `None` when cancelled.
    async fn consume_question_stream(
        &self,
        session_id: &str,
        question_number: u32,
        cancel: CancellationToken,
    ) -> CoreResult<Option<(String, Option<QuestionMeta>)>> {
        let mut stream = self
            .backend
            .stream_question(session_id, question_number, cancel.clone())
            .await?;

        let mut throttle = Throttle::new(self.stream_throttle);
        let mut text = String::new();
        let mut meta: Option<QuestionMeta> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    if let Some(m) = event.meta {
                        meta = Some(m);
                    }
                    if event.done {
                        break;
                    }
                    if event.text.is_empty() {
                        continue;
                    }
                    text.push_str(&event.text);
                    {
                        let mut state = self.state.lock().await;
                        if cancel.is_cancelled() {
                            // An orphaned delta must not touch state that a
                            // reset or replacement has already reclaimed.
                            return Ok(None);
                        }
                        if let Some(question) = state.current_question.as_mut() {
                            question.text = text.clone();
                        }
                    }
                    if let Some(snapshot) = throttle.offer(text.clone()) {
                        self.emit(SessionEvent::QuestionStreaming(snapshot)).await;
                    }
                }
                Some(Err(e)) => return Err(e),
                // End-of-stream without a `done` event still completes the
                // question with whatever text arrived.
                None => break,
            }
        }

        if let Some(tail) = throttle.take_pending() {
            self.emit(SessionEvent::QuestionStreaming(tail)).await;
        }
        Ok(Some((text, meta)))
    }

    async fn install_question(&self, text: String, meta: Option<&QuestionMeta>) {
        let record = normalize_question(&text, meta);
        {
            let mut state = self.state.lock().await;
            state.current_question = Some(record.clone());
            state.phase = SessionPhase::AwaitingAnswer;
        }
        self.emit(SessionEvent::QuestionReady(record)).await;
    }

    async fn fail(&self, fallback: SessionPhase, error: &CoreError) {
        if error.is_abort() {
            return;
        }
        warn!(error = %error, "session operation failed");
        {
            let mut state = self.state.lock().await;
            state.phase = fallback;
            state.last_error = Some(error.to_string());
        }
        self.emit(SessionEvent::Error(error.to_string())).await;
    }

    async fn replace_stream_token(&self) -> CancellationToken {
        let mut guard = self.stream_cancel.lock().await;
        if let Some(previous) = guard.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        token
    }

    async fn cancel_stream(&self) {
        if let Some(previous) = self.stream_cancel.lock().await.take() {
            previous.cancel();
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            if events.send(event).await.is_err() {
                warn!("session event receiver dropped");
            }
        }
    }
}

/// Turns the draft into the answer string and recorded value for the
/// current question's type.
fn compose_answer(
    question: &QuestionRecord,
    draft: &AnswerDraft,
) -> CoreResult<(String, Option<i64>)> {
    match question.question_type {
        QuestionType::SingleChoice => {
            let index = draft
                .selected
                .ok_or_else(|| CoreError::Validation("no selection".into()))?;
            let option = question.options.get(index).ok_or_else(|| {
                CoreError::Validation(format!("selection {index} is out of range"))
            })?;
            Ok((option.clone(), Some(index as i64)))
        }
        QuestionType::Likert => {
            let value = draft.likert_value.clamp(1, 5);
            let descriptor =
                likert_descriptor(&question.text, value, question.likert_options.as_deref());
            Ok((format!("{value} — {descriptor}"), Some(i64::from(value))))
        }
        QuestionType::Open => Ok((draft.text.clone(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockQuestionnaireBackend, QuestionEvent};
    use crate::question::QuestionType;

    fn start_reply(question: Option<&str>) -> StartReply {
        StartReply {
            session_id: "s1".into(),
            question: question.map(String::from),
            question_meta: None,
            question_number: Some(1),
            total_questions: None,
        }
    }

    fn final_reply() -> AnswerReply {
        AnswerReply {
            has_next_question: false,
            question: None,
            question_meta: None,
            question_number: None,
            total_questions: None,
            advice: Some("分散配置".into()),
            profile: Some(InvestorProfile {
                risk: 35,
                stability: 62,
                confidence: 48,
                patience: 55,
                sensitivity: 41,
            }),
            analysis: None,
            investor_type: Some("保守".into()),
        }
    }

    fn event_stream(events: Vec<QuestionEvent>) -> crate::backend::QuestionStream {
        Box::pin(tokio_stream::iter(
            events.into_iter().map(Ok::<_, CoreError>),
        ))
    }

    #[tokio::test]
    async fn start_with_embedded_question_goes_straight_to_awaiting_answer() {
        let mut backend = MockQuestionnaireBackend::new();
        backend
            .expect_start()
            .times(1)
            .returning(|| Ok(start_reply(Some("Q1?"))));

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.phase, SessionPhase::AwaitingAnswer);
        assert_eq!(state.session_id.as_deref(), Some("s1"));
        assert_eq!(state.question_index, 1);
        assert_eq!(state.current_question.as_ref().unwrap().text, "Q1?");
    }

    #[tokio::test]
    async fn end_to_end_open_question_round() {
        let mut backend = MockQuestionnaireBackend::new();
        backend
            .expect_start()
            .returning(|| Ok(start_reply(Some("Q1?"))));
        backend
            .expect_answer()
            .withf(|session_id, answer| session_id == "s1" && answer == "A")
            .times(1)
            .returning(|_, _| Ok(final_reply()));

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();
        session.submit_answer(&AnswerDraft::open("A")).await.unwrap();

        let state = session.snapshot().await;
        assert!(state.finished());
        assert!(state.current_question.is_none());
        assert_eq!(state.advice.as_deref(), Some("分散配置"));
        assert_eq!(state.investor_type.as_deref(), Some("保守"));
        assert_eq!(state.responses.len(), 1);
        let record = &state.responses[0];
        assert_eq!(record.question, "Q1?");
        assert_eq!(record.answer, "A");
        assert_eq!(record.question_type, QuestionType::Open);
        assert_eq!(record.value, None);
    }

    #[tokio::test]
    async fn server_reported_question_number_is_authoritative() {
        let mut backend = MockQuestionnaireBackend::new();
        backend
            .expect_start()
            .returning(|| Ok(start_reply(Some("Q1?"))));
        backend.expect_answer().returning(|_, _| {
            Ok(AnswerReply {
                has_next_question: true,
                question: Some("Q7?".into()),
                question_meta: None,
                question_number: Some(7),
                total_questions: Some(10),
                advice: None,
                profile: None,
                analysis: None,
                investor_type: None,
            })
        });

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();
        session.submit_answer(&AnswerDraft::open("x")).await.unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.question_index, 7);
        assert_eq!(state.total_questions, Some(10));
        assert_eq!(state.current_question.as_ref().unwrap().text, "Q7?");
    }

    #[tokio::test]
    async fn single_choice_submits_the_option_text_and_records_the_index() {
        let mut backend = MockQuestionnaireBackend::new();
        backend.expect_start().returning(|| {
            Ok(StartReply {
                session_id: "s1".into(),
                question: Some("What now?".into()),
                question_meta: Some(QuestionMeta {
                    question_type: Some("mc".into()),
                    options: Some(vec!["Buy".into(), "Hold".into(), "Sell".into()]),
                    ..Default::default()
                }),
                question_number: Some(1),
                total_questions: None,
            })
        });
        backend
            .expect_answer()
            .withf(|_, answer| answer == "Hold")
            .times(1)
            .returning(|_, _| Ok(final_reply()));

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();
        session
            .submit_answer(&AnswerDraft::choice(1))
            .await
            .unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.responses[0].answer, "Hold");
        assert_eq!(state.responses[0].value, Some(1));
        assert_eq!(state.responses[0].question_type, QuestionType::SingleChoice);
    }

    #[tokio::test]
    async fn single_choice_without_selection_fails_validation_before_any_call() {
        let mut backend = MockQuestionnaireBackend::new();
        backend.expect_start().returning(|| {
            Ok(StartReply {
                session_id: "s1".into(),
                question: Some("What now?".into()),
                question_meta: Some(QuestionMeta {
                    question_type: Some("mc".into()),
                    options: Some(vec!["Buy".into(), "Hold".into()]),
                    ..Default::default()
                }),
                question_number: Some(1),
                total_questions: None,
            })
        });
        backend.expect_answer().times(0);

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();

        let err = session
            .submit_answer(&AnswerDraft::default())
            .await
            .unwrap_err();
        match err {
            CoreError::Validation(message) => assert!(message.contains("no selection")),
            other => panic!("expected validation error, got {other:?}"),
        }
        // The failed validation left no trace in the response log.
        assert!(session.snapshot().await.responses.is_empty());
    }

    #[tokio::test]
    async fn likert_answers_compose_value_and_descriptor() {
        let mut backend = MockQuestionnaireBackend::new();
        backend.expect_start().returning(|| {
            Ok(StartReply {
                session_id: "s1".into(),
                question: Some("投資虧損時您會感到壓力嗎？請以 1 到 5 評分".into()),
                question_meta: Some(QuestionMeta {
                    question_type: Some("likert".into()),
                    ..Default::default()
                }),
                question_number: Some(1),
                total_questions: None,
            })
        });
        backend
            .expect_answer()
            .withf(|_, answer| answer == "4 — 經常感到壓力")
            .times(1)
            .returning(|_, _| Ok(final_reply()));

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();
        session
            .submit_answer(&AnswerDraft::likert(4))
            .await
            .unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.responses[0].value, Some(4));
    }

    #[tokio::test]
    async fn streamed_question_accumulates_and_normalizes_on_done() {
        let mut backend = MockQuestionnaireBackend::new();
        backend
            .expect_start()
            .returning(|| Ok(start_reply(None)));
        backend
            .expect_stream_question()
            .withf(|session_id, question_number, _| session_id == "s1" && *question_number == 1)
            .times(1)
            .returning(|_, _, _| {
                Ok(event_stream(vec![
                    QuestionEvent {
                        text: "市場大跌時".into(),
                        ..Default::default()
                    },
                    QuestionEvent {
                        text: "您會怎麼做？".into(),
                        ..Default::default()
                    },
                    QuestionEvent {
                        done: true,
                        meta: Some(QuestionMeta {
                            question_type: Some("mc".into()),
                            options: Some(vec!["加碼".into(), "觀望".into(), "賣出".into()]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]))
            });

        let (tx, mut rx) = mpsc::channel(16);
        let session = QuestionnaireSession::new(Arc::new(backend)).with_events(tx);
        session.start().await.unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.phase, SessionPhase::AwaitingAnswer);
        let question = state.current_question.unwrap();
        assert_eq!(question.text, "市場大跌時您會怎麼做？");
        assert_eq!(question.question_type, QuestionType::SingleChoice);
        assert_eq!(question.options.len(), 3);
        assert!(question.is_answerable());

        // The last event must be the ready notification with the final text.
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        match last {
            Some(SessionEvent::QuestionReady(ready)) => {
                assert_eq!(ready.text, "市場大跌時您會怎麼做？");
            }
            other => panic!("expected QuestionReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_failure_keeps_a_retryable_state() {
        let mut backend = MockQuestionnaireBackend::new();
        backend.expect_start().returning(|| Ok(start_reply(None)));
        backend
            .expect_stream_question()
            .times(1)
            .returning(|_, _, _| Err(CoreError::Stream("connection reset".into())));

        let session = QuestionnaireSession::new(Arc::new(backend));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CoreError::Stream(_)));

        let state = session.snapshot().await;
        assert_eq!(state.phase, SessionPhase::AwaitingQuestion);
        assert!(!state.finished());
        assert_eq!(state.session_id.as_deref(), Some("s1"));
        assert!(state.last_error.as_deref().unwrap().contains("connection reset"));
        assert!(state.responses.is_empty());
    }

    #[tokio::test]
    async fn regenerate_retries_the_same_question_number() {
        let mut backend = MockQuestionnaireBackend::new();
        backend.expect_start().returning(|| Ok(start_reply(None)));
        backend
            .expect_stream_question()
            .withf(|_, question_number, _| *question_number == 1)
            .times(2)
            .returning(|_, _, _| {
                Ok(event_stream(vec![
                    QuestionEvent {
                        text: "您如何看待長期投資策略？".into(),
                        ..Default::default()
                    },
                    QuestionEvent {
                        done: true,
                        ..Default::default()
                    },
                ]))
            });

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();
        session.regenerate().await.unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.question_index, 1);
        assert_eq!(state.phase, SessionPhase::AwaitingAnswer);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn submit_failure_preserves_the_current_question() {
        let mut backend = MockQuestionnaireBackend::new();
        backend
            .expect_start()
            .returning(|| Ok(start_reply(Some("Q1?"))));
        backend
            .expect_answer()
            .times(1)
            .returning(|_, _| Err(CoreError::Network("offline".into())));

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();
        let err = session
            .submit_answer(&AnswerDraft::open("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Network(_)));

        let state = session.snapshot().await;
        assert_eq!(state.phase, SessionPhase::AwaitingAnswer);
        assert_eq!(state.current_question.as_ref().unwrap().text, "Q1?");
        assert!(state.responses.is_empty());
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn reset_mid_stream_leaves_no_orphaned_mutation() {
        let mut backend = MockQuestionnaireBackend::new();
        backend.expect_start().returning(|| Ok(start_reply(None)));
        backend.expect_stream_question().returning(|_, _, cancel| {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(Ok(QuestionEvent {
                        text: "第一段".into(),
                        ..Default::default()
                    }))
                    .await;
                // Emulate a slow producer that outlives the reset.
                cancel.cancelled().await;
                let _ = tx
                    .send(Ok(QuestionEvent {
                        text: "孤兒段".into(),
                        ..Default::default()
                    }))
                    .await;
            });
            let stream: crate::backend::QuestionStream =
                Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx));
            Ok(stream)
        });

        let session = Arc::new(QuestionnaireSession::new(Arc::new(backend)));
        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.start().await })
        };

        // Give the stream a moment to deliver its first delta, then reset.
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.reset().await;
        runner.await.unwrap().unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.phase, SessionPhase::Idle);
        assert!(state.session_id.is_none());
        assert!(state.current_question.is_none());
        assert!(state.responses.is_empty());
    }

    #[tokio::test]
    async fn final_profile_falls_back_to_local_scoring() {
        let mut backend = MockQuestionnaireBackend::new();
        backend
            .expect_start()
            .returning(|| Ok(start_reply(Some("Q1?"))));
        backend.expect_answer().returning(|_, _| {
            Ok(AnswerReply {
                has_next_question: false,
                question: None,
                question_meta: None,
                question_number: None,
                total_questions: None,
                advice: Some("建議".into()),
                profile: None,
                analysis: None,
                investor_type: None,
            })
        });

        let session = QuestionnaireSession::new(Arc::new(backend));
        session.start().await.unwrap();
        session.submit_answer(&AnswerDraft::open("短答")).await.unwrap();

        let state = session.snapshot().await;
        let profile = state.profile.expect("locally computed profile");
        assert_eq!(profile.risk, 50);
    }
}
