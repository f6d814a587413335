//! Debounced, cancel-before-replace driver for AI insight requests.
//!
//! Dashboards re-render fast: the data feeding an analysis can change
//! several times per second. This service absorbs that churn with a
//! debounce before issuing the request, keeps at most one request in
//! flight, and publishes the assembling text to the owner. Completion is
//! latched so one logical analysis reports it at most once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assembler::AssemblerEvent;
use crate::chat_client::{ChatClient, ChatRequest};
use crate::throttle::Debouncer;

/// Lifecycle events of one insight analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum InsightEvent {
    /// A request was issued and is waiting for the first delta.
    Connecting,
    /// Cumulative text so far.
    Update(String),
    /// Final text; at most one per logical analysis.
    Completed(String),
    /// The request failed; `retry` re-issues it.
    Failed(String),
}

/// Debounce applied before a new analysis request is issued.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

struct Inner {
    chat: Arc<dyn ChatClient>,
    events: mpsc::Sender<InsightEvent>,
    inflight: Mutex<Option<CancellationToken>>,
    last_request: Mutex<Option<ChatRequest>>,
    completed: AtomicBool,
}

impl Inner {
    async fn run(self: Arc<Self>, request: ChatRequest) {
        // Cancel-before-replace: never let two responses race for state.
        let cancel = {
            let mut inflight = self.inflight.lock().await;
            if let Some(previous) = inflight.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            *inflight = Some(token.clone());
            token
        };

        let _ = self.events.send(InsightEvent::Connecting).await;

        let (tx, mut rx) = mpsc::channel(32);
        let forwarder = {
            let inner = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        AssemblerEvent::Update(text) => {
                            let _ = inner.events.send(InsightEvent::Update(text)).await;
                        }
                        AssemblerEvent::Complete(text) => {
                            if !inner.completed.swap(true, Ordering::SeqCst) {
                                let _ = inner.events.send(InsightEvent::Completed(text)).await;
                            }
                        }
                    }
                }
            })
        };

        let result = self.chat.stream_chat(&request, cancel.clone(), tx).await;
        // `tx` was moved into the call and is gone; the forwarder drains
        // whatever is buffered and exits.
        let _ = forwarder.await;

        match result {
            Ok(_) => {}
            Err(e) if e.is_abort() => debug!("insight request aborted"),
            Err(e) => {
                let _ = self.events.send(InsightEvent::Failed(e.to_string())).await;
            }
        }
    }
}

/// Owns the single in-flight insight request.
pub struct InsightService {
    inner: Arc<Inner>,
    debouncer: Mutex<Debouncer>,
    debounce: Duration,
}

impl InsightService {
    pub fn new(chat: Arc<dyn ChatClient>, events: mpsc::Sender<InsightEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                chat,
                events,
                inflight: Mutex::new(None),
                last_request: Mutex::new(None),
                completed: AtomicBool::new(false),
            }),
            debouncer: Mutex::new(Debouncer::new()),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Overrides the debounce interval.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Schedules an analysis for `request`.
    ///
    /// Rapid successive calls collapse into the last one; when the debounce
    /// elapses, any request still in flight is cancelled first.
    pub async fn request_analysis(&self, request: ChatRequest) {
        {
            let mut last = self.inner.last_request.lock().await;
            *last = Some(request.clone());
        }
        self.inner.completed.store(false, Ordering::SeqCst);

        let inner = self.inner.clone();
        let mut debouncer = self.debouncer.lock().await;
        debouncer.arm(self.debounce, async move {
            inner.run(request).await;
        });
    }

    /// Clears the completion latch and re-issues the last request.
    pub async fn retry(&self) {
        let request = self.inner.last_request.lock().await.clone();
        if let Some(request) = request {
            self.request_analysis(request).await;
        } else {
            warn!("retry requested with no prior analysis");
        }
    }

    /// Aborts the in-flight request and any pending debounce. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        self.debouncer.lock().await.cancel();
        if let Some(token) = self.inner.inflight.lock().await.take() {
            token.cancel();
        }
    }
}
