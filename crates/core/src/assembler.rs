//! Incremental assembly of line-framed streaming response bodies.
//!
//! The model endpoints this crate talks to reply in one of three framings,
//! sometimes mixed within a single response: JSON objects one per line,
//! SSE-style `data: {...}` lines, or plain text lines. [`StreamAssembler`]
//! folds any of those into a single growing string, and [`assemble_stream`]
//! drives it over an HTTP body with cancellation and completion semantics.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Streaming UTF-8 decoder.
///
/// A multi-byte scalar split across two network chunks must come out as the
/// single correct character, so an incomplete trailing sequence is carried
/// over to the next call instead of being decoded lossily.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk` together with any bytes held back from earlier calls.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        // Possibly the start of a scalar whose remaining
                        // bytes are still in flight: hold it back.
                        None => {
                            self.carry = tail.to_vec();
                            break;
                        }
                        // Genuinely invalid bytes: replace and move on.
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[n..];
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes held-back bytes at end-of-stream. A dangling partial sequence
    /// at that point is truncated input and decodes to U+FFFD.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}

/// Splits a decoded byte stream into complete `\n`-terminated lines.
///
/// An unterminated trailing line is retained and prepended to the next
/// chunk rather than processed prematurely.
#[derive(Debug, Default)]
pub struct LineDecoder {
    utf8: Utf8Decoder,
    buf: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one chunk and returns every line it completed, without the
    /// trailing newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let decoded = self.utf8.decode(chunk);
        self.buf.push_str(&decoded);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Returns the pending unterminated line at end-of-stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        let tail = self.utf8.finish();
        self.buf.push_str(&tail);
        let rest = std::mem::take(&mut self.buf);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Extracts a content delta from one parsed JSON line.
///
/// Shapes are probed in a fixed order and the first string match wins. A
/// JSON line carrying none of the known fields contributes no delta, which
/// is not an error.
pub fn extract_delta(value: &Value) -> Option<&str> {
    const PATHS: [&str; 5] = [
        "/message/content",
        "/choices/0/message/content",
        "/result",
        "/text",
        "/output",
    ];
    PATHS
        .iter()
        .find_map(|path| value.pointer(path).and_then(Value::as_str))
}

/// Accumulates content deltas from a line-framed byte stream.
///
/// Feed raw chunks with [`push`](Self::push); call
/// [`finish`](Self::finish) exactly once at end-of-stream so an
/// unterminated final line is flushed through the same parsing rule.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    lines: LineDecoder,
    accumulated: String,
    raw_log: Vec<String>,
    complete: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The text accumulated so far. Never shrinks.
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    /// True once [`finish`](Self::finish) has sealed the message.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Every processed line, verbatim, for diagnostics.
    pub fn raw_log(&self) -> &[String] {
        &self.raw_log
    }

    /// Decodes one chunk and returns how many deltas it contributed.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let mut deltas = 0;
        for line in self.lines.push(chunk) {
            deltas += self.process_line(&line);
        }
        deltas
    }

    /// Flushes the pending partial line, seals the message, and returns the
    /// final accumulated text.
    pub fn finish(&mut self) -> &str {
        if !self.complete {
            if let Some(rest) = self.lines.finish() {
                self.process_line(&rest);
            }
            self.complete = true;
        }
        &self.accumulated
    }

    fn process_line(&mut self, line: &str) -> usize {
        let line = line.trim();
        if line.is_empty() {
            return 0;
        }
        self.raw_log.push(line.to_string());

        let parsed = serde_json::from_str::<Value>(line).ok().or_else(|| {
            line.strip_prefix("data:")
                .and_then(|rest| serde_json::from_str(rest.trim()).ok())
        });

        let delta = match &parsed {
            Some(value) => extract_delta(value).map(str::to_owned),
            None => {
                // Not JSON at all: the line itself is text, unless it looks
                // like a mangled JSON fragment.
                let text = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
                (!text.is_empty() && !text.starts_with('{')).then(|| text.to_owned())
            }
        };

        match delta {
            Some(delta) if !delta.is_empty() => {
                self.accumulated.push_str(&delta);
                1
            }
            _ => 0,
        }
    }
}

/// Progress events published while a response body is being assembled.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerEvent {
    /// The full accumulated text after a new delta was appended.
    Update(String),
    /// The final accumulated text; sent exactly once, never after a cancel.
    Complete(String),
}

/// Drives a byte stream through a [`StreamAssembler`] until end-of-stream,
/// cancellation, or a transport error.
///
/// Updates are published per chunk that contributed at least one delta; the
/// completion event carries the final text and is withheld on cancellation,
/// which is reported as [`CoreError::Aborted`].
pub async fn assemble_stream<S, E>(
    mut body: S,
    cancel: &CancellationToken,
    events: &mpsc::Sender<AssemblerEvent>,
) -> CoreResult<String>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut assembler = StreamAssembler::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("stream assembly cancelled");
                return Err(CoreError::Aborted);
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    if assembler.push(&bytes) > 0 {
                        // A lagging receiver is not fatal; the final state
                        // still arrives with the completion event.
                        let _ = events
                            .send(AssemblerEvent::Update(assembler.text().to_owned()))
                            .await;
                    }
                }
                Some(Err(e)) => return Err(CoreError::Stream(e.to_string())),
                None => break,
            }
        }
    }

    let finished = assembler.finish().to_owned();
    let _ = events
        .send(AssemblerEvent::Complete(finished.clone()))
        .await;
    Ok(finished)
}
