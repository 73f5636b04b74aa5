//! Server-sent-event progress streams.
//!
//! A [`ProgressEmitter`] is bound to exactly one client response. It opens
//! the session with a `session`/`"start"` frame as soon as it is created and
//! closes it with `session`/`"close"` on [`ProgressEmitter::finish`]. Frames
//! in between are caller-defined: an event name plus a JSON payload.
//!
//! ```text
//! event: session
//! data: "start"
//!
//! event: job:start
//! data: {"job_id":"...","type":"job_started",...}
//!
//! event: session
//! data: "close"
//! ```

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use plumb_pipeline::{ProgressSink, RunEvent};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Event name of the frames that open and close a session.
pub const SESSION_EVENT: &str = "session";

/// Frames queued but not yet taken by the HTTP body above which
/// [`ProgressEmitter::emit`] reports back-pressure.
const HIGH_WATER_MARK: usize = 16;

/// One event on the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressFrame {
    pub event: String,
    pub data: serde_json::Value,
}

impl ProgressFrame {
    fn to_sse_event(&self) -> Event {
        Event::default().event(&self.event).data(self.data.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// The client went away or the session was already finished.
    #[error("Progress stream is closed")]
    Closed,

    #[error("Failed to serialize progress payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Write side of a progress session.
#[derive(Debug)]
pub struct ProgressEmitter {
    sender: Option<mpsc::UnboundedSender<ProgressFrame>>,
    backlog: Arc<AtomicUsize>,
}

/// Read side of a progress session; turns into the SSE response body.
#[derive(Debug)]
pub struct ProgressStream {
    receiver: mpsc::UnboundedReceiver<ProgressFrame>,
    backlog: Arc<AtomicUsize>,
}

impl ProgressEmitter {
    /// Open a session. The `session`/`"start"` frame is already queued when
    /// this returns.
    pub fn channel() -> (Self, ProgressStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        let mut emitter = Self {
            sender: Some(sender),
            backlog: Arc::clone(&backlog),
        };
        // The receiver is alive, so the opening frame cannot be rejected.
        let _ = emitter.emit(SESSION_EVENT, "start");

        (emitter, ProgressStream { receiver, backlog })
    }

    /// Queue one frame for the client.
    ///
    /// Returns `Ok(false)` when the client is falling behind; the frame is
    /// still delivered. Fails with [`ProgressError::Closed`] once the client
    /// has disconnected or [`finish`](Self::finish) was called.
    pub fn emit<T: Serialize + ?Sized>(
        &mut self,
        event: &str,
        payload: &T,
    ) -> Result<bool, ProgressError> {
        let sender = self.sender.as_ref().ok_or(ProgressError::Closed)?;
        let frame = ProgressFrame {
            event: event.to_string(),
            data: serde_json::to_value(payload)?,
        };

        let queued = self.backlog.fetch_add(1, Ordering::SeqCst) + 1;
        if sender.send(frame).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            self.sender = None;
            return Err(ProgressError::Closed);
        }
        Ok(queued <= HIGH_WATER_MARK)
    }

    /// Emit `session`/`"close"` and detach from the client.
    ///
    /// Only the first call writes anything; later calls, and calls after the
    /// client disconnected, are no-ops.
    pub fn finish(&mut self) {
        if self.sender.is_none() {
            return;
        }
        if let Err(e) = self.emit(SESSION_EVENT, "close") {
            tracing::debug!(error = %e, "Progress session closed before finish");
        }
        self.sender = None;
    }

    /// Whether [`finish`](Self::finish) ran or the client is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.as_ref().map_or(true, |s| s.is_closed())
    }
}

impl ProgressSink for ProgressEmitter {
    fn report(&mut self, event: RunEvent) {
        if let Err(e) = self.emit(event.name(), &event) {
            tracing::debug!(job_id = %event.job_id, error = %e, "Dropped progress event");
        }
    }
}

impl ProgressStream {
    /// Take the next frame directly, bypassing HTTP.
    pub async fn next_frame(&mut self) -> Option<ProgressFrame> {
        let frame = self.receiver.recv().await?;
        self.backlog.fetch_sub(1, Ordering::SeqCst);
        Some(frame)
    }

    /// Convert into an axum SSE response.
    pub fn into_sse(self) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let Self { receiver, backlog } = self;
        let events = UnboundedReceiverStream::new(receiver).map(move |frame| {
            backlog.fetch_sub(1, Ordering::SeqCst);
            Ok(frame.to_sse_event())
        });
        Sse::new(events).keep_alive(KeepAlive::default())
    }
}

impl IntoResponse for ProgressStream {
    fn into_response(self) -> Response {
        self.into_sse().into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use http_body_util::BodyExt;
    use serde_json::json;

    use super::*;

    fn frame(event: &str, data: serde_json::Value) -> ProgressFrame {
        ProgressFrame {
            event: event.to_string(),
            data,
        }
    }

    async fn drain(stream: &mut ProgressStream) -> Vec<ProgressFrame> {
        let mut frames = Vec::new();
        while let Some(f) = stream.next_frame().await {
            frames.push(f);
        }
        frames
    }

    #[tokio::test]
    async fn session_start_precedes_caller_events() {
        let (mut emitter, mut stream) = ProgressEmitter::channel();
        emitter.emit("log", &json!({"line": "hello"})).unwrap();

        assert_eq!(stream.next_frame().await, Some(frame("session", json!("start"))));
        assert_eq!(stream.next_frame().await, Some(frame("log", json!({"line": "hello"}))));
    }

    #[tokio::test]
    async fn finish_is_last_and_idempotent() {
        let (mut emitter, mut stream) = ProgressEmitter::channel();
        emitter.emit("step", &1).unwrap();
        emitter.finish();
        emitter.finish();

        let frames = drain(&mut stream).await;
        assert_eq!(
            frames,
            vec![
                frame("session", json!("start")),
                frame("step", json!(1)),
                frame("session", json!("close")),
            ]
        );
        assert!(emitter.is_closed());
    }

    #[tokio::test]
    async fn emit_after_finish_is_closed() {
        let (mut emitter, _stream) = ProgressEmitter::channel();
        emitter.finish();
        assert_matches!(emitter.emit("late", &()), Err(ProgressError::Closed));
    }

    #[tokio::test]
    async fn disconnected_client_is_reported_and_finish_stays_quiet() {
        let (mut emitter, stream) = ProgressEmitter::channel();
        drop(stream);

        assert!(emitter.is_closed());
        assert_matches!(emitter.emit("step", &1), Err(ProgressError::Closed));
        emitter.finish();
    }

    #[tokio::test]
    async fn backlog_signals_pressure_without_dropping_frames() {
        let (mut emitter, mut stream) = ProgressEmitter::channel();

        // The start frame already occupies one slot.
        let hints: Vec<bool> = (0..HIGH_WATER_MARK)
            .map(|i| emitter.emit("tick", &i).unwrap())
            .collect();
        assert!(hints[..HIGH_WATER_MARK - 1].iter().all(|ok| *ok));
        assert!(!hints[HIGH_WATER_MARK - 1]);

        stream.next_frame().await.unwrap();
        stream.next_frame().await.unwrap();
        assert!(emitter.emit("tick", &"after").unwrap());

        emitter.finish();
        // 15 remaining ticks, the late tick, and the close frame.
        assert_eq!(drain(&mut stream).await.len(), HIGH_WATER_MARK - 1 + 2);
    }

    #[tokio::test]
    async fn sse_body_uses_event_stream_framing() {
        let (mut emitter, stream) = ProgressEmitter::channel();
        emitter.emit("job:queued", &json!({"position": 0})).unwrap();
        emitter.finish();

        let response = stream.into_response();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(
            text,
            "event: session\ndata: \"start\"\n\n\
             event: job:queued\ndata: {\"position\":0}\n\n\
             event: session\ndata: \"close\"\n\n"
        );
    }

    #[test]
    fn emitter_reports_run_events() {
        let (mut emitter, mut stream) = ProgressEmitter::channel();
        let event = RunEvent::new(
            uuid::Uuid::nil(),
            plumb_pipeline::RunEventKind::JobFinished { duration_ms: 5 },
        );
        emitter.report(event);

        let frames: Vec<_> = std::iter::from_fn(|| stream.receiver.try_recv().ok()).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].event, "job:end");
        assert_eq!(frames[1].data["type"], "job_finished");
        assert_eq!(frames[1].data["duration_ms"], 5);
    }
}
