//! Consumes the controller's event stream for one request.

use std::time::{Duration, Instant};

use pocketllm_core::{ControllerHandle, Request, RequestId, StreamEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How a request ended, as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { tokens_per_second: Option<f64> },
    Failed(String),
    /// Cancelled by the controller, or by Ctrl-C.
    Cancelled,
    /// No event arrived within the inactivity timeout.
    TimedOut,
    /// The controller went away before a terminal event.
    Disconnected,
}

/// Submit `request` and forward its text to `on_text` until it terminates.
pub async fn stream_request(
    handle: &ControllerHandle,
    events: &mut UnboundedReceiver<StreamEvent>,
    request: Request,
    inactivity: Duration,
    on_text: impl FnMut(&str) -> std::io::Result<()>,
) -> anyhow::Result<Outcome> {
    let id = request.id;
    if !handle.submit(request) {
        return Ok(Outcome::Disconnected);
    }
    await_outcome(events, id, inactivity, on_text, || {
        handle.cancel_request(id);
    })
    .await
}

/// Event loop behind [`stream_request`].
///
/// Events of other requests are stale leftovers of earlier cancellations and
/// are skipped. `cancel` is called once, on Ctrl-C or on inactivity.
pub async fn await_outcome(
    events: &mut UnboundedReceiver<StreamEvent>,
    id: RequestId,
    inactivity: Duration,
    mut on_text: impl FnMut(&str) -> std::io::Result<()>,
    cancel: impl Fn(),
) -> anyhow::Result<Outcome> {
    let started = Instant::now();
    let mut error: Option<String> = None;
    let mut interrupted = false;

    loop {
        let next = tokio::select! {
            next = timeout(inactivity, events.recv()) => next,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!(request_id = id, "Interrupted; cancelling request");
                cancel();
                interrupted = true;
                continue;
            }
        };

        let event = match next {
            Err(_) => {
                warn!(request_id = id, timeout_secs = inactivity.as_secs(), "Request timed out");
                cancel();
                return Ok(Outcome::TimedOut);
            }
            Ok(None) => return Ok(Outcome::Disconnected),
            Ok(Some(event)) => event,
        };
        if event.request_id() != Some(id) {
            debug!(?event, "Skipping event of another request");
            continue;
        }

        match event {
            StreamEvent::Token { text, .. } => on_text(&text)?,
            StreamEvent::Error { message, .. } => error = Some(message),
            StreamEvent::Cancelled { .. } => {
                debug!(request_id = id, elapsed_ms = started.elapsed().as_millis() as u64, "Cancelled");
                return Ok(Outcome::Cancelled);
            }
            StreamEvent::Done { tokens_per_second, .. } => {
                return Ok(match error {
                    Some(message) => Outcome::Failed(message),
                    None if interrupted => Outcome::Cancelled,
                    None => Outcome::Completed { tokens_per_second },
                });
            }
            StreamEvent::Warmup => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::sync::mpsc;

    use super::*;

    fn token(id: RequestId, text: &str) -> StreamEvent {
        StreamEvent::Token { request_id: id, text: text.into() }
    }

    #[tokio::test]
    async fn test_collects_text_until_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(token(1, "Hel")).unwrap();
        tx.send(token(1, "lo")).unwrap();
        tx.send(StreamEvent::Done { request_id: 1, tokens_per_second: Some(12.5) }).unwrap();

        let mut out = String::new();
        let outcome = await_outcome(&mut rx, 1, Duration::from_secs(5), |t| {
            out.push_str(t);
            Ok(())
        }, || {})
        .await
        .unwrap();

        assert_eq!(out, "Hello");
        assert_eq!(outcome, Outcome::Completed { tokens_per_second: Some(12.5) });
    }

    #[tokio::test]
    async fn test_skips_stale_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(token(1, "old")).unwrap();
        tx.send(StreamEvent::Cancelled { request_id: 1 }).unwrap();
        tx.send(StreamEvent::Warmup).unwrap();
        tx.send(token(2, "new")).unwrap();
        tx.send(StreamEvent::Done { request_id: 2, tokens_per_second: None }).unwrap();

        let mut out = String::new();
        let outcome = await_outcome(&mut rx, 2, Duration::from_secs(5), |t| {
            out.push_str(t);
            Ok(())
        }, || {})
        .await
        .unwrap();

        assert_eq!(out, "new");
        assert_eq!(outcome, Outcome::Completed { tokens_per_second: None });
    }

    #[tokio::test]
    async fn test_error_then_done_is_a_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(StreamEvent::Error { request_id: 3, message: "decode failed".into() }).unwrap();
        tx.send(StreamEvent::Done { request_id: 3, tokens_per_second: None }).unwrap();

        let outcome = await_outcome(&mut rx, 3, Duration::from_secs(5), |_| Ok(()), || {})
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Failed("decode failed".into()));
    }

    #[tokio::test]
    async fn test_cancelled_event_ends_the_wait() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(StreamEvent::Cancelled { request_id: 4 }).unwrap();
        let outcome = await_outcome(&mut rx, 4, Duration::from_secs(5), |_| Ok(()), || {})
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_cancels_the_request() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
        let cancelled = Cell::new(0);
        let outcome = await_outcome(&mut rx, 5, Duration::from_secs(30), |_| Ok(()), || {
            cancelled.set(cancelled.get() + 1);
        })
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(cancelled.get(), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_is_disconnected() {
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
        drop(tx);
        let outcome = await_outcome(&mut rx, 6, Duration::from_secs(5), |_| Ok(()), || {})
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Disconnected);
    }
}
