//! Per-session transport handle
//!
//! Serializes the exchanges of one session, carries the server-push channel, and releases
//! itself exactly once no matter whether the close comes from the client or the server.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures_util::{stream, Stream};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SessionError, SessionId, SessionState};

const EVENT_BUFFER: usize = 64;

/// One frame on the server-push stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub event: &'static str,
    pub data: Value,
}

impl StreamEvent {
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            event: "message",
            data: json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
        }
    }
}

#[derive(Debug)]
pub struct SessionTransport {
    session_id: SessionId,
    exchange: Mutex<()>,
    events: broadcast::Sender<StreamEvent>,
    streaming: Arc<AtomicBool>,
    closed: CancellationToken,
    released: AtomicBool,
    close_events: mpsc::UnboundedSender<SessionId>,
}

/// Held for the duration of one exchange on a session.
pub struct ExchangeGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl SessionTransport {
    pub(crate) fn new(
        session_id: SessionId,
        close_events: mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            session_id,
            exchange: Mutex::new(()),
            events,
            streaming: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
            released: AtomicBool::new(false),
            close_events,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if self.streaming.load(Ordering::SeqCst) {
            SessionState::Streaming
        } else {
            SessionState::Active
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits for any in-flight exchange on this session to finish, then claims the handle.
    ///
    /// Fails if the transport was closed while waiting.
    pub async fn begin_exchange(&self) -> Result<ExchangeGuard<'_>, SessionError> {
        let guard = self.exchange.lock().await;
        if self.is_closed() {
            return Err(SessionError::NotFound(self.session_id.to_string()));
        }
        Ok(ExchangeGuard { _guard: guard })
    }

    /// Opens the server-push stream. Only one stream may be open per session.
    pub fn open_stream(&self) -> Result<EventStream, SessionError> {
        if self.is_closed() {
            return Err(SessionError::NotFound(self.session_id.to_string()));
        }
        if self
            .streaming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::StreamAlreadyOpen(self.session_id.clone()));
        }

        let receiver = self.events.subscribe();
        let closed = self.closed.clone();
        let session_id = self.session_id.clone();
        let inner = stream::unfold(
            (receiver, closed, session_id),
            |(mut receiver, closed, session_id)| async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = closed.cancelled() => None,
                        received = receiver.recv() => Some(received),
                    };

                    match received {
                        Some(Ok(event)) => return Some((event, (receiver, closed, session_id))),
                        Some(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                            warn!(session_id = %session_id, skipped, "event stream lagged");
                        }
                        Some(Err(broadcast::error::RecvError::Closed)) | None => return None,
                    }
                }
            },
        );

        debug!(session_id = %self.session_id, "event stream opened");
        Ok(EventStream {
            inner: Box::pin(inner),
            active_flag: self.streaming.clone(),
            session_id: self.session_id.clone(),
        })
    }

    /// Pushes a JSON-RPC notification to the open stream.
    ///
    /// Returns `false` when no stream is listening.
    pub fn notify(&self, method: &str, params: Value) -> bool {
        if self.is_closed() || !self.streaming.load(Ordering::SeqCst) {
            return false;
        }
        self.events
            .send(StreamEvent::notification(method, params))
            .is_ok()
    }

    /// Releases the transport. Only the first call has any effect; it ends the push stream
    /// and emits the close notification. Returns whether this call performed the release.
    ///
    /// A close that does not go through [`SessionStore::remove`](super::store::SessionStore::remove)
    /// leaves the session in the store until the router's reaper handles the notification.
    /// Lookups already treat it as not found in the meantime.
    pub fn close(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.closed.cancel();
        if self.close_events.send(self.session_id.clone()).is_err() {
            debug!(session_id = %self.session_id, "no listener for close notification");
        }
        true
    }
}

/// Server-push stream for one session. Dropping it marks the session as no longer streaming.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
    active_flag: Arc<AtomicBool>,
    session_id: SessionId,
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.active_flag.store(false, Ordering::SeqCst);
        debug!(session_id = %self.session_id, "event stream closed");
    }
}
