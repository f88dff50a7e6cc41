//! Session routing state machine
//!
//! Every inbound exchange is classified as one of [`Route`]'s transitions before anything is
//! dispatched:
//!
//! * `POST` without a session header carrying a single `initialize` request starts a session.
//! * `POST` with a live session header resumes that session.
//! * `GET` with a live session header upgrades the exchange to a server-push stream.
//! * `DELETE` terminates the session, idempotently.
//!
//! Anything else is rejected with a client error and leaves the store untouched. A session
//! header that does not resolve is never treated as a request to start a new session.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{store::SessionStore, transport::EventStream, Session, SessionId, SessionInit};
use crate::domain::registry::ProcedureRegistry;
use crate::errors::AppError;
use crate::mcp::server::{self, INITIALIZE_METHOD};

#[derive(Debug)]
pub enum Route {
    New,
    Resumed(Arc<Session>),
    StreamUpgrade(Arc<Session>),
    Terminate(Option<Arc<Session>>),
    Rejected(AppError),
}

/// Result of one `POST` exchange.
#[derive(Debug)]
pub struct Exchange {
    /// Set only on the exchange that created the session.
    pub created_session: Option<SessionId>,
    /// `None` when the body carried only notifications.
    pub reply: Option<Value>,
}

pub struct SessionRouter {
    store: SessionStore,
    registry: Arc<ProcedureRegistry>,
}

impl SessionRouter {
    /// Builds the router and spawns the task that removes sessions whose transport closed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(registry: Arc<ProcedureRegistry>) -> Self {
        let (store, mut close_events) = SessionStore::new();
        let weak_store = store.downgrade();

        tokio::spawn(async move {
            while let Some(session_id) = close_events.next().await {
                let Some(store) = weak_store.upgrade() else {
                    break;
                };
                if store.remove(session_id.as_str()).await {
                    debug!(session_id = %session_id, "session removed after transport close");
                }
            }
        });

        Self { store, registry }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    pub async fn route_submit(&self, session_id: Option<&str>, payload: &Value) -> Route {
        match (session_id, is_initialize_request(payload)) {
            (Some(_), true) => Route::Rejected(AppError::bad_request(
                "initialize_with_session",
                "initialize requests must not carry a session id",
            )),
            (Some(id), false) => match self.store.lookup(id).await {
                Ok(session) => Route::Resumed(session),
                Err(err) => Route::Rejected(err.into()),
            },
            (None, true) => Route::New,
            (None, false) => Route::Rejected(missing_session_id()),
        }
    }

    pub async fn route_stream(&self, session_id: Option<&str>) -> Route {
        let Some(id) = session_id else {
            return Route::Rejected(missing_session_id());
        };
        match self.store.lookup(id).await {
            Ok(session) => Route::StreamUpgrade(session),
            Err(err) => Route::Rejected(err.into()),
        }
    }

    pub async fn route_terminate(&self, session_id: Option<&str>) -> Route {
        let Some(id) = session_id else {
            return Route::Terminate(None);
        };
        Route::Terminate(self.store.lookup(id).await.ok())
    }

    /// Handles a `POST` exchange: starts a new session or continues an existing one.
    pub async fn submit(
        &self,
        session_id: Option<&str>,
        payload: Value,
    ) -> Result<Exchange, AppError> {
        match self.route_submit(session_id, &payload).await {
            Route::New => Ok(self.start_session(payload).await),
            Route::Resumed(session) => self.resume_session(&session, payload).await,
            Route::Rejected(err) => {
                warn!(reason = err.code(), "session request rejected");
                Err(err)
            }
            Route::StreamUpgrade(_) | Route::Terminate(_) => {
                Err(AppError::internal("unexpected route for submit"))
            }
        }
    }

    /// Handles a `GET` exchange by upgrading the session to a server-push stream.
    pub async fn open_stream(&self, session_id: Option<&str>) -> Result<EventStream, AppError> {
        match self.route_stream(session_id).await {
            Route::StreamUpgrade(session) => {
                let stream = session.transport().open_stream()?;
                info!(session_id = %session.id(), "session upgraded to stream");
                Ok(stream)
            }
            Route::Rejected(err) => {
                warn!(reason = err.code(), "stream request rejected");
                Err(err)
            }
            _ => Err(AppError::internal("unexpected route for stream")),
        }
    }

    /// Handles a `DELETE` exchange. Succeeds whether or not the session still existed.
    ///
    /// Returns whether a live session was terminated.
    pub async fn terminate(&self, session_id: Option<&str>) -> bool {
        let Route::Terminate(Some(session)) = self.route_terminate(session_id).await else {
            debug!("terminate requested for absent session");
            return false;
        };

        session.transport().close();
        self.store.remove(session.id().as_str()).await;
        info!(
            session_id = %session.id(),
            lifetime_ms = (Utc::now() - session.created_at()).num_milliseconds(),
            "session terminated"
        );
        true
    }

    /// Releases every live session. Used on shutdown so open streams end.
    pub async fn shutdown(&self) -> usize {
        let closed = self.store.close_all().await;
        info!(sessions = closed, "closed all sessions");
        closed
    }

    async fn start_session(&self, payload: Value) -> Exchange {
        match server::handle_initialize(payload) {
            Ok(handshake) => {
                let session = self
                    .store
                    .create(SessionInit {
                        protocol_version: handshake.protocol_version,
                        client_name: handshake.client_name,
                    })
                    .await;
                Exchange {
                    created_session: Some(session.id().clone()),
                    reply: Some(handshake.reply),
                }
            }
            Err(error_reply) => {
                warn!("initialize failed, no session created");
                Exchange {
                    created_session: None,
                    reply: Some(error_reply),
                }
            }
        }
    }

    async fn resume_session(
        &self,
        session: &Session,
        payload: Value,
    ) -> Result<Exchange, AppError> {
        let _exchange = session.transport().begin_exchange().await?;
        debug!(session_id = %session.id(), "session resumed");

        let reply = server::handle_json_rpc_payload(&self.registry, session, payload).await;
        Ok(Exchange {
            created_session: None,
            reply,
        })
    }
}

pub fn is_initialize_request(payload: &Value) -> bool {
    payload
        .as_object()
        .and_then(|object| object.get("method"))
        .and_then(Value::as_str)
        == Some(INITIALIZE_METHOD)
}

fn missing_session_id() -> AppError {
    AppError::bad_request(
        "missing_session_id",
        "no valid session id provided; send initialize first",
    )
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::domain::tools::build_registry;
    use crate::session::SessionState;

    fn router() -> SessionRouter {
        SessionRouter::new(Arc::new(build_registry().expect("registry builds")))
    }

    fn initialize_body() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "clientInfo": { "name": "test-client", "version": "1.0.0" },
                "capabilities": {}
            }
        })
    }

    fn add_numbers_body(id: i64, arguments: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": "addNumbers", "arguments": arguments }
        })
    }

    async fn initialize(router: &SessionRouter) -> SessionId {
        router
            .submit(None, initialize_body())
            .await
            .expect("initialize succeeds")
            .created_session
            .expect("session created")
    }

    #[tokio::test]
    async fn initializations_yield_distinct_sessions() {
        let router = router();

        let mut ids = HashSet::new();
        for _ in 0..16 {
            ids.insert(initialize(&router).await);
        }

        assert_eq!(ids.len(), 16);
        assert_eq!(router.store().len().await, 16);
    }

    #[tokio::test]
    async fn add_numbers_session_scenario() {
        let router = router();
        let session_id = initialize(&router).await;

        let exchange = router
            .submit(
                Some(session_id.as_str()),
                add_numbers_body(2, json!({ "a": 2, "b": 3 })),
            )
            .await
            .expect("resumed exchange");
        assert!(exchange.created_session.is_none());
        let reply = exchange.reply.expect("reply");
        assert_eq!(reply["result"]["content"][0]["text"], "Sum is 5");
        assert_eq!(reply["result"]["structuredContent"]["sum"], json!(5.0));

        let reply = router
            .submit(
                Some(session_id.as_str()),
                add_numbers_body(3, json!({ "a": "x", "b": 3 })),
            )
            .await
            .expect("validation errors stay inside the exchange")
            .reply
            .expect("reply");
        assert_eq!(reply["error"]["code"], -32602);
        assert_eq!(reply["error"]["data"]["code"], "validation_error");

        assert!(router.terminate(Some(session_id.as_str())).await);

        let err = router
            .submit(
                Some(session_id.as_str()),
                add_numbers_body(4, json!({ "a": 2, "b": 3 })),
            )
            .await
            .expect_err("terminated session");
        assert!(matches!(err, AppError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn non_initializer_without_session_is_rejected() {
        let router = router();

        let err = router
            .submit(None, add_numbers_body(1, json!({ "a": 1, "b": 1 })))
            .await
            .expect_err("rejected");

        assert_eq!(err.code(), "missing_session_id");
        assert!(router.store().is_empty().await);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_without_creating_one() {
        let router = router();
        initialize(&router).await;

        let route = router
            .route_submit(Some("guessed-session-id"), &add_numbers_body(1, json!({})))
            .await;
        assert!(matches!(route, Route::Rejected(AppError::SessionNotFound { .. })));

        let err = router
            .submit(Some("guessed-session-id"), initialize_body())
            .await
            .expect_err("initialize with session header");
        assert_eq!(err.code(), "initialize_with_session");

        assert_eq!(router.store().len().await, 1);
    }

    #[tokio::test]
    async fn initialize_on_live_session_is_rejected() {
        let router = router();
        let session_id = initialize(&router).await;

        let route = router
            .route_submit(Some(session_id.as_str()), &initialize_body())
            .await;

        assert!(matches!(route, Route::Rejected(AppError::BadRequest { code, .. }) if code == "initialize_with_session"));
        assert_eq!(router.store().len().await, 1);
    }

    #[tokio::test]
    async fn failed_handshake_creates_no_session() {
        let router = router();

        let exchange = router
            .submit(
                None,
                json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
            )
            .await
            .expect("handshake errors are JSON-RPC replies");

        assert!(exchange.created_session.is_none());
        assert_eq!(exchange.reply.expect("reply")["error"]["code"], -32602);
        assert!(router.store().is_empty().await);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let router = router();
        let session_id = initialize(&router).await;

        assert!(router.terminate(Some(session_id.as_str())).await);
        assert!(!router.terminate(Some(session_id.as_str())).await);
        assert!(!router.terminate(None).await);
        assert!(router.store().is_empty().await);
    }

    #[tokio::test]
    async fn stream_upgrade_requires_live_session() {
        let router = router();

        let err = router.open_stream(None).await.err().expect("missing id");
        assert_eq!(err.code(), "missing_session_id");

        let err = router
            .open_stream(Some("unknown"))
            .await
            .err()
            .expect("unknown id");
        assert_eq!(err.code(), "session_not_found");

        let session_id = initialize(&router).await;
        let _stream = router
            .open_stream(Some(session_id.as_str()))
            .await
            .expect("stream opens");
        let session = router
            .store()
            .lookup(session_id.as_str())
            .await
            .expect("live session");
        assert_eq!(session.state(), SessionState::Streaming);

        let err = router
            .open_stream(Some(session_id.as_str()))
            .await
            .err()
            .expect("second stream");
        assert_eq!(err.code(), "stream_already_open");
    }

    #[tokio::test]
    async fn stream_receives_audit_and_ends_on_terminate() {
        let router = router();
        let session_id = initialize(&router).await;
        let mut stream = router
            .open_stream(Some(session_id.as_str()))
            .await
            .expect("stream opens");

        router
            .submit(
                Some(session_id.as_str()),
                add_numbers_body(2, json!({ "a": 1, "b": 1 })),
            )
            .await
            .expect("exchange");

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("audit event arrives")
            .expect("stream open");
        assert_eq!(event.data["method"], "notifications/message");
        assert_eq!(event.data["params"]["data"]["method"], "tools/call");

        router.terminate(Some(session_id.as_str())).await;
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream ends");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn transport_close_notification_removes_session() {
        let router = router();
        let session_id = initialize(&router).await;
        let session = router
            .store()
            .lookup(session_id.as_str())
            .await
            .expect("live session");

        assert!(session.transport().close());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !router.store().is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reaper removes closed session");
    }

    #[tokio::test]
    async fn concurrent_exchanges_on_one_session_are_serialized() {
        let router = Arc::new(router());
        let session_id = initialize(&router).await;

        let mut tasks = Vec::new();
        for id in 0..8 {
            let router = router.clone();
            let session_id = session_id.clone();
            tasks.push(tokio::spawn(async move {
                router
                    .submit(
                        Some(session_id.as_str()),
                        add_numbers_body(id, json!({ "a": id, "b": 1 })),
                    )
                    .await
                    .expect("exchange")
                    .reply
                    .expect("reply")
            }));
        }

        for (id, task) in tasks.into_iter().enumerate() {
            let reply = task.await.expect("task joins");
            assert_eq!(reply["id"], id as i64);
            assert_eq!(
                reply["result"]["content"][0]["text"],
                format!("Sum is {}", id + 1)
            );
        }
    }

    #[tokio::test]
    async fn submit_waits_for_in_flight_exchange() {
        let router = Arc::new(router());
        let session_id = initialize(&router).await;
        let session = router
            .store()
            .lookup(session_id.as_str())
            .await
            .expect("live session");

        let guard = session
            .transport()
            .begin_exchange()
            .await
            .expect("exchange claimed");

        let mut pending = tokio::spawn({
            let router = router.clone();
            let session_id = session_id.clone();
            async move {
                router
                    .submit(
                        Some(session_id.as_str()),
                        add_numbers_body(7, json!({ "a": 3, "b": 4 })),
                    )
                    .await
            }
        });

        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut pending)
                .await
                .is_err(),
            "submit must queue behind the held exchange"
        );

        drop(guard);
        let reply = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("submit completes once released")
            .expect("task joins")
            .expect("exchange")
            .reply
            .expect("reply");
        assert_eq!(reply["result"]["content"][0]["text"], "Sum is 7");
    }

    #[tokio::test]
    async fn submit_queued_behind_terminate_reports_not_found() {
        let router = Arc::new(router());
        let session_id = initialize(&router).await;
        let session = router
            .store()
            .lookup(session_id.as_str())
            .await
            .expect("live session");

        let guard = session
            .transport()
            .begin_exchange()
            .await
            .expect("exchange claimed");

        let pending = tokio::spawn({
            let router = router.clone();
            let session_id = session_id.clone();
            async move {
                router
                    .submit(
                        Some(session_id.as_str()),
                        add_numbers_body(8, json!({ "a": 1, "b": 1 })),
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.transport().close();
        drop(guard);

        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("submit completes once released")
            .expect("task joins")
            .expect_err("transport closed while queued");
        assert!(matches!(err, AppError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let router = router();
        initialize(&router).await;
        initialize(&router).await;

        assert_eq!(router.shutdown().await, 2);
        assert!(router.store().is_empty().await);
    }
}
