//! The hub server: connection acceptance, request decoding and routing.
//!
//! Each connection carries one request and receives one response. Read
//! queries (GET_STEPS, STEP_COUNT, FETCH_ERRORS) are answered inline on
//! the connection task; mutating methods are enqueued on the execution
//! queue and acknowledged with `"ok"` immediately, meaning "accepted for
//! processing", not "committed".

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::protocol::{read_frame, write_frame, Method, ProtocolError, Request};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{StepStatus, StepStore, StoreError};

use super::exec::Command;

/// Acknowledgement payload for accepted mutations.
const OK_RESPONSE: &[u8] = b"\"ok\"";

/// Errors that can occur while serving a request.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Framing or method decoding failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Payload failed to deserialize into the shape its method expects.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Read-path store failure, surfaced to the caller.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduling pass failed; nothing was dispatched.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// The execution queue consumer is gone.
    #[error("Execution queue closed")]
    QueueClosed,

    /// Listener-level IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Response serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Payload shape for STEP_COUNT.
#[derive(Debug, Default, Deserialize)]
struct StepCountPayload {
    /// `"*"` includes terminal statuses in the counts.
    #[serde(default)]
    types: Option<String>,
}

/// `exclude` accepts a single string or a list of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExcludeArg {
    One(String),
    Many(Vec<String>),
}

impl ExcludeArg {
    fn into_vec(self) -> Vec<String> {
        match self {
            ExcludeArg::One(value) => vec![value],
            ExcludeArg::Many(values) => values,
        }
    }
}

/// Payload shape for FETCH_ERRORS.
#[derive(Debug, Default, Deserialize)]
struct FetchErrorsPayload {
    #[serde(default)]
    count: Option<i64>,
    #[serde(default)]
    exclude: Option<ExcludeArg>,
}

/// Payload shape for ERROR.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    step_id: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    trace: String,
}

/// Serves framed requests against the store, scheduler and execution
/// queue.
pub struct HubServer {
    store: Arc<StepStore>,
    scheduler: Scheduler,
    exec_tx: mpsc::Sender<Command>,
    read_timeout: Duration,
}

impl HubServer {
    /// Creates a server over already-assembled components.
    pub fn new(
        store: Arc<StepStore>,
        scheduler: Scheduler,
        exec_tx: mpsc::Sender<Command>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            exec_tx,
            read_timeout,
        }
    }

    /// Accept loop: spawns one task per connection until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Hub listener received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles one request/response exchange, then closes the socket.
    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let body = match tokio::time::timeout(self.read_timeout, read_frame(&mut stream)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                // Transport failure: abandon, no retry (clients retry).
                warn!(peer = %peer, error = %e, "Failed to read request");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "No complete request frame within read timeout, abandoning");
                return;
            }
        };

        let outcome = match Request::decode(&body) {
            Ok(request) => {
                debug!(peer = %peer, method = %request.method, "Handling request");
                self.dispatch(request).await
            }
            Err(e) => Err(ServerError::Protocol(e)),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Request failed");
                // Errors are fatal for this connection only; other
                // connections and the execution queue are unaffected.
                match serde_json::to_vec(&serde_json::json!({ "error": e.to_string() })) {
                    Ok(body) => body,
                    Err(_) => return,
                }
            }
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(peer = %peer, error = %e, "Failed to write response");
        }
    }

    /// Routes one decoded request and produces the response body.
    async fn dispatch(&self, request: Request) -> Result<Vec<u8>, ServerError> {
        match request.method {
            Method::GetSteps => {
                let scopes: Vec<String> = parse_payload(&request.payload)?;
                let ids = self.scheduler.get_steps(&scopes).await?;
                Ok(serde_json::to_vec(&ids)?)
            }
            Method::StepCount => {
                let payload: StepCountPayload = parse_optional_payload(&request.payload)?;
                let wildcard = payload.types.as_deref() == Some("*");
                let counts = self.store.count_by_status(wildcard).await?;
                Ok(serde_json::to_vec(&counts)?)
            }
            Method::FetchErrors => {
                let payload: FetchErrorsPayload = parse_optional_payload(&request.payload)?;
                let limit = payload.count.unwrap_or(50);
                let exclude = payload
                    .exclude
                    .map(ExcludeArg::into_vec)
                    .unwrap_or_default();
                let report = self.store.fetch_errors(limit, &exclude).await?;
                Ok(serde_json::to_vec(&report)?)
            }
            Method::Done => {
                let id: String = parse_payload(&request.payload)?;
                self.enqueue(Command::Done { id }).await
            }
            Method::Pending => {
                let id: String = parse_payload(&request.payload)?;
                self.enqueue(Command::Pending { id }).await
            }
            Method::Cancel => {
                let id: String = parse_payload(&request.payload)?;
                self.enqueue(Command::Cancel { id }).await
            }
            Method::Reset => {
                let id: String = parse_payload(&request.payload)?;
                self.enqueue(Command::Reset { id }).await
            }
            Method::Error => {
                let payload: ErrorPayload = parse_payload(&request.payload)?;
                self.enqueue(Command::Error {
                    id: payload.step_id,
                    msg: payload.msg,
                    trace: payload.trace,
                })
                .await
            }
            Method::UploadStep => {
                let (step, status): (crate::store::Step, StepStatus) =
                    parse_payload(&request.payload)?;
                self.enqueue(Command::UploadStep { step, status }).await
            }
            Method::ResetErrors => {
                let include_working: bool = parse_optional_payload(&request.payload)?;
                self.enqueue(Command::ResetErrors { include_working }).await
            }
            Method::DeleteSteps => self.enqueue(Command::DeleteSteps).await,
        }
    }

    /// Enqueues a mutation and acknowledges acceptance.
    ///
    /// Blocks (asynchronously) when the bounded queue is full.
    async fn enqueue(&self, command: Command) -> Result<Vec<u8>, ServerError> {
        self.exec_tx
            .send(command)
            .await
            .map_err(|_| ServerError::QueueClosed)?;
        Ok(OK_RESPONSE.to_vec())
    }
}

/// Deserializes a required JSON payload.
fn parse_payload<'de, T: Deserialize<'de>>(payload: &'de [u8]) -> Result<T, ServerError> {
    serde_json::from_slice(payload).map_err(|e| ServerError::MalformedPayload(e.to_string()))
}

/// Deserializes a payload that may be empty or JSON null, falling back
/// to the type's default.
fn parse_optional_payload<'de, T: Deserialize<'de> + Default>(
    payload: &'de [u8],
) -> Result<T, ServerError> {
    if payload.is_empty() || payload == b"null" {
        return Ok(T::default());
    }
    parse_payload(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::graph::GraphPropagator;
    use crate::scheduler::SchedulerConfig;
    use crate::store::Step;
    use crate::throttle::TagThrottle;
    use sqlx::sqlite::SqlitePoolOptions;

    struct Fixture {
        store: Arc<StepStore>,
        server: HubServer,
        exec_handle: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        let store = Arc::new(StepStore::from_pool(pool));
        store.run_migrations().await.expect("migrations should run");

        let blobs = Arc::new(FsBlobStore::new(dir.path()));
        let propagator = Arc::new(GraphPropagator::new(Arc::clone(&store), blobs as _));
        let (exec_tx, exec_handle) =
            super::super::exec::Executor::new(Arc::clone(&store), propagator).spawn(16);
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(TagThrottle::new()),
            SchedulerConfig::default(),
        );
        let server = HubServer::new(
            Arc::clone(&store),
            scheduler,
            exec_tx,
            Duration::from_secs(5),
        );

        Fixture {
            store,
            server,
            exec_handle,
            _dir: dir,
        }
    }

    /// Drops the server (and its queue sender) and waits for the
    /// executor to drain.
    async fn drain(fx: Fixture) -> Arc<StepStore> {
        let Fixture {
            store,
            server,
            exec_handle,
            _dir,
        } = fx;
        drop(server);
        exec_handle.await.expect("executor should exit cleanly");
        store
    }

    #[tokio::test]
    async fn test_upload_then_get_steps() {
        let fx = fixture().await;

        let step = Step::new("a", "default", "t");
        let payload = serde_json::to_vec(&(step, StepStatus::Pending)).unwrap();
        let response = fx
            .server
            .dispatch(Request::new(Method::UploadStep, payload))
            .await
            .unwrap();
        assert_eq!(response, OK_RESPONSE);

        // The ack precedes the apply; wait for the queue to drain before
        // scheduling. Reuse the server by querying first, then drain.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = fx
            .server
            .dispatch(Request::new(Method::GetSteps, br#"["default"]"#.to_vec()))
            .await
            .unwrap();
        let ids: Vec<String> = serde_json::from_slice(&response).unwrap();
        assert_eq!(ids, vec!["a"]);

        drain(fx).await;
    }

    #[tokio::test]
    async fn test_step_count_wildcard() {
        let fx = fixture().await;
        fx.store
            .insert_or_replace(&Step::new("a", "default", "t"), StepStatus::Success)
            .await
            .unwrap();

        let response = fx
            .server
            .dispatch(Request::new(Method::StepCount, Vec::new()))
            .await
            .unwrap();
        let counts: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert!(counts.get("success").is_none());

        let response = fx
            .server
            .dispatch(Request::new(Method::StepCount, br#"{"types":"*"}"#.to_vec()))
            .await
            .unwrap();
        let counts: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(counts["success"], 1);

        drain(fx).await;
    }

    #[tokio::test]
    async fn test_fetch_errors_accepts_string_or_list_exclude() {
        let fx = fixture().await;
        fx.store
            .insert_or_replace(&Step::new("a", "default", "t"), StepStatus::Pending)
            .await
            .unwrap();
        fx.store
            .set_status("a", StepStatus::Error, Some("timeout talking to worker"), None)
            .await
            .unwrap();

        for payload in [
            br#"{"count":5,"exclude":"timeout"}"#.to_vec(),
            br#"{"count":5,"exclude":["timeout"]}"#.to_vec(),
        ] {
            let response = fx
                .server
                .dispatch(Request::new(Method::FetchErrors, payload))
                .await
                .unwrap();
            let report: serde_json::Value = serde_json::from_slice(&response).unwrap();
            assert_eq!(report["total"], 0);
            assert_eq!(report["count"], 0);
        }

        drain(fx).await;
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let fx = fixture().await;

        let err = fx
            .server
            .dispatch(Request::new(Method::GetSteps, b"not json".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::MalformedPayload(_)));

        drain(fx).await;
    }

    #[tokio::test]
    async fn test_mutations_ack_immediately() {
        let fx = fixture().await;
        fx.store
            .insert_or_replace(&Step::new("a", "default", "t"), StepStatus::Pending)
            .await
            .unwrap();

        let response = fx
            .server
            .dispatch(Request::new(Method::Cancel, br#""a""#.to_vec()))
            .await
            .unwrap();
        assert_eq!(response, OK_RESPONSE);

        let store = drain(fx).await;
        assert_eq!(store.get_by_id("a").await.unwrap().status, StepStatus::Cancel);
    }

    #[tokio::test]
    async fn test_reset_errors_defaults_to_errors_only() {
        let fx = fixture().await;
        fx.store
            .insert_or_replace(&Step::new("a", "default", "t"), StepStatus::Working)
            .await
            .unwrap();

        let response = fx
            .server
            .dispatch(Request::new(Method::ResetErrors, Vec::new()))
            .await
            .unwrap();
        assert_eq!(response, OK_RESPONSE);

        let store = drain(fx).await;
        assert_eq!(store.get_by_id("a").await.unwrap().status, StepStatus::Working);
    }
}
