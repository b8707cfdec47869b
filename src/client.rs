//! Client side of the hub wire protocol.
//!
//! Workers and pipeline tooling talk to the hub through [`HubClient`].
//! Each call opens a fresh connection, sends one framed request, reads
//! one framed response and closes the socket; there is no connection
//! state to manage or poison.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::{read_frame, write_frame, Method, ProtocolError, Request, DEFAULT_PORT};
use crate::store::{ErrorReport, Step, StepStatus};

/// Errors that can occur on the client side of a hub exchange.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Framing or transport failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connecting to the hub failed.
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// The hub reported a request failure.
    #[error("Hub rejected request: {0}")]
    Remote(String),

    /// Response payload did not deserialize into the expected shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// Decodes a response body, separating the hub's error envelope from a
/// method's normal payload.
///
/// Only a JSON object carrying an `"error"` string is treated as an
/// envelope; a payload that happens to contain the word (or a
/// single-element array like `["a"]`) decodes as the expected type.
fn decode_response<R: DeserializeOwned>(body: &[u8]) -> Result<R, ClientError> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
        return Err(ClientError::Remote(error.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

/// A hub client bound to one hub address.
#[derive(Debug, Clone)]
pub struct HubClient {
    addr: String,
}

impl HubClient {
    /// Creates a client for the given `host:port` address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Creates a client for a hub on the default port of `host`.
    pub fn with_host(host: &str) -> Self {
        Self::new(format!("{host}:{DEFAULT_PORT}"))
    }

    /// Requests up to a hub-configured number of dispatchable step ids
    /// within the given scopes. The returned steps are already claimed
    /// (marked working) for this caller.
    pub async fn get_steps(&self, scopes: &[String]) -> Result<Vec<String>, ClientError> {
        self.call(Method::GetSteps, &scopes).await
    }

    /// Inserts or replaces a step with an explicit initial status.
    pub async fn upload_step(
        &self,
        step: &Step,
        status: StepStatus,
    ) -> Result<(), ClientError> {
        self.call_ack(Method::UploadStep, &(step, status)).await
    }

    /// Reports a step finished successfully.
    pub async fn done(&self, id: &str) -> Result<(), ClientError> {
        self.call_ack(Method::Done, &id).await
    }

    /// Forces a step back to pending.
    pub async fn pending(&self, id: &str) -> Result<(), ClientError> {
        self.call_ack(Method::Pending, &id).await
    }

    /// Cancels a step and its connected component.
    pub async fn cancel(&self, id: &str) -> Result<(), ClientError> {
        self.call_ack(Method::Cancel, &id).await
    }

    /// Revives a step and its connected component.
    pub async fn reset(&self, id: &str) -> Result<(), ClientError> {
        self.call_ack(Method::Reset, &id).await
    }

    /// Reports a step failure with message and trace.
    pub async fn record_error(
        &self,
        id: &str,
        msg: &str,
        trace: &str,
    ) -> Result<(), ClientError> {
        let payload = serde_json::json!({ "step_id": id, "msg": msg, "trace": trace });
        self.call_ack(Method::Error, &payload).await
    }

    /// Returns per-status step counts. With `wildcard`, terminal
    /// statuses are included.
    pub async fn step_count(&self, wildcard: bool) -> Result<HashMap<String, i64>, ClientError> {
        let types = if wildcard { Some("*") } else { None };
        self.call(Method::StepCount, &serde_json::json!({ "types": types }))
            .await
    }

    /// Fetches up to `count` errored steps, skipping rows whose message
    /// contains any of the `exclude` substrings.
    pub async fn fetch_errors(
        &self,
        count: i64,
        exclude: &[String],
    ) -> Result<ErrorReport, ClientError> {
        let payload = serde_json::json!({ "count": count, "exclude": exclude });
        self.call(Method::FetchErrors, &payload).await
    }

    /// Bulk-resets errored (and optionally working) steps to pending.
    pub async fn reset_errors(&self, include_working: bool) -> Result<(), ClientError> {
        self.call_ack(Method::ResetErrors, &include_working).await
    }

    /// Deletes every step row.
    pub async fn delete_steps(&self) -> Result<(), ClientError> {
        self.call_ack(Method::DeleteSteps, &()).await
    }

    /// One full exchange, deserializing the response payload.
    async fn call<P, R>(&self, method: Method, payload: &P) -> Result<R, ClientError>
    where
        P: serde::Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = self.exchange(method, serde_json::to_vec(payload)?).await?;
        decode_response(&body)
    }

    /// An exchange whose only expected response is the `"ok"` ack.
    async fn call_ack<P>(&self, method: Method, payload: &P) -> Result<(), ClientError>
    where
        P: serde::Serialize + ?Sized,
    {
        let ack: String = self.call(method, payload).await?;
        debug!(method = %method, ack, "Mutation accepted");
        Ok(())
    }

    async fn exchange(&self, method: Method, payload: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        let request = Request::new(method, payload);
        write_frame(&mut stream, &request.encode()).await?;
        let response = read_frame(&mut stream).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_id_response_is_not_an_error_envelope() {
        // A one-result dispatch response must decode as ids, not be
        // mistaken for the error envelope.
        let ids: Vec<String> = decode_response(br#"["a"]"#).expect("should decode");
        assert_eq!(ids, vec!["a"]);

        let ids: Vec<String> = decode_response(br#"[]"#).expect("should decode");
        assert!(ids.is_empty());
    }

    #[test]
    fn test_error_envelope_maps_to_remote() {
        let err = decode_response::<Vec<String>>(br#"{"error":"Step not found: x"}"#).unwrap_err();
        assert!(matches!(err, ClientError::Remote(msg) if msg.contains("not found")));
    }

    #[test]
    fn test_error_status_count_is_not_an_envelope() {
        // STEP_COUNT can legitimately report an "error" bucket; a
        // numeric value is payload, not an envelope.
        let counts: std::collections::HashMap<String, i64> =
            decode_response(br#"{"pending":1,"error":2}"#).expect("should decode");
        assert_eq!(counts["error"], 2);
    }

    #[test]
    fn test_with_host_uses_default_port() {
        let client = HubClient::with_host("10.0.0.5");
        assert_eq!(client.addr, format!("10.0.0.5:{DEFAULT_PORT}"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Port 1 is essentially never listening.
        let client = HubClient::new("127.0.0.1:1");
        let err = client.done("a").await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
