//! Wire protocol framing.
//!
//! Requests and responses travel over a stream socket as length-prefixed
//! frames: a 4-byte big-endian body length followed by exactly that many
//! body bytes. A request body carries a 2-byte big-endian method-name
//! length, the ASCII method name, then the payload (a JSON document); a
//! response body is the payload alone. Length prefixing means payload
//! bytes never need escaping and a partial read is detected immediately.

use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body, to stop a bad length prefix from
/// allocating unboundedly.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Default TCP port of the hub listener.
pub const DEFAULT_PORT: u16 = 65432;

/// Errors that can occur during framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport-level failure during send/receive.
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared frame length exceeds `MAX_FRAME_LEN`.
    #[error("Frame of {0} bytes exceeds maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),

    /// Request body too short to hold its method header.
    #[error("Truncated request body")]
    Truncated,

    /// Method name is not valid UTF-8 or not a known method.
    #[error("Invalid method: '{0}'")]
    InvalidMethod(String),
}

/// Hub request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetSteps,
    Done,
    Pending,
    Cancel,
    Reset,
    Error,
    UploadStep,
    StepCount,
    ResetErrors,
    DeleteSteps,
    FetchErrors,
}

impl Method {
    /// Returns the wire name for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetSteps => "GET_STEPS",
            Method::Done => "DONE",
            Method::Pending => "PENDING",
            Method::Cancel => "CANCEL",
            Method::Reset => "RESET",
            Method::Error => "ERROR",
            Method::UploadStep => "UPLOAD_STEP",
            Method::StepCount => "STEP_COUNT",
            Method::ResetErrors => "RESET_ERRORS",
            Method::DeleteSteps => "DELETE_STEPS",
            Method::FetchErrors => "FETCH_ERRORS",
        }
    }

    /// All methods, for enumeration in tests and diagnostics.
    pub fn all() -> [Method; 11] {
        [
            Method::GetSteps,
            Method::Done,
            Method::Pending,
            Method::Cancel,
            Method::Reset,
            Method::Error,
            Method::UploadStep,
            Method::StepCount,
            Method::ResetErrors,
            Method::DeleteSteps,
            Method::FetchErrors,
        ]
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET_STEPS" => Ok(Method::GetSteps),
            "DONE" => Ok(Method::Done),
            "PENDING" => Ok(Method::Pending),
            "CANCEL" => Ok(Method::Cancel),
            "RESET" => Ok(Method::Reset),
            "ERROR" => Ok(Method::Error),
            "UPLOAD_STEP" => Ok(Method::UploadStep),
            "STEP_COUNT" => Ok(Method::StepCount),
            "RESET_ERRORS" => Ok(Method::ResetErrors),
            "DELETE_STEPS" => Ok(Method::DeleteSteps),
            "FETCH_ERRORS" => Ok(Method::FetchErrors),
            other => Err(ProtocolError::InvalidMethod(other.to_string())),
        }
    }
}

/// One decoded request: method plus raw payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub payload: Vec<u8>,
}

impl Request {
    /// Creates a request from a method and payload.
    pub fn new(method: Method, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            method,
            payload: payload.into(),
        }
    }

    /// Encodes the request into a frame body.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.method.as_str().as_bytes();
        let mut body = Vec::with_capacity(2 + name.len() + self.payload.len());
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name);
        body.extend_from_slice(&self.payload);
        body
    }

    /// Decodes a request from a frame body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 2 {
            return Err(ProtocolError::Truncated);
        }
        let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        if body.len() < 2 + name_len {
            return Err(ProtocolError::Truncated);
        }

        let name = std::str::from_utf8(&body[2..2 + name_len])
            .map_err(|_| ProtocolError::InvalidMethod("<non-utf8>".to_string()))?;
        let method = name.parse::<Method>()?;

        Ok(Self {
            method,
            payload: body[2 + name_len..].to_vec(),
        })
    }
}

/// Reads one length-prefixed frame body from the connection.
pub async fn read_frame<R>(conn: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    conn.read_exact(&mut body).await?;
    Ok(body)
}

/// Writes one length-prefixed frame to the connection and flushes it.
pub async fn write_frame<W>(conn: &mut W, body: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    conn.write_all(&len.to_be_bytes()).await?;
    conn.write_all(body).await?;
    conn.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_roundtrip() {
        for method in Method::all() {
            let parsed: Method = method.as_str().parse().expect("should parse");
            assert_eq!(parsed, method);
        }
    }

    #[test]
    fn test_unknown_method_rejected() {
        let err = "UPLOAD".parse::<Method>().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMethod(_)));
        assert!(err.to_string().contains("UPLOAD"));
    }

    #[test]
    fn test_request_encode_decode() {
        let request = Request::new(Method::GetSteps, br#"["default"]"#.to_vec());
        let decoded = Request::decode(&request.encode()).expect("should decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_with_empty_payload() {
        let request = Request::new(Method::DeleteSteps, Vec::new());
        let decoded = Request::decode(&request.encode()).expect("should decode");
        assert_eq!(decoded.method, Method::DeleteSteps);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_truncated_request_rejected() {
        assert!(matches!(
            Request::decode(&[]),
            Err(ProtocolError::Truncated)
        ));
        // Declared method length longer than the body.
        assert!(matches!(
            Request::decode(&[0x00, 0x09, b'D', b'O']),
            Err(ProtocolError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let body = Request::new(Method::Done, br#""step-1""#.to_vec()).encode();
        write_frame(&mut client, &body).await.expect("write should work");

        let received = read_frame(&mut server).await.expect("read should work");
        assert_eq!(received, body);

        let request = Request::decode(&received).expect("should decode");
        assert_eq!(request.method, Method::Done);
        assert_eq!(request.payload, br#""step-1""#);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Hand-write a header that lies about a giant body.
        use tokio::io::AsyncWriteExt;
        let len = (MAX_FRAME_LEN + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_short_read_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        use tokio::io::AsyncWriteExt;
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
