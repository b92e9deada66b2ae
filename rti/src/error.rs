//! Error types shared by the transport, client, aggregator and control layers

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the RTI client
#[derive(Debug, Clone, Error)]
pub enum RtiError {
    /// Socket failed to open or dropped; reconnection is scheduled separately
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker rejected or cleared credentials
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Server-reported failure for a single invoke
    #[error("RPC {method} failed: {error}")]
    Rpc { method: String, error: Value },

    /// An application callback failed while handling a message
    #[error("Handler error on {scope}: {message}")]
    Handler { scope: String, message: String },

    /// Malformed or unexpected frame
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Operation attempted in a state that cannot satisfy it
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A blocking wait gave up
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Payload decode error: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl RtiError {
    /// Short scope tag used when the error is reported through the event bus
    pub fn scope(&self) -> &'static str {
        match self {
            RtiError::Connection(_) => "connection",
            RtiError::Authentication(_) => "auth",
            RtiError::Rpc { .. } => "rpc",
            RtiError::Handler { .. } => "handler",
            RtiError::Protocol(_) => "protocol",
            RtiError::Precondition(_) => "precondition",
            RtiError::Timeout(_) => "timeout",
            RtiError::Decode(_) | RtiError::Json(_) => "codec",
        }
    }

    /// True for the timeout outcome of a blocking wait
    pub fn is_timeout(&self) -> bool {
        matches!(self, RtiError::Timeout(_))
    }
}

impl From<serde_json::Error> for RtiError {
    fn from(e: serde_json::Error) -> Self {
        RtiError::Json(e.to_string())
    }
}

impl From<base64::DecodeError> for RtiError {
    fn from(e: base64::DecodeError) -> Self {
        RtiError::Decode(e.to_string())
    }
}

impl From<prost::DecodeError> for RtiError {
    fn from(e: prost::DecodeError) -> Self {
        RtiError::Decode(e.to_string())
    }
}

/// Result alias for RTI operations
pub type RtiResult<T> = Result<T, RtiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_error_display_includes_method() {
        let err = RtiError::Rpc {
            method: "verifytoken".to_string(),
            error: json!("bad token"),
        };
        assert_eq!(err.to_string(), r#"RPC verifytoken failed: "bad token""#);
        assert_eq!(err.scope(), "rpc");
    }

    #[test]
    fn test_handler_error_names_channel() {
        let err = RtiError::Handler {
            scope: "scores".to_string(),
            message: "bad input".to_string(),
        };
        assert_eq!(err.to_string(), "Handler error on scores: bad input");
        assert_eq!(err.scope(), "handler");
    }

    #[test]
    fn test_timeout_is_distinguishable() {
        assert!(RtiError::Timeout("connect".to_string()).is_timeout());
        assert!(!RtiError::Connection("refused".to_string()).is_timeout());
    }

    #[test]
    fn test_json_error_converts_to_codec_scope() {
        let err: RtiError = serde_json::from_str::<Value>("{").unwrap_err().into();
        assert!(matches!(err, RtiError::Json(_)));
        assert_eq!(err.scope(), "codec");
    }

    #[test]
    fn test_decode_error_from_base64() {
        use base64::Engine;
        let err: RtiError = base64::engine::general_purpose::STANDARD
            .decode("***")
            .unwrap_err()
            .into();
        assert_eq!(err.scope(), "codec");
    }
}
