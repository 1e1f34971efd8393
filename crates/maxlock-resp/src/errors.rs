use maxlock_common::NodeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RespError>;

#[derive(Debug, Error)]
pub enum RespError {
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("connection closed by peer")]
    ConnectionReset,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{kind} {message}")]
    Server { kind: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RespError> for NodeError {
    fn from(err: RespError) -> Self {
        match err {
            RespError::Server { kind, .. } if kind == "NOSCRIPT" => NodeError::NoScript,
            RespError::Server { .. } => NodeError::Server(err.to_string()),
            RespError::Protocol(message) => NodeError::Protocol(message),
            RespError::InvalidEndpoint { .. }
            | RespError::ConnectTimeout { .. }
            | RespError::ConnectionReset
            | RespError::Io(_) => NodeError::Unreachable(err.to_string()),
        }
    }
}
