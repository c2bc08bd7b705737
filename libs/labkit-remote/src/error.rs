use std::path::PathBuf;

/// Errors of the remote module channel, on either side.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("cannot reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote channel i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS setup failed: {reason}")]
    Tls { reason: String },

    #[error("cannot load PEM material from {path}: {reason}")]
    Pem { path: PathBuf, reason: String },

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("remote call '{request}' got no answer within {after_ms} ms")]
    Timeout { request: &'static str, after_ms: u128 },

    #[error("peer closed the connection")]
    Closed,

    #[error("remote module '{name}' is not available: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("remote call failed: {message}")]
    Remote { message: String },

    #[error("unexpected response to '{request}'")]
    UnexpectedResponse { request: &'static str },

    #[error("module manager has shut down")]
    ManagerGone,
}
