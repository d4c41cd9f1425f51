//! Error types for the tritonstream client.

use std::result;
use thiserror::Error;
use tonic::metadata::errors::InvalidMetadataValue;

/// A specialized Result type for tritonstream operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for tritonstream operations.
#[derive(Debug, Error)]
pub enum Error {
    /// RPC failure reported by the transport or the server
    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),

    /// Channel could not be established
    #[error("connection error: {0}")]
    Connection(#[from] tonic::transport::Error),

    /// Server URL could not be parsed
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Bearer token is not a valid header value
    #[error("invalid access token: {0}")]
    InvalidAccessToken(#[from] InvalidMetadataValue),

    /// Datatype string outside the supported set
    #[error("unsupported datatype: {0}")]
    UnsupportedDatatype(String),

    /// Payload length inconsistent with declared shape and datatype
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Malformed tensor contents
    #[error("invalid tensor data: {0}")]
    InvalidData(String),

    #[error("shared memory region already exists: {0}")]
    RegionExists(String),

    #[error("shared memory region not found: {0}")]
    RegionNotFound(String),

    #[error("out of bounds: offset {offset} + {required} bytes exceeds region size {byte_size}")]
    OutOfBounds {
        offset: u64,
        required: u64,
        byte_size: u64,
    },

    /// Region handle is no longer mapped into this process
    #[error("shared memory region not attached: {0}")]
    RegionDetached(String),

    /// Other OS-level shared memory failures
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] nix::Error),

    /// Failure during an inference call, wrapping the original cause
    #[error("inference failed: {0}")]
    Inference(#[source] Box<Error>),

    /// Asynchronous call was cancelled before it started
    #[error("inference call cancelled")]
    Cancelled,

    /// Client has been shut down
    #[error("client is closed")]
    Closed,

    /// A dispatched call panicked on its worker
    #[error("call panicked: {0}")]
    Panicked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wraps `self` as an inference failure unless it already is one.
    pub fn into_inference(self) -> Self {
        match self {
            Error::Inference(_) | Error::Cancelled => self,
            other => Error::Inference(Box::new(other)),
        }
    }

    /// True for network and RPC level failures.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Transport(_)
            | Error::Connection(_)
            | Error::InvalidEndpoint(_)
            | Error::InvalidAccessToken(_) => true,
            Error::Inference(inner) => inner.is_transport(),
            _ => false,
        }
    }

    /// The gRPC status code when the failure came from the server.
    pub fn status_code(&self) -> Option<tonic::Code> {
        match self {
            Error::Transport(status) => Some(status.code()),
            Error::Inference(inner) => inner.status_code(),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
