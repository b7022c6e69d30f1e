//! Error taxonomy for the RPC runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to callers of `dispatch`, `post` and `ping`.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No live channel and either this is a placeholder connection or the
    /// caller chose not to wait for one.
    #[error("connection is invalid")]
    ConnectionInvalid,
    /// The transport answered with neither a value nor an error.
    #[error("remote reply carried neither a value nor an error")]
    ReplyInvalid,
    #[error("no endpoint registered under '{0}'")]
    EndpointNotFound(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// An error raised on the remote side, passed through unchanged.
    #[error("remote error: {0}")]
    Remote(RemoteError),
}

impl RpcError {
    /// Convert to the wire error sent back to a peer.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            RpcError::ConnectionInvalid => {
                RemoteError::new(RemoteErrorKind::ConnectionInvalid, self.to_string())
            }
            RpcError::ReplyInvalid => {
                RemoteError::new(RemoteErrorKind::ReplyInvalid, self.to_string())
            }
            RpcError::EndpointNotFound(name) => {
                RemoteError::new(RemoteErrorKind::EndpointNotFound, name.clone())
            }
            RpcError::Codec(err) => RemoteError::new(RemoteErrorKind::Codec, err.to_string()),
            RpcError::Remote(err) => err.clone(),
        }
    }
}

impl From<RemoteError> for RpcError {
    /// Endpoint misses are reconstituted so callers can match on them; every
    /// other remote failure stays a transport-native error.
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::EndpointNotFound => RpcError::EndpointNotFound(err.message),
            _ => RpcError::Remote(err),
        }
    }
}

/// Failure while turning a typed value into payload bytes or back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to decode {type_name}: {source}")]
    Decode {
        type_name: &'static str,
        source: serde_json::Error,
    },
}

crate::open_enum! {
    /// Category of a [`RemoteError`]. Peers built against newer protocol
    /// revisions may send kinds this build does not know.
    pub enum RemoteErrorKind {
        ConnectionInvalid = "connection_invalid",
        ReplyInvalid = "reply_invalid",
        EndpointNotFound = "endpoint_not_found",
        Codec = "codec",
        PermissionDenied = "permission_denied",
        Unavailable = "unavailable",
        Transport = "transport",
        Handler = "handler",
    }
}

/// Transport-native error carried across the channel.
///
/// For `endpoint_not_found` the message is the endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Failure raised by an endpoint handler itself.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Handler, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transport, message)
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
