/// Coarse classification of an [`Error`], used by retry policies and by
/// screens choosing between a toast and a full-screen error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 4xx-equivalent. Never retried.
    Client,
    /// 5xx, transport failure or offline. Retried per backoff policy.
    ServerOrNetwork,
    /// Durable storage read/write failure.
    Storage,
    /// Programming or flow error, e.g. a missing required parameter.
    Logic,
}

/// Errors surfaced by the synchronization layer.
///
/// Errors are `Clone` because a single in-flight fetch settles every
/// subscriber attached to it with the same result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The remote rejected the request (status in `[400, 500)`).
    #[error("request rejected ({status}): {message}")]
    Client {
        /// HTTP-like status code.
        status: u16,
        /// Message suitable for an actionable toast.
        message: String,
    },
    /// The remote failed or could not be reached.
    #[error("{}", server_or_network_message(.status, .message))]
    ServerOrNetwork {
        /// HTTP-like status code, absent for transport failures.
        status: Option<u16>,
        /// Description of the failure.
        message: String,
    },
    /// Durable storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A flow invariant was violated.
    #[error("{0}")]
    Logic(String),
}

fn server_or_network_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("server error ({status}): {message}"),
        None => format!("network error: {message}"),
    }
}

impl Error {
    /// Classify an HTTP-like status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            Error::Client { status, message }
        } else {
            Error::ServerOrNetwork {
                status: Some(status),
                message,
            }
        }
    }

    /// A transport-level failure without a status.
    pub fn network(message: impl Into<String>) -> Self {
        Error::ServerOrNetwork {
            status: None,
            message: message.into(),
        }
    }

    /// A flow error such as a missing navigation parameter.
    pub fn logic(message: impl Into<String>) -> Self {
        Error::Logic(message.into())
    }

    pub(crate) fn offline() -> Self {
        Self::network("device is offline")
    }

    /// The [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Client { .. } => ErrorKind::Client,
            Error::ServerOrNetwork { .. } => ErrorKind::ServerOrNetwork,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Logic(_) => ErrorKind::Logic,
        }
    }

    /// The HTTP-like status, if the error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Client { status, .. } => Some(*status),
            Error::ServerOrNetwork { status, .. } => *status,
            Error::Storage(_) | Error::Logic(_) => None,
        }
    }

    /// Whether the error is a client error (status in `[400, 500)`).
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ServerOrNetwork) && !self.is_client_error()
    }
}

/// Failure reported by a [`KeyValueStore`](crate::storage::KeyValueStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The underlying medium failed.
    #[error("storage io failure on `{key}`: {message}")]
    Io {
        /// Key being accessed.
        key: String,
        /// Description of the failure.
        message: String,
    },
    /// A stored value could not be decoded.
    #[error("corrupt value under `{key}`")]
    Corrupt {
        /// Key being decoded.
        key: String,
    },
}

impl StorageError {
    pub(crate) fn io(key: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Io {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status() {
        assert_eq!(ErrorKind::Client, Error::from_status(404, "missing").kind());
        assert_eq!(ErrorKind::Client, Error::from_status(400, "bad").kind());
        assert_eq!(
            ErrorKind::ServerOrNetwork,
            Error::from_status(500, "boom").kind()
        );
        assert_eq!(
            ErrorKind::ServerOrNetwork,
            Error::from_status(399, "odd").kind()
        );
        assert!(Error::from_status(499, "x").is_client_error());
        assert!(!Error::from_status(503, "x").is_client_error());
    }

    #[test]
    fn retryable() {
        assert!(Error::network("reset").is_retryable());
        assert!(Error::from_status(502, "gateway").is_retryable());
        assert!(!Error::from_status(401, "auth").is_retryable());
        assert!(!Error::logic("missing course id").is_retryable());
        assert!(!Error::from(StorageError::io("token", "disk full")).is_retryable());
    }

    #[test]
    fn display() {
        assert_eq!(
            "network error: reset",
            Error::network("reset").to_string()
        );
        assert_eq!(
            "server error (500): boom",
            Error::from_status(500, "boom").to_string()
        );
        assert_eq!(
            "request rejected (404): missing",
            Error::from_status(404, "missing").to_string()
        );
    }
}
