//! Outcome codes for transfers, connections and individual byte sources

use serde::Serialize;
use std::fmt;

/// Terminal outcome of one unit of work (a byte source, a connection, or a
/// whole transfer).
///
/// Only `ConnError`, `ConnErrorRetryable` and `SocketWriteError` describe
/// the connection itself; `ByteSourceReadError` is local to one source and
/// never causes a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[default]
    Ok,
    /// Fatal connection failure, not retried further
    ConnError,
    /// Transient connect failure (timeout, reset during connect)
    ConnErrorRetryable,
    SocketWriteError,
    /// Reading the peer's end-of-transfer acknowledgement failed
    SocketReadError,
    /// Local data source failure; the source is abandoned
    ByteSourceReadError,
    /// Peer sent something the protocol does not allow
    ProtocolError,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// Errors that mean the active connection can no longer be used.
    pub fn is_socket_error(self) -> bool {
        matches!(
            self,
            ErrorCode::ConnError
                | ErrorCode::ConnErrorRetryable
                | ErrorCode::SocketWriteError
                | ErrorCode::SocketReadError
        )
    }

    /// Merge rule for aggregates: the first non-OK code wins.
    pub fn merge(self, other: ErrorCode) -> ErrorCode {
        if self.is_ok() {
            other
        } else {
            self
        }
    }

    /// Process exit code for a transfer ending with this code.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::ConnError => 2,
            ErrorCode::ConnErrorRetryable => 3,
            ErrorCode::SocketWriteError => 4,
            ErrorCode::SocketReadError => 5,
            ErrorCode::ByteSourceReadError => 6,
            ErrorCode::ProtocolError => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::ConnError => "CONN_ERROR",
            ErrorCode::ConnErrorRetryable => "CONN_ERROR_RETRYABLE",
            ErrorCode::SocketWriteError => "SOCKET_WRITE_ERROR",
            ErrorCode::SocketReadError => "SOCKET_READ_ERROR",
            ErrorCode::ByteSourceReadError => "BYTE_SOURCE_READ_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished transfer that did not fully succeed.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("transfer failed with {code}: {files_failed} source(s) not delivered")]
    Failed { code: ErrorCode, files_failed: usize },
}

impl ReportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ReportError::Failed { code, .. } => *code,
        }
    }
}
