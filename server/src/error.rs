//! Error taxonomy for the Live Component Runtime.

use axum::extract::ws::{close_code, CloseFrame};

/// A runtime error. Every variant carries the wire `code` used in an
/// `error` frame and, where the error is fatal to the connection, a WebSocket close code.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("malformed frame: {0}")]
    BadFrame(String),

    #[error("unknown component type: {0}")]
    UnknownType(String),

    #[error("unknown method {method} on type {type_name}")]
    UnknownMethod { type_name: String, method: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("version gap, resync required")]
    VersionGap,

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("handler timed out")]
    Timeout,

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("out-of-order or duplicate chunk sequence")]
    BadSeq,

    #[error("upload exceeds configured size limit")]
    SizeLimit,

    #[error("upload hash mismatch")]
    HashMismatch,

    #[error("connection send queue overloaded")]
    Overloaded,

    #[error("connection backpressure, closing")]
    Backpressure,

    #[error("instance quarantined after repeated panics")]
    InstanceQuarantined,
}

impl RuntimeError {
    /// The wire `code` string carried in an `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadFrame(_) => "BAD_FRAME",
            Self::UnknownType(_) => "UNKNOWN_TYPE",
            Self::UnknownMethod { .. } => "UNKNOWN_METHOD",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL",
            Self::VersionGap => "VERSION_GAP",
            Self::HandlerError(_) => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::MountFailed(_) => "MOUNT_FAILED",
            Self::UnmountFailed(_) => "UNMOUNT_FAILED",
            Self::BadSeq => "BAD_SEQ",
            Self::SizeLimit => "SIZE_LIMIT",
            Self::HashMismatch => "HASH_MISMATCH",
            Self::Overloaded => "OVERLOADED",
            Self::Backpressure => "BACKPRESSURE",
            Self::InstanceQuarantined => "INSTANCE_QUARANTINED",
        }
    }

    /// A sanitized, client-safe message. Stack traces never cross the
    /// wire — `Internal` is flattened to a generic message.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            Self::HandlerError(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// WebSocket close code for errors that terminate the connection. `None` means the
    /// connection stays open and the error is reported via an `error`/`function-error`
    /// frame instead. Among the rate-limiting errors, only `Backpressure` closes the
    /// connection — `RateLimited` and `Overloaded` are surfaced but leave it open.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::BadFrame(_) => Some(4001),
            Self::Unauthorized => Some(4002),
            Self::Backpressure => Some(4008),
            _ => None,
        }
    }

    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.close_code().map(|code| CloseFrame {
            code,
            reason: self.client_message().into(),
        })
    }
}

/// Close code for a normal, graceful shutdown.
pub const NORMAL_CLOSE: u16 = close_code::NORMAL;

pub type Result<T> = std::result::Result<T, RuntimeError>;
