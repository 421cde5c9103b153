//! Error types for the ctxhub runtime
//!
//! Two distinct notions of "error" coexist here and must not be conflated:
//!
//! - [`ErrorCode`] is the asynchronous completion code delivered to nanoapps
//!   inside async-result events (and relayed to the host for reliable
//!   messages). It is plain data, not a Rust error.
//! - The `thiserror` enums below are synchronous rejections returned to
//!   callers before any state is mutated: a request that fails validation
//!   never produces an async result.

use crate::types::{HostEndpoint, InstanceId};

// ----------------------------------------------------------------------------
// Async Completion Codes
// ----------------------------------------------------------------------------

/// Completion code carried by async-result events and delivery statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    /// The operation completed successfully.
    Success,
    /// Unspecified failure.
    Generic,
    /// The subsystem was busy; the operation may be retried.
    Busy,
    /// A transient failure; the operation may be retried.
    Transient,
    /// The operation timed out.
    Timeout,
    /// The function is disabled by a user setting.
    FunctionDisabled,
    /// A newer request from the same nanoapp superseded this one.
    ObsoleteRequest,
    /// No destination exists for the message.
    DestinationNotFound,
    /// A fixed-capacity pool or queue was exhausted.
    NoMemory,
    /// The request arguments were rejected.
    InvalidArgument,
    /// The caller lacks the permissions the operation requires.
    PermissionDenied,
}

impl ErrorCode {
    /// Whether this code represents success.
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Whether a reliable-message delivery that ended with this code may be
    /// retried when the host resends the same sequence number.
    pub fn is_transient_failure(self) -> bool {
        matches!(self, ErrorCode::Busy | ErrorCode::Transient)
    }
}

// ----------------------------------------------------------------------------
// Synchronous Rejections
// ----------------------------------------------------------------------------

/// Rejections of resource requests (BLE scans, WiFi scans, timers).
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid scan filter: {reason}")]
    InvalidFilter { reason: &'static str },
    #[error("Request queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("Nanoapp {instance_id} has no active request")]
    NoActiveRequest { instance_id: InstanceId },
    #[error("Platform rejected the request")]
    PlatformRejected,
    #[error("Operation not supported by platform capabilities")]
    NotSupported,
}

/// Rejections of host message sends.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message of {size} bytes exceeds maximum of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("Invalid host endpoint {endpoint}")]
    InvalidEndpoint { endpoint: HostEndpoint },
    #[error("Reliable messages may not target the broadcast endpoint")]
    ReliableBroadcast,
    #[error("Message permissions {requested:#x} exceed nanoapp permissions {held:#x}")]
    PermissionMismatch { requested: u32, held: u32 },
    #[error("Message pool exhausted")]
    PoolExhausted,
    #[error("Transport rejected the message")]
    TransportRejected,
}

/// Rejections of nanoapp lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("App {app_id} is already loaded as instance {instance_id}")]
    AlreadyLoaded {
        app_id: crate::types::AppId,
        instance_id: InstanceId,
    },
    #[error("Nanoapp start callback returned failure")]
    StartFailed,
    #[error("Refusing to unload a system nanoapp")]
    SystemNanoapp,
    #[error("No nanoapp with instance id {instance_id}")]
    NotFound { instance_id: InstanceId },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Unified error for the ctxhub crates.
#[derive(Debug, thiserror::Error)]
pub enum CtxhubError {
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Transaction capacity exhausted")]
    TransactionsFull,
}

pub type Result<T> = core::result::Result<T, CtxhubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ErrorCode::Busy.is_transient_failure());
        assert!(ErrorCode::Transient.is_transient_failure());
        assert!(!ErrorCode::Timeout.is_transient_failure());
        assert!(!ErrorCode::Success.is_transient_failure());
    }
}
