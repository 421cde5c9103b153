//! ctxhub Core Protocol Types
//!
//! This crate provides the thread-free building blocks of the ctxhub
//! runtime: identity and time types, the error taxonomy, BLE/WiFi request
//! models with the generic request multiplexer, the transaction manager
//! that drives retries and per-group serialization, and inbound
//! duplicate-message detection. Everything here is deterministic and owns
//! no threads or timers; the runtime crate supplies those.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod ble;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod multiplexer;
pub mod transaction;
pub mod types;
pub mod wifi;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use ble::{BleScanMode, BleScanRequest, RequestStatus};
pub use config::HubConfig;
pub use dedup::DuplicateMessageDetector;
pub use errors::{CtxhubError, ErrorCode, Result};
pub use multiplexer::{MergeableRequest, RequestMultiplexer};
pub use transaction::{TransactionId, TransactionManager};
pub use types::{AppId, HostEndpoint, InstanceId, TimeSource, TimerHandle, Timestamp};
