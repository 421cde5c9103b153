//! Context Hub Runtime Engine
//!
//! This crate contains the runtime side of the context hub: the event loop
//! that owns all nanoapps, the per-resource request managers (BLE, WiFi,
//! host comms), the timer pool, and the platform abstraction seams. The
//! `ctxhub-core` crate provides the pure data model these managers are
//! built on.
//!
//! One dedicated thread runs [`event_loop::ContextHub`]; everything else
//! talks to it through a cloneable [`event_loop::HubHandle`].

pub mod ble_manager;
pub mod event;
pub mod event_loop;
pub mod host_comms;
pub mod nanoapp;
pub mod platform;
pub mod settings;
pub mod timer_pool;
pub mod wifi_manager;

pub use ble_manager::BleRequestManager;
pub use event::{
    event_type, AsyncRequestType, AsyncResult, BleAdvertisementReport, Event, EventPayload,
    EventPool, EventPoster, EventQueue,
};
pub use event_loop::{ContextHub, HubHandle, HubStats, NanoappContext, SystemCall};
pub use host_comms::{HostCommsManager, MessageFromHost, MessageToHost};
pub use nanoapp::{Nanoapp, NanoappHandler, NanoappTable};
pub use platform::{BlePlatform, HostLink, SystemTimer, WifiPlatform};
pub use settings::{Setting, SettingManager};
pub use timer_pool::{SystemTimerCallback, TimerPool};
pub use wifi_manager::{WifiRequestManager, WifiScanEventData, WifiScanResult};

// Re-export the data-model crate for convenience.
pub use ctxhub_core::{
    ble::{BleScanMode, BleScanRequest},
    config::HubConfig,
    errors::{CtxhubError, ErrorCode, Result},
    types::{AppId, HostEndpoint, InstanceId, TimeSource, TimerHandle, Timestamp},
};
