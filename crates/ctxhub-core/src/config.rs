//! Centralized configuration for the ctxhub runtime
//!
//! All capacities here are hard bounds: the runtime never grows past them,
//! and exhaustion is a first-class, reported condition rather than an edge
//! case.

use core::time::Duration;

// ----------------------------------------------------------------------------
// Event Loop Configuration
// ----------------------------------------------------------------------------

/// Configuration for the event loop and its backing pool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventLoopConfig {
    /// Total event pool capacity shared by all producers.
    pub event_pool_capacity: usize,
    /// How many low-priority events to evict from the back of the queue when
    /// a high-priority post finds the pool full.
    pub low_priority_evict_target: usize,
    /// Interval at which per-nanoapp wakeup/message stat buckets cycle.
    pub wakeup_bucket_interval: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            event_pool_capacity: 96,
            low_priority_evict_target: 4,
            wakeup_bucket_interval: Duration::from_secs(180 * 60),
        }
    }
}

impl EventLoopConfig {
    /// Small pools and a fast bucket cycle, for tests.
    pub fn testing() -> Self {
        Self {
            event_pool_capacity: 16,
            low_priority_evict_target: 4,
            wakeup_bucket_interval: Duration::from_secs(60),
        }
    }
}

// ----------------------------------------------------------------------------
// Timer Pool Configuration
// ----------------------------------------------------------------------------

/// Configuration for the shared timer pool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TimerPoolConfig {
    /// Total timer capacity (system + nanoapp).
    pub max_timers: usize,
    /// Cap on concurrently outstanding nanoapp timers.
    pub max_nanoapp_timers: usize,
    /// Timer slots held in reserve for nanoapps, never claimable by the
    /// system.
    pub reserved_nanoapp_timers: usize,
}

impl Default for TimerPoolConfig {
    fn default() -> Self {
        Self {
            max_timers: 64,
            max_nanoapp_timers: 32,
            reserved_nanoapp_timers: 8,
        }
    }
}

// ----------------------------------------------------------------------------
// Reliable Message Configuration
// ----------------------------------------------------------------------------

/// Configuration for host-acknowledged message delivery.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReliableMessageConfig {
    /// Delay between send attempts of an unacknowledged reliable message.
    pub retry_wait: Duration,
    /// Total send attempts before the message is failed with a timeout.
    pub max_attempts: u16,
    /// How long inbound duplicate-detection records are retained. Chosen as
    /// 3x the full round-trip timeout so a host retry always hits a live
    /// record.
    pub duplicate_detector_timeout: Duration,
    /// Maximum concurrently tracked host messages (both directions).
    pub message_pool_capacity: usize,
    /// Maximum outbound payload size accepted from a nanoapp.
    pub max_message_size: usize,
}

impl Default for ReliableMessageConfig {
    fn default() -> Self {
        let retry_wait = Duration::from_millis(250);
        let max_attempts = 4;
        Self {
            retry_wait,
            max_attempts,
            duplicate_detector_timeout: retry_wait * u32::from(max_attempts) * 3,
            message_pool_capacity: 32,
            max_message_size: 4096,
        }
    }
}

impl ReliableMessageConfig {
    /// Short timeouts for deterministic tests.
    pub fn testing() -> Self {
        Self {
            retry_wait: Duration::from_millis(10),
            max_attempts: 3,
            duplicate_detector_timeout: Duration::from_millis(90),
            message_pool_capacity: 8,
            max_message_size: 512,
        }
    }
}

// ----------------------------------------------------------------------------
// BLE Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE request manager.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BleConfig {
    /// Maximum queued batch-flush requests.
    pub max_flush_requests: usize,
    /// Deadline for a platform flush to complete.
    pub flush_timeout: Duration,
    /// Maximum outstanding RSSI read requests (first is in flight, the rest
    /// queue behind it).
    pub max_rssi_requests: usize,
    /// Entries retained in the request debug log ring.
    pub request_log_entries: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            max_flush_requests: 16,
            flush_timeout: Duration::from_secs(5),
            max_rssi_requests: 2,
            request_log_entries: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// WiFi Configuration
// ----------------------------------------------------------------------------

/// Configuration for the WiFi request manager.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WifiConfig {
    /// Maximum queued scan-monitor state transitions.
    pub max_scan_monitor_transitions: usize,
    /// Maximum queued on-demand scan requests.
    pub max_scan_requests: usize,
    /// Deadline for the platform to acknowledge a scan-monitor change.
    pub scan_monitor_timeout: Duration,
    /// Deadline for an on-demand scan to produce results.
    pub scan_request_timeout: Duration,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            max_scan_monitor_transitions: 8,
            max_scan_requests: 8,
            scan_monitor_timeout: Duration::from_secs(5),
            scan_request_timeout: Duration::from_secs(10),
        }
    }
}

// ----------------------------------------------------------------------------
// Top-Level Configuration
// ----------------------------------------------------------------------------

/// Aggregate runtime configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HubConfig {
    pub event_loop: EventLoopConfig,
    pub timers: TimerPoolConfig,
    pub reliable_messages: ReliableMessageConfig,
    pub ble: BleConfig,
    pub wifi: WifiConfig,
}

impl HubConfig {
    /// Configuration tuned for deterministic tests.
    pub fn testing() -> Self {
        Self {
            event_loop: EventLoopConfig::testing(),
            reliable_messages: ReliableMessageConfig::testing(),
            ..Self::default()
        }
    }
}
