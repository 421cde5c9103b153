//! Platform abstraction seams
//!
//! Every hardware-facing call crosses one of these traits. They accept or
//! reject synchronously; actual completion arrives later from the platform
//! side as deferred work posted through a
//! [`HubHandle`](crate::event_loop::HubHandle). All trait methods are called
//! from the loop thread only.

use ctxhub_core::ble::BleScanRequest;
use ctxhub_core::errors::ErrorCode;
use ctxhub_core::types::{AppId, Timestamp};
use ctxhub_core::wifi::WifiScanParams;

use crate::host_comms::MessageToHost;

// ----------------------------------------------------------------------------
// System Timer
// ----------------------------------------------------------------------------

/// The single hardware timer backing [`TimerPool`](crate::timer_pool::TimerPool).
/// `arm` replaces any pending deadline. On expiry the platform posts
/// [`SystemCall::TimerFired`](crate::event_loop::SystemCall::TimerFired).
pub trait SystemTimer: Send {
    fn arm(&mut self, deadline: Timestamp);
    fn cancel(&mut self);
}

// ----------------------------------------------------------------------------
// BLE
// ----------------------------------------------------------------------------

/// BLE capability bits reported by the platform.
pub mod ble_capabilities {
    pub const SCAN: u32 = 1 << 0;
    pub const BATCHING: u32 = 1 << 1;
    pub const READ_RSSI: u32 = 1 << 2;
}

pub trait BlePlatform: Send {
    fn capabilities(&self) -> u32;

    /// Starts or reconfigures scanning with the merged request. Completion
    /// arrives as `SystemCall::BleScanResponse { enabled: true, .. }`.
    fn start_scan(&mut self, request: &BleScanRequest) -> bool;

    /// Stops scanning. Completion arrives as
    /// `SystemCall::BleScanResponse { enabled: false, .. }`.
    fn stop_scan(&mut self) -> bool;

    /// Flushes batched advertisements. Completion arrives as
    /// `SystemCall::BleFlushComplete`.
    fn flush(&mut self) -> bool;

    /// Reads RSSI on a connection. Completion arrives as
    /// `SystemCall::BleRssiResponse`.
    fn read_rssi(&mut self, connection_handle: u16) -> bool;
}

// ----------------------------------------------------------------------------
// WiFi
// ----------------------------------------------------------------------------

pub trait WifiPlatform: Send {
    /// Completion arrives as `SystemCall::WifiScanMonitorStatus`.
    fn configure_scan_monitor(&mut self, enable: bool) -> bool;

    /// Completion arrives as `SystemCall::WifiScanResponse` followed by zero
    /// or more `SystemCall::WifiScanEvent`s.
    fn request_scan(&mut self, params: &WifiScanParams) -> bool;
}

// ----------------------------------------------------------------------------
// Host Link
// ----------------------------------------------------------------------------

pub trait HostLink: Send {
    /// Hands one message to the transport. `true` means accepted for
    /// delivery, not delivered; reliable messages are only finished by a
    /// `SystemCall::MessageDeliveryStatus` from the host.
    fn send_message(&mut self, message: &MessageToHost) -> bool;

    /// Reports the delivery outcome of an inbound reliable message back to
    /// the host.
    fn send_message_delivery_status(&mut self, sequence_number: u32, error: ErrorCode);

    /// Synchronously completes or rejects everything previously accepted on
    /// behalf of `app_id`. Part of the unload flush protocol.
    fn flush_messages_from_app(&mut self, app_id: AppId);
}

// ----------------------------------------------------------------------------
// Test Doubles
// ----------------------------------------------------------------------------

/// Scriptable fakes shared by unit and scenario tests.
pub mod testing {
    use std::sync::{Arc, Mutex, MutexGuard};

    use super::*;

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        match m.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Backing timer that records its deadline and fires only when told to.
    #[derive(Clone, Default)]
    pub struct ManualSystemTimer {
        armed: Arc<Mutex<Option<Timestamp>>>,
    }

    impl ManualSystemTimer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn armed_at(&self) -> Option<Timestamp> {
            *lock(&self.armed)
        }
    }

    impl SystemTimer for ManualSystemTimer {
        fn arm(&mut self, deadline: Timestamp) {
            *lock(&self.armed) = Some(deadline);
        }
        fn cancel(&mut self) {
            *lock(&self.armed) = None;
        }
    }

    #[derive(Default)]
    pub struct BleCalls {
        pub starts: Vec<BleScanRequest>,
        pub stops: u32,
        pub flushes: u32,
        pub rssi_reads: Vec<u16>,
    }

    /// BLE platform that records calls and accepts or rejects per a flag.
    #[derive(Clone)]
    pub struct FakeBlePlatform {
        pub calls: Arc<Mutex<BleCalls>>,
        pub accept: Arc<Mutex<bool>>,
        capabilities: u32,
    }

    impl Default for FakeBlePlatform {
        fn default() -> Self {
            Self {
                calls: Arc::new(Mutex::new(BleCalls::default())),
                accept: Arc::new(Mutex::new(true)),
                capabilities: ble_capabilities::SCAN
                    | ble_capabilities::BATCHING
                    | ble_capabilities::READ_RSSI,
            }
        }
    }

    impl FakeBlePlatform {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_accept(&self, accept: bool) {
            *lock(&self.accept) = accept;
        }

        pub fn start_count(&self) -> usize {
            lock(&self.calls).starts.len()
        }

        pub fn stop_count(&self) -> u32 {
            lock(&self.calls).stops
        }

        pub fn last_start(&self) -> Option<BleScanRequest> {
            lock(&self.calls).starts.last().cloned()
        }
    }

    impl BlePlatform for FakeBlePlatform {
        fn capabilities(&self) -> u32 {
            self.capabilities
        }
        fn start_scan(&mut self, request: &BleScanRequest) -> bool {
            let accepted = *lock(&self.accept);
            if accepted {
                lock(&self.calls).starts.push(request.clone());
            }
            accepted
        }
        fn stop_scan(&mut self) -> bool {
            let accepted = *lock(&self.accept);
            if accepted {
                lock(&self.calls).stops += 1;
            }
            accepted
        }
        fn flush(&mut self) -> bool {
            let accepted = *lock(&self.accept);
            if accepted {
                lock(&self.calls).flushes += 1;
            }
            accepted
        }
        fn read_rssi(&mut self, connection_handle: u16) -> bool {
            let accepted = *lock(&self.accept);
            if accepted {
                lock(&self.calls).rssi_reads.push(connection_handle);
            }
            accepted
        }
    }

    #[derive(Default)]
    pub struct WifiCalls {
        pub monitor_changes: Vec<bool>,
        pub scans: Vec<WifiScanParams>,
    }

    #[derive(Clone)]
    pub struct FakeWifiPlatform {
        pub calls: Arc<Mutex<WifiCalls>>,
        pub accept: Arc<Mutex<bool>>,
    }

    impl Default for FakeWifiPlatform {
        fn default() -> Self {
            Self {
                calls: Arc::new(Mutex::new(WifiCalls::default())),
                accept: Arc::new(Mutex::new(true)),
            }
        }
    }

    impl FakeWifiPlatform {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_accept(&self, accept: bool) {
            *lock(&self.accept) = accept;
        }

        pub fn monitor_changes(&self) -> Vec<bool> {
            lock(&self.calls).monitor_changes.clone()
        }

        pub fn scan_count(&self) -> usize {
            lock(&self.calls).scans.len()
        }
    }

    impl WifiPlatform for FakeWifiPlatform {
        fn configure_scan_monitor(&mut self, enable: bool) -> bool {
            let accepted = *lock(&self.accept);
            if accepted {
                lock(&self.calls).monitor_changes.push(enable);
            }
            accepted
        }
        fn request_scan(&mut self, params: &WifiScanParams) -> bool {
            let accepted = *lock(&self.accept);
            if accepted {
                lock(&self.calls).scans.push(params.clone());
            }
            accepted
        }
    }

    #[derive(Default)]
    pub struct HostLinkCalls {
        pub sent: Vec<MessageToHost>,
        pub delivery_statuses: Vec<(u32, ErrorCode)>,
        pub flushed_apps: Vec<AppId>,
    }

    #[derive(Clone)]
    pub struct FakeHostLink {
        pub calls: Arc<Mutex<HostLinkCalls>>,
        pub accept: Arc<Mutex<bool>>,
    }

    impl Default for FakeHostLink {
        fn default() -> Self {
            Self {
                calls: Arc::new(Mutex::new(HostLinkCalls::default())),
                accept: Arc::new(Mutex::new(true)),
            }
        }
    }

    impl FakeHostLink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_accept(&self, accept: bool) {
            *lock(&self.accept) = accept;
        }

        pub fn sent_count(&self) -> usize {
            lock(&self.calls).sent.len()
        }

        pub fn last_sent(&self) -> Option<MessageToHost> {
            lock(&self.calls).sent.last().cloned()
        }
    }

    impl HostLink for FakeHostLink {
        fn send_message(&mut self, message: &MessageToHost) -> bool {
            let accepted = *lock(&self.accept);
            if accepted {
                lock(&self.calls).sent.push(message.clone());
            }
            accepted
        }
        fn send_message_delivery_status(&mut self, sequence_number: u32, error: ErrorCode) {
            lock(&self.calls).delivery_statuses.push((sequence_number, error));
        }
        fn flush_messages_from_app(&mut self, app_id: AppId) {
            lock(&self.calls).flushed_apps.push(app_id);
        }
    }
}
