//! WiFi request manager
//!
//! Two independent pipelines with the same shape: scan-monitor state
//! transitions and on-demand scans. Each keeps a FIFO queue with a single
//! platform operation in flight, guarded by a timeout timer. Platform
//! completions arrive as deferred work on the loop thread.

use std::collections::VecDeque;

use ctxhub_core::config::WifiConfig;
use ctxhub_core::errors::{ErrorCode, RequestError};
use ctxhub_core::multiplexer::RequestMultiplexer;
use ctxhub_core::types::{InstanceId, TimerHandle, Timestamp};
use ctxhub_core::wifi::{ScanMonitorRequest, WifiScanParams, WifiScanType};

use crate::event::{event_type, AsyncRequestType, AsyncResult, Event, EventPayload, EventPoster};
use crate::platform::WifiPlatform;
use crate::settings::{Setting, SettingManager};
use crate::timer_pool::{SystemTimerCallback, TimerPool};

// ----------------------------------------------------------------------------
// Scan Results
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WifiScanResult {
    pub ssid: Vec<u8>,
    pub bssid: [u8; 6],
    pub rssi: i8,
    pub frequency_mhz: u32,
}

/// One batch of scan results from the platform.
#[derive(Debug, Clone)]
pub struct WifiScanEventData {
    pub scan_type: WifiScanType,
    pub results: Vec<WifiScanResult>,
}

// ----------------------------------------------------------------------------
// Queued Work
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MonitorTransition {
    instance_id: InstanceId,
    enable: bool,
    cookie: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    /// Platform call issued, scan response not yet seen.
    Dispatched,
    /// Response accepted; waiting for the result event.
    Accepted,
}

#[derive(Debug)]
struct ScanRequest {
    instance_id: InstanceId,
    params: WifiScanParams,
    cookie: u32,
    phase: ScanPhase,
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

pub struct WifiRequestManager {
    platform: Box<dyn WifiPlatform>,
    poster: EventPoster,
    config: WifiConfig,

    monitor_subscribers: RequestMultiplexer<ScanMonitorRequest>,
    monitor_platform_enabled: bool,
    monitor_queue: VecDeque<MonitorTransition>,
    monitor_in_flight: bool,
    monitor_timer: Option<TimerHandle>,

    scan_queue: VecDeque<ScanRequest>,
    scan_in_flight: bool,
    scan_timer: Option<TimerHandle>,
    /// The scan most recently taken off the queue by completion.
    last_finished: Option<ScanRequest>,
}

impl WifiRequestManager {
    pub fn new(platform: Box<dyn WifiPlatform>, poster: EventPoster, config: WifiConfig) -> Self {
        Self {
            platform,
            poster,
            config,
            monitor_subscribers: RequestMultiplexer::new(),
            monitor_platform_enabled: false,
            monitor_queue: VecDeque::new(),
            monitor_in_flight: false,
            monitor_timer: None,
            scan_queue: VecDeque::new(),
            scan_in_flight: false,
            scan_timer: None,
            last_finished: None,
        }
    }

    pub fn scan_monitor_enabled(&self) -> bool {
        self.monitor_platform_enabled
    }

    pub fn has_monitor_subscription(&self, instance_id: InstanceId) -> bool {
        self.monitor_subscribers
            .find_request(instance_id)
            .map(|i| self.monitor_subscribers.get(i).map(|r| r.enabled) == Some(true))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Scan monitor
    // ------------------------------------------------------------------

    /// Queues a scan-monitor transition. Accepted requests always resolve
    /// asynchronously.
    pub fn configure_scan_monitor(
        &mut self,
        instance_id: InstanceId,
        enable: bool,
        cookie: u32,
        settings: &SettingManager,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) -> Result<(), RequestError> {
        if enable && !settings.get_setting_enabled(Setting::WifiAvailable) {
            self.post_monitor_result(instance_id, cookie, ErrorCode::FunctionDisabled);
            return Ok(());
        }
        if self.monitor_queue.len() >= self.config.max_scan_monitor_transitions {
            return Err(RequestError::QueueFull {
                capacity: self.config.max_scan_monitor_transitions,
            });
        }
        self.monitor_queue.push_back(MonitorTransition {
            instance_id,
            enable,
            cookie,
        });
        self.dispatch_monitor_queue(timer_pool, now);
        Ok(())
    }

    /// Platform completion for a scan-monitor change.
    pub fn handle_monitor_status(
        &mut self,
        enabled: bool,
        error: ErrorCode,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) {
        if !self.monitor_in_flight {
            tracing::warn!("unsolicited scan monitor status, enabled={}", enabled);
            return;
        }
        self.monitor_in_flight = false;
        if let Some(handle) = self.monitor_timer.take() {
            timer_pool.cancel(handle);
        }
        let Some(transition) = self.monitor_queue.pop_front() else {
            return;
        };
        if error.is_success() {
            self.commit_monitor_transition(&transition);
            self.monitor_platform_enabled = enabled;
            self.post_monitor_result(transition.instance_id, transition.cookie, ErrorCode::Success);
        } else {
            // There is no fallback state when turning monitoring off fails.
            assert!(
                transition.enable,
                "platform failed to disable wifi scan monitoring"
            );
            self.post_monitor_result(transition.instance_id, transition.cookie, error);
        }
        self.dispatch_monitor_queue(timer_pool, now);
    }

    /// The in-flight transition's deadline passed with no status.
    pub fn handle_monitor_timeout(&mut self, timer_pool: &mut TimerPool, now: Timestamp) {
        if !self.monitor_in_flight {
            return;
        }
        self.monitor_in_flight = false;
        self.monitor_timer = None;
        if let Some(transition) = self.monitor_queue.pop_front() {
            tracing::error!(
                "scan monitor transition for {} timed out",
                transition.instance_id
            );
            self.post_monitor_result(transition.instance_id, transition.cookie, ErrorCode::Timeout);
        }
        self.dispatch_monitor_queue(timer_pool, now);
    }

    fn dispatch_monitor_queue(&mut self, timer_pool: &mut TimerPool, now: Timestamp) {
        while !self.monitor_in_flight {
            let Some(front) = self.monitor_queue.front().cloned() else {
                return;
            };
            let desired = self.desired_monitor_state(&front);
            if desired == self.monitor_platform_enabled {
                // No physical change needed; commit and resolve in place.
                let transition = self.monitor_queue.pop_front().unwrap_or(front);
                self.commit_monitor_transition(&transition);
                self.post_monitor_result(
                    transition.instance_id,
                    transition.cookie,
                    ErrorCode::Success,
                );
                continue;
            }
            if self.platform.configure_scan_monitor(desired) {
                self.monitor_in_flight = true;
                self.monitor_timer = timer_pool.set_system_timer(
                    self.config.scan_monitor_timeout,
                    SystemTimerCallback::WifiScanMonitorTimeout,
                    now,
                );
                return;
            }
            let transition = self.monitor_queue.pop_front().unwrap_or(front);
            tracing::warn!(
                "platform rejected scan monitor change for {}",
                transition.instance_id
            );
            self.post_monitor_result(transition.instance_id, transition.cookie, ErrorCode::Generic);
        }
    }

    /// Platform state the front transition implies once applied on top of
    /// the current subscriber set.
    fn desired_monitor_state(&self, transition: &MonitorTransition) -> bool {
        if transition.enable {
            return true;
        }
        self.monitor_subscribers
            .requests()
            .iter()
            .any(|r| r.enabled && r.instance_id != transition.instance_id)
    }

    fn commit_monitor_transition(&mut self, transition: &MonitorTransition) {
        let request = ScanMonitorRequest::new(transition.instance_id, transition.enable);
        match self.monitor_subscribers.find_request(transition.instance_id) {
            Some(index) if !transition.enable => {
                self.monitor_subscribers.remove_request(index);
            }
            Some(index) => {
                self.monitor_subscribers.update_request(index, request);
            }
            None if transition.enable => {
                self.monitor_subscribers.add_request(request);
            }
            None => {}
        }
    }

    fn post_monitor_result(&self, instance_id: InstanceId, cookie: u32, error: ErrorCode) {
        self.poster.post_or_die(Event::new(
            event_type::WIFI_ASYNC_RESULT,
            EventPayload::AsyncResult(AsyncResult {
                request_type: AsyncRequestType::WifiConfigureScanMonitor,
                success: error.is_success(),
                error,
                cookie,
            }),
            InstanceId::SYSTEM,
            instance_id,
        ));
    }

    // ------------------------------------------------------------------
    // On-demand scans
    // ------------------------------------------------------------------

    /// Queues a one-shot scan. At most one scan is in flight; the rest wait
    /// FIFO.
    pub fn request_scan(
        &mut self,
        instance_id: InstanceId,
        params: WifiScanParams,
        cookie: u32,
        settings: &SettingManager,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) -> Result<(), RequestError> {
        params.validate()?;
        if !settings.get_setting_enabled(Setting::WifiAvailable) {
            self.post_scan_result(instance_id, cookie, ErrorCode::FunctionDisabled);
            return Ok(());
        }
        if self.scan_queue.len() >= self.config.max_scan_requests {
            return Err(RequestError::QueueFull {
                capacity: self.config.max_scan_requests,
            });
        }
        self.scan_queue.push_back(ScanRequest {
            instance_id,
            params,
            cookie,
            phase: ScanPhase::Dispatched,
        });
        self.dispatch_scan_queue(timer_pool, now);
        Ok(())
    }

    /// Platform acceptance/rejection of the in-flight scan.
    pub fn handle_scan_response(
        &mut self,
        pending: bool,
        error: ErrorCode,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) {
        if !self.scan_in_flight {
            tracing::warn!("unsolicited scan response");
            return;
        }
        if pending && error.is_success() {
            if let Some(active) = self.scan_queue.front_mut() {
                active.phase = ScanPhase::Accepted;
                let (id, cookie) = (active.instance_id, active.cookie);
                self.post_scan_result(id, cookie, ErrorCode::Success);
            }
            return;
        }
        self.finish_active_scan(timer_pool);
        if let Some(done) = self.last_finished.take() {
            let error = if error.is_success() { ErrorCode::Generic } else { error };
            self.post_scan_result(done.instance_id, done.cookie, error);
        }
        self.dispatch_scan_queue(timer_pool, now);
    }

    /// A batch of results. Completes the active scan (if any) and broadcasts
    /// to scan-monitor listeners.
    pub fn handle_scan_event(
        &mut self,
        data: WifiScanEventData,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) {
        self.finish_active_scan(timer_pool);
        if let Some(done) = self.last_finished.take() {
            self.poster.post_or_die(Event::new(
                event_type::WIFI_SCAN_RESULT,
                EventPayload::WifiScanResult(data.clone()),
                InstanceId::SYSTEM,
                done.instance_id,
            ));
        }
        // Monitor listeners see every batch, requester-driven or not.
        if self.monitor_platform_enabled {
            self.poster.post(
                Event::new(
                    event_type::WIFI_SCAN_RESULT,
                    EventPayload::WifiScanResult(data),
                    InstanceId::SYSTEM,
                    InstanceId::BROADCAST,
                )
                .low_priority(),
            );
        }
        self.dispatch_scan_queue(timer_pool, now);
    }

    pub fn handle_scan_timeout(&mut self, timer_pool: &mut TimerPool, now: Timestamp) {
        if !self.scan_in_flight {
            return;
        }
        self.scan_in_flight = false;
        self.scan_timer = None;
        if let Some(active) = self.scan_queue.pop_front() {
            match active.phase {
                ScanPhase::Dispatched => {
                    self.post_scan_result(active.instance_id, active.cookie, ErrorCode::Timeout);
                }
                ScanPhase::Accepted => {
                    // Success was already reported; results never came.
                    tracing::error!("scan results for {} never arrived", active.instance_id);
                }
            }
        }
        self.dispatch_scan_queue(timer_pool, now);
    }

    fn dispatch_scan_queue(&mut self, timer_pool: &mut TimerPool, now: Timestamp) {
        while !self.scan_in_flight {
            let Some(front) = self.scan_queue.front() else {
                return;
            };
            if self.platform.request_scan(&front.params) {
                self.scan_in_flight = true;
                self.scan_timer = timer_pool.set_system_timer(
                    self.config.scan_request_timeout,
                    SystemTimerCallback::WifiScanRequestTimeout,
                    now,
                );
                return;
            }
            if let Some(rejected) = self.scan_queue.pop_front() {
                self.post_scan_result(rejected.instance_id, rejected.cookie, ErrorCode::Generic);
            }
        }
    }

    fn finish_active_scan(&mut self, timer_pool: &mut TimerPool) {
        if !self.scan_in_flight {
            self.last_finished = None;
            return;
        }
        self.scan_in_flight = false;
        if let Some(handle) = self.scan_timer.take() {
            timer_pool.cancel(handle);
        }
        self.last_finished = self.scan_queue.pop_front();
    }

    fn post_scan_result(&self, instance_id: InstanceId, cookie: u32, error: ErrorCode) {
        self.poster.post_or_die(Event::new(
            event_type::WIFI_ASYNC_RESULT,
            EventPayload::AsyncResult(AsyncResult {
                request_type: AsyncRequestType::WifiRequestScan,
                success: error.is_success(),
                error,
                cookie,
            }),
            InstanceId::SYSTEM,
            instance_id,
        ));
    }

    // ------------------------------------------------------------------
    // Unload support
    // ------------------------------------------------------------------

    /// Withdraws everything the nanoapp owns; returns the subscription count
    /// released, for unload accounting.
    pub fn disable_all_subscriptions(
        &mut self,
        instance_id: InstanceId,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) -> u32 {
        let mut released = 0;
        if self.has_monitor_subscription(instance_id) {
            released += 1;
            self.monitor_queue.push_back(MonitorTransition {
                instance_id,
                enable: false,
                cookie: 0,
            });
            self.dispatch_monitor_queue(timer_pool, now);
        }
        // Queued scans are dropped outright; an in-flight scan finishes with
        // its results discarded.
        let in_flight = self.scan_in_flight;
        let before = self.scan_queue.len();
        let mut index = 0;
        self.scan_queue.retain(|r| {
            let keep = r.instance_id != instance_id || (index == 0 && in_flight);
            index += 1;
            keep
        });
        released += (before - self.scan_queue.len()) as u32;
        if in_flight {
            if let Some(active) = self.scan_queue.front_mut() {
                if active.instance_id == instance_id {
                    active.instance_id = InstanceId::SYSTEM;
                    released += 1;
                }
            }
        }
        released
    }
}

impl std::fmt::Debug for WifiRequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiRequestManager")
            .field("monitor_enabled", &self.monitor_platform_enabled)
            .field("monitor_queue", &self.monitor_queue.len())
            .field("scan_queue", &self.scan_queue.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
