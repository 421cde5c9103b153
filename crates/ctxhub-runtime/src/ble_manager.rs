//! BLE request manager
//!
//! Arbitrates all nanoapp scan requests into the single physical scan the
//! platform runs, with one platform operation outstanding at a time. Also
//! owns the batch-flush and RSSI-read pipelines and the resync handshake.

use std::collections::VecDeque;

use ctxhub_core::ble::{BleScanMode, BleScanRequest, RequestStatus};
use ctxhub_core::config::BleConfig;
use ctxhub_core::errors::{ErrorCode, RequestError};
use ctxhub_core::multiplexer::{MergeableRequest, RequestMultiplexer};
use ctxhub_core::types::{InstanceId, TimerHandle, Timestamp};

use crate::event::{
    event_type, AsyncRequestType, AsyncResult, BleAdvertisementReport, Event, EventPayload,
    EventPoster,
};
use crate::nanoapp::NanoappTable;
use crate::platform::{ble_capabilities, BlePlatform};
use crate::settings::{Setting, SettingManager};
use crate::timer_pool::{SystemTimerCallback, TimerPool};

/// RSSI value reported when a read fails, per the BT specification.
pub const RSSI_FAILURE: i8 = 0x7F;

// ----------------------------------------------------------------------------
// Queued Work
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FlushRequest {
    instance_id: InstanceId,
    cookie: u32,
}

#[derive(Debug, Clone)]
struct RssiRequest {
    instance_id: InstanceId,
    connection_handle: u16,
    cookie: u32,
}

/// Debug-dump record of one accepted configure call.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub instance_id: InstanceId,
    pub enabled: bool,
    pub mode: BleScanMode,
    pub at: Timestamp,
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

pub struct BleRequestManager {
    platform: Box<dyn BlePlatform>,
    poster: EventPoster,
    config: BleConfig,

    requests: RequestMultiplexer<BleScanRequest>,
    /// What the platform is currently running.
    active_platform_request: BleScanRequest,
    /// What the in-flight platform operation will make it run.
    pending_platform_request: Option<BleScanRequest>,
    pending_resync: bool,
    /// Last observed value of the BLE-available user setting.
    setting_enabled: bool,

    flush_queue: VecDeque<FlushRequest>,
    flush_timer: Option<TimerHandle>,

    rssi_queue: VecDeque<RssiRequest>,

    request_log: VecDeque<RequestLogEntry>,
}

impl BleRequestManager {
    pub fn new(platform: Box<dyn BlePlatform>, poster: EventPoster, config: BleConfig) -> Self {
        Self {
            platform,
            poster,
            config,
            requests: RequestMultiplexer::new(),
            active_platform_request: BleScanRequest::disabled(),
            pending_platform_request: None,
            pending_resync: false,
            setting_enabled: true,
            flush_queue: VecDeque::new(),
            flush_timer: None,
            rssi_queue: VecDeque::new(),
            request_log: VecDeque::new(),
        }
    }

    pub fn scan_enabled(&self) -> bool {
        self.active_platform_request.enabled
    }

    pub fn platform_operation_in_flight(&self) -> bool {
        self.pending_platform_request.is_some()
    }

    pub fn request_log(&self) -> impl Iterator<Item = &RequestLogEntry> {
        self.request_log.iter()
    }

    // ------------------------------------------------------------------
    // Configure
    // ------------------------------------------------------------------

    /// Accepts or rejects one nanoapp's scan request. Rejection is
    /// synchronous with no side effects; acceptance always resolves through
    /// an async result event.
    pub fn configure(
        &mut self,
        mut request: BleScanRequest,
        nanoapps: &mut NanoappTable,
        settings: &SettingManager,
        now: Timestamp,
    ) -> Result<(), RequestError> {
        request.validate()?;
        request.status = RequestStatus::PendingRequest;
        let instance_id = request.instance_id;

        // A still-unresolved earlier request is pre-empted: exactly one live
        // request per nanoapp.
        let existing = self.requests.find_request(instance_id);
        if let Some(index) = existing {
            if let Some(old) = self.requests.get(index) {
                if old.status != RequestStatus::Applied {
                    self.post_async_result(instance_id, old.enabled, ErrorCode::ObsoleteRequest, old.cookie);
                }
            }
        }

        if request.enabled && !settings.get_setting_enabled(Setting::BleAvailable) {
            self.post_async_result(instance_id, true, ErrorCode::FunctionDisabled, request.cookie);
            if let Some(index) = existing {
                self.requests.remove_request(index);
                self.unregister_for_advertisements(nanoapps, instance_id);
                self.dispatch_pending(nanoapps);
            }
            return Ok(());
        }

        if !request.enabled && existing.is_none() {
            // Nothing to stop; resolve immediately.
            self.post_async_result(instance_id, false, ErrorCode::Success, request.cookie);
            return Ok(());
        }

        self.log_request(&request, now);
        if request.enabled {
            if let Some(app) = nanoapps.get_mut(instance_id) {
                app.register_for_event(event_type::BLE_ADVERTISEMENT, event_type::DEFAULT_GROUP_MASK);
            }
        }
        match existing {
            Some(index) => {
                self.requests.update_request(index, request);
            }
            None => {
                self.requests.add_request(request);
            }
        }
        self.dispatch_pending(nanoapps);
        Ok(())
    }

    /// Withdraws the nanoapp's scan, for unload. Returns the number of
    /// subscriptions released.
    pub fn disable_active_scan(
        &mut self,
        instance_id: InstanceId,
        nanoapps: &mut NanoappTable,
        now: Timestamp,
    ) -> u32 {
        if self.requests.find_request(instance_id).is_none() {
            return 0;
        }
        let disable = BleScanRequest::disable(instance_id);
        // Unload ignores validation and posts no obsolete result; the app is
        // going away.
        self.log_request(&disable, now);
        if let Some(index) = self.requests.find_request(instance_id) {
            self.requests.update_request(index, disable);
        }
        self.unregister_for_advertisements(nanoapps, instance_id);
        self.dispatch_pending(nanoapps);
        1
    }

    /// Issues whatever platform change the request set currently implies.
    /// No-op while an operation is in flight; requests stay queued at
    /// `PendingRequest` and are picked up when the in-flight one resolves.
    fn dispatch_pending(&mut self, nanoapps: &mut NanoappTable) {
        if self.pending_platform_request.is_some() {
            return;
        }
        if !self.setting_enabled {
            // Enables accepted before the setting flipped off can no longer
            // be honored. Applied entries stay for restore on re-enable.
            let rejected: Vec<(InstanceId, u32)> = self
                .requests
                .requests()
                .iter()
                .filter(|r| r.status == RequestStatus::PendingRequest && r.enabled)
                .map(|r| (r.instance_id, r.cookie))
                .collect();
            self.requests
                .remove_requests_where(|r| r.status == RequestStatus::PendingRequest && r.enabled);
            for (instance_id, cookie) in rejected {
                self.unregister_for_advertisements(nanoapps, instance_id);
                self.post_async_result(instance_id, true, ErrorCode::FunctionDisabled, cookie);
            }
        }
        let maximal = if self.setting_enabled {
            self.requests.maximal_request().clone()
        } else {
            BleScanRequest::disabled()
        };
        let has_pending = self
            .requests
            .requests()
            .iter()
            .any(|r| r.status == RequestStatus::PendingRequest);

        if maximal.is_equivalent_to(&self.active_platform_request) {
            if !has_pending {
                return;
            }
            // The physical state already satisfies everyone; resolve without
            // touching the platform.
            let resolved = self.mark_pending(RequestStatus::Applied);
            for (instance_id, enabled, cookie) in resolved {
                self.post_async_result(instance_id, enabled, ErrorCode::Success, cookie);
            }
            self.prune_disabled(nanoapps);
            return;
        }

        let accepted = if maximal.enabled {
            self.platform.start_scan(&maximal)
        } else {
            self.platform.stop_scan()
        };
        if accepted {
            self.mark_pending(RequestStatus::PendingResponse);
            self.pending_platform_request = Some(maximal);
            return;
        }
        // A platform that cannot accept a stop has lost track of state; no
        // rollback exists for that.
        assert!(maximal.enabled, "platform rejected a BLE scan disable");
        let rolled_back = self.take_pending_requests();
        for (instance_id, enabled, cookie) in rolled_back {
            self.unregister_for_advertisements(nanoapps, instance_id);
            self.post_async_result(instance_id, enabled, ErrorCode::Generic, cookie);
        }
    }

    /// Platform completion for a start/stop/reconfigure operation.
    pub fn handle_platform_change(
        &mut self,
        enabled: bool,
        error: ErrorCode,
        nanoapps: &mut NanoappTable,
    ) {
        let Some(target) = self.pending_platform_request.take() else {
            tracing::warn!("unsolicited BLE platform change, enabled={}", enabled);
            return;
        };
        if error.is_success() {
            if enabled != target.enabled {
                tracing::error!(
                    "platform reported enabled={} for a request with enabled={}",
                    enabled,
                    target.enabled
                );
            }
            self.active_platform_request = target;
            let resolved = self.mark_in_flight(RequestStatus::Applied);
            for (instance_id, was_enabled, cookie) in resolved {
                self.post_async_result(instance_id, was_enabled, ErrorCode::Success, cookie);
            }
            self.prune_disabled(nanoapps);
        } else {
            assert!(target.enabled, "platform failed to disable BLE scanning");
            // No partial commit: every request that was part of the failed
            // operation is discarded entirely.
            let discarded = self.take_in_flight_requests();
            for (instance_id, was_enabled, cookie) in discarded {
                self.unregister_for_advertisements(nanoapps, instance_id);
                self.post_async_result(instance_id, was_enabled, error, cookie);
            }
        }
        if self.pending_resync {
            self.pending_resync = false;
            self.force_platform_sync();
        }
        self.dispatch_pending(nanoapps);
    }

    /// The platform asked for a full state resync (for example after a
    /// low-power cycle). Coalesced: deferred while an operation is in
    /// flight.
    pub fn handle_resync_request(&mut self) {
        if self.pending_platform_request.is_some() {
            self.pending_resync = true;
        } else {
            self.force_platform_sync();
        }
    }

    /// Runtime flip of the BLE-available user setting. Disabling stops the
    /// platform scan but keeps subscriber entries, so re-enabling restores
    /// them without new configure calls.
    pub fn handle_setting_changed(&mut self, enabled: bool) {
        self.setting_enabled = enabled;
        self.handle_resync_request();
    }

    /// Re-issues the current maximal request unconditionally.
    fn force_platform_sync(&mut self) {
        let maximal = if self.setting_enabled {
            self.requests.maximal_request().clone()
        } else {
            BleScanRequest::disabled()
        };
        let accepted = if maximal.enabled {
            self.platform.start_scan(&maximal)
        } else if self.active_platform_request.enabled {
            self.platform.stop_scan()
        } else {
            // Both sides agree scanning is off.
            return;
        };
        if accepted {
            self.pending_platform_request = Some(maximal);
        } else {
            tracing::error!("platform rejected resync dispatch");
        }
    }

    /// Fans one advertisement batch out to registered nanoapps.
    pub fn handle_advertisements(&mut self, reports: Vec<BleAdvertisementReport>) {
        for report in reports {
            self.poster.post(
                Event::new(
                    event_type::BLE_ADVERTISEMENT,
                    EventPayload::BleAdvertisement(report),
                    InstanceId::SYSTEM,
                    InstanceId::BROADCAST,
                )
                .low_priority(),
            );
        }
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    /// Requests delivery of batched advertisements ahead of the report
    /// delay. One flush runs at a time; up to `max_flush_requests` wait.
    pub fn flush_async(
        &mut self,
        instance_id: InstanceId,
        cookie: u32,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) -> Result<(), RequestError> {
        if self.platform.capabilities() & ble_capabilities::BATCHING == 0 {
            return Err(RequestError::NotSupported);
        }
        if self.flush_queue.len() >= self.config.max_flush_requests {
            return Err(RequestError::QueueFull {
                capacity: self.config.max_flush_requests,
            });
        }
        self.flush_queue.push_back(FlushRequest { instance_id, cookie });
        if self.flush_queue.len() == 1 && !self.dispatch_flush(timer_pool, now) {
            self.flush_queue.pop_back();
            return Err(RequestError::PlatformRejected);
        }
        Ok(())
    }

    pub fn handle_flush_complete(
        &mut self,
        error: ErrorCode,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) {
        if let Some(handle) = self.flush_timer.take() {
            timer_pool.cancel(handle);
        }
        let Some(done) = self.flush_queue.pop_front() else {
            tracing::warn!("unsolicited BLE flush completion");
            return;
        };
        self.post_flush_complete(&done, error);
        // Replay the queue; later entries were accepted queued, so dispatch
        // failure resolves them with an event rather than an error return.
        while !self.flush_queue.is_empty() && !self.dispatch_flush(timer_pool, now) {
            if let Some(rejected) = self.flush_queue.pop_front() {
                self.post_flush_complete(&rejected, ErrorCode::Generic);
            }
        }
    }

    pub fn handle_flush_timeout(&mut self, timer_pool: &mut TimerPool, now: Timestamp) {
        self.flush_timer = None;
        self.handle_flush_complete(ErrorCode::Timeout, timer_pool, now);
    }

    fn dispatch_flush(&mut self, timer_pool: &mut TimerPool, now: Timestamp) -> bool {
        if !self.platform.flush() {
            return false;
        }
        self.flush_timer = timer_pool.set_system_timer(
            self.config.flush_timeout,
            SystemTimerCallback::BleFlushTimeout,
            now,
        );
        true
    }

    fn post_flush_complete(&self, request: &FlushRequest, error: ErrorCode) {
        self.poster.post_or_die(Event::new(
            event_type::BLE_FLUSH_COMPLETE,
            EventPayload::BleFlushComplete { error },
            InstanceId::SYSTEM,
            request.instance_id,
        ));
        self.poster.post_or_die(Event::new(
            event_type::BLE_ASYNC_RESULT,
            EventPayload::AsyncResult(AsyncResult {
                request_type: AsyncRequestType::BleFlush,
                success: error.is_success(),
                error,
                cookie: request.cookie,
            }),
            InstanceId::SYSTEM,
            request.instance_id,
        ));
    }

    // ------------------------------------------------------------------
    // RSSI
    // ------------------------------------------------------------------

    /// Reads RSSI on a connection. The front of the queue is in flight; a
    /// synchronous platform rejection resolves with [`RSSI_FAILURE`] and the
    /// queue drains until one dispatch sticks.
    pub fn read_rssi_async(
        &mut self,
        instance_id: InstanceId,
        connection_handle: u16,
        cookie: u32,
    ) -> Result<(), RequestError> {
        if self.platform.capabilities() & ble_capabilities::READ_RSSI == 0 {
            return Err(RequestError::NotSupported);
        }
        if self.rssi_queue.len() >= self.config.max_rssi_requests {
            return Err(RequestError::QueueFull {
                capacity: self.config.max_rssi_requests,
            });
        }
        self.rssi_queue.push_back(RssiRequest {
            instance_id,
            connection_handle,
            cookie,
        });
        if self.rssi_queue.len() == 1 {
            self.drain_rssi_queue();
        }
        Ok(())
    }

    pub fn handle_rssi_response(&mut self, connection_handle: u16, rssi: i8, error: ErrorCode) {
        let Some(done) = self.rssi_queue.pop_front() else {
            tracing::warn!("unsolicited RSSI response for handle {}", connection_handle);
            return;
        };
        if done.connection_handle != connection_handle {
            tracing::error!(
                "RSSI response handle {} does not match in-flight {}",
                connection_handle,
                done.connection_handle
            );
        }
        self.post_rssi_result(&done, rssi, error);
        self.drain_rssi_queue();
    }

    /// Dispatches the queue front, resolving synchronous rejections with
    /// the failure RSSI until one dispatch is accepted.
    fn drain_rssi_queue(&mut self) {
        while let Some(front) = self.rssi_queue.front() {
            if self.platform.read_rssi(front.connection_handle) {
                return;
            }
            if let Some(rejected) = self.rssi_queue.pop_front() {
                self.post_rssi_result(&rejected, RSSI_FAILURE, ErrorCode::Generic);
            }
        }
    }

    fn post_rssi_result(&self, request: &RssiRequest, rssi: i8, error: ErrorCode) {
        self.poster.post_or_die(Event::new(
            event_type::BLE_RSSI_RESULT,
            EventPayload::BleRssiResult {
                connection_handle: request.connection_handle,
                rssi,
                error,
            },
            InstanceId::SYSTEM,
            request.instance_id,
        ));
        self.poster.post_or_die(Event::new(
            event_type::BLE_ASYNC_RESULT,
            EventPayload::AsyncResult(AsyncResult {
                request_type: AsyncRequestType::BleReadRssi,
                success: error.is_success(),
                error,
                cookie: request.cookie,
            }),
            InstanceId::SYSTEM,
            request.instance_id,
        ));
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Moves every `PendingRequest` entry to `status`; returns
    /// (instance, enabled, cookie) per entry moved.
    fn mark_pending(&mut self, status: RequestStatus) -> Vec<(InstanceId, bool, u32)> {
        self.transition(RequestStatus::PendingRequest, status)
    }

    /// Moves every `PendingResponse` entry to `status`.
    fn mark_in_flight(&mut self, status: RequestStatus) -> Vec<(InstanceId, bool, u32)> {
        self.transition(RequestStatus::PendingResponse, status)
    }

    fn transition(
        &mut self,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Vec<(InstanceId, bool, u32)> {
        let mut moved = Vec::new();
        for request in self.requests.requests_mut() {
            if request.status == from {
                request.status = to;
                moved.push((request.instance_id, request.enabled, request.cookie));
            }
        }
        moved
    }

    fn take_pending_requests(&mut self) -> Vec<(InstanceId, bool, u32)> {
        self.take_with_status(RequestStatus::PendingRequest)
    }

    fn take_in_flight_requests(&mut self) -> Vec<(InstanceId, bool, u32)> {
        self.take_with_status(RequestStatus::PendingResponse)
    }

    fn take_with_status(&mut self, status: RequestStatus) -> Vec<(InstanceId, bool, u32)> {
        let taken: Vec<(InstanceId, bool, u32)> = self
            .requests
            .requests()
            .iter()
            .filter(|r| r.status == status)
            .map(|r| (r.instance_id, r.enabled, r.cookie))
            .collect();
        self.requests.remove_requests_where(|r| r.status == status);
        taken
    }

    /// Entries whose disable has been applied have no further effect on the
    /// maximal request and are not retained.
    fn prune_disabled(&mut self, nanoapps: &mut NanoappTable) {
        let stale: Vec<InstanceId> = self
            .requests
            .requests()
            .iter()
            .filter(|r| !r.enabled && r.status == RequestStatus::Applied)
            .map(|r| r.instance_id)
            .collect();
        if stale.is_empty() {
            return;
        }
        self.requests
            .remove_requests_where(|r| !r.enabled && r.status == RequestStatus::Applied);
        for instance_id in stale {
            self.unregister_for_advertisements(nanoapps, instance_id);
        }
    }

    fn unregister_for_advertisements(&self, nanoapps: &mut NanoappTable, instance_id: InstanceId) {
        if let Some(app) = nanoapps.get_mut(instance_id) {
            app.unregister_for_event(event_type::BLE_ADVERTISEMENT);
        }
    }

    fn post_async_result(&self, instance_id: InstanceId, enabled: bool, error: ErrorCode, cookie: u32) {
        self.poster.post_or_die(Event::new(
            event_type::BLE_ASYNC_RESULT,
            EventPayload::AsyncResult(AsyncResult {
                request_type: if enabled {
                    AsyncRequestType::BleStartScan
                } else {
                    AsyncRequestType::BleStopScan
                },
                success: error.is_success(),
                error,
                cookie,
            }),
            InstanceId::SYSTEM,
            instance_id,
        ));
    }

    fn log_request(&mut self, request: &BleScanRequest, now: Timestamp) {
        if self.request_log.len() >= self.config.request_log_entries {
            self.request_log.pop_front();
        }
        self.request_log.push_back(RequestLogEntry {
            instance_id: request.instance_id,
            enabled: request.enabled,
            mode: request.mode,
            at: now,
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPool, EventQueue};
    use crate::nanoapp::{Nanoapp, NanoappHandler, NanoappTable};
    use crate::platform::testing::{FakeBlePlatform, ManualSystemTimer};
    use ctxhub_core::ble::RSSI_THRESHOLD_NONE;
    use ctxhub_core::config::TimerPoolConfig;
    use ctxhub_core::types::{AppId, ManualTimeSource};
    use std::sync::Arc;

    struct NullHandler;
    impl NanoappHandler for NullHandler {
        fn start(&mut self, _ctx: &mut dyn crate::event_loop::NanoappContext) -> bool {
            true
        }
        fn handle_event(
            &mut self,
            _ctx: &mut dyn crate::event_loop::NanoappContext,
            _t: u16,
            _p: &EventPayload,
        ) {
        }
        fn end(&mut self, _ctx: &mut dyn crate::event_loop::NanoappContext) {}
    }

    struct Fixture {
        mgr: BleRequestManager,
        platform: FakeBlePlatform,
        nanoapps: NanoappTable,
        settings: SettingManager,
        timers: TimerPool,
        queue: Arc<EventQueue>,
        a: InstanceId,
        b: InstanceId,
    }

    fn fixture() -> Fixture {
        let platform = FakeBlePlatform::new();
        let queue = Arc::new(EventQueue::new());
        let poster = EventPoster::new(
            EventPool::new(64),
            Arc::clone(&queue),
            Arc::new(ManualTimeSource::new()),
            4,
        );
        let mgr = BleRequestManager::new(Box::new(platform.clone()), poster, BleConfig::default());
        let mut nanoapps = NanoappTable::new();
        let a = nanoapps.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xa), 1, 0),
            Box::new(NullHandler),
        );
        let b = nanoapps.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xb), 1, 0),
            Box::new(NullHandler),
        );
        let timers = TimerPool::new(
            TimerPoolConfig::default(),
            Box::new(ManualSystemTimer::new()),
        );
        Fixture {
            mgr,
            platform,
            nanoapps,
            settings: SettingManager::new(),
            timers,
            queue,
            a,
            b,
        }
    }

    fn enable(id: InstanceId, mode: BleScanMode, delay: u32) -> BleScanRequest {
        BleScanRequest::enable(id, mode, delay, RSSI_THRESHOLD_NONE, Vec::new(), Vec::new())
    }

    /// Async results drained from the queue as (target, error) pairs.
    fn drain_results(queue: &EventQueue) -> Vec<(InstanceId, ErrorCode)> {
        std::iter::from_fn(|| queue.try_pop())
            .filter_map(|e| match e.event.payload {
                EventPayload::AsyncResult(r) => Some((e.event.target, r.error)),
                _ => None,
            })
            .collect()
    }

    fn now() -> Timestamp {
        Timestamp::from_nanos(0)
    }

    #[test]
    fn second_request_queues_behind_in_flight_operation() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.start_count(), 1);

        // B arrives while A's operation is in flight: no second call yet.
        f.mgr.configure(
            enable(f.b, BleScanMode::Aggressive, 5000),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.start_count(), 1);

        // A's completion applies A and dispatches the merged request.
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        assert_eq!(f.platform.start_count(), 2);
        let merged = f.platform.last_start().unwrap();
        assert_eq!(merged.mode, BleScanMode::Aggressive);
        assert_eq!(merged.report_delay_ms, 0);
        assert_eq!(drain_results(&f.queue), vec![(f.a, ErrorCode::Success)]);

        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        assert_eq!(drain_results(&f.queue), vec![(f.b, ErrorCode::Success)]);
        assert!(!f.mgr.platform_operation_in_flight());
    }

    #[test]
    fn equivalent_request_skips_platform_call() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Foreground, 100),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        drain_results(&f.queue);

        f.mgr.configure(
            enable(f.b, BleScanMode::Foreground, 100),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.start_count(), 1, "no physical change needed");
        assert_eq!(drain_results(&f.queue), vec![(f.b, ErrorCode::Success)]);
    }

    #[test]
    fn failed_enable_discards_all_in_flight_requests() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.handle_platform_change(false, ErrorCode::Generic, &mut f.nanoapps);
        assert_eq!(drain_results(&f.queue), vec![(f.a, ErrorCode::Generic)]);
        assert!(!f.mgr.scan_enabled());
        // The discarded app no longer receives advertisements.
        assert!(!f
            .nanoapps
            .get(f.a)
            .unwrap()
            .is_registered_for(event_type::BLE_ADVERTISEMENT, event_type::DEFAULT_GROUP_MASK));
    }

    #[test]
    fn unresolved_request_is_preempted_as_obsolete() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.configure(
            enable(f.a, BleScanMode::Aggressive, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(
            drain_results(&f.queue),
            vec![(f.a, ErrorCode::ObsoleteRequest)]
        );
    }

    #[test]
    fn setting_gate_fails_enable_asynchronously() {
        let mut f = fixture();
        f.settings.apply_change(Setting::BleAvailable, false);
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.start_count(), 0);
        assert_eq!(
            drain_results(&f.queue),
            vec![(f.a, ErrorCode::FunctionDisabled)]
        );
    }

    #[test]
    fn disable_with_no_request_succeeds_immediately() {
        let mut f = fixture();
        f.mgr.configure(
            BleScanRequest::disable(f.a),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.stop_count(), 0);
        assert_eq!(drain_results(&f.queue), vec![(f.a, ErrorCode::Success)]);
    }

    #[test]
    fn last_disable_stops_scan_and_prunes_entry() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        drain_results(&f.queue);

        f.mgr.configure(
            BleScanRequest::disable(f.a),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.stop_count(), 1);
        f.mgr.handle_platform_change(false, ErrorCode::Success, &mut f.nanoapps);
        assert_eq!(drain_results(&f.queue), vec![(f.a, ErrorCode::Success)]);
        assert_eq!(f.mgr.requests.len(), 0, "applied disable is pruned");
    }

    #[test]
    #[should_panic(expected = "disable")]
    fn failed_disable_is_fatal() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        f.mgr.configure(
            BleScanRequest::disable(f.a),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.handle_platform_change(true, ErrorCode::Generic, &mut f.nanoapps);
    }

    #[test]
    fn resync_is_deferred_while_operation_in_flight() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.start_count(), 1);
        f.mgr.handle_resync_request();
        assert_eq!(f.platform.start_count(), 1, "resync coalesced");
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        assert_eq!(f.platform.start_count(), 2, "resync replayed after completion");
    }

    #[test]
    fn setting_flip_stops_scan_and_restores_it_on_return() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Foreground, 100),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        drain_results(&f.queue);
        assert_eq!(f.platform.start_count(), 1);

        f.settings.apply_change(Setting::BleAvailable, false);
        f.mgr.handle_setting_changed(false);
        assert_eq!(f.platform.stop_count(), 1);
        f.mgr.handle_platform_change(false, ErrorCode::Success, &mut f.nanoapps);
        assert_eq!(
            f.platform.start_count(),
            1,
            "scan stays stopped while the setting is off"
        );
        assert!(!f.mgr.scan_enabled());
        assert_eq!(f.mgr.requests.len(), 1, "subscriber entry is kept");

        f.settings.apply_change(Setting::BleAvailable, true);
        f.mgr.handle_setting_changed(true);
        assert_eq!(
            f.platform.start_count(),
            2,
            "kept subscriber restored without a new configure"
        );
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        assert!(f.mgr.scan_enabled());
        assert_eq!(f.platform.last_start().unwrap().mode, BleScanMode::Foreground);
    }

    #[test]
    fn pending_enable_fails_when_setting_flips_off_mid_flight() {
        let mut f = fixture();
        f.mgr.configure(
            enable(f.a, BleScanMode::Background, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        f.mgr.configure(
            enable(f.b, BleScanMode::Aggressive, 0),
            &mut f.nanoapps,
            &f.settings,
            now(),
        )
        .unwrap();
        assert_eq!(f.platform.start_count(), 1, "b queued behind a");

        f.settings.apply_change(Setting::BleAvailable, false);
        f.mgr.handle_setting_changed(false);

        // A's completion replays the deferred resync as a stop.
        f.mgr.handle_platform_change(true, ErrorCode::Success, &mut f.nanoapps);
        assert_eq!(f.platform.stop_count(), 1);
        assert_eq!(drain_results(&f.queue), vec![(f.a, ErrorCode::Success)]);

        // The stop completing rejects b's queued enable instead of starting.
        f.mgr.handle_platform_change(false, ErrorCode::Success, &mut f.nanoapps);
        assert_eq!(f.platform.start_count(), 1);
        assert_eq!(
            drain_results(&f.queue),
            vec![(f.b, ErrorCode::FunctionDisabled)]
        );
        assert!(!f
            .nanoapps
            .get(f.b)
            .unwrap()
            .is_registered_for(event_type::BLE_ADVERTISEMENT, event_type::DEFAULT_GROUP_MASK));
    }

    #[test]
    fn rssi_rejection_drains_queue_with_failure_rssi() {
        let mut f = fixture();
        f.platform.set_accept(false);
        f.mgr.read_rssi_async(f.a, 42, 0).unwrap();
        let results: Vec<(InstanceId, i8)> = std::iter::from_fn(|| f.queue.try_pop())
            .filter_map(|e| match e.event.payload {
                EventPayload::BleRssiResult { rssi, .. } => Some((e.event.target, rssi)),
                _ => None,
            })
            .collect();
        assert_eq!(results, vec![(f.a, RSSI_FAILURE)]);
    }

    #[test]
    fn flush_queue_serializes_and_times_out() {
        let mut f = fixture();
        f.mgr.flush_async(f.a, 1, &mut f.timers, now()).unwrap();
        f.mgr.flush_async(f.b, 2, &mut f.timers, now()).unwrap();
        {
            let calls = f.platform.calls.lock().unwrap();
            assert_eq!(calls.flushes, 1, "one flush in flight");
        }
        f.mgr.handle_flush_timeout(&mut f.timers, now());
        let mut statuses: Vec<(InstanceId, ErrorCode)> = std::iter::from_fn(|| f.queue.try_pop())
            .filter_map(|e| match e.event.payload {
                EventPayload::BleFlushComplete { error } => Some((e.event.target, error)),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.remove(0), (f.a, ErrorCode::Timeout));
        let calls = f.platform.calls.lock().unwrap();
        assert_eq!(calls.flushes, 2, "next flush dispatched");
    }

    #[test]
    fn flush_queue_capacity_is_enforced() {
        let mut f = fixture();
        for i in 0..BleConfig::default().max_flush_requests {
            f.mgr.flush_async(f.a, i as u32, &mut f.timers, now()).unwrap();
        }
        assert!(matches!(
            f.mgr.flush_async(f.b, 99, &mut f.timers, now()),
            Err(RequestError::QueueFull { .. })
        ));
    }
}

impl std::fmt::Debug for BleRequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleRequestManager")
            .field("requests", &self.requests.len())
            .field("scan_enabled", &self.scan_enabled())
            .field("in_flight", &self.platform_operation_in_flight())
            .field("flush_queue", &self.flush_queue.len())
            .field("rssi_queue", &self.rssi_queue.len())
            .finish()
    }
}
