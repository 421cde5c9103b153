//! The context hub event loop
//!
//! One dedicated thread pops events off a single FIFO and fans them out to
//! nanoapps. Everything that touches hub state runs here; platform threads
//! only ever post [`SystemCall`] events through a [`HubHandle`]. Handlers
//! run to completion, so no nanoapp ever observes the framework mid-update.

use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use ctxhub_core::ble::BleScanRequest;
use ctxhub_core::config::HubConfig;
use ctxhub_core::errors::{CtxhubError, ErrorCode, LifecycleError, RequestError};
use ctxhub_core::types::{
    AppId, HostEndpoint, InstanceId, TimeSource, TimerHandle, Timestamp,
};
use ctxhub_core::wifi::WifiScanParams;

use crate::ble_manager::BleRequestManager;
use crate::event::{
    event_type, BleAdvertisementReport, Event, EventPayload, EventPool, EventPoster,
    EventQueue, PooledEvent,
};
use crate::host_comms::{HostCommsManager, MessageFreeCallback, MessageFromHost};
use crate::nanoapp::{BlockId, Nanoapp, NanoappHandler, NanoappTable};
use crate::platform::{BlePlatform, HostLink, SystemTimer, WifiPlatform};
use crate::settings::{Setting, SettingManager};
use crate::timer_pool::{SystemTimerCallback, TimerKind, TimerPool};
use crate::wifi_manager::{WifiRequestManager, WifiScanEventData};

// ----------------------------------------------------------------------------
// Deferred Work
// ----------------------------------------------------------------------------

/// Work marshalled onto the loop thread. Platform callbacks wrap their
/// parameters in one of these and post it; the loop dispatches the whole
/// union in a single match, so manager state is only ever touched from one
/// thread.
#[derive(Debug)]
pub enum SystemCall {
    /// Clears the running flag. Queued like any other event, so everything
    /// posted before the stop request drains first.
    Stop,
    /// The backing hardware timer fired.
    TimerFired,
    BleScanResponse {
        enabled: bool,
        error: ErrorCode,
    },
    BleAdvertisements(Vec<BleAdvertisementReport>),
    BleFlushComplete {
        error: ErrorCode,
    },
    BleRssiResponse {
        connection_handle: u16,
        rssi: i8,
        error: ErrorCode,
    },
    BleRequestResync,
    WifiScanMonitorStatus {
        enabled: bool,
        error: ErrorCode,
    },
    WifiScanResponse {
        pending: bool,
        error: ErrorCode,
    },
    WifiScanEvent(WifiScanEventData),
    HostMessageReceived(MessageFromHost),
    MessageDeliveryStatus {
        sequence_number: u32,
        error: ErrorCode,
    },
    SettingChanged {
        setting: Setting,
        enabled: bool,
    },
    UnloadNanoapp {
        instance_id: InstanceId,
    },
    HostAwakeChanged {
        awake: bool,
    },
}

// ----------------------------------------------------------------------------
// Nanoapp Context
// ----------------------------------------------------------------------------

/// Framework surface available to a nanoapp while one of its callbacks is
/// running. Everything here executes synchronously on the loop thread.
pub trait NanoappContext {
    fn instance_id(&self) -> InstanceId;
    fn now(&self) -> Timestamp;

    fn register_for_event(&mut self, event_type: u16, group_mask: u16);
    fn unregister_for_event(&mut self, event_type: u16) -> bool;
    fn register_host_endpoint(&mut self, endpoint: HostEndpoint);

    /// `None` when the timer pool is full.
    fn set_timer(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        cookie: u64,
    ) -> Option<TimerHandle>;
    /// Canceling a handle that already fired is a tolerated no-op.
    fn cancel_timer(&mut self, handle: TimerHandle) -> bool;

    /// The request's instance id is overwritten with the caller's.
    fn configure_ble_scan(&mut self, request: BleScanRequest) -> Result<(), RequestError>;
    fn ble_flush(&mut self, cookie: u32) -> Result<(), RequestError>;
    fn ble_read_rssi(&mut self, connection_handle: u16, cookie: u32)
        -> Result<(), RequestError>;

    fn configure_wifi_scan_monitor(
        &mut self,
        enable: bool,
        cookie: u32,
    ) -> Result<(), RequestError>;
    fn request_wifi_scan(
        &mut self,
        params: WifiScanParams,
        cookie: u32,
    ) -> Result<(), RequestError>;

    #[allow(clippy::too_many_arguments)]
    fn send_host_message(
        &mut self,
        endpoint: HostEndpoint,
        message_type: u32,
        payload: Vec<u8>,
        permissions: u32,
        reliable: bool,
        free_callback: Option<MessageFreeCallback>,
    ) -> Result<(), CtxhubError>;

    /// Nanoapp-to-nanoapp event, admitted at low priority.
    fn post_event(&mut self, event_type: u16, payload: EventPayload, target: InstanceId)
        -> bool;

    /// `None` signals exhaustion, never blocking.
    fn alloc(&mut self, size: usize) -> Option<BlockId>;
    fn free(&mut self, block: BlockId) -> bool;

    fn find_instance_by_app_id(&self, app_id: AppId) -> Option<InstanceId>;
}

struct HubContext<'a> {
    instance_id: InstanceId,
    state: &'a mut HubState,
}

impl NanoappContext for HubContext<'_> {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn now(&self) -> Timestamp {
        self.state.time.now()
    }

    fn register_for_event(&mut self, event_type: u16, group_mask: u16) {
        if let Some(app) = self.state.nanoapps.get_mut(self.instance_id) {
            app.register_for_event(event_type, group_mask);
        }
    }

    fn unregister_for_event(&mut self, event_type: u16) -> bool {
        self.state
            .nanoapps
            .get_mut(self.instance_id)
            .map_or(false, |app| app.unregister_for_event(event_type))
    }

    fn register_host_endpoint(&mut self, endpoint: HostEndpoint) {
        if let Some(app) = self.state.nanoapps.get_mut(self.instance_id) {
            app.register_host_endpoint(endpoint);
        }
    }

    fn set_timer(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        cookie: u64,
    ) -> Option<TimerHandle> {
        let now = self.state.time.now();
        self.state
            .timer_pool
            .set_nanoapp_timer(self.instance_id, delay, period, cookie, now)
    }

    fn cancel_timer(&mut self, handle: TimerHandle) -> bool {
        self.state.timer_pool.cancel(handle)
    }

    fn configure_ble_scan(&mut self, mut request: BleScanRequest) -> Result<(), RequestError> {
        request.instance_id = self.instance_id;
        let now = self.state.time.now();
        let state = &mut *self.state;
        state
            .ble
            .configure(request, &mut state.nanoapps, &state.settings, now)
    }

    fn ble_flush(&mut self, cookie: u32) -> Result<(), RequestError> {
        let now = self.state.time.now();
        let state = &mut *self.state;
        state
            .ble
            .flush_async(self.instance_id, cookie, &mut state.timer_pool, now)
    }

    fn ble_read_rssi(
        &mut self,
        connection_handle: u16,
        cookie: u32,
    ) -> Result<(), RequestError> {
        self.state
            .ble
            .read_rssi_async(self.instance_id, connection_handle, cookie)
    }

    fn configure_wifi_scan_monitor(
        &mut self,
        enable: bool,
        cookie: u32,
    ) -> Result<(), RequestError> {
        let now = self.state.time.now();
        let state = &mut *self.state;
        state.wifi.configure_scan_monitor(
            self.instance_id,
            enable,
            cookie,
            &state.settings,
            &mut state.timer_pool,
            now,
        )
    }

    fn request_wifi_scan(
        &mut self,
        params: WifiScanParams,
        cookie: u32,
    ) -> Result<(), RequestError> {
        let now = self.state.time.now();
        let state = &mut *self.state;
        state.wifi.request_scan(
            self.instance_id,
            params,
            cookie,
            &state.settings,
            &mut state.timer_pool,
            now,
        )
    }

    fn send_host_message(
        &mut self,
        endpoint: HostEndpoint,
        message_type: u32,
        payload: Vec<u8>,
        permissions: u32,
        reliable: bool,
        free_callback: Option<MessageFreeCallback>,
    ) -> Result<(), CtxhubError> {
        let now = self.state.time.now();
        let state = &mut *self.state;
        let Some(app) = state.nanoapps.get_mut(self.instance_id) else {
            return Err(LifecycleError::NotFound {
                instance_id: self.instance_id,
            }
            .into());
        };
        state.host_comms.send_message_async(
            app,
            endpoint,
            message_type,
            payload,
            permissions,
            reliable,
            free_callback,
            &mut state.timer_pool,
            now,
        )
    }

    fn post_event(
        &mut self,
        event_type: u16,
        payload: EventPayload,
        target: InstanceId,
    ) -> bool {
        self.state
            .poster
            .post(Event::new(event_type, payload, self.instance_id, target).low_priority())
    }

    fn alloc(&mut self, size: usize) -> Option<BlockId> {
        self.state
            .nanoapps
            .get_mut(self.instance_id)
            .map(|app| app.arena.alloc(size))
    }

    fn free(&mut self, block: BlockId) -> bool {
        self.state
            .nanoapps
            .get_mut(self.instance_id)
            .map_or(false, |app| app.arena.free(block))
    }

    fn find_instance_by_app_id(&self, app_id: AppId) -> Option<InstanceId> {
        self.state.nanoapps.find_by_app_id(app_id)
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable, thread-safe entry point into the loop. Platform glue holds
/// one of these and posts deferred work through it.
#[derive(Clone)]
pub struct HubHandle {
    poster: EventPoster,
    directory: Arc<Mutex<std::collections::HashMap<AppId, InstanceId>>>,
}

impl HubHandle {
    /// Framework-critical post; panics only if the pool is exhausted and
    /// nothing sheddable remains.
    pub fn post_system_call(&self, call: SystemCall) {
        self.poster.post_or_die(Event::system_call(call));
    }

    /// Best-effort post of an ordinary event.
    pub fn post_event(&self, event: Event) -> bool {
        self.poster.post(event)
    }

    /// Requests a stop through the queue, so everything already posted is
    /// processed first.
    pub fn stop(&self) {
        self.post_system_call(SystemCall::Stop);
    }

    /// Off-thread nanoapp lookup. Takes the directory mutex; loop-thread
    /// code reads the table directly instead.
    pub fn find_instance_by_app_id(&self, app_id: AppId) -> Option<InstanceId> {
        let directory = match self.directory.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        directory.get(&app_id).copied()
    }

    pub fn poster(&self) -> &EventPoster {
        &self.poster
    }
}

// ----------------------------------------------------------------------------
// Hub State
// ----------------------------------------------------------------------------

/// Loop-thread observability counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubStats {
    pub events_processed: u64,
    pub max_queue_depth: usize,
}

struct HubState {
    config: HubConfig,
    time: Arc<dyn TimeSource + Send + Sync>,
    poster: EventPoster,
    nanoapps: NanoappTable,
    timer_pool: TimerPool,
    ble: BleRequestManager,
    wifi: WifiRequestManager,
    host_comms: HostCommsManager,
    settings: SettingManager,
    running: bool,
    current_app: InstanceId,
    loop_thread: Option<ThreadId>,
    stats: HubStats,
}

// ----------------------------------------------------------------------------
// Context Hub
// ----------------------------------------------------------------------------

pub struct ContextHub {
    state: HubState,
}

impl ContextHub {
    pub fn new(
        config: HubConfig,
        time: Arc<dyn TimeSource + Send + Sync>,
        system_timer: Box<dyn SystemTimer>,
        ble_platform: Box<dyn BlePlatform>,
        wifi_platform: Box<dyn WifiPlatform>,
        host_link: Box<dyn HostLink>,
    ) -> Self {
        let pool = EventPool::new(config.event_loop.event_pool_capacity);
        let queue = Arc::new(EventQueue::new());
        let poster = EventPoster::new(
            pool,
            queue,
            Arc::clone(&time),
            config.event_loop.low_priority_evict_target,
        );
        let now = time.now();
        let state = HubState {
            timer_pool: TimerPool::new(config.timers.clone(), system_timer),
            ble: BleRequestManager::new(ble_platform, poster.clone(), config.ble.clone()),
            wifi: WifiRequestManager::new(wifi_platform, poster.clone(), config.wifi.clone()),
            host_comms: HostCommsManager::new(
                host_link,
                poster.clone(),
                config.reliable_messages.clone(),
                now,
            ),
            config,
            time,
            poster,
            nanoapps: NanoappTable::new(),
            settings: SettingManager::new(),
            running: false,
            current_app: InstanceId::SYSTEM,
            loop_thread: None,
            stats: HubStats::default(),
        };
        Self { state }
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            poster: self.state.poster.clone(),
            directory: self.state.nanoapps.directory(),
        }
    }

    pub fn stats(&self) -> HubStats {
        self.state.stats
    }

    pub fn nanoapp_count(&self) -> usize {
        self.state.nanoapps.len()
    }

    fn on_loop_thread(&self) -> bool {
        self.state.loop_thread == Some(std::thread::current().id())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Loads a nanoapp and runs its start callback. A start that returns
    /// false unwinds the load completely.
    pub fn load_nanoapp(
        &mut self,
        app_id: AppId,
        version: u32,
        permissions: u32,
        handler: Box<dyn NanoappHandler>,
    ) -> Result<InstanceId, LifecycleError> {
        if let Some(existing) = self.state.nanoapps.find_by_app_id(app_id) {
            return Err(LifecycleError::AlreadyLoaded {
                app_id,
                instance_id: existing,
            });
        }
        let info = Nanoapp::new(InstanceId::SYSTEM, app_id, version, permissions);
        let instance_id = self.state.nanoapps.insert(info, handler);
        let Some(mut handler) = self.state.nanoapps.take_handler(instance_id) else {
            return Err(LifecycleError::StartFailed);
        };
        self.state.current_app = instance_id;
        let started = handler.start(&mut HubContext {
            instance_id,
            state: &mut self.state,
        });
        self.state.current_app = InstanceId::SYSTEM;
        if started {
            self.state.nanoapps.put_handler(instance_id, handler);
            tracing::info!("loaded nanoapp {} as {}", app_id, instance_id);
            Ok(instance_id)
        } else {
            self.teardown_nanoapp(instance_id, None);
            Err(LifecycleError::StartFailed)
        }
    }

    /// Unloads a nanoapp with the full flush protocol: withdraw its host
    /// messages, settle its queued events, run its end callback, then
    /// release every resource it still holds.
    pub fn unload_nanoapp(&mut self, instance_id: InstanceId) -> Result<(), LifecycleError> {
        if instance_id.is_system() {
            return Err(LifecycleError::SystemNanoapp);
        }
        let Some(app) = self.state.nanoapps.get(instance_id) else {
            return Err(LifecycleError::NotFound { instance_id });
        };
        let app_id = app.app_id;

        let state = &mut self.state;
        let withdrawn = state
            .host_comms
            .flush_nanoapp(instance_id, app_id, &mut state.timer_pool);
        if withdrawn > 0 {
            tracing::debug!("withdrew {} reliable messages from {}", withdrawn, instance_id);
        }

        // Settle everything queued for the app, free-callbacks included,
        // before its handler goes away.
        let queue = Arc::clone(self.state.poster.queue());
        let purged = queue.remove_matched_from_back(|e| e.target == instance_id, usize::MAX);
        for victim in purged {
            self.finish_event(victim);
        }

        let handler = self.state.nanoapps.take_handler(instance_id);
        if let Some(mut handler) = handler {
            self.state.current_app = instance_id;
            handler.end(&mut HubContext {
                instance_id,
                state: &mut self.state,
            });
            self.state.current_app = InstanceId::SYSTEM;
        }

        self.teardown_nanoapp(instance_id, Some(app_id));
        Ok(())
    }

    /// Releases dangling resources and removes the table entry. The app's
    /// handler must already be out of the table.
    fn teardown_nanoapp(&mut self, instance_id: InstanceId, app_id: Option<AppId>) {
        let now = self.state.time.now();
        let state = &mut self.state;
        let timers = state.timer_pool.cancel_all_timers(instance_id);
        let scans = state
            .ble
            .disable_active_scan(instance_id, &mut state.nanoapps, now);
        let wifi = state
            .wifi
            .disable_all_subscriptions(instance_id, &mut state.timer_pool, now);
        let mut blocks = 0;
        if let Some((mut info, _)) = state.nanoapps.remove(instance_id) {
            blocks = info.arena.free_all();
        }
        if timers + scans + wifi + blocks > 0 {
            tracing::warn!(
                "nanoapp {} left {} timers, {} scans, {} wifi subscriptions, {} heap blocks",
                instance_id,
                timers,
                scans,
                wifi,
                blocks
            );
        }
        if let Some(app_id) = app_id {
            tracing::info!("unloaded nanoapp {} ({})", app_id, instance_id);
        }
    }

    // ------------------------------------------------------------------
    // Run Loop
    // ------------------------------------------------------------------

    /// Blocks the calling thread servicing the queue until a
    /// [`SystemCall::Stop`] is processed. On exit, remaining queued events
    /// get their free callbacks (no delivery) and every nanoapp unloads in
    /// reverse load order.
    pub fn run(&mut self) {
        self.state.loop_thread = Some(std::thread::current().id());
        self.state.running = true;
        let now = self.state.time.now();
        self.state.timer_pool.set_system_timer(
            self.state.config.event_loop.wakeup_bucket_interval,
            SystemTimerCallback::WakeupBucketCycle,
            now,
        );
        let queue = Arc::clone(self.state.poster.queue());
        while self.state.running {
            let event = queue.pop_blocking();
            let depth = queue.len() + 1;
            if depth > self.state.stats.max_queue_depth {
                self.state.stats.max_queue_depth = depth;
            }
            self.distribute(event);
        }
        tracing::info!("event loop stopping, {} events still queued", queue.len());
        while let Some(event) = queue.try_pop() {
            self.finish_event(event);
        }
        let mut instance_ids = self.state.nanoapps.instance_ids();
        instance_ids.reverse();
        for instance_id in instance_ids {
            if let Err(err) = self.unload_nanoapp(instance_id) {
                tracing::warn!("unload of {} on shutdown failed: {}", instance_id, err);
            }
        }
    }

    /// Spawns the loop on its own thread.
    pub fn spawn(mut self) -> std::io::Result<(std::thread::JoinHandle<()>, HubHandle)> {
        let handle = self.handle();
        let join = std::thread::Builder::new()
            .name("ctxhub-loop".into())
            .spawn(move || self.run())?;
        Ok((join, handle))
    }

    /// Processes everything currently queued, without blocking. Drives the
    /// loop when a host schedules it instead of dedicating a thread.
    pub fn drain(&mut self) {
        self.state.loop_thread = Some(std::thread::current().id());
        let queue = Arc::clone(self.state.poster.queue());
        while let Some(event) = queue.try_pop() {
            self.distribute(event);
        }
    }

    // ------------------------------------------------------------------
    // Distribution
    // ------------------------------------------------------------------

    fn distribute(&mut self, mut pooled: PooledEvent) {
        debug_assert!(self.on_loop_thread());
        self.state.stats.events_processed += 1;

        if pooled.event.event_type == event_type::SYSTEM_CALL {
            let payload = std::mem::replace(&mut pooled.event.payload, EventPayload::None);
            if let EventPayload::System(call) = payload {
                self.handle_system_call(call);
            }
            return;
        }

        let reliable_inbound = match &pooled.event.payload {
            EventPayload::MessageFromHost(m) if m.is_reliable => {
                Some((m.sequence_number, m.host_endpoint))
            }
            _ => None,
        };

        if pooled.event.is_broadcast() {
            for target in self.broadcast_targets_for(&pooled.event) {
                self.deliver(target, pooled.event.event_type, &pooled.event.payload);
            }
        } else {
            let target = pooled.event.target;
            if self.state.nanoapps.contains(target) {
                self.deliver(target, pooled.event.event_type, &pooled.event.payload);
                if let Some((sequence_number, endpoint)) = reliable_inbound {
                    self.state
                        .host_comms
                        .on_inbound_delivered(sequence_number, endpoint);
                }
            } else {
                // Expected under race with unload.
                tracing::warn!(
                    "dropping unicast event {:#06x} for missing {}",
                    pooled.event.event_type,
                    target
                );
            }
        }
        self.finish_event(pooled);
    }

    fn broadcast_targets_for(&self, event: &Event) -> Vec<InstanceId> {
        let targets = self
            .state
            .nanoapps
            .broadcast_targets(event.event_type, event.target_group_mask);
        // Host endpoint notifications additionally require a registration
        // for the specific endpoint.
        if let EventPayload::HostEndpointNotification { endpoint, .. } = &event.payload {
            targets
                .into_iter()
                .filter(|id| {
                    self.state
                        .nanoapps
                        .get(*id)
                        .map_or(false, |app| app.is_registered_for_host_endpoint(*endpoint))
                })
                .collect()
        } else {
            targets
        }
    }

    fn deliver(&mut self, target: InstanceId, event_type: u16, payload: &EventPayload) {
        let Some(mut handler) = self.state.nanoapps.take_handler(target) else {
            tracing::warn!("nanoapp {} has no handler installed", target);
            return;
        };
        if let Some(app) = self.state.nanoapps.get_mut(target) {
            app.stats.record_event();
        }
        self.state.current_app = target;
        handler.handle_event(
            &mut HubContext {
                instance_id: target,
                state: &mut self.state,
            },
            event_type,
            payload,
        );
        self.state.current_app = InstanceId::SYSTEM;
        self.state.nanoapps.put_handler(target, handler);
    }

    /// Runs the free callback in the sender's app slot (or the system slot
    /// if the sender unloaded), then lets the pool slot go.
    fn finish_event(&mut self, mut pooled: PooledEvent) {
        if let Some(cb) = pooled.event.free_callback.take() {
            let sender = pooled.event.sender;
            self.state.current_app = if self.state.nanoapps.contains(sender) {
                sender
            } else {
                InstanceId::SYSTEM
            };
            let payload = std::mem::replace(&mut pooled.event.payload, EventPayload::None);
            cb(pooled.event.event_type, payload);
            self.state.current_app = InstanceId::SYSTEM;
        }
    }

    // ------------------------------------------------------------------
    // Deferred Work Dispatch
    // ------------------------------------------------------------------

    fn handle_system_call(&mut self, call: SystemCall) {
        let now = self.state.time.now();
        let state = &mut self.state;
        match call {
            SystemCall::Stop => {
                state.running = false;
            }
            SystemCall::TimerFired => {
                for firing in state.timer_pool.pop_expired(now) {
                    match firing.kind {
                        TimerKind::Nanoapp { instance_id, cookie } => {
                            let payload = EventPayload::TimerExpired {
                                handle: firing.handle,
                                cookie,
                            };
                            self.deliver(instance_id, event_type::TIMER_EXPIRED, &payload);
                        }
                        TimerKind::System(callback) => {
                            self.handle_system_timer(callback, now);
                        }
                    }
                }
            }
            SystemCall::BleScanResponse { enabled, error } => {
                state
                    .ble
                    .handle_platform_change(enabled, error, &mut state.nanoapps);
            }
            SystemCall::BleAdvertisements(reports) => {
                state.ble.handle_advertisements(reports);
            }
            SystemCall::BleFlushComplete { error } => {
                state
                    .ble
                    .handle_flush_complete(error, &mut state.timer_pool, now);
            }
            SystemCall::BleRssiResponse {
                connection_handle,
                rssi,
                error,
            } => {
                state.ble.handle_rssi_response(connection_handle, rssi, error);
            }
            SystemCall::BleRequestResync => {
                state.ble.handle_resync_request();
            }
            SystemCall::WifiScanMonitorStatus { enabled, error } => {
                state
                    .wifi
                    .handle_monitor_status(enabled, error, &mut state.timer_pool, now);
            }
            SystemCall::WifiScanResponse { pending, error } => {
                state
                    .wifi
                    .handle_scan_response(pending, error, &mut state.timer_pool, now);
            }
            SystemCall::WifiScanEvent(data) => {
                state
                    .wifi
                    .handle_scan_event(data, &mut state.timer_pool, now);
            }
            SystemCall::HostMessageReceived(message) => {
                state
                    .host_comms
                    .handle_message_from_host(message, &state.nanoapps, now);
            }
            SystemCall::MessageDeliveryStatus {
                sequence_number,
                error,
            } => {
                state.host_comms.handle_delivery_status(
                    sequence_number,
                    error,
                    &mut state.timer_pool,
                    now,
                );
            }
            SystemCall::SettingChanged { setting, enabled } => {
                if !state.settings.apply_change(setting, enabled) {
                    return;
                }
                if setting == Setting::BleAvailable {
                    state.ble.handle_setting_changed(enabled);
                }
                state.poster.post(Event::new(
                    event_type::SETTING_CHANGED,
                    EventPayload::SettingChanged { setting, enabled },
                    InstanceId::SYSTEM,
                    InstanceId::BROADCAST,
                ));
            }
            SystemCall::UnloadNanoapp { instance_id } => {
                if let Err(err) = self.unload_nanoapp(instance_id) {
                    tracing::warn!("deferred unload of {} failed: {}", instance_id, err);
                }
            }
            SystemCall::HostAwakeChanged { awake } => {
                state.host_comms.set_host_awake(awake);
            }
        }
    }

    fn handle_system_timer(&mut self, callback: SystemTimerCallback, now: Timestamp) {
        let state = &mut self.state;
        match callback {
            SystemTimerCallback::BleFlushTimeout => {
                state.ble.handle_flush_timeout(&mut state.timer_pool, now);
            }
            SystemTimerCallback::WifiScanMonitorTimeout => {
                state.wifi.handle_monitor_timeout(&mut state.timer_pool, now);
            }
            SystemTimerCallback::WifiScanRequestTimeout => {
                state.wifi.handle_scan_timeout(&mut state.timer_pool, now);
            }
            SystemTimerCallback::ReliableMessageRetry => {
                state.host_comms.handle_retry_timer(&mut state.timer_pool, now);
            }
            SystemTimerCallback::WakeupBucketCycle => {
                for instance_id in state.nanoapps.instance_ids() {
                    if let Some(app) = state.nanoapps.get_mut(instance_id) {
                        app.stats.cycle();
                    }
                }
                state.timer_pool.set_system_timer(
                    state.config.event_loop.wakeup_bucket_interval,
                    SystemTimerCallback::WakeupBucketCycle,
                    now,
                );
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
