//! Event model: the unit of work flowing through the event loop
//!
//! Events are owned values backed by a fixed-capacity pool. The pool bounds
//! memory, not the queue: admission control in the event loop decides what
//! happens when allocation fails. Dequeue order is strict FIFO; priority
//! only ever affects admission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ctxhub_core::types::{InstanceId, TimerHandle, Timestamp};

use crate::event_loop::SystemCall;
use crate::host_comms::MessageFromHost;
use crate::settings::Setting;
use crate::wifi_manager::WifiScanEventData;
use ctxhub_core::errors::ErrorCode;

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// Event type values visible to nanoapps. Internal events use the high bit.
pub mod event_type {
    pub const MESSAGE_FROM_HOST: u16 = 0x0001;
    pub const TIMER_EXPIRED: u16 = 0x0002;
    pub const SETTING_CHANGED: u16 = 0x0003;
    pub const HOST_ENDPOINT_NOTIFICATION: u16 = 0x0004;
    pub const MESSAGE_DELIVERY_STATUS: u16 = 0x0005;

    pub const WIFI_ASYNC_RESULT: u16 = 0x0100;
    pub const WIFI_SCAN_RESULT: u16 = 0x0101;

    pub const BLE_ASYNC_RESULT: u16 = 0x0200;
    pub const BLE_ADVERTISEMENT: u16 = 0x0201;
    pub const BLE_FLUSH_COMPLETE: u16 = 0x0202;
    pub const BLE_RSSI_RESULT: u16 = 0x0203;

    /// Deferred framework work; never delivered to nanoapps.
    pub const SYSTEM_CALL: u16 = 0x8000;

    /// Default group mask for broadcast registration.
    pub const DEFAULT_GROUP_MASK: u16 = 0x0001;
}

// ----------------------------------------------------------------------------
// Async Results
// ----------------------------------------------------------------------------

/// Which asynchronous operation a result event resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncRequestType {
    BleStartScan,
    BleStopScan,
    BleFlush,
    BleReadRssi,
    WifiConfigureScanMonitor,
    WifiRequestScan,
}

/// Outcome of an accepted asynchronous request, echoed to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncResult {
    pub request_type: AsyncRequestType,
    pub success: bool,
    pub error: ErrorCode,
    pub cookie: u32,
}

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

/// Typed event data. Handlers receive it by reference; ownership stays with
/// the event until the pool reclaims it.
#[derive(Debug)]
pub enum EventPayload {
    None,
    TimerExpired {
        handle: TimerHandle,
        cookie: u64,
    },
    AsyncResult(AsyncResult),
    BleAdvertisement(BleAdvertisementReport),
    BleFlushComplete {
        error: ErrorCode,
    },
    BleRssiResult {
        connection_handle: u16,
        rssi: i8,
        error: ErrorCode,
    },
    WifiScanResult(WifiScanEventData),
    MessageFromHost(MessageFromHost),
    MessageDeliveryStatus {
        sequence_number: u32,
        error: ErrorCode,
    },
    HostEndpointNotification {
        endpoint: ctxhub_core::types::HostEndpoint,
        disconnected: bool,
    },
    SettingChanged {
        setting: Setting,
        enabled: bool,
    },
    System(SystemCall),
}

/// One BLE advertisement as reported by the platform.
#[derive(Debug, Clone)]
pub struct BleAdvertisementReport {
    pub address: [u8; 6],
    pub rssi: i8,
    pub data: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Event
// ----------------------------------------------------------------------------

/// Runs after distribution, in the sender's app slot, before the event
/// returns to the pool.
pub type FreeCallback = Box<dyn FnOnce(u16, EventPayload) + Send>;

pub struct Event {
    pub event_type: u16,
    pub payload: EventPayload,
    pub free_callback: Option<FreeCallback>,
    pub is_low_priority: bool,
    pub sender: InstanceId,
    /// [`InstanceId::BROADCAST`] fans out by registration.
    pub target: InstanceId,
    pub target_group_mask: u16,
    /// Wrapping millisecond stamp taken at admission, for latency stats.
    pub received_time_millis: u16,
}

impl Event {
    pub fn new(event_type: u16, payload: EventPayload, sender: InstanceId, target: InstanceId) -> Self {
        Self {
            event_type,
            payload,
            free_callback: None,
            is_low_priority: false,
            sender,
            target,
            target_group_mask: event_type::DEFAULT_GROUP_MASK,
            received_time_millis: 0,
        }
    }

    /// Deferred framework work addressed to the loop itself. Never low
    /// priority.
    pub fn system_call(call: SystemCall) -> Self {
        Self::new(
            event_type::SYSTEM_CALL,
            EventPayload::System(call),
            InstanceId::SYSTEM,
            InstanceId::SYSTEM,
        )
    }

    pub fn low_priority(mut self) -> Self {
        self.is_low_priority = true;
        self
    }

    pub fn with_group_mask(mut self, mask: u16) -> Self {
        self.target_group_mask = mask;
        self
    }

    pub fn with_free_callback(mut self, cb: FreeCallback) -> Self {
        self.free_callback = Some(cb);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_broadcast()
    }

    pub fn stamp(&mut self, now: Timestamp) {
        self.received_time_millis = (now.as_millis() & 0xFFFF) as u16;
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &format_args!("{:#06x}", self.event_type))
            .field("sender", &self.sender)
            .field("target", &self.target)
            .field("low_priority", &self.is_low_priority)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Event Pool
// ----------------------------------------------------------------------------

/// Fixed-capacity allocator shared by the loop thread and platform threads.
/// Allocation never blocks; exhaustion returns `None` and the caller's
/// admission policy decides what happens next.
#[derive(Clone)]
pub struct EventPool {
    available: Arc<AtomicUsize>,
    capacity: usize,
}

impl EventPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Arc::new(AtomicUsize::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available.load(Ordering::Relaxed)
    }

    /// Wraps `event` in a pool slot, or returns it back on exhaustion.
    pub fn allocate(&self, event: Event) -> Result<PooledEvent, Event> {
        let mut current = self.available.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(event);
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(PooledEvent {
                        event,
                        _slot: PoolSlot {
                            available: Arc::clone(&self.available),
                        },
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

struct PoolSlot {
    available: Arc<AtomicUsize>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}

/// An event holding one pool slot; the slot frees when this drops.
pub struct PooledEvent {
    pub event: Event,
    _slot: PoolSlot,
}

impl std::fmt::Debug for PooledEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.event.fmt(f)
    }
}

// ----------------------------------------------------------------------------
// Event Queue
// ----------------------------------------------------------------------------

/// The single inbound FIFO feeding the loop thread. Capacity is bounded
/// indirectly by the pool, so pushes never fail here.
pub struct EventQueue {
    inner: Mutex<VecDeque<PooledEvent>>,
    signal: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    pub fn push(&self, event: PooledEvent) {
        let mut queue = lock_unpoisoned(&self.inner);
        queue.push_back(event);
        self.signal.notify_one();
    }

    /// Blocks until an event is available. The loop's only blocking point.
    pub fn pop_blocking(&self) -> PooledEvent {
        let mut queue = lock_unpoisoned(&self.inner);
        loop {
            if let Some(event) = queue.pop_front() {
                return event;
            }
            queue = match self.signal.wait(queue) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn try_pop(&self) -> Option<PooledEvent> {
        lock_unpoisoned(&self.inner).pop_front()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes up to `limit` events matching `pred`, scanning from the back
    /// (newest first). Used by admission control to shed low-priority load.
    /// Removed events are returned so their free callbacks can run.
    pub fn remove_matched_from_back<F>(&self, mut pred: F, limit: usize) -> Vec<PooledEvent>
    where
        F: FnMut(&Event) -> bool,
    {
        let mut queue = lock_unpoisoned(&self.inner);
        let mut removed = Vec::new();
        let mut index = queue.len();
        while index > 0 && removed.len() < limit {
            index -= 1;
            if pred(&queue[index].event) {
                if let Some(event) = queue.remove(index) {
                    removed.push(event);
                }
            }
        }
        removed
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ----------------------------------------------------------------------------
// Event Poster
// ----------------------------------------------------------------------------

/// Admission control over the shared pool and queue. Clonable and callable
/// from any thread; this is how platform threads and managers hand work to
/// the loop.
///
/// Priority is two-tier and affects admission only: system-critical posts
/// may evict queued low-priority system-originated events and die if the
/// pool is still full, while nanoapp low-priority posts fail softly with
/// their free callback run.
#[derive(Clone)]
pub struct EventPoster {
    pool: EventPool,
    queue: Arc<EventQueue>,
    time: Arc<dyn ctxhub_core::types::TimeSource + Send + Sync>,
    evict_target: usize,
}

impl EventPoster {
    pub fn new(
        pool: EventPool,
        queue: Arc<EventQueue>,
        time: Arc<dyn ctxhub_core::types::TimeSource + Send + Sync>,
        evict_target: usize,
    ) -> Self {
        Self {
            pool,
            queue,
            time,
            evict_target,
        }
    }

    pub fn pool(&self) -> &EventPool {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Best-effort post. On pool exhaustion the event's free callback runs
    /// on this thread and `false` is returned.
    pub fn post(&self, event: Event) -> bool {
        match self.admit(event) {
            Ok(()) => true,
            Err(rejected) => {
                tracing::warn!("event pool full, dropping {:?}", rejected);
                run_free_callback(rejected);
                false
            }
        }
    }

    /// System-critical post. On pool exhaustion, up to `evict_target`
    /// low-priority system-originated events are shed from the back of the
    /// queue; if the pool is still full the framework is in an inconsistent
    /// state and this panics rather than losing the event.
    ///
    /// Eviction can run on any thread, so the free callbacks of shed events
    /// run on the posting thread.
    pub fn post_or_die(&self, event: Event) {
        let event = match self.admit(event) {
            Ok(()) => return,
            Err(rejected) => rejected,
        };
        let shed = self.queue.remove_matched_from_back(
            |e| e.is_low_priority && e.sender.is_system(),
            self.evict_target,
        );
        tracing::warn!("event pool full, shed {} low-priority events", shed.len());
        for victim in shed {
            run_free_callback(victim.event);
        }
        match self.admit(event) {
            Ok(()) => {}
            Err(rejected) => {
                panic!(
                    "event pool exhausted for system-critical event {:#06x}",
                    rejected.event_type
                );
            }
        }
    }

    fn admit(&self, mut event: Event) -> Result<(), Event> {
        event.stamp(self.time.now());
        match self.pool.allocate(event) {
            Ok(pooled) => {
                self.queue.push(pooled);
                Ok(())
            }
            Err(event) => Err(event),
        }
    }
}

/// Runs the free callback of an event that will never be delivered.
pub(crate) fn run_free_callback(mut event: Event) {
    if let Some(cb) = event.free_callback.take() {
        cb(event.event_type, event.payload);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
