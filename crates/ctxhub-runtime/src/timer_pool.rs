//! Timer pool
//!
//! All framework and nanoapp timers multiplex onto one backing platform
//! timer, always armed at the earliest expiry. Expiry is reported to the
//! loop thread as deferred work; the pool itself never runs callbacks.
//!
//! Admission is partitioned: nanoapp timers have their own cap, and a
//! reserve of slots is held back from system timers so nanoapps cannot be
//! starved by framework load.

use core::time::Duration;

use ctxhub_core::config::TimerPoolConfig;
use ctxhub_core::types::{InstanceId, TimerHandle, Timestamp};

use crate::platform::SystemTimer;

// ----------------------------------------------------------------------------
// Timer Kinds
// ----------------------------------------------------------------------------

/// The closed set of framework timeouts. Dispatch is a single match in the
/// event loop, so every timeout path is enumerable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTimerCallback {
    BleFlushTimeout,
    WifiScanMonitorTimeout,
    WifiScanRequestTimeout,
    ReliableMessageRetry,
    WakeupBucketCycle,
}

#[derive(Debug, Clone)]
pub enum TimerKind {
    /// Expiry delivers a `TimerExpired` unicast to the owner.
    Nanoapp { instance_id: InstanceId, cookie: u64 },
    /// Expiry dispatches framework work.
    System(SystemTimerCallback),
}

#[derive(Debug, Clone)]
struct TimerRecord {
    handle: TimerHandle,
    expiry: Timestamp,
    /// Periodic timers re-arm from their previous expiry, not from `now`,
    /// so the period does not drift under dispatch latency.
    period: Option<Duration>,
    kind: TimerKind,
}

/// One expired timer, ready for dispatch on the loop thread.
#[derive(Debug)]
pub struct TimerFiring {
    pub handle: TimerHandle,
    pub kind: TimerKind,
}

// ----------------------------------------------------------------------------
// Timer Pool
// ----------------------------------------------------------------------------

pub struct TimerPool {
    /// Sorted by expiry ascending; index 0 is next to fire.
    timers: Vec<TimerRecord>,
    backing: Box<dyn SystemTimer>,
    config: TimerPoolConfig,
    next_handle: u32,
}

impl TimerPool {
    pub fn new(config: TimerPoolConfig, backing: Box<dyn SystemTimer>) -> Self {
        Self {
            timers: Vec::with_capacity(config.max_timers),
            backing,
            config,
            next_handle: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.timers.first().map(|t| t.expiry)
    }

    /// Arms a timer owned by a nanoapp. `period` of `None` means one-shot.
    /// Returns `None` when the nanoapp partition is full.
    pub fn set_nanoapp_timer(
        &mut self,
        instance_id: InstanceId,
        delay: Duration,
        period: Option<Duration>,
        cookie: u64,
        now: Timestamp,
    ) -> Option<TimerHandle> {
        if self.nanoapp_count() >= self.config.max_nanoapp_timers
            || self.timers.len() >= self.config.max_timers
        {
            tracing::warn!("nanoapp timer rejected for {}: pool full", instance_id);
            return None;
        }
        Some(self.insert(now + delay, period, TimerKind::Nanoapp { instance_id, cookie }))
    }

    /// Arms a framework timer. System timers may not dip into the slots
    /// reserved for nanoapps.
    pub fn set_system_timer(
        &mut self,
        delay: Duration,
        callback: SystemTimerCallback,
        now: Timestamp,
    ) -> Option<TimerHandle> {
        let system_budget = self
            .config
            .max_timers
            .saturating_sub(self.config.reserved_nanoapp_timers);
        if self.system_count() >= system_budget || self.timers.len() >= self.config.max_timers {
            tracing::error!("system timer rejected: pool full ({:?})", callback);
            return None;
        }
        Some(self.insert(now + delay, None, TimerKind::System(callback)))
    }

    /// Cancels a timer. A handle that already fired (or never existed) is a
    /// tolerated no-op returning false.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let Some(index) = self.timers.iter().position(|t| t.handle == handle) else {
            return false;
        };
        self.timers.remove(index);
        self.sync_backing();
        true
    }

    /// Cancels every timer owned by `instance_id`; returns the count, for
    /// unload accounting.
    pub fn cancel_all_timers(&mut self, instance_id: InstanceId) -> u32 {
        let before = self.timers.len();
        self.timers.retain(|t| {
            !matches!(t.kind, TimerKind::Nanoapp { instance_id: owner, .. } if owner == instance_id)
        });
        let removed = before - self.timers.len();
        if removed > 0 {
            self.sync_backing();
        }
        removed as u32
    }

    /// Pops every timer due at `now`, re-arming periodic ones. Called from
    /// the loop thread when the backing timer reports expiry.
    pub fn pop_expired(&mut self, now: Timestamp) -> Vec<TimerFiring> {
        let mut fired = Vec::new();
        while let Some(front) = self.timers.first() {
            if front.expiry > now {
                break;
            }
            let record = self.timers.remove(0);
            fired.push(TimerFiring {
                handle: record.handle,
                kind: record.kind.clone(),
            });
            if let Some(period) = record.period {
                let next = TimerRecord {
                    expiry: record.expiry + period,
                    ..record
                };
                self.insert_record(next);
            }
        }
        self.sync_backing();
        fired
    }

    fn nanoapp_count(&self) -> usize {
        self.timers
            .iter()
            .filter(|t| matches!(t.kind, TimerKind::Nanoapp { .. }))
            .count()
    }

    fn system_count(&self) -> usize {
        self.timers.len() - self.nanoapp_count()
    }

    fn insert(&mut self, expiry: Timestamp, period: Option<Duration>, kind: TimerKind) -> TimerHandle {
        let handle = TimerHandle::new(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.insert_record(TimerRecord {
            handle,
            expiry,
            period,
            kind,
        });
        self.sync_backing();
        handle
    }

    fn insert_record(&mut self, record: TimerRecord) {
        let at = self
            .timers
            .partition_point(|t| t.expiry <= record.expiry);
        self.timers.insert(at, record);
    }

    /// Keeps the backing platform timer at the earliest expiry.
    fn sync_backing(&mut self) {
        match self.next_expiry() {
            Some(expiry) => self.backing.arm(expiry),
            None => self.backing.cancel(),
        }
    }
}

impl std::fmt::Debug for TimerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerPool")
            .field("live", &self.timers.len())
            .field("next_expiry", &self.next_expiry())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::ManualSystemTimer;

    fn pool() -> (TimerPool, ManualSystemTimer) {
        let backing = ManualSystemTimer::new();
        let pool = TimerPool::new(TimerPoolConfig::default(), Box::new(backing.clone()));
        (pool, backing)
    }

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn backing_timer_tracks_earliest_expiry() {
        let (mut pool, backing) = pool();
        let t0 = Timestamp::from_nanos(0);
        pool.set_system_timer(100 * MS, SystemTimerCallback::BleFlushTimeout, t0);
        assert_eq!(backing.armed_at(), Some(t0 + 100 * MS));
        // An earlier timer pulls the backing deadline in.
        pool.set_nanoapp_timer(InstanceId::new(1), 20 * MS, None, 0, t0);
        assert_eq!(backing.armed_at(), Some(t0 + 20 * MS));
    }

    #[test]
    fn pop_expired_fires_in_expiry_order() {
        let (mut pool, _backing) = pool();
        let t0 = Timestamp::from_nanos(0);
        let late = pool.set_nanoapp_timer(InstanceId::new(1), 50 * MS, None, 0, t0).unwrap();
        let early = pool.set_nanoapp_timer(InstanceId::new(2), 10 * MS, None, 0, t0).unwrap();
        let fired = pool.pop_expired(t0 + 60 * MS);
        let handles: Vec<TimerHandle> = fired.iter().map(|f| f.handle).collect();
        assert_eq!(handles, vec![early, late]);
        assert!(pool.is_empty());
    }

    #[test]
    fn periodic_timer_rearms_from_previous_expiry() {
        let (mut pool, backing) = pool();
        let t0 = Timestamp::from_nanos(0);
        pool.set_nanoapp_timer(InstanceId::new(1), 10 * MS, Some(10 * MS), 7, t0);
        // Fire late; the next expiry is still anchored to the schedule.
        let fired = pool.pop_expired(t0 + 14 * MS);
        assert_eq!(fired.len(), 1);
        assert_eq!(pool.next_expiry(), Some(t0 + 20 * MS));
        assert_eq!(backing.armed_at(), Some(t0 + 20 * MS));
    }

    #[test]
    fn cancel_after_fire_is_tolerated() {
        let (mut pool, _backing) = pool();
        let t0 = Timestamp::from_nanos(0);
        let handle = pool.set_nanoapp_timer(InstanceId::new(1), MS, None, 0, t0).unwrap();
        pool.pop_expired(t0 + 2 * MS);
        assert!(!pool.cancel(handle));
    }

    #[test]
    fn cancel_all_counts_only_the_owner() {
        let (mut pool, backing) = pool();
        let t0 = Timestamp::from_nanos(0);
        pool.set_nanoapp_timer(InstanceId::new(1), 10 * MS, None, 0, t0);
        pool.set_nanoapp_timer(InstanceId::new(1), 20 * MS, None, 0, t0);
        pool.set_nanoapp_timer(InstanceId::new(2), 5 * MS, None, 0, t0);
        pool.set_system_timer(30 * MS, SystemTimerCallback::ReliableMessageRetry, t0);
        assert_eq!(pool.cancel_all_timers(InstanceId::new(1)), 2);
        assert_eq!(pool.len(), 2);
        assert_eq!(backing.armed_at(), Some(t0 + 5 * MS));
    }

    #[test]
    fn system_timers_cannot_claim_the_nanoapp_reserve() {
        let config = TimerPoolConfig {
            max_timers: 4,
            max_nanoapp_timers: 4,
            reserved_nanoapp_timers: 2,
        };
        let backing = ManualSystemTimer::new();
        let mut pool = TimerPool::new(config, Box::new(backing.clone()));
        let t0 = Timestamp::from_nanos(0);
        assert!(pool.set_system_timer(MS, SystemTimerCallback::BleFlushTimeout, t0).is_some());
        assert!(pool.set_system_timer(MS, SystemTimerCallback::BleFlushTimeout, t0).is_some());
        // Third system timer would eat into the reserve.
        assert!(pool.set_system_timer(MS, SystemTimerCallback::BleFlushTimeout, t0).is_none());
        // Nanoapps can still fill the pool.
        assert!(pool.set_nanoapp_timer(InstanceId::new(1), MS, None, 0, t0).is_some());
        assert!(pool.set_nanoapp_timer(InstanceId::new(1), MS, None, 0, t0).is_some());
        assert!(pool.set_nanoapp_timer(InstanceId::new(1), MS, None, 0, t0).is_none());
    }

    #[test]
    fn empty_pool_cancels_backing_timer() {
        let (mut pool, backing) = pool();
        let t0 = Timestamp::from_nanos(0);
        let handle = pool.set_nanoapp_timer(InstanceId::new(1), MS, None, 0, t0).unwrap();
        assert!(backing.armed_at().is_some());
        pool.cancel(handle);
        assert_eq!(backing.armed_at(), None);
    }
}
