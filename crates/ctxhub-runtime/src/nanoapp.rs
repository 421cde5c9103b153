//! Nanoapp bookkeeping
//!
//! Framework-side state for one loaded nanoapp, kept apart from the app's
//! own code behind [`NanoappHandler`]. The split lets the event loop take
//! the handler out of its slot during delivery while registrations and
//! stats remain addressable.

use ctxhub_core::errors::LifecycleError;
use ctxhub_core::types::{AppId, HostEndpoint, InstanceId};

use crate::event::EventPayload;
use crate::event_loop::NanoappContext;

// ----------------------------------------------------------------------------
// Handler Trait
// ----------------------------------------------------------------------------

/// The app code. All three callbacks run on the loop thread, to completion,
/// non-preemptively.
pub trait NanoappHandler: Send {
    /// Returning false aborts the load.
    fn start(&mut self, ctx: &mut dyn NanoappContext) -> bool;

    fn handle_event(&mut self, ctx: &mut dyn NanoappContext, event_type: u16, payload: &EventPayload);

    /// Last callback before teardown; resources are force-released after.
    fn end(&mut self, ctx: &mut dyn NanoappContext);
}

// ----------------------------------------------------------------------------
// Registrations
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRegistration {
    pub event_type: u16,
    pub group_mask: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcService {
    pub id: u64,
    pub version: u32,
}

// ----------------------------------------------------------------------------
// Allocation Arena
// ----------------------------------------------------------------------------

/// Handle into a nanoapp's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(usize);

/// Per-app allocation tracking with an index free-list, so unload can
/// reclaim everything the app leaked and report the count.
#[derive(Debug, Default)]
pub struct AllocationArena {
    blocks: Vec<Option<Vec<u8>>>,
    free_indices: Vec<usize>,
}

impl AllocationArena {
    pub fn alloc(&mut self, size: usize) -> BlockId {
        let block = vec![0u8; size];
        match self.free_indices.pop() {
            Some(index) => {
                self.blocks[index] = Some(block);
                BlockId(index)
            }
            None => {
                self.blocks.push(Some(block));
                BlockId(self.blocks.len() - 1)
            }
        }
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Vec<u8>> {
        self.blocks.get_mut(id.0).and_then(|b| b.as_mut())
    }

    /// Returns whether the block was live.
    pub fn free(&mut self, id: BlockId) -> bool {
        match self.blocks.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free_indices.push(id.0);
                true
            }
            _ => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Frees every live block; returns how many there were.
    pub fn free_all(&mut self) -> u32 {
        let live = self.live_count() as u32;
        self.blocks.clear();
        self.free_indices.clear();
        live
    }
}

// ----------------------------------------------------------------------------
// Stat Buckets
// ----------------------------------------------------------------------------

pub const STAT_BUCKET_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatBucket {
    pub wakeups: u32,
    pub host_messages: u32,
    pub events: u32,
}

/// Fixed ring of recent activity windows; the loop cycles it on a long
/// periodic timer.
#[derive(Debug)]
pub struct StatBuckets {
    buckets: [StatBucket; STAT_BUCKET_COUNT],
}

impl Default for StatBuckets {
    fn default() -> Self {
        Self {
            buckets: [StatBucket::default(); STAT_BUCKET_COUNT],
        }
    }
}

impl StatBuckets {
    /// Index 0 is the current window.
    pub fn current(&self) -> &StatBucket {
        &self.buckets[0]
    }

    pub fn all(&self) -> &[StatBucket; STAT_BUCKET_COUNT] {
        &self.buckets
    }

    pub fn record_wakeup(&mut self) {
        self.buckets[0].wakeups = self.buckets[0].wakeups.saturating_add(1);
    }

    pub fn record_host_message(&mut self) {
        self.buckets[0].host_messages = self.buckets[0].host_messages.saturating_add(1);
    }

    pub fn record_event(&mut self) {
        self.buckets[0].events = self.buckets[0].events.saturating_add(1);
    }

    /// Opens a fresh window, dropping the oldest.
    pub fn cycle(&mut self) {
        self.buckets.rotate_right(1);
        self.buckets[0] = StatBucket::default();
    }
}

// ----------------------------------------------------------------------------
// Nanoapp
// ----------------------------------------------------------------------------

/// Framework bookkeeping for one loaded nanoapp. The handler box lives in
/// the event loop's table next to this and is absent while the app is
/// executing.
pub struct Nanoapp {
    pub instance_id: InstanceId,
    pub app_id: AppId,
    pub version: u32,
    /// Declared permission bits; outbound host messages must stay within
    /// them.
    pub permissions: u32,
    registered_events: Vec<EventRegistration>,
    registered_host_endpoints: Vec<HostEndpoint>,
    rpc_services: Vec<RpcService>,
    pub arena: AllocationArena,
    pub stats: StatBuckets,
}

impl Nanoapp {
    pub fn new(instance_id: InstanceId, app_id: AppId, version: u32, permissions: u32) -> Self {
        Self {
            instance_id,
            app_id,
            version,
            permissions,
            registered_events: Vec::new(),
            registered_host_endpoints: Vec::new(),
            rpc_services: Vec::new(),
            arena: AllocationArena::default(),
            stats: StatBuckets::default(),
        }
    }

    /// Registers for a broadcast event type, replacing the group mask of an
    /// existing registration.
    pub fn register_for_event(&mut self, event_type: u16, group_mask: u16) {
        match self
            .registered_events
            .iter_mut()
            .find(|r| r.event_type == event_type)
        {
            Some(existing) => existing.group_mask = group_mask,
            None => self.registered_events.push(EventRegistration {
                event_type,
                group_mask,
            }),
        }
    }

    /// Returns whether a registration was removed.
    pub fn unregister_for_event(&mut self, event_type: u16) -> bool {
        let before = self.registered_events.len();
        self.registered_events.retain(|r| r.event_type != event_type);
        before != self.registered_events.len()
    }

    /// Broadcast eligibility: type matches and group masks intersect.
    pub fn is_registered_for(&self, event_type: u16, group_mask: u16) -> bool {
        self.registered_events
            .iter()
            .any(|r| r.event_type == event_type && r.group_mask & group_mask != 0)
    }

    pub fn register_host_endpoint(&mut self, endpoint: HostEndpoint) {
        if !self.registered_host_endpoints.contains(&endpoint) {
            self.registered_host_endpoints.push(endpoint);
        }
    }

    pub fn unregister_host_endpoint(&mut self, endpoint: HostEndpoint) -> bool {
        let before = self.registered_host_endpoints.len();
        self.registered_host_endpoints.retain(|e| *e != endpoint);
        before != self.registered_host_endpoints.len()
    }

    pub fn is_registered_for_host_endpoint(&self, endpoint: HostEndpoint) -> bool {
        self.registered_host_endpoints.contains(&endpoint)
    }

    /// Service ids are unique per app.
    pub fn register_rpc_service(&mut self, service: RpcService) -> Result<(), LifecycleError> {
        if self.rpc_services.iter().any(|s| s.id == service.id) {
            return Err(LifecycleError::StartFailed);
        }
        self.rpc_services.push(service);
        Ok(())
    }

    pub fn rpc_services(&self) -> &[RpcService] {
        &self.rpc_services
    }

    pub fn registered_event_count(&self) -> usize {
        self.registered_events.len()
    }
}

impl std::fmt::Debug for Nanoapp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nanoapp")
            .field("instance_id", &self.instance_id)
            .field("app_id", &self.app_id)
            .field("version", &self.version)
            .field("events", &self.registered_events.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Nanoapp Table
// ----------------------------------------------------------------------------

struct NanoappSlot {
    info: Nanoapp,
    /// Absent while the app is executing a callback.
    handler: Option<Box<dyn NanoappHandler>>,
}

/// The loaded-nanoapp collection, owned by the event loop. Iteration order
/// is load order, which is also the reverse of teardown order.
///
/// The app-id directory is shared so other threads can resolve an app id to
/// an instance id without touching the table itself.
pub struct NanoappTable {
    slots: Vec<NanoappSlot>,
    directory: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<AppId, InstanceId>>>,
    next_instance_id: u16,
}

impl NanoappTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            directory: std::sync::Arc::new(std::sync::Mutex::new(
                std::collections::HashMap::new(),
            )),
            next_instance_id: 1,
        }
    }

    pub fn directory(
        &self,
    ) -> std::sync::Arc<std::sync::Mutex<std::collections::HashMap<AppId, InstanceId>>> {
        std::sync::Arc::clone(&self.directory)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Assigns an instance id and inserts the app. The caller is expected to
    /// have checked for app-id duplicates via the directory.
    pub fn insert(&mut self, mut info: Nanoapp, handler: Box<dyn NanoappHandler>) -> InstanceId {
        let instance_id = InstanceId::new(self.next_instance_id);
        self.next_instance_id = self.next_instance_id.wrapping_add(1).max(1);
        info.instance_id = instance_id;
        let app_id = info.app_id;
        self.slots.push(NanoappSlot {
            info,
            handler: Some(handler),
        });
        if let Ok(mut dir) = self.directory.lock() {
            dir.insert(app_id, instance_id);
        }
        instance_id
    }

    /// Removes the app's bookkeeping; returns it with its handler for the
    /// final `end` callback.
    pub fn remove(&mut self, instance_id: InstanceId) -> Option<(Nanoapp, Option<Box<dyn NanoappHandler>>)> {
        let index = self
            .slots
            .iter()
            .position(|s| s.info.instance_id == instance_id)?;
        let slot = self.slots.remove(index);
        if let Ok(mut dir) = self.directory.lock() {
            dir.remove(&slot.info.app_id);
        }
        Some((slot.info, slot.handler))
    }

    pub fn get(&self, instance_id: InstanceId) -> Option<&Nanoapp> {
        self.slots
            .iter()
            .find(|s| s.info.instance_id == instance_id)
            .map(|s| &s.info)
    }

    pub fn get_mut(&mut self, instance_id: InstanceId) -> Option<&mut Nanoapp> {
        self.slots
            .iter_mut()
            .find(|s| s.info.instance_id == instance_id)
            .map(|s| &mut s.info)
    }

    pub fn find_by_app_id(&self, app_id: AppId) -> Option<InstanceId> {
        self.slots
            .iter()
            .find(|s| s.info.app_id == app_id)
            .map(|s| s.info.instance_id)
    }

    pub fn contains(&self, instance_id: InstanceId) -> bool {
        self.get(instance_id).is_some()
    }

    /// Instance ids of every app registered for a broadcast (type, mask).
    pub fn broadcast_targets(&self, event_type: u16, group_mask: u16) -> Vec<InstanceId> {
        self.slots
            .iter()
            .filter(|s| s.info.is_registered_for(event_type, group_mask))
            .map(|s| s.info.instance_id)
            .collect()
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.slots.iter().map(|s| s.info.instance_id).collect()
    }

    /// Takes the handler out for the duration of a callback.
    pub fn take_handler(&mut self, instance_id: InstanceId) -> Option<Box<dyn NanoappHandler>> {
        self.slots
            .iter_mut()
            .find(|s| s.info.instance_id == instance_id)
            .and_then(|s| s.handler.take())
    }

    pub fn put_handler(&mut self, instance_id: InstanceId, handler: Box<dyn NanoappHandler>) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.info.instance_id == instance_id)
        {
            slot.handler = Some(handler);
        }
    }
}

impl Default for NanoappTable {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> Nanoapp {
        Nanoapp::new(InstanceId::new(1), AppId::new(0x1234), 1, 0)
    }

    #[test]
    fn broadcast_registration_respects_group_mask() {
        let mut app = app();
        app.register_for_event(0x0200, 0b0010);
        assert!(app.is_registered_for(0x0200, 0b0110));
        assert!(!app.is_registered_for(0x0200, 0b0001));
        assert!(!app.is_registered_for(0x0201, 0b0010));
    }

    #[test]
    fn reregistration_replaces_mask() {
        let mut app = app();
        app.register_for_event(0x0200, 0b0001);
        app.register_for_event(0x0200, 0b0100);
        assert_eq!(app.registered_event_count(), 1);
        assert!(!app.is_registered_for(0x0200, 0b0001));
        assert!(app.is_registered_for(0x0200, 0b0100));
    }

    #[test]
    fn rpc_service_ids_are_unique() {
        let mut app = app();
        let svc = RpcService { id: 5, version: 1 };
        assert!(app.register_rpc_service(svc).is_ok());
        assert!(app.register_rpc_service(RpcService { id: 5, version: 2 }).is_err());
        assert_eq!(app.rpc_services().len(), 1);
    }

    #[test]
    fn arena_reuses_freed_indices() {
        let mut arena = AllocationArena::default();
        let a = arena.alloc(16);
        let _b = arena.alloc(16);
        assert!(arena.free(a));
        assert!(!arena.free(a), "double free reports false");
        let c = arena.alloc(8);
        assert_eq!(c, a, "freed index is reused");
        assert_eq!(arena.live_count(), 2);
    }

    #[test]
    fn arena_free_all_reports_leaks() {
        let mut arena = AllocationArena::default();
        arena.alloc(1);
        arena.alloc(2);
        let freed = arena.alloc(3);
        arena.free(freed);
        assert_eq!(arena.free_all(), 2);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn stat_buckets_cycle_drops_oldest() {
        let mut stats = StatBuckets::default();
        stats.record_wakeup();
        stats.record_wakeup();
        for _ in 0..STAT_BUCKET_COUNT {
            stats.cycle();
        }
        assert!(stats.all().iter().all(|b| b.wakeups == 0));
    }

    struct NullHandler;

    impl NanoappHandler for NullHandler {
        fn start(&mut self, _ctx: &mut dyn NanoappContext) -> bool {
            true
        }
        fn handle_event(&mut self, _ctx: &mut dyn NanoappContext, _t: u16, _p: &EventPayload) {}
        fn end(&mut self, _ctx: &mut dyn NanoappContext) {}
    }

    #[test]
    fn table_assigns_ids_and_tracks_directory() {
        let mut table = NanoappTable::new();
        let a = table.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xa), 1, 0),
            Box::new(NullHandler),
        );
        let b = table.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xb), 1, 0),
            Box::new(NullHandler),
        );
        assert_ne!(a, b);
        assert_eq!(table.find_by_app_id(AppId::new(0xb)), Some(b));
        let dir = table.directory();
        assert_eq!(dir.lock().unwrap().get(&AppId::new(0xa)), Some(&a));

        table.remove(a).unwrap();
        assert!(dir.lock().unwrap().get(&AppId::new(0xa)).is_none());
    }

    #[test]
    fn broadcast_targets_follow_registration() {
        let mut table = NanoappTable::new();
        let a = table.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xa), 1, 0),
            Box::new(NullHandler),
        );
        let _b = table.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xb), 1, 0),
            Box::new(NullHandler),
        );
        table.get_mut(a).unwrap().register_for_event(0x0200, 0b01);
        assert_eq!(table.broadcast_targets(0x0200, 0b01), vec![a]);
        assert!(table.broadcast_targets(0x0200, 0b10).is_empty());
    }

    #[test]
    fn handler_take_put_round_trip() {
        let mut table = NanoappTable::new();
        let a = table.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xa), 1, 0),
            Box::new(NullHandler),
        );
        let handler = table.take_handler(a).unwrap();
        assert!(table.take_handler(a).is_none(), "handler is out");
        table.put_handler(a, handler);
        assert!(table.take_handler(a).is_some());
    }

    #[test]
    fn stat_buckets_keep_recent_history() {
        let mut stats = StatBuckets::default();
        stats.record_host_message();
        stats.cycle();
        stats.record_host_message();
        stats.record_host_message();
        assert_eq!(stats.current().host_messages, 2);
        assert_eq!(stats.all()[1].host_messages, 1);
    }
}
