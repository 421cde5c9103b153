//! Host communications manager
//!
//! Relays nanoapp messages to and from the host. Outbound reliable messages
//! retry through the transaction manager, grouped per nanoapp so one app's
//! messages stay ordered. The inbound reliable path suppresses host
//! retransmissions through the duplicate detector.
//!
//! All methods run on the loop thread; platform-side completions (delivery
//! statuses, inbound messages) arrive as deferred work. Free callbacks
//! therefore always run on the loop thread and never race app event
//! delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ctxhub_core::config::ReliableMessageConfig;
use ctxhub_core::dedup::DuplicateMessageDetector;
use ctxhub_core::errors::{CtxhubError, ErrorCode, MessageError};
use ctxhub_core::transaction::{
    RetryTimer, TransactionCallback, TransactionId, TransactionManager,
};
use ctxhub_core::types::{AppId, HostEndpoint, InstanceId, TimerHandle, Timestamp};

use crate::event::{event_type, Event, EventPayload, EventPoster};
use crate::nanoapp::{Nanoapp, NanoappTable};
use crate::platform::HostLink;
use crate::timer_pool::{SystemTimerCallback, TimerPool};

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MessageToHost {
    pub sender_instance: InstanceId,
    pub sender_app_id: AppId,
    pub host_endpoint: HostEndpoint,
    pub message_type: u32,
    pub payload: Vec<u8>,
    pub permissions: u32,
    pub is_reliable: bool,
    /// Zero for unreliable messages.
    pub sequence_number: u32,
}

#[derive(Debug, Clone)]
pub struct MessageFromHost {
    pub app_id: AppId,
    pub host_endpoint: HostEndpoint,
    pub message_type: u32,
    pub payload: Vec<u8>,
    pub is_reliable: bool,
    pub sequence_number: u32,
}

/// Returns the payload buffer to the app once the framework is done with
/// it.
pub type MessageFreeCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

// ----------------------------------------------------------------------------
// Message Pool
// ----------------------------------------------------------------------------

/// Capacity accounting for in-flight host messages, shared across both
/// directions. Allocation never blocks.
#[derive(Clone)]
pub struct MessagePool {
    available: Arc<AtomicUsize>,
    capacity: usize,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Arc::new(AtomicUsize::new(capacity)),
            capacity,
        }
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available.load(Ordering::Relaxed)
    }

    pub fn allocate(&self) -> Option<MessageTicket> {
        let mut current = self.available.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return None;
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(MessageTicket {
                        available: Arc::clone(&self.available),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

pub struct MessageTicket {
    available: Arc<AtomicUsize>,
}

impl Drop for MessageTicket {
    fn drop(&mut self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}

// ----------------------------------------------------------------------------
// Outbound Records
// ----------------------------------------------------------------------------

struct OutboundRecord {
    message: MessageToHost,
    _ticket: MessageTicket,
    /// Attached once the transaction manager assigns an id.
    txn: Option<TransactionId>,
    free_callback: Option<MessageFreeCallback>,
}

impl OutboundRecord {
    fn finish(mut self) {
        if let Some(cb) = self.free_callback.take() {
            cb(std::mem::take(&mut self.message.payload));
        }
    }
}

// ----------------------------------------------------------------------------
// Transaction Adapters
// ----------------------------------------------------------------------------

/// Re-arms the shared retry timer from transaction deadlines.
struct PoolRetryTimer<'a> {
    pool: &'a mut TimerPool,
    slot: &'a mut Option<TimerHandle>,
    now: Timestamp,
}

impl RetryTimer for PoolRetryTimer<'_> {
    fn arm(&mut self, deadline: Timestamp) {
        if let Some(handle) = self.slot.take() {
            self.pool.cancel(handle);
        }
        *self.slot = self.pool.set_system_timer(
            deadline.duration_since(self.now),
            SystemTimerCallback::ReliableMessageRetry,
            self.now,
        );
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.slot.take() {
            self.pool.cancel(handle);
        }
    }
}

/// Performs the transport send on each attempt and collects terminal
/// failures for the manager to resolve after the borrow ends.
struct SendAttempts<'a> {
    link: &'a mut dyn HostLink,
    records: &'a mut Vec<OutboundRecord>,
    failed: Vec<TransactionId>,
}

impl TransactionCallback for SendAttempts<'_> {
    fn on_transaction_attempt(&mut self, id: TransactionId, group_id: u16) {
        // The attempt inside `add` fires before the id is attached; that
        // record is the group's single unattached one.
        let record = match self.records.iter_mut().find(|r| r.txn == Some(id)) {
            Some(record) => Some(record),
            None => self
                .records
                .iter_mut()
                .find(|r| r.txn.is_none() && r.message.sender_instance.raw() == group_id),
        };
        let Some(record) = record else {
            tracing::error!("transaction {} has no backing message", id);
            return;
        };
        record.txn = Some(id);
        if !self.link.send_message(&record.message) {
            // Transport said no; the next retry tick tries again.
            tracing::warn!(
                "transport rejected attempt of reliable message seq={}",
                record.message.sequence_number
            );
        }
    }

    fn on_transaction_failure(&mut self, id: TransactionId, _group_id: u16) {
        self.failed.push(id);
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

pub struct HostCommsManager {
    link: Box<dyn HostLink>,
    poster: EventPoster,
    config: ReliableMessageConfig,
    pool: MessagePool,
    outbound: Vec<OutboundRecord>,
    transactions: TransactionManager,
    retry_timer: Option<TimerHandle>,
    detector: DuplicateMessageDetector,
    next_sequence: u32,
    host_awake: bool,
}

impl HostCommsManager {
    pub fn new(
        link: Box<dyn HostLink>,
        poster: EventPoster,
        config: ReliableMessageConfig,
        now: Timestamp,
    ) -> Self {
        let pool = MessagePool::new(config.message_pool_capacity);
        let transactions = TransactionManager::new(
            config.message_pool_capacity,
            config.max_attempts,
            config.retry_wait,
            now,
        );
        let detector = DuplicateMessageDetector::new(
            config.duplicate_detector_timeout,
            config.message_pool_capacity,
        );
        Self {
            link,
            poster,
            config,
            pool,
            outbound: Vec::new(),
            transactions,
            retry_timer: None,
            detector,
            next_sequence: 1,
            host_awake: true,
        }
    }

    pub fn outstanding_reliable_messages(&self) -> usize {
        self.outbound.len()
    }

    /// Host sleep state, used for wakeup blame attribution.
    pub fn set_host_awake(&mut self, awake: bool) {
        self.host_awake = awake;
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Validates and sends one nanoapp message. Unreliable messages finish
    /// inside this call; reliable ones are tracked until the host reports a
    /// delivery status or retries are exhausted.
    #[allow(clippy::too_many_arguments)]
    pub fn send_message_async(
        &mut self,
        app: &mut Nanoapp,
        host_endpoint: HostEndpoint,
        message_type: u32,
        payload: Vec<u8>,
        message_permissions: u32,
        is_reliable: bool,
        free_callback: Option<MessageFreeCallback>,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) -> Result<(), CtxhubError> {
        if payload.len() > self.config.max_message_size {
            return Err(MessageError::TooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            }
            .into());
        }
        if host_endpoint.is_unspecified() {
            return Err(MessageError::InvalidEndpoint {
                endpoint: host_endpoint,
            }
            .into());
        }
        if is_reliable && host_endpoint.is_broadcast() {
            return Err(MessageError::ReliableBroadcast.into());
        }
        if message_permissions & !app.permissions != 0 {
            return Err(MessageError::PermissionMismatch {
                requested: message_permissions,
                held: app.permissions,
            }
            .into());
        }
        let Some(ticket) = self.pool.allocate() else {
            return Err(MessageError::PoolExhausted.into());
        };

        app.stats.record_host_message();
        if !self.host_awake {
            // First cause of a host wakeup gets the blame.
            app.stats.record_wakeup();
            self.host_awake = true;
        }

        let sequence_number = if is_reliable {
            let seq = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            seq
        } else {
            0
        };
        let message = MessageToHost {
            sender_instance: app.instance_id,
            sender_app_id: app.app_id,
            host_endpoint,
            message_type,
            payload,
            permissions: message_permissions,
            is_reliable,
            sequence_number,
        };

        if !is_reliable {
            let accepted = self.link.send_message(&message);
            OutboundRecord {
                message,
                _ticket: ticket,
                txn: None,
                free_callback,
            }
            .finish();
            return if accepted {
                Ok(())
            } else {
                Err(MessageError::TransportRejected.into())
            };
        }

        self.outbound.push(OutboundRecord {
            message,
            _ticket: ticket,
            txn: None,
            free_callback,
        });
        let group_id = app.instance_id.raw();
        let mut timer = PoolRetryTimer {
            pool: timer_pool,
            slot: &mut self.retry_timer,
            now,
        };
        let mut attempts = SendAttempts {
            link: self.link.as_mut(),
            records: &mut self.outbound,
            failed: Vec::new(),
        };
        match self.transactions.add(group_id, now, &mut timer, &mut attempts) {
            Some(id) => {
                if let Some(record) = self.outbound.last_mut() {
                    if record.txn.is_none() {
                        // Queued behind another message of the same app; the
                        // attempt (and id attach) happens at promotion.
                        record.txn = Some(id);
                    }
                }
                Ok(())
            }
            None => {
                self.outbound.pop().map(OutboundRecord::finish);
                Err(CtxhubError::TransactionsFull)
            }
        }
    }

    /// Host acknowledgement (or terminal refusal) of a reliable message.
    pub fn handle_delivery_status(
        &mut self,
        sequence_number: u32,
        error: ErrorCode,
        timer_pool: &mut TimerPool,
        now: Timestamp,
    ) {
        let Some(index) = self
            .outbound
            .iter()
            .position(|r| r.message.sequence_number == sequence_number)
        else {
            tracing::warn!("delivery status for unknown seq={}", sequence_number);
            return;
        };
        let record = self.outbound.remove(index);
        if let Some(txn) = record.txn {
            let mut timer = PoolRetryTimer {
                pool: timer_pool,
                slot: &mut self.retry_timer,
                now,
            };
            let mut attempts = SendAttempts {
                link: self.link.as_mut(),
                records: &mut self.outbound,
                failed: Vec::new(),
            };
            self.transactions.remove(txn, now, &mut timer, &mut attempts);
            let failed = attempts.failed;
            self.resolve_failures(failed);
        }
        self.post_delivery_status(record.message.sender_instance, sequence_number, error);
        record.finish();
    }

    /// The shared retry timer fired.
    pub fn handle_retry_timer(&mut self, timer_pool: &mut TimerPool, now: Timestamp) {
        self.retry_timer = None;
        let mut timer = PoolRetryTimer {
            pool: timer_pool,
            slot: &mut self.retry_timer,
            now,
        };
        let mut attempts = SendAttempts {
            link: self.link.as_mut(),
            records: &mut self.outbound,
            failed: Vec::new(),
        };
        self.transactions.handle_timer_expiry(now, &mut timer, &mut attempts);
        let failed = attempts.failed;
        self.resolve_failures(failed);
    }

    /// Resolves transactions that exhausted their attempts.
    fn resolve_failures(&mut self, failed: Vec<TransactionId>) {
        for txn in failed {
            let Some(index) = self.outbound.iter().position(|r| r.txn == Some(txn)) else {
                continue;
            };
            let record = self.outbound.remove(index);
            tracing::warn!(
                "reliable message seq={} from {} timed out",
                record.message.sequence_number,
                record.message.sender_instance
            );
            self.post_delivery_status(
                record.message.sender_instance,
                record.message.sequence_number,
                ErrorCode::Timeout,
            );
            record.finish();
        }
    }

    fn post_delivery_status(&self, target: InstanceId, sequence_number: u32, error: ErrorCode) {
        self.poster.post_or_die(Event::new(
            event_type::MESSAGE_DELIVERY_STATUS,
            EventPayload::MessageDeliveryStatus {
                sequence_number,
                error,
            },
            InstanceId::SYSTEM,
            target,
        ));
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Routes one decoded host message to its nanoapp, with duplicate
    /// suppression on the reliable path. Detector GC runs eagerly at the
    /// end of every call.
    pub fn handle_message_from_host(
        &mut self,
        message: MessageFromHost,
        nanoapps: &NanoappTable,
        now: Timestamp,
    ) {
        let seq = message.sequence_number;
        let endpoint = message.host_endpoint;
        let reliable = message.is_reliable;

        if reliable {
            let (outcome, duplicate) = self.detector.find_or_add(seq, endpoint, now);
            if duplicate {
                match outcome {
                    Some(error) if error.is_transient_failure() => {
                        // Retry delivery below.
                    }
                    Some(error) => {
                        // Terminal outcome already known; replay it.
                        self.link.send_message_delivery_status(seq, error);
                        self.detector.remove_old_entries(now);
                        return;
                    }
                    None => {
                        // First delivery still in progress; suppress.
                        self.detector.remove_old_entries(now);
                        return;
                    }
                }
            }
        }

        let Some(target) = nanoapps.find_by_app_id(message.app_id) else {
            tracing::warn!("inbound message for unknown app {}", message.app_id);
            if reliable {
                self.detector
                    .find_and_set_error(seq, endpoint, ErrorCode::DestinationNotFound);
                self.link
                    .send_message_delivery_status(seq, ErrorCode::DestinationNotFound);
            }
            self.detector.remove_old_entries(now);
            return;
        };

        let posted = self.poster.post(Event::new(
            event_type::MESSAGE_FROM_HOST,
            EventPayload::MessageFromHost(message),
            InstanceId::SYSTEM,
            target,
        ));
        if !posted && reliable {
            // Transient: the host's retransmission will retry delivery.
            self.detector
                .find_and_set_error(seq, endpoint, ErrorCode::Transient);
            self.link
                .send_message_delivery_status(seq, ErrorCode::Transient);
        }
        self.detector.remove_old_entries(now);
    }

    /// Called by the loop after a reliable inbound message was handed to
    /// its nanoapp; records and reports the final outcome.
    pub fn on_inbound_delivered(&mut self, sequence_number: u32, endpoint: HostEndpoint) {
        self.detector
            .find_and_set_error(sequence_number, endpoint, ErrorCode::Success);
        self.link
            .send_message_delivery_status(sequence_number, ErrorCode::Success);
    }

    // ------------------------------------------------------------------
    // Unload support
    // ------------------------------------------------------------------

    /// First two steps of the unload flush protocol: withdraw the app's
    /// pending transactions and have the transport resolve everything sent
    /// on its behalf. Returns the number of withdrawn reliable messages.
    pub fn flush_nanoapp(
        &mut self,
        instance_id: InstanceId,
        app_id: AppId,
        timer_pool: &mut TimerPool,
    ) -> u32 {
        let mut timer = PoolRetryTimer {
            pool: timer_pool,
            slot: &mut self.retry_timer,
            now: Timestamp::from_nanos(0),
        };
        let withdrawn = self.transactions.remove_group(instance_id.raw(), &mut timer);
        let mut index = 0;
        while index < self.outbound.len() {
            if self.outbound[index].message.sender_instance == instance_id {
                self.outbound.remove(index).finish();
            } else {
                index += 1;
            }
        }
        self.link.flush_messages_from_app(app_id);
        withdrawn
    }
}

impl std::fmt::Debug for HostCommsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCommsManager")
            .field("outbound", &self.outbound.len())
            .field("pool_in_use", &self.pool.in_use())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPool, EventQueue};
    use crate::nanoapp::NanoappHandler;
    use crate::platform::testing::{FakeHostLink, ManualSystemTimer};
    use ctxhub_core::config::TimerPoolConfig;
    use ctxhub_core::types::ManualTimeSource;

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
        mgr: HostCommsManager,
        link: FakeHostLink,
        timers: TimerPool,
        queue: Arc<EventQueue>,
        app: Nanoapp,
    }

    const EP: HostEndpoint = HostEndpoint::new(0x10);

    fn fixture() -> Fixture {
        let link = FakeHostLink::new();
        let queue = Arc::new(EventQueue::new());
        let poster = EventPoster::new(
            EventPool::new(64),
            Arc::clone(&queue),
            Arc::new(ManualTimeSource::new()),
            4,
        );
        let mgr = HostCommsManager::new(
            Box::new(link.clone()),
            poster,
            ReliableMessageConfig::testing(),
            Timestamp::from_nanos(99),
        );
        let timers = TimerPool::new(
            TimerPoolConfig::default(),
            Box::new(ManualSystemTimer::new()),
        );
        Fixture {
            mgr,
            link,
            timers,
            queue,
            app: Nanoapp::new(InstanceId::new(1), AppId::new(0xaa), 1, 0b11),
        }
    }

    fn now() -> Timestamp {
        Timestamp::from_nanos(0)
    }

    fn send(f: &mut Fixture, reliable: bool) -> Result<(), CtxhubError> {
        let app = &mut f.app;
        f.mgr.send_message_async(
            app,
            EP,
            7,
            vec![1, 2, 3],
            0,
            reliable,
            None,
            &mut f.timers,
            now(),
        )
    }

    #[test]
    fn unreliable_message_completes_inside_send() {
        let mut f = fixture();
        send(&mut f, false).unwrap();
        assert_eq!(f.link.sent_count(), 1);
        assert_eq!(f.mgr.outstanding_reliable_messages(), 0);
        assert_eq!(f.mgr.pool.in_use(), 0, "ticket returned");
    }

    #[test]
    fn oversized_message_is_rejected_synchronously() {
        let mut f = fixture();
        let payload = vec![0u8; ReliableMessageConfig::testing().max_message_size + 1];
        let app = &mut f.app;
        let err = f
            .mgr
            .send_message_async(app, EP, 7, payload, 0, false, None, &mut f.timers, now())
            .unwrap_err();
        assert!(matches!(
            err,
            CtxhubError::Message(MessageError::TooLarge { .. })
        ));
        assert_eq!(f.link.sent_count(), 0);
    }

    #[test]
    fn reliable_broadcast_is_rejected() {
        let mut f = fixture();
        let app = &mut f.app;
        let err = f
            .mgr
            .send_message_async(
                app,
                HostEndpoint::BROADCAST,
                7,
                vec![1],
                0,
                true,
                None,
                &mut f.timers,
                now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CtxhubError::Message(MessageError::ReliableBroadcast)
        ));
    }

    #[test]
    fn permission_superset_is_rejected() {
        let mut f = fixture();
        let app = &mut f.app;
        let err = f
            .mgr
            .send_message_async(app, EP, 7, vec![1], 0b100, false, None, &mut f.timers, now())
            .unwrap_err();
        assert!(matches!(
            err,
            CtxhubError::Message(MessageError::PermissionMismatch { .. })
        ));
    }

    #[test]
    fn reliable_message_retries_until_acked() {
        let mut f = fixture();
        send(&mut f, true).unwrap();
        assert_eq!(f.link.sent_count(), 1);
        let seq = f.link.last_sent().unwrap().sequence_number;

        // Two retry ticks, then the host acks.
        f.mgr.handle_retry_timer(&mut f.timers, now() + ReliableMessageConfig::testing().retry_wait);
        assert_eq!(f.link.sent_count(), 2);
        f.mgr.handle_delivery_status(seq, ErrorCode::Success, &mut f.timers, now());
        assert_eq!(f.mgr.outstanding_reliable_messages(), 0);

        let statuses: Vec<(u32, ErrorCode)> = std::iter::from_fn(|| f.queue.try_pop())
            .filter_map(|e| match e.event.payload {
                EventPayload::MessageDeliveryStatus {
                    sequence_number,
                    error,
                } => Some((sequence_number, error)),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![(seq, ErrorCode::Success)]);
    }

    #[test]
    fn exhausted_retries_fail_with_timeout() {
        let mut f = fixture();
        send(&mut f, true).unwrap();
        let wait = ReliableMessageConfig::testing().retry_wait;
        let mut t = now();
        // testing() allows 3 attempts; the 4th expiry fails the message.
        for _ in 0..3 {
            t = t + wait;
            f.mgr.handle_retry_timer(&mut f.timers, t);
        }
        assert_eq!(f.mgr.outstanding_reliable_messages(), 0);
        let statuses: Vec<ErrorCode> = std::iter::from_fn(|| f.queue.try_pop())
            .filter_map(|e| match e.event.payload {
                EventPayload::MessageDeliveryStatus { error, .. } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![ErrorCode::Timeout]);
    }

    #[test]
    fn same_app_reliable_messages_are_serialized() {
        let mut f = fixture();
        send(&mut f, true).unwrap();
        send(&mut f, true).unwrap();
        assert_eq!(f.link.sent_count(), 1, "second waits in the group");
        let first_seq = f.link.last_sent().unwrap().sequence_number;
        f.mgr.handle_delivery_status(first_seq, ErrorCode::Success, &mut f.timers, now());
        assert_eq!(f.link.sent_count(), 2, "ack promotes the next message");
    }

    #[test]
    fn inbound_duplicate_is_suppressed_and_status_replayed() {
        let mut f = fixture();
        let mut nanoapps = NanoappTable::new();
        let instance = nanoapps.insert(
            Nanoapp::new(InstanceId::SYSTEM, AppId::new(0xaa), 1, 0),
            Box::new(NullHandler),
        );
        let message = MessageFromHost {
            app_id: AppId::new(0xaa),
            host_endpoint: EP,
            message_type: 7,
            payload: vec![9],
            is_reliable: true,
            sequence_number: 55,
        };
        f.mgr.handle_message_from_host(message.clone(), &nanoapps, now());
        let delivered = f.queue.try_pop().unwrap();
        assert_eq!(delivered.event.target, instance);
        f.mgr.on_inbound_delivered(55, EP);

        // The host retransmits; no second delivery, status replayed.
        f.mgr.handle_message_from_host(message, &nanoapps, now());
        assert!(f.queue.try_pop().is_none());
        let statuses = f.link.calls.lock().unwrap().delivery_statuses.clone();
        assert_eq!(
            statuses,
            vec![(55, ErrorCode::Success), (55, ErrorCode::Success)]
        );
    }

    #[test]
    fn inbound_for_unknown_app_reports_destination_not_found() {
        let mut f = fixture();
        let nanoapps = NanoappTable::new();
        f.mgr.handle_message_from_host(
            MessageFromHost {
                app_id: AppId::new(0xdead),
                host_endpoint: EP,
                message_type: 1,
                payload: Vec::new(),
                is_reliable: true,
                sequence_number: 9,
            },
            &nanoapps,
            now(),
        );
        let statuses = f.link.calls.lock().unwrap().delivery_statuses.clone();
        assert_eq!(statuses, vec![(9, ErrorCode::DestinationNotFound)]);
    }

    #[test]
    fn flush_withdraws_transactions_and_flushes_transport() {
        let mut f = fixture();
        send(&mut f, true).unwrap();
        send(&mut f, true).unwrap();
        let withdrawn = f
            .mgr
            .flush_nanoapp(f.app.instance_id, f.app.app_id, &mut f.timers);
        assert_eq!(withdrawn, 2);
        assert_eq!(f.mgr.outstanding_reliable_messages(), 0);
        assert_eq!(f.mgr.pool.in_use(), 0);
        let flushed = f.link.calls.lock().unwrap().flushed_apps.clone();
        assert_eq!(flushed, vec![AppId::new(0xaa)]);
    }
}
