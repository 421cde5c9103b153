//! Transaction manager
//!
//! Drives retries of asynchronous operations that need an acknowledgement,
//! with FIFO serialization per group: at most one transaction per group is
//! "started" (actively attempting) at a time, the rest queue behind it.
//!
//! Not internally synchronized. All methods must be called from the thread
//! that services the retry timer. Callbacks are borrowed per call rather
//! than stored, so re-entrant `add`/`remove` from inside a callback is ruled
//! out by the borrow checker instead of a runtime flag.

use core::fmt;
use core::time::Duration;

use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

/// Opaque transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u32);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{:#010x}", self.0)
    }
}

const FNV_OFFSET_BASIS_32: u32 = 0x811c_9dc5;
const FNV_PRIME_32: u32 = 0x0100_0193;

/// FNV-1a over the byte representation of a timestamp, masked to 30 bits.
/// The mask keeps generated ids clear of a peer's 32-bit signed counter
/// space while the hash keeps the starting point unpredictable at boot.
fn seed_transaction_id(now: Timestamp) -> u32 {
    let mut hash = FNV_OFFSET_BASIS_32;
    for byte in now.as_nanos().to_le_bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME_32);
    }
    hash & 0x3fff_ffff
}

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// Receives attempt and failure notifications. `on_transaction_attempt` is
/// where the caller performs the actual operation (for example a transport
/// send); it fires once when the transaction starts and once per retry.
pub trait TransactionCallback {
    fn on_transaction_attempt(&mut self, id: TransactionId, group_id: u16);
    fn on_transaction_failure(&mut self, id: TransactionId, group_id: u16);
}

/// The single coalesced retry timer. The manager keeps it armed at the
/// earliest deadline across all started transactions.
pub trait RetryTimer {
    fn arm(&mut self, deadline: Timestamp);
    fn cancel(&mut self);
}

// ----------------------------------------------------------------------------
// Transaction Manager
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Transaction {
    id: TransactionId,
    group_id: u16,
    /// 0 while pending; first attempt sets it to 1.
    attempt_count: u16,
    deadline: Timestamp,
}

impl Transaction {
    fn is_started(&self) -> bool {
        self.attempt_count > 0
    }
}

/// Bounded retry/serialization engine. Insertion order of the backing list
/// doubles as FIFO order within each group.
pub struct TransactionManager {
    transactions: Vec<Transaction>,
    max_transactions: usize,
    max_attempts: u16,
    retry_wait: Duration,
    next_id: u32,
}

impl TransactionManager {
    /// `now` seeds the pseudo-random id start.
    pub fn new(
        max_transactions: usize,
        max_attempts: u16,
        retry_wait: Duration,
        now: Timestamp,
    ) -> Self {
        Self {
            transactions: Vec::with_capacity(max_transactions),
            max_transactions,
            max_attempts,
            retry_wait,
            next_id: seed_transaction_id(now),
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Adds a transaction to `group_id`. If no other transaction in the
    /// group is started, the first attempt fires synchronously inside this
    /// call. Returns `None` when the manager is at capacity.
    pub fn add(
        &mut self,
        group_id: u16,
        now: Timestamp,
        timer: &mut impl RetryTimer,
        callback: &mut impl TransactionCallback,
    ) -> Option<TransactionId> {
        if self.transactions.len() >= self.max_transactions {
            log::warn!(
                "transaction table full ({}), rejecting add for group {}",
                self.max_transactions,
                group_id
            );
            return None;
        }
        let id = TransactionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let start_now = !self
            .transactions
            .iter()
            .any(|t| t.group_id == group_id && t.is_started());
        self.transactions.push(Transaction {
            id,
            group_id,
            attempt_count: 0,
            deadline: now,
        });
        if start_now {
            self.start_transaction(id, now, callback);
            self.update_timer(timer);
        }
        Some(id)
    }

    /// Removes a transaction (normally on acknowledgement). Returns whether
    /// it was present. The next pending member of its group, if any, starts
    /// before this returns.
    pub fn remove(
        &mut self,
        id: TransactionId,
        now: Timestamp,
        timer: &mut impl RetryTimer,
        callback: &mut impl TransactionCallback,
    ) -> bool {
        let Some(index) = self.transactions.iter().position(|t| t.id == id) else {
            return false;
        };
        let removed = self.transactions.remove(index);
        if removed.is_started() {
            self.promote_next_in_group(removed.group_id, now, callback);
        }
        self.update_timer(timer);
        true
    }

    /// Removes every transaction in `group_id` without firing callbacks.
    /// Used when the group's owner goes away. Returns the count removed.
    pub fn remove_group(&mut self, group_id: u16, timer: &mut impl RetryTimer) -> u32 {
        let before = self.transactions.len();
        self.transactions.retain(|t| t.group_id != group_id);
        self.update_timer(timer);
        (before - self.transactions.len()) as u32
    }

    /// Services the retry timer. Every started transaction at or past its
    /// deadline is retried, or failed once its attempts are exhausted;
    /// failures promote the next pending member of the group.
    pub fn handle_timer_expiry(
        &mut self,
        now: Timestamp,
        timer: &mut impl RetryTimer,
        callback: &mut impl TransactionCallback,
    ) {
        let due: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|t| t.is_started() && t.deadline <= now)
            .map(|t| t.id)
            .collect();
        for id in due {
            // May have been removed by an earlier promotion this pass.
            let Some(index) = self.transactions.iter().position(|t| t.id == id) else {
                continue;
            };
            if self.transactions[index].attempt_count >= self.max_attempts {
                let failed = self.transactions.remove(index);
                log::warn!(
                    "{} failed after {} attempts (group {})",
                    failed.id,
                    failed.attempt_count,
                    failed.group_id
                );
                callback.on_transaction_failure(failed.id, failed.group_id);
                self.promote_next_in_group(failed.group_id, now, callback);
            } else {
                let t = &mut self.transactions[index];
                t.attempt_count += 1;
                t.deadline = now + self.retry_wait;
                let (id, group_id) = (t.id, t.group_id);
                callback.on_transaction_attempt(id, group_id);
            }
        }
        self.update_timer(timer);
    }

    /// Earliest deadline across started transactions, if any. Exposed for
    /// state dumps and tests.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.transactions
            .iter()
            .filter(|t| t.is_started())
            .map(|t| t.deadline)
            .min()
    }

    fn start_transaction(
        &mut self,
        id: TransactionId,
        now: Timestamp,
        callback: &mut impl TransactionCallback,
    ) {
        if let Some(t) = self.transactions.iter_mut().find(|t| t.id == id) {
            t.attempt_count = 1;
            t.deadline = now + self.retry_wait;
            let group_id = t.group_id;
            callback.on_transaction_attempt(id, group_id);
        }
    }

    fn promote_next_in_group(
        &mut self,
        group_id: u16,
        now: Timestamp,
        callback: &mut impl TransactionCallback,
    ) {
        let next = self
            .transactions
            .iter()
            .find(|t| t.group_id == group_id && !t.is_started())
            .map(|t| t.id);
        if let Some(id) = next {
            self.start_transaction(id, now, callback);
        }
    }

    /// Re-derives the coalesced timer from scratch.
    fn update_timer(&self, timer: &mut impl RetryTimer) {
        match self.next_deadline() {
            Some(deadline) => timer.arm(deadline),
            None => timer.cancel(),
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("live", &self.transactions.len())
            .field("capacity", &self.max_transactions)
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    #[derive(Default)]
    struct Recorder {
        attempts: Vec<(TransactionId, u16)>,
        failures: Vec<(TransactionId, u16)>,
    }

    impl TransactionCallback for Recorder {
        fn on_transaction_attempt(&mut self, id: TransactionId, group_id: u16) {
            self.attempts.push((id, group_id));
        }
        fn on_transaction_failure(&mut self, id: TransactionId, group_id: u16) {
            self.failures.push((id, group_id));
        }
    }

    #[derive(Default)]
    struct FakeTimer {
        armed: Option<Timestamp>,
    }

    impl RetryTimer for FakeTimer {
        fn arm(&mut self, deadline: Timestamp) {
            self.armed = Some(deadline);
        }
        fn cancel(&mut self) {
            self.armed = None;
        }
    }

    fn mgr(max_attempts: u16) -> TransactionManager {
        TransactionManager::new(32, max_attempts, WAIT, Timestamp::from_nanos(12345))
    }

    #[test]
    fn first_in_group_starts_inside_add() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        let t0 = Timestamp::from_nanos(0);
        let id = m.add(7, t0, &mut timer, &mut cb).unwrap();
        assert_eq!(cb.attempts, vec![(id, 7)]);
        assert_eq!(timer.armed, Some(t0 + WAIT));
    }

    #[test]
    fn ids_are_consecutive_and_30_bit() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        let t0 = Timestamp::from_nanos(0);
        let a = m.add(1, t0, &mut timer, &mut cb).unwrap();
        let b = m.add(2, t0, &mut timer, &mut cb).unwrap();
        assert_eq!(b.0, a.0.wrapping_add(1));
        assert!(a.0 < 1 << 30);
    }

    #[test]
    fn second_in_group_waits_for_first() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        let t0 = Timestamp::from_nanos(0);
        let first = m.add(7, t0, &mut timer, &mut cb).unwrap();
        let second = m.add(7, t0, &mut timer, &mut cb).unwrap();
        assert_eq!(cb.attempts.len(), 1);

        assert!(m.remove(first, t0, &mut timer, &mut cb));
        assert_eq!(cb.attempts, vec![(first, 7), (second, 7)]);
        assert!(m.remove(second, t0, &mut timer, &mut cb));
        assert!(m.is_empty());
        assert_eq!(timer.armed, None);
    }

    #[test]
    fn different_groups_start_independently() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        let t0 = Timestamp::from_nanos(0);
        m.add(1, t0, &mut timer, &mut cb).unwrap();
        m.add(2, t0, &mut timer, &mut cb).unwrap();
        assert_eq!(cb.attempts.len(), 2);
    }

    #[test]
    fn retries_then_fails_after_max_attempts() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        let t0 = Timestamp::from_nanos(0);
        let id = m.add(7, t0, &mut timer, &mut cb).unwrap();
        let queued = m.add(7, t0, &mut timer, &mut cb).unwrap();

        // Attempts at t0 (inside add), t0+W, t0+2W; failure at t0+3W.
        let mut now = t0;
        for expected in 2..=3u16 {
            now = timer.armed.unwrap();
            m.handle_timer_expiry(now, &mut timer, &mut cb);
            assert_eq!(cb.attempts.iter().filter(|(i, _)| *i == id).count(), usize::from(expected));
            assert!(cb.failures.is_empty());
        }
        now = timer.armed.unwrap();
        assert_eq!(now, t0 + WAIT * 3);
        m.handle_timer_expiry(now, &mut timer, &mut cb);
        assert_eq!(cb.failures, vec![(id, 7)]);
        // Failure promotes the queued group member.
        assert_eq!(*cb.attempts.last().unwrap(), (queued, 7));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn remove_unknown_id_is_false() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        assert!(!m.remove(TransactionId(99), Timestamp::from_nanos(0), &mut timer, &mut cb));
    }

    #[test]
    fn timer_tracks_minimum_deadline() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        let t0 = Timestamp::from_nanos(0);
        let early = m.add(1, t0, &mut timer, &mut cb).unwrap();
        // A later add in another group must not push the deadline out.
        let t1 = t0 + Duration::from_millis(40);
        m.add(2, t1, &mut timer, &mut cb).unwrap();
        assert_eq!(timer.armed, Some(t0 + WAIT));

        m.remove(early, t1, &mut timer, &mut cb);
        assert_eq!(timer.armed, Some(t1 + WAIT));
    }

    #[test]
    fn capacity_limit_rejects_add() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = TransactionManager::new(2, 3, WAIT, Timestamp::from_nanos(1));
        let t0 = Timestamp::from_nanos(0);
        assert!(m.add(1, t0, &mut timer, &mut cb).is_some());
        assert!(m.add(1, t0, &mut timer, &mut cb).is_some());
        assert!(m.add(1, t0, &mut timer, &mut cb).is_none());
    }

    #[test]
    fn remove_group_drops_pending_and_started_silently() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(3);
        let t0 = Timestamp::from_nanos(0);
        m.add(7, t0, &mut timer, &mut cb).unwrap();
        m.add(7, t0, &mut timer, &mut cb).unwrap();
        m.add(8, t0, &mut timer, &mut cb).unwrap();
        assert_eq!(m.remove_group(7, &mut timer), 2);
        assert_eq!(m.len(), 1);
        assert!(cb.failures.is_empty());
    }

    #[test]
    fn pending_transaction_does_not_hold_the_timer() {
        let (mut timer, mut cb) = (FakeTimer::default(), Recorder::default());
        let mut m = mgr(1);
        let t0 = Timestamp::from_nanos(0);
        let started = m.add(7, t0, &mut timer, &mut cb).unwrap();
        m.add(7, t0, &mut timer, &mut cb).unwrap();
        // Exhaust the started one: attempt in add, then failure on expiry.
        let now = timer.armed.unwrap();
        m.handle_timer_expiry(now, &mut timer, &mut cb);
        assert_eq!(cb.failures, vec![(started, 7)]);
        // The promoted successor now owns the timer.
        assert_eq!(timer.armed, Some(now + WAIT));
    }
}
