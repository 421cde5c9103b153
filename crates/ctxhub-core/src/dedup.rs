//! Inbound reliable-message duplicate detection
//!
//! The host retransmits a reliable message until it sees a delivery status,
//! so the same (sequence number, endpoint) pair can arrive several times.
//! Each pair is tracked for a bounded window along with the outcome of its
//! first delivery, letting later sightings either replay that outcome or,
//! for transient failures, retry delivery.

use core::time::Duration;

use crate::errors::ErrorCode;
use crate::types::{HostEndpoint, Timestamp};

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Record {
    sequence_number: u32,
    endpoint: HostEndpoint,
    seen_at: Timestamp,
    /// Outcome of the first delivery attempt, once known.
    outcome: Option<ErrorCode>,
}

// ----------------------------------------------------------------------------
// Detector
// ----------------------------------------------------------------------------

/// Bounded, time-ordered set of recently seen inbound reliable messages.
///
/// Expired records are purged eagerly by [`remove_old_entries`], called by
/// the owner after processing each inbound message. There is no background
/// timer; a quiet link simply keeps stale records a little longer, which is
/// harmless.
///
/// [`remove_old_entries`]: DuplicateMessageDetector::remove_old_entries
#[derive(Debug)]
pub struct DuplicateMessageDetector {
    /// Ordered by `seen_at` ascending. Pushes use the current time, which is
    /// monotonic, so order is maintained by construction.
    records: Vec<Record>,
    timeout: Duration,
    capacity: usize,
}

impl DuplicateMessageDetector {
    pub fn new(timeout: Duration, capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            timeout,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up the pair, adding a fresh record when unseen. Returns the
    /// stored outcome (if the first delivery already resolved) and whether
    /// this sighting is a duplicate.
    pub fn find_or_add(
        &mut self,
        sequence_number: u32,
        endpoint: HostEndpoint,
        now: Timestamp,
    ) -> (Option<ErrorCode>, bool) {
        if let Some(record) = self.find(sequence_number, endpoint) {
            return (record.outcome, true);
        }
        if self.records.len() >= self.capacity {
            // The oldest record is first. Evicting it may let an old
            // duplicate through, which the nanoapp must already tolerate.
            let evicted = self.records.remove(0);
            log::warn!(
                "duplicate detector full, evicting seq={} ep={}",
                evicted.sequence_number,
                evicted.endpoint
            );
        }
        self.records.push(Record {
            sequence_number,
            endpoint,
            seen_at: now,
            outcome: None,
        });
        (None, false)
    }

    /// Records the delivery outcome for a tracked pair. Returns whether the
    /// pair was found.
    pub fn find_and_set_error(
        &mut self,
        sequence_number: u32,
        endpoint: HostEndpoint,
        error: ErrorCode,
    ) -> bool {
        match self.find_mut(sequence_number, endpoint) {
            Some(record) => {
                record.outcome = Some(error);
                true
            }
            None => false,
        }
    }

    /// Purges records older than the timeout. Returns the number removed.
    pub fn remove_old_entries(&mut self, now: Timestamp) -> usize {
        let timeout = self.timeout;
        let before = self.records.len();
        self.records
            .retain(|r| now.duration_since(r.seen_at) <= timeout);
        before - self.records.len()
    }

    fn find(&self, sequence_number: u32, endpoint: HostEndpoint) -> Option<&Record> {
        self.records
            .iter()
            .find(|r| r.sequence_number == sequence_number && r.endpoint == endpoint)
    }

    fn find_mut(
        &mut self,
        sequence_number: u32,
        endpoint: HostEndpoint,
    ) -> Option<&mut Record> {
        self.records
            .iter_mut()
            .find(|r| r.sequence_number == sequence_number && r.endpoint == endpoint)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
