//! Request multiplexer
//!
//! Reduces N per-nanoapp resource requests to the single request actually
//! issued to the platform. Every mutation reports whether the merged
//! "maximal" request changed, which is what gates physical platform calls.

use crate::ble::RequestStatus;
use crate::types::InstanceId;

// ----------------------------------------------------------------------------
// Mergeable Request Trait
// ----------------------------------------------------------------------------

/// A per-nanoapp resource request that can be folded into a maximal request.
pub trait MergeableRequest: Clone {
    /// The requesting nanoapp.
    fn instance_id(&self) -> InstanceId;

    /// Whether this request asks for the resource at all.
    fn is_enabled(&self) -> bool;

    fn status(&self) -> RequestStatus;
    fn set_status(&mut self, status: RequestStatus);

    /// The identity element of the fold: a request with nothing enabled.
    fn disabled() -> Self;

    /// Folds `other`'s constraints into `self`; returns whether `self`
    /// changed observably.
    fn merge_with(&mut self, other: &Self) -> bool;

    /// Whether two requests would drive the platform identically.
    fn is_equivalent_to(&self, other: &Self) -> bool;
}

// ----------------------------------------------------------------------------
// Multiplexer
// ----------------------------------------------------------------------------

/// Holds at most one request per nanoapp plus the cached maximal request.
#[derive(Debug, Clone)]
pub struct RequestMultiplexer<R: MergeableRequest> {
    requests: Vec<R>,
    maximal: R,
}

impl<R: MergeableRequest> Default for RequestMultiplexer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: MergeableRequest> RequestMultiplexer<R> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            maximal: R::disabled(),
        }
    }

    /// Index of the given nanoapp's request, if present.
    pub fn find_request(&self, instance_id: InstanceId) -> Option<usize> {
        self.requests
            .iter()
            .position(|r| r.instance_id() == instance_id)
    }

    pub fn get(&self, index: usize) -> Option<&R> {
        self.requests.get(index)
    }

    pub fn requests(&self) -> &[R] {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut [R] {
        &mut self.requests
    }

    /// The merged request over all enabled entries.
    pub fn maximal_request(&self) -> &R {
        &self.maximal
    }

    /// Appends a request; returns whether the maximal request changed.
    pub fn add_request(&mut self, request: R) -> bool {
        self.requests.push(request);
        self.update_maximal()
    }

    /// Replaces the request at `index`; returns whether the maximal request
    /// changed.
    pub fn update_request(&mut self, index: usize, request: R) -> bool {
        self.requests[index] = request;
        self.update_maximal()
    }

    /// Removes the request at `index`; returns whether the maximal request
    /// changed.
    pub fn remove_request(&mut self, index: usize) -> bool {
        self.requests.remove(index);
        self.update_maximal()
    }

    /// Removes all requests satisfying `pred`; returns whether the maximal
    /// request changed.
    pub fn remove_requests_where<F: FnMut(&R) -> bool>(&mut self, mut pred: F) -> bool {
        self.requests.retain(|r| !pred(r));
        self.update_maximal()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Recomputes the fold from scratch and reports whether it changed.
    fn update_maximal(&mut self) -> bool {
        let mut merged = R::disabled();
        for request in self.requests.iter().filter(|r| r.is_enabled()) {
            merged.merge_with(request);
        }
        let changed = !merged.is_equivalent_to(&self.maximal);
        self.maximal = merged;
        changed
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{BleScanMode, BleScanRequest, RSSI_THRESHOLD_NONE};

    fn enable(id: u16, mode: BleScanMode, delay: u32) -> BleScanRequest {
        BleScanRequest::enable(
            InstanceId::new(id),
            mode,
            delay,
            RSSI_THRESHOLD_NONE,
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn empty_multiplexer_is_disabled() {
        let mux: RequestMultiplexer<BleScanRequest> = RequestMultiplexer::new();
        assert!(!mux.maximal_request().is_enabled());
    }

    #[test]
    fn add_reports_maximal_change() {
        let mut mux = RequestMultiplexer::new();
        assert!(mux.add_request(enable(1, BleScanMode::Background, 1000)));
        // A weaker request changes nothing observable.
        assert!(!mux.add_request(enable(2, BleScanMode::Background, 2000)));
        // A stricter one does.
        assert!(mux.add_request(enable(3, BleScanMode::Aggressive, 0)));
        assert_eq!(mux.maximal_request().mode, BleScanMode::Aggressive);
        assert_eq!(mux.maximal_request().report_delay_ms, 0);
    }

    #[test]
    fn remove_recomputes_maximal() {
        let mut mux = RequestMultiplexer::new();
        mux.add_request(enable(1, BleScanMode::Background, 1000));
        mux.add_request(enable(2, BleScanMode::Aggressive, 0));
        let idx = mux.find_request(InstanceId::new(2)).unwrap();
        assert!(mux.remove_request(idx));
        assert_eq!(mux.maximal_request().mode, BleScanMode::Background);
        assert_eq!(mux.maximal_request().report_delay_ms, 1000);
    }

    #[test]
    fn removing_last_request_disables_maximal() {
        let mut mux = RequestMultiplexer::new();
        mux.add_request(enable(1, BleScanMode::Foreground, 0));
        assert!(mux.remove_request(0));
        assert!(!mux.maximal_request().is_enabled());
        assert!(mux.is_empty());
    }

    #[test]
    fn disabled_entries_do_not_contribute() {
        let mut mux = RequestMultiplexer::new();
        mux.add_request(enable(1, BleScanMode::Aggressive, 0));
        let idx = mux.find_request(InstanceId::new(1)).unwrap();
        assert!(mux.update_request(idx, BleScanRequest::disable(InstanceId::new(1))));
        assert!(!mux.maximal_request().is_enabled());
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn find_request_by_instance() {
        let mut mux = RequestMultiplexer::new();
        mux.add_request(enable(5, BleScanMode::Background, 0));
        mux.add_request(enable(9, BleScanMode::Background, 0));
        assert_eq!(mux.find_request(InstanceId::new(9)), Some(1));
        assert_eq!(mux.find_request(InstanceId::new(4)), None);
    }
}
