//! BLE scan request model
//!
//! A [`BleScanRequest`] captures one nanoapp's scanning constraints. The
//! request manager reduces all active requests to a single maximal request
//! via [`MergeableRequest`](crate::multiplexer::MergeableRequest); the merge
//! rule here defines what "maximal" means for BLE.

use smallvec::SmallVec;

use crate::errors::RequestError;
use crate::multiplexer::MergeableRequest;
use crate::types::InstanceId;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum length of a generic filter's data and mask fields.
pub const MAX_FILTER_DATA_LEN: usize = 29;

/// Maximum number of generic filters accepted in one request.
pub const MAX_GENERIC_FILTERS: usize = 8;

/// Maximum number of broadcaster address filters accepted in one request.
pub const MAX_BROADCASTER_FILTERS: usize = 8;

/// Report delay meaning "deliver each result immediately".
pub const IMMEDIATE_REPORT_DELAY_MS: u32 = 0;

/// RSSI threshold meaning "no threshold".
pub const RSSI_THRESHOLD_NONE: i8 = i8::MIN;

// ----------------------------------------------------------------------------
// Scan Mode
// ----------------------------------------------------------------------------

/// Scan duty-cycle modes, ordered from least to most aggressive.
///
/// The derived `Ord` is load-bearing: merging picks the maximum mode across
/// all enabled requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum BleScanMode {
    /// Low duty cycle, suitable for always-on background scanning.
    Background,
    /// Moderate duty cycle while an interactive use case is active.
    Foreground,
    /// Maximum duty cycle, lowest latency.
    Aggressive,
}

// ----------------------------------------------------------------------------
// Filters
// ----------------------------------------------------------------------------

/// Advertisement data field types accepted in generic filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum FilterType {
    ServiceData16 = 0x16,
    ManufacturerData = 0xff,
}

impl FilterType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x16 => Some(Self::ServiceData16),
            0xff => Some(Self::ManufacturerData),
            _ => None,
        }
    }
}

/// Match on one advertisement data field: a candidate field matches when
/// `candidate & mask == data & mask` over `len` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GenericFilter {
    pub filter_type: FilterType,
    pub data: SmallVec<[u8; MAX_FILTER_DATA_LEN]>,
    pub mask: SmallVec<[u8; MAX_FILTER_DATA_LEN]>,
}

impl GenericFilter {
    pub fn new(filter_type: FilterType, data: &[u8], mask: &[u8]) -> Self {
        Self {
            filter_type,
            data: SmallVec::from_slice(data),
            mask: SmallVec::from_slice(mask),
        }
    }

    /// A filter is well formed when data and mask lengths agree, fit the
    /// length bound, and no data bit tests a position the mask excludes.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.data.len() != self.mask.len() || self.data.len() > MAX_FILTER_DATA_LEN {
            return Err(RequestError::InvalidFilter {
                reason: "filter data/mask length mismatch or overflow",
            });
        }
        for (d, m) in self.data.iter().zip(self.mask.iter()) {
            if d & !m != 0 {
                return Err(RequestError::InvalidFilter {
                    reason: "filter data tests bits excluded by mask",
                });
            }
        }
        Ok(())
    }
}

/// Match on a specific broadcaster address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BroadcasterFilter {
    pub address: [u8; 6],
}

// ----------------------------------------------------------------------------
// Request Status
// ----------------------------------------------------------------------------

/// Where a request stands relative to the physical scan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RequestStatus {
    /// Accepted but not yet part of a dispatched platform operation.
    PendingRequest,
    /// Part of the platform operation currently in flight.
    PendingResponse,
    /// Reflected in the platform's current scan state.
    Applied,
}

// ----------------------------------------------------------------------------
// Scan Request
// ----------------------------------------------------------------------------

/// One nanoapp's BLE scanning constraints.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BleScanRequest {
    pub instance_id: InstanceId,
    pub enabled: bool,
    pub mode: BleScanMode,
    /// Maximum batching delay before results are delivered. Lower is
    /// stricter; the merged request takes the minimum.
    pub report_delay_ms: u32,
    /// Minimum RSSI for a result to be reported. Lower is stricter.
    pub rssi_threshold: i8,
    pub generic_filters: Vec<GenericFilter>,
    pub broadcaster_filters: Vec<BroadcasterFilter>,
    pub status: RequestStatus,
    /// Opaque app-supplied value echoed back in async results. Ignored by
    /// merging and equivalence.
    pub cookie: u32,
}

impl BleScanRequest {
    /// An enable request with the given parameters, initially pending.
    pub fn enable(
        instance_id: InstanceId,
        mode: BleScanMode,
        report_delay_ms: u32,
        rssi_threshold: i8,
        generic_filters: Vec<GenericFilter>,
        broadcaster_filters: Vec<BroadcasterFilter>,
    ) -> Self {
        Self {
            instance_id,
            enabled: true,
            mode,
            report_delay_ms,
            rssi_threshold,
            generic_filters,
            broadcaster_filters,
            status: RequestStatus::PendingRequest,
            cookie: 0,
        }
    }

    /// A disable request for the given nanoapp.
    pub fn disable(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            enabled: false,
            mode: BleScanMode::Background,
            report_delay_ms: IMMEDIATE_REPORT_DELAY_MS,
            rssi_threshold: RSSI_THRESHOLD_NONE,
            generic_filters: Vec::new(),
            broadcaster_filters: Vec::new(),
            status: RequestStatus::PendingRequest,
            cookie: 0,
        }
    }

    pub fn with_cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }

    /// Validates filter counts and per-filter well-formedness. Disable
    /// requests carry no filters and always pass.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.generic_filters.len() > MAX_GENERIC_FILTERS {
            return Err(RequestError::InvalidFilter {
                reason: "too many generic filters",
            });
        }
        if self.broadcaster_filters.len() > MAX_BROADCASTER_FILTERS {
            return Err(RequestError::InvalidFilter {
                reason: "too many broadcaster filters",
            });
        }
        for filter in &self.generic_filters {
            filter.validate()?;
        }
        Ok(())
    }

    fn push_filters_from(&mut self, other: &Self) {
        for filter in &other.generic_filters {
            if !self.generic_filters.contains(filter) {
                self.generic_filters.push(filter.clone());
            }
        }
        for filter in &other.broadcaster_filters {
            if !self.broadcaster_filters.contains(filter) {
                self.broadcaster_filters.push(*filter);
            }
        }
    }
}

impl MergeableRequest for BleScanRequest {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn status(&self) -> RequestStatus {
        self.status
    }

    fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
    }

    fn disabled() -> Self {
        Self::disable(InstanceId::SYSTEM)
    }

    /// Folds `other` into `self`, returning whether `self` changed. Only
    /// enabled requests contribute constraints.
    fn merge_with(&mut self, other: &Self) -> bool {
        if !other.enabled {
            return false;
        }
        if !self.enabled {
            // A disabled request imposes no constraints, so the first enabled
            // contributor is adopted wholesale.
            self.enabled = true;
            self.mode = other.mode;
            self.report_delay_ms = other.report_delay_ms;
            self.rssi_threshold = other.rssi_threshold;
            self.push_filters_from(other);
            return true;
        }
        let before_filters =
            self.generic_filters.len() + self.broadcaster_filters.len();
        let mut changed = false;
        if other.mode > self.mode {
            self.mode = other.mode;
            changed = true;
        }
        if other.report_delay_ms < self.report_delay_ms {
            self.report_delay_ms = other.report_delay_ms;
            changed = true;
        }
        if other.rssi_threshold < self.rssi_threshold {
            self.rssi_threshold = other.rssi_threshold;
            changed = true;
        }
        self.push_filters_from(other);
        changed
            || self.generic_filters.len() + self.broadcaster_filters.len()
                != before_filters
    }

    /// Whether two requests would drive the platform identically. Status and
    /// requester identity are ignored.
    fn is_equivalent_to(&self, other: &Self) -> bool {
        if !self.enabled && !other.enabled {
            return true;
        }
        self.enabled == other.enabled
            && self.mode == other.mode
            && self.report_delay_ms == other.report_delay_ms
            && self.rssi_threshold == other.rssi_threshold
            && same_filter_set(&self.generic_filters, &other.generic_filters)
            && same_filter_set(&self.broadcaster_filters, &other.broadcaster_filters)
    }
}

fn same_filter_set<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().all(|f| b.contains(f))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter(data: &[u8], mask: &[u8]) -> GenericFilter {
        GenericFilter::new(FilterType::ServiceData16, data, mask)
    }

    #[test]
    fn filter_rejects_bits_outside_mask() {
        assert!(filter(&[0xab, 0x01], &[0xff, 0xff]).validate().is_ok());
        assert!(filter(&[0xab, 0x01], &[0xff, 0x00]).validate().is_err());
    }

    #[test]
    fn filter_rejects_length_mismatch() {
        assert!(filter(&[0xab], &[0xff, 0xff]).validate().is_err());
        let long = vec![0u8; MAX_FILTER_DATA_LEN + 1];
        assert!(filter(&long, &long).validate().is_err());
    }

    #[test]
    fn request_rejects_too_many_filters() {
        let mut req = BleScanRequest::enable(
            InstanceId::new(1),
            BleScanMode::Background,
            0,
            RSSI_THRESHOLD_NONE,
            vec![filter(&[0x01], &[0xff]); MAX_GENERIC_FILTERS + 1],
            Vec::new(),
        );
        assert!(req.validate().is_err());
        req.generic_filters.truncate(MAX_GENERIC_FILTERS);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn merge_takes_strictest_constraints() {
        let mut merged = BleScanRequest::enable(
            InstanceId::new(1),
            BleScanMode::Background,
            5000,
            -40,
            vec![filter(&[0x01], &[0xff])],
            Vec::new(),
        );
        let other = BleScanRequest::enable(
            InstanceId::new(2),
            BleScanMode::Aggressive,
            0,
            -90,
            vec![filter(&[0x02], &[0xff])],
            Vec::new(),
        );
        assert!(merged.merge_with(&other));
        assert_eq!(merged.mode, BleScanMode::Aggressive);
        assert_eq!(merged.report_delay_ms, 0);
        assert_eq!(merged.rssi_threshold, -90);
        assert_eq!(merged.generic_filters.len(), 2);
    }

    #[test]
    fn merging_disabled_request_is_a_noop() {
        let mut merged = BleScanRequest::enable(
            InstanceId::new(1),
            BleScanMode::Foreground,
            100,
            -50,
            Vec::new(),
            Vec::new(),
        );
        let snapshot = merged.clone();
        assert!(!merged.merge_with(&BleScanRequest::disable(InstanceId::new(2))));
        assert!(merged.is_equivalent_to(&snapshot));
    }

    #[test]
    fn equivalence_ignores_requester_and_status() {
        let a = BleScanRequest::enable(
            InstanceId::new(1),
            BleScanMode::Foreground,
            100,
            -50,
            vec![filter(&[0x01], &[0xff])],
            Vec::new(),
        );
        let mut b = a.clone();
        b.instance_id = InstanceId::new(7);
        b.status = RequestStatus::Applied;
        assert!(a.is_equivalent_to(&b));
        b.mode = BleScanMode::Aggressive;
        assert!(!a.is_equivalent_to(&b));
    }

    #[test]
    fn disabled_requests_are_equivalent_regardless_of_params() {
        let mut a = BleScanRequest::disable(InstanceId::new(1));
        a.mode = BleScanMode::Aggressive;
        let b = BleScanRequest::disable(InstanceId::new(2));
        assert!(a.is_equivalent_to(&b));
    }

    fn arb_request() -> impl Strategy<Value = BleScanRequest> {
        (
            1u16..100,
            prop::bool::ANY,
            prop_oneof![
                Just(BleScanMode::Background),
                Just(BleScanMode::Foreground),
                Just(BleScanMode::Aggressive),
            ],
            0u32..10_000,
            -100i8..0,
            prop::collection::vec((0u8..=3, 0u8..=3), 0..3),
        )
            .prop_map(|(id, enabled, mode, delay, rssi, raw_filters)| {
                let filters = raw_filters
                    .into_iter()
                    .map(|(d, _)| filter(&[d], &[0xff]))
                    .collect();
                BleScanRequest {
                    instance_id: InstanceId::new(id),
                    enabled,
                    mode,
                    report_delay_ms: delay,
                    rssi_threshold: rssi,
                    generic_filters: filters,
                    broadcaster_filters: Vec::new(),
                    status: RequestStatus::PendingRequest,
                    cookie: 0,
                }
            })
    }

    proptest! {
        /// The merged request is always at least as strict as each input.
        #[test]
        fn merge_is_monotonic(a in arb_request(), b in arb_request()) {
            let mut merged = a.clone();
            merged.merge_with(&b);
            if b.enabled {
                prop_assert!(merged.mode >= b.mode);
                prop_assert!(merged.report_delay_ms <= b.report_delay_ms);
                prop_assert!(merged.rssi_threshold <= b.rssi_threshold);
                for f in &b.generic_filters {
                    prop_assert!(merged.generic_filters.contains(f));
                }
            }
            if a.enabled {
                prop_assert!(merged.mode >= a.mode);
                prop_assert!(merged.report_delay_ms <= a.report_delay_ms);
                prop_assert!(merged.rssi_threshold <= a.rssi_threshold);
            }
        }

        /// Merging the same request twice changes nothing the second time.
        #[test]
        fn merge_is_idempotent(a in arb_request(), b in arb_request()) {
            let mut merged = a.clone();
            merged.merge_with(&b);
            let once = merged.clone();
            prop_assert!(!merged.merge_with(&b));
            prop_assert!(merged.is_equivalent_to(&once));
        }
    }
}
