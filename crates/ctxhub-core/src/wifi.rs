//! WiFi request model
//!
//! Scan monitoring is an on/off resource, so its multiplexed request carries
//! only the enabled flag. On-demand scans are one-shot and queue in the
//! manager rather than merging.

use smallvec::SmallVec;

use crate::ble::RequestStatus;
use crate::errors::RequestError;
use crate::multiplexer::MergeableRequest;
use crate::types::InstanceId;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum SSIDs in one on-demand scan request.
pub const MAX_SCAN_SSIDS: usize = 10;

/// Maximum frequencies in one on-demand scan request.
pub const MAX_SCAN_FREQUENCIES: usize = 20;

/// Maximum SSID length in bytes.
pub const MAX_SSID_LEN: usize = 32;

// ----------------------------------------------------------------------------
// Scan Monitor Request
// ----------------------------------------------------------------------------

/// One nanoapp's scan-monitor subscription. Merging is a plain OR over the
/// enabled flags.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanMonitorRequest {
    pub instance_id: InstanceId,
    pub enabled: bool,
    pub status: RequestStatus,
}

impl ScanMonitorRequest {
    pub fn new(instance_id: InstanceId, enabled: bool) -> Self {
        Self {
            instance_id,
            enabled,
            status: RequestStatus::PendingRequest,
        }
    }
}

impl MergeableRequest for ScanMonitorRequest {
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
        Self::new(InstanceId::SYSTEM, false)
    }

    fn merge_with(&mut self, other: &Self) -> bool {
        let changed = other.enabled && !self.enabled;
        self.enabled |= other.enabled;
        changed
    }

    fn is_equivalent_to(&self, other: &Self) -> bool {
        self.enabled == other.enabled
    }
}

// ----------------------------------------------------------------------------
// On-Demand Scan
// ----------------------------------------------------------------------------

/// How thoroughly an on-demand scan probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WifiScanType {
    Active,
    PassiveOnly,
    ActivePlusPassiveDfs,
    /// Let the platform pick, preferring cached results when fresh enough.
    NoPreference,
}

/// Parameters for a one-shot scan.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WifiScanParams {
    pub scan_type: WifiScanType,
    /// Cached results younger than this satisfy the request without a fresh
    /// scan. Zero forces a fresh scan.
    pub max_scan_age_ms: u32,
    pub frequencies_mhz: SmallVec<[u32; 8]>,
    pub ssids: Vec<SmallVec<[u8; MAX_SSID_LEN]>>,
}

impl Default for WifiScanParams {
    fn default() -> Self {
        Self {
            scan_type: WifiScanType::NoPreference,
            max_scan_age_ms: 5000,
            frequencies_mhz: SmallVec::new(),
            ssids: Vec::new(),
        }
    }
}

impl WifiScanParams {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.ssids.len() > MAX_SCAN_SSIDS {
            return Err(RequestError::InvalidFilter {
                reason: "too many scan ssids",
            });
        }
        if self.frequencies_mhz.len() > MAX_SCAN_FREQUENCIES {
            return Err(RequestError::InvalidFilter {
                reason: "too many scan frequencies",
            });
        }
        if self.ssids.iter().any(|s| s.is_empty() || s.len() > MAX_SSID_LEN) {
            return Err(RequestError::InvalidFilter {
                reason: "ssid empty or too long",
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
