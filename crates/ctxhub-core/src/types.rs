//! Core identifier and time types for the ctxhub runtime
//!
//! This module defines the fundamental types used throughout the runtime,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Nanoapp Instance Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a loaded nanoapp instance, assigned at load time.
///
/// Two identifiers are reserved: [`InstanceId::SYSTEM`] denotes the framework
/// itself (events sent on behalf of the runtime carry it as their sender) and
/// [`InstanceId::BROADCAST`] is the wildcard delivery target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(u16);

impl InstanceId {
    /// The framework pseudo-instance.
    pub const SYSTEM: Self = Self(0);

    /// Delivery target meaning "every registered nanoapp".
    pub const BROADCAST: Self = Self(u16::MAX);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Nanoapp Application Identifier
// ----------------------------------------------------------------------------

/// Stable 64-bit application identifier, unique per nanoapp binary.
///
/// Unlike [`InstanceId`], an `AppId` survives unload/reload cycles and is the
/// identifier the host uses to address a nanoapp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(u64);

impl AppId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Host Endpoint
// ----------------------------------------------------------------------------

/// Identifier of a host-side client endpoint for message routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEndpoint(u16);

impl HostEndpoint {
    /// No endpoint specified; not a valid message destination.
    pub const UNSPECIFIED: Self = Self(0xFFFF);

    /// Broadcast to all host clients. Reliable messages may not use this.
    pub const BROADCAST: Self = Self(0xFFFE);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    pub fn is_unspecified(self) -> bool {
        self == Self::UNSPECIFIED
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timer Handle
// ----------------------------------------------------------------------------

/// Handle identifying an outstanding timer in the timer pool.
///
/// Canceling a handle that already fired is a tolerated no-op; holders must
/// treat "handle not found" as benign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle(u32);

impl TimerHandle {
    /// Sentinel for "no timer outstanding".
    pub const INVALID: Self = Self(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Monotonic timestamp in nanoseconds since an arbitrary origin.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Saturating difference, as a `Duration`.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, dur: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(dur.as_nanos() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        self.duration_since(other)
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Abstraction over the monotonic clock.
///
/// Production code uses [`SystemTimeSource`]; tests substitute
/// [`ManualTimeSource`] for deterministic scheduling.
pub trait TimeSource {
    /// Get the current monotonic timestamp.
    fn now(&self) -> Timestamp;
}

/// Standard library implementation of [`TimeSource`], anchored to process
/// start so timestamps stay small and comparable.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    origin: std::time::Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.origin.elapsed().as_nanos() as u64)
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying time, so a test can hold one handle while
/// the component under test holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    current: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `dur`.
    pub fn advance(&self, dur: Duration) {
        self.current
            .fetch_add(dur.as_nanos() as u64, std::sync::atomic::Ordering::SeqCst);
    }

    /// Jump the clock to an absolute timestamp.
    pub fn set(&self, ts: Timestamp) {
        self.current
            .store(ts.as_nanos(), std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.current.load(std::sync::atomic::Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_sentinels() {
        assert!(InstanceId::SYSTEM.is_system());
        assert!(InstanceId::BROADCAST.is_broadcast());
        assert!(!InstanceId::new(7).is_system());
        assert!(!InstanceId::new(7).is_broadcast());
    }

    #[test]
    fn timestamp_arithmetic() {
        let a = Timestamp::from_nanos(1_000);
        let b = a + Duration::from_nanos(500);
        assert_eq!(b.as_nanos(), 1_500);
        assert_eq!(b - a, Duration::from_nanos(500));
        // Saturating on underflow.
        assert_eq!(a - b, Duration::ZERO);
    }

    #[test]
    fn manual_time_source_is_shared_across_clones() {
        let ts = ManualTimeSource::new();
        let other = ts.clone();
        ts.advance(Duration::from_millis(5));
        assert_eq!(other.now().as_millis(), 5);
    }
}
