//! Reconciliation loop primitives.
//!
//! Every background worker in the control plane follows the same shape:
//! acquire a lease, run one pass that re-reads the datastore and attempts
//! one idempotent step per entity, record what failed, try again next tick.
//! This crate holds the pieces of that shape that do not touch a datastore:
//!
//! - **Lease timing**: the relationship between renewal interval and lease
//!   duration that makes failover both safe and quick.
//! - **In-flight guard**: the per-replica flag that keeps two passes of the
//!   same worker kind from overlapping.
//! - **Pass errors**: the list of independent step failures a pass returns
//!   instead of a single fatal error.
//! - **Spec hashing**: content hashes of desired manifests, used to detect
//!   drift without comparing whole documents.
//! - **Clock**: wall-clock access that tests can drive by hand.
//!
//! # Invariants
//!
//! - A pass never gives up on an entity; failures are retried next tick.
//! - Decisions are deterministic given the same datastore contents.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Lease duration is not a small multiple of the renewal interval.
    #[error(
        "lease duration {lease_duration:?} must be between {min}x and {max}x the renewal interval {renew_interval:?}"
    )]
    InvalidLeaseTiming {
        renew_interval: Duration,
        lease_duration: Duration,
        min: u32,
        max: u32,
    },

    /// Renewal interval of zero would spin.
    #[error("renewal interval must be non-zero")]
    ZeroInterval,
}

// =============================================================================
// Lease timing
// =============================================================================

/// Smallest allowed lease duration, in renewal intervals.
pub const MIN_LEASE_MULTIPLE: u32 = 3;

/// Largest allowed lease duration, in renewal intervals.
pub const MAX_LEASE_MULTIPLE: u32 = 6;

/// Default reconciliation (and lease renewal) interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(120);

/// Renewal cadence and lease lifetime for one worker kind.
///
/// A holder that misses a couple of ticks keeps its lease; a crashed holder
/// loses it within [`LeaseTiming::handover_bound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    pub renew_interval: Duration,
    pub lease_duration: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            renew_interval: DEFAULT_RECONCILE_INTERVAL,
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }
}

impl LeaseTiming {
    /// Create and validate a timing pair.
    pub fn new(renew_interval: Duration, lease_duration: Duration) -> Result<Self, ReconcileError> {
        let timing = Self {
            renew_interval,
            lease_duration,
        };
        timing.validate()?;
        Ok(timing)
    }

    /// Check that the lease outlives [`MIN_LEASE_MULTIPLE`] renewals and no
    /// more than [`MAX_LEASE_MULTIPLE`].
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.renew_interval.is_zero() {
            return Err(ReconcileError::ZeroInterval);
        }

        let min = self.renew_interval * MIN_LEASE_MULTIPLE;
        let max = self.renew_interval * MAX_LEASE_MULTIPLE;
        if self.lease_duration < min || self.lease_duration > max {
            return Err(ReconcileError::InvalidLeaseTiming {
                renew_interval: self.renew_interval,
                lease_duration: self.lease_duration,
                min: MIN_LEASE_MULTIPLE,
                max: MAX_LEASE_MULTIPLE,
            });
        }
        Ok(())
    }

    /// Latest point after the last renewal by which another replica holds
    /// the lease, if the old holder stopped renewing.
    pub fn handover_bound(&self) -> Duration {
        self.lease_duration + self.renew_interval
    }
}

// =============================================================================
// In-flight guard
// =============================================================================

/// Process-local "a pass is running" flag for one worker kind.
///
/// Cloning shares the flag. [`InFlight::try_begin`] is the only way to set
/// it, and the returned guard clears it on drop, so a panicking pass still
/// releases the flag.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicBool>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag. Returns `None` if a pass is already running.
    pub fn try_begin(&self) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(Arc::clone(&self.0)))
    }

    /// True while a guard is alive.
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the in-flight flag when dropped.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Pass errors
// =============================================================================

/// One failed step inside a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Sub-task name, e.g. `"accepted_clusters"`.
    pub step: &'static str,
    /// Entity the step was working on, when there was one.
    pub subject: Option<String>,
    pub message: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{} [{}]: {}", self.step, subject, self.message),
            None => write!(f, "{}: {}", self.step, self.message),
        }
    }
}

/// Independent step failures collected over a pass.
///
/// A pass returns this instead of `Result`: one failing entity never stops
/// the pass from attempting the others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassErrors {
    failures: Vec<StepFailure>,
}

impl PassErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for a step.
    pub fn push(&mut self, step: &'static str, subject: Option<String>, error: impl fmt::Display) {
        self.failures.push(StepFailure {
            step,
            subject,
            message: error.to_string(),
        });
    }

    /// Record the error of `result`, if any, and return the success value.
    pub fn record<T, E: fmt::Display>(
        &mut self,
        step: &'static str,
        subject: Option<String>,
        result: Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(step, subject, e);
                None
            }
        }
    }

    /// Append failures from another pass or sub-task.
    pub fn extend(&mut self, other: PassErrors) {
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepFailure> {
        self.failures.iter()
    }

    /// True if any failure was recorded for `step`.
    pub fn has_step(&self, step: &str) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }
}

impl IntoIterator for PassErrors {
    type Item = StepFailure;
    type IntoIter = std::vec::IntoIter<StepFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

// =============================================================================
// Spec hashing
// =============================================================================

/// A content hash for deterministic comparison.
///
/// Used to detect when a desired manifest differs from the one last applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Wrap a previously stored hash string.
    pub fn from_stored(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Source of "now" for anything that compares against stored timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": null}});
        let json2 = serde_json::json!({"a": {"x": null, "y": [1, 2]}, "b": 2});

        assert_eq!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
    }

    #[test]
    fn test_spec_hash_detects_change() {
        let before = serde_json::json!({"namespace": "kfm-observability"});
        let after = serde_json::json!({"namespace": "kfm-monitoring"});
        assert_ne!(SpecHash::from_json(&before), SpecHash::from_json(&after));
        assert!(SpecHash::from_json(&before).as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_lease_timing_bounds() {
        let secs = Duration::from_secs;
        assert!(LeaseTiming::new(secs(30), secs(90)).is_ok());
        assert!(LeaseTiming::new(secs(30), secs(180)).is_ok());
        assert!(matches!(
            LeaseTiming::new(secs(30), secs(60)),
            Err(ReconcileError::InvalidLeaseTiming { .. })
        ));
        assert!(matches!(
            LeaseTiming::new(secs(30), secs(181)),
            Err(ReconcileError::InvalidLeaseTiming { .. })
        ));
        assert_eq!(
            LeaseTiming::new(Duration::ZERO, secs(1)),
            Err(ReconcileError::ZeroInterval)
        );
        assert!(LeaseTiming::default().validate().is_ok());
    }

    #[test]
    fn test_handover_bound() {
        let timing = LeaseTiming::new(Duration::from_secs(5), Duration::from_secs(20)).unwrap();
        assert_eq!(timing.handover_bound(), Duration::from_secs(25));
    }

    #[test]
    fn test_in_flight_refuses_second_claim() {
        let flag = InFlight::new();
        let guard = flag.try_begin().expect("first claim");
        assert!(flag.is_active());
        assert!(flag.clone().try_begin().is_none());

        drop(guard);
        assert!(!flag.is_active());
        assert!(flag.try_begin().is_some());
    }

    #[test]
    fn test_pass_errors_record() {
        let mut errors = PassErrors::new();
        let ok: Option<u32> = errors.record("step_a", None, Ok::<_, String>(7));
        assert_eq!(ok, Some(7));
        let failed: Option<u32> =
            errors.record("step_b", Some("cl_1".into()), Err::<u32, _>("boom"));
        assert_eq!(failed, None);

        assert_eq!(errors.len(), 1);
        assert!(errors.has_step("step_b"));
        let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["step_b [cl_1]: boom".to_string()]);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::default();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }
}
