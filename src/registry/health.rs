//! Per-instance health tracking
//!
//! Tracks for each module instance:
//! - Success/failure counts
//! - Consecutive failures against the unhealthy threshold
//! - Last success/failure timestamps and last probe latency
//! - Overall health state (`unknown` until the first probe)

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Health of an instance or module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not probed yet
    Unknown,
    /// Last probe succeeded
    Healthy,
    /// Failed at least `unhealthy_threshold` probes in a row
    Unhealthy,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Healthy,
            2 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Unhealthy => 2,
        }
    }
}

fn now_millis() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Instance health tracker
#[derive(Debug)]
pub struct HealthTracker {
    /// Label used in logs (`module@address`)
    name: String,
    /// Consecutive failures that flip the state to unhealthy
    threshold: u32,
    state: AtomicU8,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU32,
    /// Millis since epoch
    last_success: AtomicU64,
    /// Millis since epoch
    last_failure: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl HealthTracker {
    /// Create a tracker in the `unknown` state
    #[must_use]
    pub fn new(name: &str, threshold: u32) -> Self {
        Self {
            name: name.to_string(),
            threshold: threshold.max(1),
            state: AtomicU8::new(HealthState::Unknown.as_u8()),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_success: AtomicU64::new(0),
            last_failure: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
        }
    }

    /// Record a successful probe
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success.store(now_millis(), Ordering::Relaxed);
        self.last_latency_ms.store(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        let previous = self.state.swap(HealthState::Healthy.as_u8(), Ordering::AcqRel);
        match HealthState::from_u8(previous) {
            HealthState::Unhealthy => info!(instance = %self.name, "Instance recovered"),
            HealthState::Unknown => debug!(instance = %self.name, "Instance healthy"),
            HealthState::Healthy => {}
        }
    }

    /// Record a failed probe; returns the consecutive failure count
    pub fn record_failure(&self) -> u32 {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure.store(now_millis(), Ordering::Relaxed);

        if consecutive >= self.threshold {
            let previous = self
                .state
                .swap(HealthState::Unhealthy.as_u8(), Ordering::AcqRel);
            if HealthState::from_u8(previous) != HealthState::Unhealthy {
                warn!(
                    instance = %self.name,
                    consecutive_failures = consecutive,
                    "Instance marked unhealthy"
                );
            }
        }
        consecutive
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Failures since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Current metrics
    #[must_use]
    pub fn metrics(&self) -> HealthMetrics {
        HealthMetrics {
            state: self.state(),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            last_success_ms: self.last_success.load(Ordering::Relaxed),
            last_failure_ms: self.last_failure.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Health metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Current state
    pub state: HealthState,
    /// Total successful probes
    pub success_count: u64,
    /// Total failed probes
    pub failure_count: u64,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Last success timestamp (millis since epoch)
    pub last_success_ms: u64,
    /// Last failure timestamp (millis since epoch)
    pub last_failure_ms: u64,
    /// Latency of the last successful probe
    pub last_latency_ms: u64,
}
