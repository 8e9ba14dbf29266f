//! Storage health reporting
//!
//! [`StorageHealth`] is the "storage degraded" signal: it combines the
//! outcome and latency of a `RETURN 1` probe with the circuit breaker state.

use crate::circuit_breaker::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Response time above which a successful probe reports `Degraded`
pub const DEFAULT_DEGRADED_THRESHOLD: Duration = Duration::from_millis(1000);

/// Health status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Database is healthy and responsive
    Healthy,
    /// Database answers, but slowly or with the circuit not fully closed
    Degraded,
    /// Database is not responsive or erroring
    Unhealthy,
}

impl HealthStatus {
    /// Convert to HTTP status code equivalent
    pub fn to_http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }

    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Storage health report
#[derive(Debug, Clone, Serialize)]
pub struct StorageHealth {
    /// Overall health status
    pub status: HealthStatus,
    /// Probe round-trip in milliseconds
    pub response_time_ms: u64,
    /// Breaker state after the probe
    pub circuit_state: CircuitState,
    /// Error message (if unhealthy)
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StorageHealth {
    /// Report for a probe that succeeded.
    pub fn healthy(
        response_time: Duration,
        circuit_state: CircuitState,
        degraded_threshold: Duration,
    ) -> Self {
        let status = if response_time > degraded_threshold || circuit_state != CircuitState::Closed
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            response_time_ms: response_time.as_millis() as u64,
            circuit_state,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Report for a probe that failed.
    pub fn unhealthy(response_time: Duration, circuit_state: CircuitState, error: &str) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: response_time.as_millis() as u64,
            circuit_state,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.status != HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_http_codes() {
        assert_eq!(HealthStatus::Healthy.to_http_status_code(), 200);
        assert_eq!(HealthStatus::Degraded.to_http_status_code(), 200);
        assert_eq!(HealthStatus::Unhealthy.to_http_status_code(), 503);
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
    }

    #[test]
    fn test_slow_probe_is_degraded() {
        let fast = StorageHealth::healthy(
            Duration::from_millis(5),
            CircuitState::Closed,
            DEFAULT_DEGRADED_THRESHOLD,
        );
        assert_eq!(fast.status, HealthStatus::Healthy);
        assert!(!fast.is_degraded());

        let slow = StorageHealth::healthy(
            Duration::from_millis(1500),
            CircuitState::Closed,
            DEFAULT_DEGRADED_THRESHOLD,
        );
        assert_eq!(slow.status, HealthStatus::Degraded);
        assert_eq!(slow.response_time_ms, 1500);
    }

    #[test]
    fn test_unhealthy_carries_error() {
        let report = StorageHealth::unhealthy(
            Duration::from_millis(3),
            CircuitState::Open,
            "Circuit breaker open",
        );
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.error.as_deref(), Some("Circuit breaker open"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["circuit_state"], "OPEN");
    }
}
