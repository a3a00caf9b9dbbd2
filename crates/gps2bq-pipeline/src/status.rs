// Read-only views for the HTTP surface.

use serde::Serialize;

use gps2bq_spool::SpoolStats;

use crate::hybrid::{Phase, RollbackEvent};
use crate::ledger::LedgerSummary;

/// Everything the snapshot endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub phase: Phase,
    pub cooldown_active: bool,
    pub ledger: LedgerSummary,
    pub spool: SpoolStats,
    pub rollback_history: Vec<RollbackEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl Health {
    /// The aggregate is the worst component status, tightened by the
    /// recent cycle success rate.
    pub fn aggregate(components: Vec<ComponentHealth>, success_rate: f64) -> Self {
        let mut status = components
            .iter()
            .map(|c| c.status)
            .max_by_key(|s| match s {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            })
            .unwrap_or(HealthStatus::Healthy);

        if success_rate < 0.5 {
            status = HealthStatus::Unhealthy;
        } else if success_rate < 0.9 && status == HealthStatus::Healthy {
            status = HealthStatus::Degraded;
        }

        Self {
            healthy: status == HealthStatus::Healthy,
            status,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(status: HealthStatus) -> ComponentHealth {
        ComponentHealth {
            name: "redis",
            status,
            detail: String::new(),
        }
    }

    #[test]
    fn test_aggregate_takes_worst_component() {
        let health = Health::aggregate(
            vec![component(HealthStatus::Healthy), component(HealthStatus::Degraded)],
            1.0,
        );
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.healthy);
    }

    #[test]
    fn test_success_rate_tightens_aggregate() {
        let health = Health::aggregate(vec![component(HealthStatus::Healthy)], 0.8);
        assert_eq!(health.status, HealthStatus::Degraded);

        let health = Health::aggregate(vec![component(HealthStatus::Healthy)], 0.2);
        assert_eq!(health.status, HealthStatus::Unhealthy);

        let health = Health::aggregate(vec![component(HealthStatus::Healthy)], 1.0);
        assert!(health.healthy);
    }
}
