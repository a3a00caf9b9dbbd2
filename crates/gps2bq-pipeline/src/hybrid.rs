// Hybrid controller: flow selection, comparison and automatic rollback.
//
// The controller supervises the cutover from the legacy direct path
// (Redis → warehouse streaming inserts) to the staged path (Redis →
// object store → warehouse load jobs). Only one flow may mutate real
// destinations in a cycle; in hybrid phase the new flow dry-runs
// against scratch destinations and produces statistics only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gps2bq_config::RollbackConfig;
use gps2bq_core::{
    AlertEvent, AlertKind, AlertSink, CycleOutcome, DrainAllResult, LeaseGuard, LeaseLock,
    QueueSource, StreamType,
};

use crate::cycle::Pipeline;
use crate::ledger::{ComparisonRecord, Ledger};
use crate::legacy::LegacyFlow;
use crate::recovery::{RecoveryReport, RecoverySweeper};

/// Rate trigger needs a few samples before it is meaningful; the
/// consecutive-failure trigger covers the cold start.
const MIN_RATE_SAMPLES: usize = 10;
const MIN_PERF_SAMPLES: usize = 5;
const ROLLBACK_HISTORY: usize = 50;

/// Closed enumeration of cutover phases, ordered legacy → new.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Legacy,
    Hybrid,
    Migration,
    New,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Hybrid => "hybrid",
            Self::Migration => "migration",
            Self::New => "new",
        }
    }

    /// Position on the cutover ladder.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::Hybrid => 1,
            Self::Migration => 2,
            Self::New => 3,
        }
    }

    /// Rollback demotes exactly one step: new → hybrid → legacy.
    pub fn demoted(&self) -> Phase {
        match self {
            Self::New | Self::Migration => Self::Hybrid,
            Self::Hybrid | Self::Legacy => Self::Legacy,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "hybrid" => Ok(Self::Hybrid),
            "migration" => Ok(Self::Migration),
            "new" => Ok(Self::New),
            other => Err(format!("unknown phase: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case", tag = "trigger", content = "value")]
pub enum RollbackTrigger {
    ConsecutiveFailures(u32),
    ErrorRate(f64),
    PerfRatio(f64),
}

/// Immutable record of one automatic demotion.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackEvent {
    pub at: chrono::DateTime<Utc>,
    pub from: Phase,
    pub to: Phase,
    pub trigger: RollbackTrigger,
}

#[derive(Debug, Error)]
pub enum PhaseChangeError {
    #[error("cooldown active for {remaining_secs}s more; refusing to advance toward new")]
    CooldownActive { remaining_secs: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Execution {
    success: bool,
    ms: u64,
}

#[derive(Debug, Default)]
struct FlowWindow {
    executions: VecDeque<Execution>,
    cap: usize,
}

impl FlowWindow {
    fn new(cap: usize) -> Self {
        Self {
            executions: VecDeque::new(),
            cap,
        }
    }

    fn push(&mut self, success: bool, ms: u64) {
        if self.executions.len() >= self.cap {
            self.executions.pop_front();
        }
        self.executions.push_back(Execution { success, ms });
    }

    fn len(&self) -> usize {
        self.executions.len()
    }

    fn failure_rate(&self) -> f64 {
        if self.executions.is_empty() {
            return 0.0;
        }
        let failed = self.executions.iter().filter(|e| !e.success).count();
        failed as f64 / self.executions.len() as f64
    }

    fn mean_ms(&self) -> Option<f64> {
        if self.executions.is_empty() {
            return None;
        }
        let total: u64 = self.executions.iter().map(|e| e.ms).sum();
        Some(total as f64 / self.executions.len() as f64)
    }
}

pub(crate) struct ControllerState {
    phase: Phase,
    cooldown_until: Option<Instant>,
    consecutive_new_failures: u32,
    new_window: FlowWindow,
    legacy_window: FlowWindow,
    history: VecDeque<RollbackEvent>,
}

impl ControllerState {
    fn new(phase: Phase, window: usize) -> Self {
        Self {
            phase,
            cooldown_until: None,
            consecutive_new_failures: 0,
            new_window: FlowWindow::new(window),
            legacy_window: FlowWindow::new(window),
            history: VecDeque::new(),
        }
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn cooldown_remaining(&self) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    fn observe_new(&mut self, success: bool, ms: u64) {
        if success {
            self.consecutive_new_failures = 0;
        } else {
            self.consecutive_new_failures += 1;
        }
        self.new_window.push(success, ms);
    }

    fn observe_legacy(&mut self, success: bool, ms: u64) {
        self.legacy_window.push(success, ms);
    }

    fn check_triggers(&self, config: &RollbackConfig) -> Option<RollbackTrigger> {
        if self.consecutive_new_failures >= config.consecutive_failures {
            return Some(RollbackTrigger::ConsecutiveFailures(
                self.consecutive_new_failures,
            ));
        }

        if self.new_window.len() >= MIN_RATE_SAMPLES {
            let rate = self.new_window.failure_rate();
            if rate > config.error_rate {
                return Some(RollbackTrigger::ErrorRate(rate));
            }
        }

        if self.new_window.len() >= MIN_PERF_SAMPLES && self.legacy_window.len() >= MIN_PERF_SAMPLES
        {
            if let (Some(new_ms), Some(legacy_ms)) =
                (self.new_window.mean_ms(), self.legacy_window.mean_ms())
            {
                if legacy_ms > 0.0 && new_ms > legacy_ms * config.perf_ratio {
                    return Some(RollbackTrigger::PerfRatio(new_ms / legacy_ms));
                }
            }
        }

        None
    }
}

pub struct HybridController {
    /// The staged path against real destinations.
    new_flow: Arc<Pipeline>,
    /// The staged path against scratch destinations, for hybrid
    /// comparison cycles. Never mutates real state.
    scratch_flow: Option<Arc<Pipeline>>,
    legacy: LegacyFlow,
    sweeper: RecoverySweeper,
    source: Arc<dyn QueueSource>,
    lock: Arc<dyn LeaseLock>,
    ledger: Arc<Ledger>,
    alerts: Arc<dyn AlertSink>,
    rollback: RollbackConfig,
    state: Mutex<ControllerState>,
    cycle_active: AtomicBool,
}

impl HybridController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        new_flow: Arc<Pipeline>,
        scratch_flow: Option<Arc<Pipeline>>,
        legacy: LegacyFlow,
        sweeper: RecoverySweeper,
        source: Arc<dyn QueueSource>,
        lock: Arc<dyn LeaseLock>,
        ledger: Arc<Ledger>,
        alerts: Arc<dyn AlertSink>,
        rollback: RollbackConfig,
        initial_phase: Phase,
    ) -> Self {
        let window = rollback.window;
        Self {
            new_flow,
            scratch_flow,
            legacy,
            sweeper,
            source,
            lock,
            ledger,
            alerts,
            rollback,
            state: Mutex::new(ControllerState::new(initial_phase, window)),
            cycle_active: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn in_cooldown(&self) -> bool {
        self.state.lock().in_cooldown()
    }

    pub fn rollback_history(&self) -> Vec<RollbackEvent> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn new_flow(&self) -> &Arc<Pipeline> {
        &self.new_flow
    }

    /// Operator phase change. Moves toward `new` are refused while the
    /// rollback cooldown runs; demotions are always allowed.
    pub fn set_phase(&self, target: Phase) -> Result<Phase, PhaseChangeError> {
        let mut state = self.state.lock();
        if target.rank() > state.phase.rank() && state.in_cooldown() {
            return Err(PhaseChangeError::CooldownActive {
                remaining_secs: state.cooldown_remaining().as_secs(),
            });
        }
        let from = state.phase;
        state.phase = target;
        info!(from = from.as_str(), to = target.as_str(), "phase changed by operator");
        Ok(target)
    }

    pub async fn run_recovery(&self) -> RecoveryReport {
        self.sweeper.run().await
    }

    /// Run one cycle through whichever flows the phase selects.
    pub async fn run_cycle(&self, token: &CancellationToken) -> CycleOutcome {
        let phase = self.phase();
        counter!("gps2bq.controller_cycles", 1, "phase" => phase.as_str());

        let outcome = match phase {
            Phase::New => {
                let outcome = self.new_flow.run_cycle(token).await;
                self.observe_new(&outcome);
                outcome
            }
            Phase::Legacy | Phase::Hybrid | Phase::Migration => {
                self.run_supervised_cycle(token, phase).await
            }
        };

        self.maybe_rollback();
        outcome
    }

    /// Controller-driven cycle: the controller owns the lock and the
    /// single atomic drain, then hands the drained batch to the flows.
    async fn run_supervised_cycle(&self, token: &CancellationToken, phase: Phase) -> CycleOutcome {
        let started_at = Utc::now();

        if self.cycle_active.swap(true, Ordering::SeqCst) {
            let outcome = CycleOutcome::skipped("busy", started_at);
            self.ledger.record_cycle(&outcome);
            return outcome;
        }
        let _active = ResetFlag(&self.cycle_active);

        let guard = match self.lock.acquire().await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                let outcome = CycleOutcome::skipped("busy", started_at);
                self.ledger.record_cycle(&outcome);
                return outcome;
            }
            Err(e) => {
                let outcome = CycleOutcome::skipped(e.kind().as_str(), started_at);
                self.ledger.record_cycle(&outcome);
                return outcome;
            }
        };

        let drained = self.source.drain_all().await;
        let outcome = match phase {
            Phase::Legacy => {
                let outcome = self.legacy.run(token, Some(guard.as_ref()), &drained).await;
                self.observe_legacy(&outcome);
                outcome
            }
            Phase::Migration => self.run_migration(token, guard.as_ref(), &drained).await,
            Phase::Hybrid => self.run_comparison(token, guard.as_ref(), &drained).await,
            Phase::New => unreachable!("new phase never reaches the supervised cycle"),
        };

        guard.release().await;
        self.ledger.record_cycle(&outcome);
        outcome
    }

    /// Migration: the new flow is primary; the legacy direct path runs
    /// only as a fallback, and only for streams whose records the new
    /// flow failed to secure anywhere durable.
    async fn run_migration(
        &self,
        token: &CancellationToken,
        guard: &dyn LeaseGuard,
        drained: &DrainAllResult,
    ) -> CycleOutcome {
        let mut outcome = self
            .new_flow
            .process_drained(token, Some(guard), drained)
            .await;
        self.observe_new(&outcome);

        if outcome.success {
            return outcome;
        }

        let unsecured: Vec<StreamType> = outcome
            .per_type
            .iter()
            .filter(|t| {
                !t.succeeded()
                    && !t.backup_created
                    && t.records_loaded == 0
                    && t.staged_key.is_none()
                    && t.records_processed > 0
            })
            .map(|t| t.stream)
            .collect();

        if unsecured.is_empty() {
            return outcome;
        }

        warn!(
            streams = ?unsecured,
            "new flow left records unsecured; legacy fallback engaging"
        );
        let fallback = self.legacy.fallback(token, Some(guard), drained, &unsecured).await;
        for result in fallback {
            // Replace the failed per-type entry with the fallback's.
            outcome.per_type.retain(|t| t.stream != result.stream);
            outcome.per_type.push(result);
        }
        outcome.success = outcome.per_type.iter().all(|t| t.succeeded());
        if outcome.success {
            outcome.reason = Some("legacy_fallback".to_string());
        }
        outcome
    }

    /// Hybrid: legacy is primary and destructive; the new flow dry-runs
    /// against scratch destinations on the same drained batch, and the
    /// two are compared.
    async fn run_comparison(
        &self,
        token: &CancellationToken,
        guard: &dyn LeaseGuard,
        drained: &DrainAllResult,
    ) -> CycleOutcome {
        let legacy_timer = Instant::now();
        let legacy_outcome = self.legacy.run(token, Some(guard), drained).await;
        let legacy_ms = legacy_timer.elapsed().as_millis() as u64;
        self.observe_legacy(&legacy_outcome);

        if self.new_flow_enabled() {
            if let Some(scratch) = &self.scratch_flow {
                let new_timer = Instant::now();
                let new_outcome = scratch.process_drained(token, Some(guard), drained).await;
                let new_ms = new_timer.elapsed().as_millis() as u64;
                self.observe_new(&new_outcome);

                let new_records = new_outcome.records_loaded();
                let legacy_records = legacy_outcome.records_loaded();
                let difference = new_records.abs_diff(legacy_records);
                let consistent = difference <= self.rollback.record_tolerance
                    && new_outcome.success == legacy_outcome.success;

                if !consistent {
                    warn!(
                        new_records,
                        legacy_records,
                        new_success = new_outcome.success,
                        legacy_success = legacy_outcome.success,
                        "hybrid comparison discrepancy recorded for review"
                    );
                }
                self.ledger.record_comparison(ComparisonRecord {
                    at: Utc::now(),
                    new_success: new_outcome.success,
                    legacy_success: legacy_outcome.success,
                    new_records,
                    legacy_records,
                    new_ms,
                    legacy_ms,
                    consistent,
                });
            }
        }

        legacy_outcome
    }

    /// Whether the new flow may run at all (hybrid secondary).
    fn new_flow_enabled(&self) -> bool {
        !self.state.lock().in_cooldown()
    }

    fn observe_new(&self, outcome: &CycleOutcome) {
        if outcome.reason.as_deref() == Some("busy") {
            return;
        }
        self.state
            .lock()
            .observe_new(outcome.success, outcome.processing_ms);
    }

    fn observe_legacy(&self, outcome: &CycleOutcome) {
        if outcome.reason.as_deref() == Some("busy") {
            return;
        }
        self.state
            .lock()
            .observe_legacy(outcome.success, outcome.processing_ms);
    }

    /// Demote one step when a rollback trigger fires. No rollback is
    /// considered during cooldown.
    fn maybe_rollback(&self) {
        let event = {
            let mut state = self.state.lock();
            if state.in_cooldown() {
                return;
            }
            let trigger = match state.check_triggers(&self.rollback) {
                Some(trigger) => trigger,
                None => return,
            };
            let from = state.phase;
            let to = from.demoted();
            if to == from {
                return;
            }

            state.phase = to;
            state.cooldown_until = Some(Instant::now() + self.rollback.cooldown());
            state.consecutive_new_failures = 0;

            let event = RollbackEvent {
                at: Utc::now(),
                from,
                to,
                trigger,
            };
            if state.history.len() >= ROLLBACK_HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
            event
        };

        counter!("gps2bq.rollbacks", 1);
        warn!(
            from = event.from.as_str(),
            to = event.to.as_str(),
            trigger = ?event.trigger,
            "new flow degraded; phase rolled back"
        );
        let alert = AlertEvent::new(
            AlertKind::Rollback,
            format!(
                "phase rolled back {} -> {} ({:?})",
                event.from, event.to, event.trigger
            ),
        );
        self.alerts.alert(alert.clone());
        self.ledger.record_alert(alert);
    }
}

impl HybridController {
    /// Read-only state for the snapshot endpoint.
    pub async fn snapshot(&self) -> crate::status::Snapshot {
        let spool = self
            .new_flow
            .spool()
            .stats()
            .await
            .unwrap_or_default();
        crate::status::Snapshot {
            phase: self.phase(),
            cooldown_active: self.in_cooldown(),
            ledger: self.ledger.summary(),
            spool,
            rollback_history: self.rollback_history(),
        }
    }

    /// Component-level health, aggregated by recent success rate and
    /// spool depth.
    pub async fn health(&self) -> crate::status::Health {
        use crate::status::{ComponentHealth, HealthStatus};

        let mut components = Vec::new();

        components.push(match self.source.depth(StreamType::Gps).await {
            Ok(depth) => ComponentHealth {
                name: "redis",
                status: HealthStatus::Healthy,
                detail: format!("gps queue depth {}", depth),
            },
            Err(e) => ComponentHealth {
                name: "redis",
                status: HealthStatus::Unhealthy,
                detail: e.to_string(),
            },
        });

        let high_water = self.new_flow.settings().high_water;
        components.push(match self.new_flow.spool().stats().await {
            Ok(stats) if stats.pending > high_water => ComponentHealth {
                name: "spool",
                status: HealthStatus::Degraded,
                detail: format!("pending {} above high water {}", stats.pending, high_water),
            },
            Ok(stats) => ComponentHealth {
                name: "spool",
                status: HealthStatus::Healthy,
                detail: format!("pending {} failed {}", stats.pending, stats.failed),
            },
            Err(e) => ComponentHealth {
                name: "spool",
                status: HealthStatus::Unhealthy,
                detail: e.to_string(),
            },
        });

        components.push(
            match self.new_flow.staging().exists(".health-probe").await {
                Ok(_) => ComponentHealth {
                    name: "staging",
                    status: HealthStatus::Healthy,
                    detail: "reachable".to_string(),
                },
                Err(e) => ComponentHealth {
                    name: "staging",
                    status: HealthStatus::Degraded,
                    detail: e.to_string(),
                },
            },
        );

        crate::status::Health::aggregate(components, self.ledger.recent_success_rate())
    }
}

struct ResetFlag<'a>(&'a AtomicBool);

impl Drop for ResetFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
