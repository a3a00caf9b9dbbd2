// gps2bq-pipeline - The pipeline core
//
// The stage machine (drain → validate → stage → load), the backup
// replay path, the recovery sweeper, the metrics ledger, and the
// hybrid controller that supervises the legacy → staged cutover.

pub mod alerts;
pub mod cycle;
pub mod hybrid;
pub mod ledger;
pub mod legacy;
pub mod ports;
pub mod recovery;
pub mod scheduler;
pub mod status;

pub use alerts::LogAlertSink;
pub use cycle::{assemble_typed_batches, Pipeline, PipelineSettings, TypedBatch};
pub use hybrid::{HybridController, Phase, PhaseChangeError, RollbackEvent, RollbackTrigger};
pub use ledger::{ComparisonRecord, Ledger, LedgerSummary, StreamCounters};
pub use legacy::LegacyFlow;
pub use ports::StagePort;
pub use recovery::{RecoveryReport, RecoverySettings, RecoverySweeper};
pub use scheduler::CycleScheduler;
pub use status::{ComponentHealth, Health, HealthStatus, Snapshot};
