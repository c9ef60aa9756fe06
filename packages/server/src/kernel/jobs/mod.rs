// Task-execution subsystem: the job model, the scoring dispatcher, the
// per-job state machine, the worker pool, and the quota view feeding them.

pub mod dispatcher;
pub mod events;
pub mod job;
pub mod quota;
pub mod runner;
pub mod worker;

pub use dispatcher::{DispatchChoice, Dispatcher};
pub use job::{AspectRatio, ClipDuration, JobPhase, JobStatus, NewJob, SoraJob, WatermarkStatus};
pub use quota::{QuotaTracker, QuotaView};
pub use runner::{JobRunner, PhaseOutcome, RunSignals};
pub use worker::WorkerPool;
