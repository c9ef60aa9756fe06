//! Builders for job lifecycle events.
//!
//! Every state transition of a job is recorded as a `source=task` event-log
//! row (`action = sora.job.<event>`, `resource_type = sora_job`). Each phase
//! emits exactly one `start` and one of `finish`/`fail`/`cancel`.

use serde_json::json;

use super::job::{JobPhase, SoraJob};
use crate::store::NewEventLog;

pub const SOURCE_TASK: &str = "task";
pub const RESOURCE_SORA_JOB: &str = "sora_job";

pub const EVENT_START: &str = "start";
pub const EVENT_FINISH: &str = "finish";
pub const EVENT_FAIL: &str = "fail";
pub const EVENT_CANCEL: &str = "cancel";
pub const EVENT_DISPATCH: &str = "dispatch";
pub const EVENT_RETRY: &str = "retry";
pub const EVENT_TRANSPORT_FAILOVER: &str = "transport_failover";

fn base(job: &SoraJob, phase: JobPhase, event: &str) -> NewEventLog {
    NewEventLog::builder()
        .source(SOURCE_TASK)
        .action(format!("sora.job.{}", event))
        .event(Some(event.to_string()))
        .phase(Some(phase.as_str().to_string()))
        .resource_type(Some(RESOURCE_SORA_JOB.to_string()))
        .resource_id(Some(job.id.to_string()))
        .operator_username(job.operator_username.clone())
        .metadata(Some(json!({
            "job_id": job.id,
            "profile_id": job.profile_id,
            "group_title": job.group_title,
            "retry_index": job.retry_index,
            "run_attempt": job.run_attempt,
        })))
        .build()
}

pub fn phase_start(job: &SoraJob, phase: JobPhase) -> NewEventLog {
    let mut event = base(job, phase, EVENT_START);
    event.message = Some(format!("{} started", phase.as_str()));
    event
}

pub fn phase_finish(job: &SoraJob, phase: JobPhase, message: impl Into<String>) -> NewEventLog {
    let mut event = base(job, phase, EVENT_FINISH);
    event.message = Some(message.into());
    event
}

pub fn phase_fail(job: &SoraJob, phase: JobPhase, reason: impl Into<String>) -> NewEventLog {
    let mut event = base(job, phase, EVENT_FAIL);
    event.status = "failed".to_string();
    event.level = "WARN".to_string();
    event.message = Some(reason.into());
    event
}

pub fn canceled(job: &SoraJob, phase: JobPhase) -> NewEventLog {
    let mut event = base(job, phase, EVENT_CANCEL);
    event.message = Some("job canceled".to_string());
    event
}

pub fn dispatched(job: &SoraJob, reason: impl Into<String>) -> NewEventLog {
    let mut event = base(job, JobPhase::Queue, EVENT_DISPATCH);
    event.message = Some(reason.into());
    event
}

pub fn retry_spawned(job: &SoraJob, new_job_id: i64, retry_index: i64) -> NewEventLog {
    let mut event = base(job, JobPhase::Submit, EVENT_RETRY);
    event.message = Some(format!(
        "overloaded profile {}, requeued as job {} (retry {})",
        job.profile_id, new_job_id, retry_index
    ));
    event
}

pub fn transport_failover(job: &SoraJob, detail: impl Into<String>) -> NewEventLog {
    let mut event = base(job, JobPhase::Progress, EVENT_TRANSPORT_FAILOVER);
    event.message = Some(detail.into());
    event
}
