//! Job model: one request to produce and publish a single video.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Queue,
    Submit,
    Progress,
    Publish,
    Watermark,
    Done,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Queue => "queue",
            JobPhase::Submit => "submit",
            JobPhase::Progress => "progress",
            JobPhase::Publish => "publish",
            JobPhase::Watermark => "watermark",
            JobPhase::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl WatermarkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkStatus::Queued => "queued",
            WatermarkStatus::Running => "running",
            WatermarkStatus::Completed => "completed",
            WatermarkStatus::Failed => "failed",
            WatermarkStatus::Skipped => "skipped",
        }
    }
}

/// Requested clip length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
pub enum ClipDuration {
    #[default]
    #[sqlx(rename = "10s")]
    #[serde(rename = "10s")]
    Short,
    #[sqlx(rename = "15s")]
    #[serde(rename = "15s")]
    Medium,
    #[sqlx(rename = "25s")]
    #[serde(rename = "25s")]
    Long,
}

impl ClipDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipDuration::Short => "10s",
            ClipDuration::Medium => "15s",
            ClipDuration::Long => "25s",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "10s" => Some(ClipDuration::Short),
            "15s" => Some(ClipDuration::Medium),
            "25s" => Some(ClipDuration::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    #[default]
    Landscape,
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "landscape",
            AspectRatio::Portrait => "portrait",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "landscape" => Some(AspectRatio::Landscape),
            "portrait" => Some(AspectRatio::Portrait),
            _ => None,
        }
    }
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct SoraJob {
    pub id: i64,

    // Target profile; 0 until the dispatcher has chosen one.
    pub profile_id: i64,
    pub group_title: Option<String>,

    // Intent
    pub prompt: String,
    pub image_url: Option<String>,
    pub duration: ClipDuration,
    pub aspect_ratio: AspectRatio,

    // Execution
    pub status: JobStatus,
    pub phase: JobPhase,
    pub progress_pct: f64,
    pub task_id: Option<String>,
    pub generation_id: Option<String>,
    pub publish_url: Option<String>,
    pub publish_post_id: Option<String>,
    pub publish_permalink: Option<String>,

    // Dispatch audit
    pub dispatch_mode: Option<String>,
    pub dispatch_score: Option<f64>,
    pub dispatch_quantity_score: Option<f64>,
    pub dispatch_quality_score: Option<f64>,
    pub dispatch_reason: Option<String>,

    // Retry chain (new row per retry; the original row keeps its index)
    pub retry_of_job_id: Option<i64>,
    pub retry_root_job_id: Option<i64>,
    pub retry_index: i64,

    // Lease
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub run_attempt: i64,
    pub run_last_error: Option<String>,
    pub error: Option<String>,

    // Watermark post-processing
    pub watermark_status: Option<WatermarkStatus>,
    pub watermark_url: Option<String>,
    pub watermark_error: Option<String>,
    pub watermark_attempts: i64,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub operator_username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SoraJob {
    /// Root of this job's retry chain (itself when never retried).
    pub fn retry_root(&self) -> i64 {
        self.retry_root_job_id.unwrap_or(self.id)
    }

    /// Whether the profile was pinned by the caller rather than dispatched.
    pub fn has_pinned_profile(&self) -> bool {
        self.profile_id > 0 && self.dispatch_mode.is_none()
    }
}

/// Payload for creating a job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub prompt: String,
    #[builder(default)]
    pub image_url: Option<String>,
    #[builder(default)]
    pub duration: ClipDuration,
    #[builder(default)]
    pub aspect_ratio: AspectRatio,
    #[builder(default)]
    pub group_title: Option<String>,
    /// Pre-assigned profile; `None` lets the dispatcher choose.
    #[builder(default)]
    pub profile_id: Option<i64>,
    #[builder(default)]
    pub operator_username: Option<String>,
    /// Set when this row is the retry of an earlier job.
    #[builder(default)]
    pub retry_of_job_id: Option<i64>,
    #[builder(default)]
    pub retry_root_job_id: Option<i64>,
    #[builder(default = 0)]
    pub retry_index: i64,
}
