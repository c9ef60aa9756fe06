//! Per-job state machine: submit -> progress -> publish -> watermark.
//!
//! The runner is handed an already-claimed job and returns once the row has
//! reached a terminal status (or the claim is lost). Each phase resolves to
//! an explicit [`PhaseOutcome`]; the driver sequences phases and owns the
//! terminal write, so there is exactly one `start` and one of
//! `finish`/`fail`/`cancel` event per phase.
//!
//! Progress polling knows two transports: the proxied API (cheap, no
//! window) and in-browser fetch. An anti-bot challenge on the proxied path
//! fails over to in-browser permanently for the job; a second challenge on
//! the in-browser path fails the phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use std::time::Instant;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use super::events;
use super::job::{JobPhase, JobStatus, NewJob, SoraJob, WatermarkStatus};
use super::quota::QuotaTracker;
use crate::kernel::settings::{SoraSettings, WatermarkFreeSettings};
use crate::kernel::upstream::{BrowserSession, PollReply, ProfileRoute, PublishReply, SubmitSpec};
use crate::kernel::Kernel;
use crate::store::scans::SessionSnapshot;

const PUBLISH_BACKOFF_SECONDS: [u64; 5] = [0, 2, 4, 8, 12];
const ERROR_TRUNCATE_LEN: usize = 500;

lazy_static! {
    static ref PUBLISH_URL_RE: Regex =
        Regex::new(r"https?://sora\.chatgpt\.com/p/(s_[a-zA-Z0-9]{8,})").unwrap();
}

/// A valid publish URL matches the share-link shape and its slug carries at
/// least one digit.
pub fn is_valid_publish_url(url: &str) -> bool {
    PUBLISH_URL_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|slug| slug.as_str().chars().any(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Wall-clock-based fallback when the upstream reports no numeric progress.
/// Never reaches 100 before completion.
pub fn estimate_progress(elapsed_secs: u64, budget_secs: u64) -> f64 {
    if budget_secs == 0 {
        return 0.0;
    }
    (elapsed_secs as f64 / budget_secs as f64).clamp(0.0, 0.95) * 100.0
}

fn truncate_error(text: &str) -> String {
    if text.len() <= ERROR_TRUNCATE_LEN {
        return text.to_string();
    }
    let mut cut = ERROR_TRUNCATE_LEN;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

/// The explicit result of one phase.
#[derive(Debug)]
pub enum PhaseOutcome {
    Success,
    Failed { reason: String },
    /// Upstream heavy load: retry on a different profile via a new job row.
    OverloadRetry,
    Canceled,
    /// Claim gone (lease lost or worker shutting down): abort silently,
    /// the stale sweeper recycles the row.
    LeaseLost,
}

/// Shutdown and lease-loss signals shared with the worker's heartbeat task.
#[derive(Clone)]
pub struct RunSignals {
    pub shutdown: CancellationToken,
    pub lease_lost: Arc<AtomicBool>,
}

impl RunSignals {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            lease_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    fn aborted(&self) -> bool {
        self.shutdown.is_cancelled() || self.lease_lost.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    ProxiedApi,
    InBrowser,
}

/// Holds the (at most one) open browser window for this job. Sessions are
/// never shared across jobs; every exit path closes the window.
struct SessionSlot {
    session: Option<Box<dyn BrowserSession>>,
}

impl SessionSlot {
    fn new() -> Self {
        Self { session: None }
    }

    async fn open(&mut self, kernel: &Kernel, profile_id: i64) -> Result<&mut dyn BrowserSession> {
        let session = match self.session.take() {
            Some(session) => session,
            None => kernel.browser.open(profile_id).await?,
        };
        Ok(self.session.insert(session).as_mut())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(error) = session.close().await {
                tracing::warn!(error = %error, "failed to close browser session");
            }
        }
    }
}

/// In-flight state shared across phases of one run.
struct RunCtx {
    task_id: String,
    access_token: Option<String>,
    route: ProfileRoute,
    transport: Transport,
    generation_id: Option<String>,
}

pub struct JobRunner {
    kernel: Arc<Kernel>,
    signals: RunSignals,
}

impl JobRunner {
    pub fn new(kernel: Arc<Kernel>, signals: RunSignals) -> Self {
        Self { kernel, signals }
    }

    /// Drive one claimed job to a terminal status (or abort on lease loss).
    pub async fn run(&self, job_id: i64) -> Result<()> {
        let Some(mut job) = self.kernel.store.get_sora_job(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Running {
            // Not ours to run (terminal or re-queued under us).
            return Ok(());
        }

        let system = self.kernel.settings.system();
        let sora = system.sora.clone();

        // Queue phase: pick a profile when none is pinned.
        match self.dispatch_phase(&mut job, &sora).await? {
            PhaseOutcome::Success => {}
            outcome => return self.conclude(&job, outcome).await,
        }

        let mut session = SessionSlot::new();
        let result = self.drive(&mut job, &sora, &mut session).await;
        session.close().await;

        match result {
            Ok(outcome) => self.conclude(&job, outcome).await,
            Err(error) => {
                // Fatal internal error: fail the current phase, keep going
                // down the terminal path. The lease is cleared by the
                // caller's unwind.
                let reason = truncate_error(&format!("internal error: {:#}", error));
                tracing::error!(job_id = job.id, error = %error, "job runner internal error");
                self.conclude(&job, PhaseOutcome::Failed { reason }).await
            }
        }
    }

    async fn drive(
        &self,
        job: &mut SoraJob,
        sora: &SoraSettings,
        session: &mut SessionSlot,
    ) -> Result<PhaseOutcome> {
        let mut ctx = match self.submit_phase(job, session).await? {
            SubmitResult::Submitted(ctx) => ctx,
            SubmitResult::Outcome(outcome) => return Ok(outcome),
        };

        match self.progress_phase(job, sora, session, &mut ctx).await? {
            PhaseOutcome::Success => {}
            outcome => return Ok(outcome),
        }

        match self.publish_phase(job, sora, session, &mut ctx).await? {
            PhaseOutcome::Success => {}
            outcome => return Ok(outcome),
        }

        let watermark = self.kernel.settings.watermark();
        self.watermark_phase(job, &watermark).await?;

        Ok(PhaseOutcome::Success)
    }

    // ------------------------------------------------------------------
    // Queue / dispatch
    // ------------------------------------------------------------------

    async fn dispatch_phase(&self, job: &mut SoraJob, sora: &SoraSettings) -> Result<PhaseOutcome> {
        if job.profile_id > 0 {
            return Ok(PhaseOutcome::Success);
        }

        let group = job
            .group_title
            .clone()
            .unwrap_or_else(|| sora.default_group_title.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&self.kernel.store));
        let choice = dispatcher
            .choose(job, &sora.account_dispatch, &group)
            .await?;

        match choice {
            Some(choice) => {
                self.kernel
                    .store
                    .set_job_dispatch(
                        job.id,
                        choice.profile_id,
                        &choice.mode,
                        choice.score,
                        choice.quantity_score,
                        choice.quality_score,
                        &choice.reason,
                    )
                    .await?;
                job.profile_id = choice.profile_id;
                job.dispatch_mode = Some(choice.mode.clone());
                self.kernel.emit(events::dispatched(job, choice.reason)).await;
                Ok(PhaseOutcome::Success)
            }
            None => Ok(PhaseOutcome::Failed {
                reason: "dispatch.no_candidate".to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Submit
    // ------------------------------------------------------------------

    async fn submit_phase(
        &self,
        job: &mut SoraJob,
        session: &mut SessionSlot,
    ) -> Result<SubmitResult> {
        self.enter_phase(job, JobPhase::Submit).await?;

        if self.signals.aborted() {
            return Ok(SubmitResult::Outcome(PhaseOutcome::LeaseLost));
        }
        if self.kernel.store.is_sora_job_canceled(job.id).await? {
            return Ok(SubmitResult::Outcome(PhaseOutcome::Canceled));
        }

        let open = session.open(&self.kernel, job.profile_id).await;
        let window = match open {
            Ok(window) => window,
            Err(error) => {
                return Ok(SubmitResult::Outcome(PhaseOutcome::Failed {
                    reason: format!("failed to open profile {}: {:#}", job.profile_id, error),
                }))
            }
        };

        let spec = SubmitSpec {
            prompt: job.prompt.clone(),
            image_url: job.image_url.clone(),
            duration: job.duration.as_str().to_string(),
            aspect_ratio: job.aspect_ratio.as_str().to_string(),
        };
        let reply = match window.submit(&spec).await {
            Ok(reply) => reply,
            Err(error) => {
                return Ok(SubmitResult::Outcome(PhaseOutcome::Failed {
                    reason: format!("submit request failed: {:#}", error),
                }))
            }
        };

        if reply.is_heavy_load() {
            return Ok(SubmitResult::Outcome(PhaseOutcome::OverloadRetry));
        }
        let Some(task_id) = reply.task_id.clone().filter(|id| !id.is_empty()) else {
            return Ok(SubmitResult::Outcome(PhaseOutcome::Failed {
                reason: reply.error_text(),
            }));
        };

        self.kernel.store.set_job_task(job.id, &task_id).await?;
        job.task_id = Some(task_id.clone());
        self.kernel
            .emit(events::phase_finish(job, JobPhase::Submit, format!("task {}", task_id)))
            .await;

        let proxy = self
            .kernel
            .store
            .get_proxy_for_profile(job.profile_id)
            .await?;
        let route = ProfileRoute {
            profile_id: job.profile_id,
            proxy_id: proxy.as_ref().map(|proxy| proxy.id),
            proxy_url: proxy.as_ref().map(|proxy| proxy.url()),
        };

        Ok(SubmitResult::Submitted(RunCtx {
            task_id,
            access_token: reply.access_token,
            route,
            transport: Transport::ProxiedApi,
            generation_id: None,
        }))
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    async fn progress_phase(
        &self,
        job: &mut SoraJob,
        sora: &SoraSettings,
        session: &mut SessionSlot,
        ctx: &mut RunCtx,
    ) -> Result<PhaseOutcome> {
        self.enter_phase(job, JobPhase::Progress).await?;

        // A proxy that has been tripping challenges recently pre-arms the
        // in-browser transport.
        if let Some(proxy_id) = ctx.route.proxy_id {
            let ratio = self
                .kernel
                .store
                .cf_recent_ratio(proxy_id, sora.cf_ratio_window_minutes)
                .await?;
            if ratio > sora.cf_ratio_threshold {
                ctx.transport = Transport::InBrowser;
                self.kernel
                    .emit(events::transport_failover(
                        job,
                        format!("proxy challenge ratio {:.2}, starting in-browser", ratio),
                    ))
                    .await;
            }
        }

        let started = Instant::now();
        let budget_secs = (sora.generate_max_minutes.max(1) as u64) * 60;
        let draft_timeout = StdDuration::from_secs((sora.draft_wait_timeout_minutes.max(1) as u64) * 60);
        let draft_refresh = StdDuration::from_secs(
            (sora.draft_manual_poll_interval_minutes.max(1) as u64) * 60,
        );
        let poll_interval = StdDuration::from_secs(sora.generate_poll_interval_sec.max(1));

        let mut draft_wait_started: Option<Instant> = None;
        let mut last_draft_refresh: Option<Instant> = None;

        loop {
            if self.signals.aborted() {
                return Ok(PhaseOutcome::LeaseLost);
            }
            if self.kernel.store.is_sora_job_canceled(job.id).await? {
                return Ok(PhaseOutcome::Canceled);
            }
            if started.elapsed().as_secs() > budget_secs {
                return Ok(PhaseOutcome::Failed {
                    reason: format!(
                        "generation timed out after {} minutes",
                        sora.generate_max_minutes
                    ),
                });
            }
            if let Some(waiting_since) = draft_wait_started {
                if waiting_since.elapsed() > draft_timeout {
                    return Ok(PhaseOutcome::Failed {
                        reason: format!(
                            "draft not available after {} minutes",
                            sora.draft_wait_timeout_minutes
                        ),
                    });
                }
            }

            // Manual draft refreshes are bounded by their own interval,
            // independent of the per-poll tick.
            let want_drafts = draft_wait_started.is_some()
                && last_draft_refresh
                    .map(|at| at.elapsed() >= draft_refresh)
                    .unwrap_or(true);
            if want_drafts {
                last_draft_refresh = Some(Instant::now());
            }

            match self.poll_once(job, session, ctx, want_drafts).await {
                Err(error) => {
                    // Transient network failure: retry in place, the phase
                    // budget bounds us.
                    tracing::debug!(job_id = job.id, error = %error, "poll failed, retrying");
                }
                Ok(reply) => {
                    if reply.cf_challenge {
                        match ctx.transport {
                            Transport::ProxiedApi => {
                                ctx.transport = Transport::InBrowser;
                                self.kernel
                                    .emit(events::transport_failover(
                                        job,
                                        "anti-bot challenge on proxied API, switching to in-browser fetch",
                                    ))
                                    .await;
                                continue;
                            }
                            Transport::InBrowser => {
                                return Ok(PhaseOutcome::Failed {
                                    reason: "anti-bot challenge persisted on in-browser transport"
                                        .to_string(),
                                });
                            }
                        }
                    }

                    if reply.remaining_count.is_some() {
                        self.record_quota_observation(job, &reply).await;
                    }

                    let observed = reply.progress.unwrap_or_else(|| {
                        estimate_progress(started.elapsed().as_secs(), budget_secs)
                    });
                    self.kernel.store.set_job_progress(job.id, observed).await?;

                    if let Some(generation_id) =
                        reply.generation_id.clone().filter(|id| !id.is_empty())
                    {
                        self.kernel
                            .store
                            .set_job_generation(job.id, &generation_id)
                            .await?;
                        ctx.generation_id = Some(generation_id.clone());
                        job.generation_id = Some(generation_id.clone());
                        self.kernel
                            .emit(events::phase_finish(
                                job,
                                JobPhase::Progress,
                                format!("generation {}", generation_id),
                            ))
                            .await;
                        return Ok(PhaseOutcome::Success);
                    }

                    if reply.state == "failed" || reply.error.is_some() {
                        return Ok(PhaseOutcome::Failed {
                            reason: reply
                                .error
                                .unwrap_or_else(|| "generation reported failure".to_string()),
                        });
                    }

                    // Complete-looking but no generation id yet: start the
                    // draft wait clock.
                    if reply.state == "completed" || reply.progress.unwrap_or(0.0) >= 100.0 {
                        draft_wait_started.get_or_insert_with(Instant::now);
                    }
                }
            }

            tokio::select! {
                _ = self.signals.shutdown.cancelled() => return Ok(PhaseOutcome::LeaseLost),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn poll_once(
        &self,
        job: &SoraJob,
        session: &mut SessionSlot,
        ctx: &mut RunCtx,
        want_drafts: bool,
    ) -> Result<PollReply> {
        match ctx.transport {
            Transport::ProxiedApi => {
                let reply = self
                    .kernel
                    .upstream
                    .poll(
                        &ctx.route,
                        &ctx.task_id,
                        ctx.access_token.as_deref(),
                        want_drafts,
                    )
                    .await;
                if let Ok(reply) = &reply {
                    // Every proxied poll feeds the challenge-ratio window.
                    if let Err(error) = self
                        .kernel
                        .store
                        .record_proxy_cf_event(
                            ctx.route.proxy_id,
                            job.profile_id,
                            job.id,
                            JobPhase::Progress.as_str(),
                            reply.cf_challenge,
                            None,
                        )
                        .await
                    {
                        tracing::warn!(error = %error, "failed to record proxy event");
                    }
                }
                reply
            }
            Transport::InBrowser => {
                let window = session.open(&self.kernel, job.profile_id).await?;
                window
                    .poll(&ctx.task_id, ctx.access_token.as_deref(), want_drafts)
                    .await
            }
        }
    }

    async fn record_quota_observation(&self, job: &SoraJob, reply: &PollReply) {
        let group = job
            .group_title
            .clone()
            .unwrap_or_else(|| self.kernel.settings.system().sora.default_group_title);
        let snapshot = SessionSnapshot {
            session_status: "active".to_string(),
            plan_type: "unknown".to_string(),
            remaining_count: reply.remaining_count,
            total_count: reply.total_count,
            ..Default::default()
        };
        let tracker = QuotaTracker::new(Arc::clone(&self.kernel.store));
        if let Err(error) = tracker
            .record_observation(&self.kernel.hub, &group, job.profile_id, &snapshot)
            .await
        {
            tracing::warn!(job_id = job.id, error = %error, "failed to record quota observation");
        }
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    async fn publish_phase(
        &self,
        job: &mut SoraJob,
        sora: &SoraSettings,
        session: &mut SessionSlot,
        ctx: &mut RunCtx,
    ) -> Result<PhaseOutcome> {
        self.enter_phase(job, JobPhase::Publish).await?;

        let generation_id = match &ctx.generation_id {
            Some(id) => id.clone(),
            None => {
                return Ok(PhaseOutcome::Failed {
                    reason: "publish without generation id".to_string(),
                })
            }
        };
        let caption: String = job.prompt.chars().take(120).collect();
        let max_attempts = sora.publish_retry_max.max(1);

        for attempt in 0..max_attempts {
            if self.signals.aborted() {
                return Ok(PhaseOutcome::LeaseLost);
            }
            if self.kernel.store.is_sora_job_canceled(job.id).await? {
                return Ok(PhaseOutcome::Canceled);
            }

            let backoff =
                PUBLISH_BACKOFF_SECONDS[(attempt as usize).min(PUBLISH_BACKOFF_SECONDS.len() - 1)];
            if backoff > 0 {
                tokio::time::sleep(StdDuration::from_secs(backoff)).await;
            }

            let reply = match self.publish_once(job, session, ctx, &generation_id, &caption).await {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::debug!(job_id = job.id, error = %error, "publish failed, retrying");
                    continue;
                }
            };

            if let Some(url) = reply.publish_url.clone().filter(|url| !url.is_empty()) {
                if !is_valid_publish_url(&url) {
                    return Ok(PhaseOutcome::Failed {
                        reason: format!("publish returned invalid url: {}", url),
                    });
                }
                self.kernel
                    .store
                    .set_job_publish(
                        job.id,
                        &url,
                        reply.post_id.as_deref(),
                        reply.permalink.as_deref(),
                    )
                    .await?;
                job.publish_url = Some(url.clone());
                self.kernel
                    .emit(events::phase_finish(job, JobPhase::Publish, url))
                    .await;
                return Ok(PhaseOutcome::Success);
            }

            if reply.is_duplicate() {
                // Already published upstream: resolve the existing URL
                // from the draft record.
                let draft = self.poll_once(job, session, ctx, true).await;
                if let Ok(poll) = draft {
                    if let Some(url) = poll.draft_publish_url.filter(|url| is_valid_publish_url(url))
                    {
                        self.kernel
                            .store
                            .set_job_publish(job.id, &url, None, None)
                            .await?;
                        job.publish_url = Some(url.clone());
                        self.kernel
                            .emit(events::phase_finish(
                                job,
                                JobPhase::Publish,
                                format!("already published: {}", url),
                            ))
                            .await;
                        return Ok(PhaseOutcome::Success);
                    }
                }
                return Ok(PhaseOutcome::Failed {
                    reason: "duplicate publish but existing url unresolved".to_string(),
                });
            }

            if reply.is_invalid_request() {
                // The generation id may not be committed server-side yet.
                continue;
            }

            return Ok(PhaseOutcome::Failed {
                reason: reply.error_text(),
            });
        }

        Ok(PhaseOutcome::Failed {
            reason: format!("publish failed after {} attempts", max_attempts),
        })
    }

    async fn publish_once(
        &self,
        job: &SoraJob,
        session: &mut SessionSlot,
        ctx: &mut RunCtx,
        generation_id: &str,
        caption: &str,
    ) -> Result<PublishReply> {
        match ctx.transport {
            Transport::ProxiedApi => {
                self.kernel
                    .upstream
                    .publish(&ctx.route, generation_id, caption)
                    .await
            }
            Transport::InBrowser => {
                let window = session.open(&self.kernel, job.profile_id).await?;
                window.publish(generation_id, caption).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Watermark
    // ------------------------------------------------------------------

    async fn watermark_phase(
        &self,
        job: &mut SoraJob,
        settings: &WatermarkFreeSettings,
    ) -> Result<()> {
        if !settings.enabled {
            self.kernel
                .store
                .set_job_watermark(job.id, WatermarkStatus::Skipped, None, None)
                .await?;
            return Ok(());
        }

        self.enter_phase(job, JobPhase::Watermark).await?;
        let publish_url = match &job.publish_url {
            Some(url) => url.clone(),
            None => return Ok(()),
        };

        let mut last_error = String::new();
        for _ in 0..=settings.retry_max {
            self.kernel
                .store
                .set_job_watermark(job.id, WatermarkStatus::Running, None, None)
                .await?;
            match self.kernel.watermark.rewrite(&publish_url).await {
                Ok(output_url) => {
                    self.kernel
                        .store
                        .set_job_watermark(
                            job.id,
                            WatermarkStatus::Completed,
                            Some(&output_url),
                            None,
                        )
                        .await?;
                    self.kernel
                        .emit(events::phase_finish(job, JobPhase::Watermark, output_url))
                        .await;
                    return Ok(());
                }
                Err(error) => {
                    last_error = truncate_error(&format!("{:#}", error));
                }
            }
        }

        // Never fails the job: the publish result stands.
        let status = if settings.fallback_on_failure {
            WatermarkStatus::Skipped
        } else {
            WatermarkStatus::Failed
        };
        self.kernel
            .store
            .set_job_watermark(job.id, status, None, Some(&last_error))
            .await?;
        self.kernel
            .emit(events::phase_fail(job, JobPhase::Watermark, last_error))
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal handling
    // ------------------------------------------------------------------

    async fn enter_phase(&self, job: &mut SoraJob, phase: JobPhase) -> Result<()> {
        self.kernel.store.set_job_phase(job.id, phase).await?;
        job.phase = phase;
        self.kernel.emit(events::phase_start(job, phase)).await;
        Ok(())
    }

    async fn conclude(&self, job: &SoraJob, outcome: PhaseOutcome) -> Result<()> {
        match outcome {
            PhaseOutcome::Success => {
                self.kernel
                    .store
                    .finish_sora_job(job.id, JobStatus::Completed, None)
                    .await?;
                self.kernel
                    .emit(events::phase_finish(job, JobPhase::Done, "job completed"))
                    .await;
            }
            PhaseOutcome::Failed { reason } => {
                let reason = truncate_error(&reason);
                self.kernel
                    .store
                    .finish_sora_job(job.id, JobStatus::Failed, Some(&reason))
                    .await?;
                self.kernel.emit(events::phase_fail(job, job.phase, reason)).await;
            }
            PhaseOutcome::Canceled => {
                self.kernel
                    .store
                    .finish_sora_job(job.id, JobStatus::Canceled, None)
                    .await?;
                self.kernel.emit(events::canceled(job, job.phase)).await;
            }
            PhaseOutcome::OverloadRetry => {
                self.spawn_overload_retry(job).await?;
            }
            PhaseOutcome::LeaseLost => {
                // Abort silently: the stale sweeper recycles the row, and
                // any status write from here could race the next claimer.
                tracing::info!(job_id = job.id, "aborting run, claim lost");
            }
        }
        Ok(())
    }

    /// Heavy load on submit: fail this row and chain a fresh one so the
    /// dispatcher picks a different profile. Bounded by
    /// `heavy_load_retry_max_attempts`.
    async fn spawn_overload_retry(&self, job: &SoraJob) -> Result<()> {
        let sora = self.kernel.settings.system().sora;
        let root = job.retry_root();
        let next_index = self.kernel.store.max_retry_index(root).await? + 1;

        if next_index > sora.heavy_load_retry_max_attempts {
            let reason = format!(
                "upstream heavy load, retries exhausted after {} attempts",
                sora.heavy_load_retry_max_attempts
            );
            self.kernel
                .store
                .finish_sora_job(job.id, JobStatus::Failed, Some(&reason))
                .await?;
            self.kernel
                .emit(events::phase_fail(job, JobPhase::Submit, reason))
                .await;
            return Ok(());
        }

        let retry = NewJob::builder()
            .prompt(job.prompt.clone())
            .image_url(job.image_url.clone())
            .duration(job.duration)
            .aspect_ratio(job.aspect_ratio)
            .group_title(job.group_title.clone())
            .operator_username(job.operator_username.clone())
            .retry_of_job_id(Some(job.id))
            .retry_root_job_id(Some(root))
            .retry_index(next_index)
            .build();
        let new_job = self.kernel.store.create_sora_job(&retry).await?;

        self.kernel
            .emit(events::retry_spawned(job, new_job.id, next_index))
            .await;
        self.kernel
            .store
            .finish_sora_job(job.id, JobStatus::Failed, Some("upstream heavy load"))
            .await?;
        self.kernel
            .emit(events::phase_fail(job, JobPhase::Submit, "upstream heavy load"))
            .await;
        Ok(())
    }
}

enum SubmitResult {
    Submitted(RunCtx),
    Outcome(PhaseOutcome),
}
