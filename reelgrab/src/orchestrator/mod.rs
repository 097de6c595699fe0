//! Acquisition orchestrator.
//!
//! Every classified link becomes a [`DownloadJob`] that moves through
//! `pending -> running -> {succeeded | failed}`:
//!
//! 1. wait for a [`ChatSlot`] from the [`AdmissionController`]
//! 2. create the job's [`WorkDir`] and invoke the provider adapter
//! 3. synthesize image sequences into a video, re-encode downloaded videos
//! 4. hand the artifact to every recipient through [`Delivery`]
//! 5. remove the working directory, then release the slot
//!
//! Identical `(chat, url)` submissions share one job while it runs and for
//! a short window after it finished.

mod admission;
mod job;
mod workdir;

pub use admission::{AdmissionClosed, AdmissionController, AdmissionStats, ChatSlot, PendingAdmission};
pub use job::{ChatId, ChatKind, DeliveryTarget, DownloadJob, JobFailure, JobStatus, MessageId, Request};
pub use workdir::WorkDir;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use media_providers::{
    AdapterRegistry, ArtifactKind, ClassifiedLink, FailureKind, FetchRequest, MediaArtifact, ProviderTag,
    fetch_with_retry,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::delivery::{Delivery, DeliveryPayload, DeliveryReceipt};
use crate::recorder::{UsageContext, UsageOutcome, UsageRecord, UsageRecorder};
use crate::slideshow::{SlideshowInput, Synthesizer};

/// Terminal jobs stay queryable this long.
const JOB_HISTORY_SECS: i64 = 600;

/// Lifecycle notifications.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Queued {
        job_id: Uuid,
        chat_id: ChatId,
        provider: ProviderTag,
    },
    Started {
        job_id: Uuid,
    },
    Completed {
        job_id: Uuid,
        duration_secs: f64,
    },
    Failed {
        job_id: Uuid,
        kind: FailureKind,
    },
}

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub registry: Arc<AdapterRegistry>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub delivery: Arc<dyn Delivery>,
    pub recorder: Arc<dyn UsageRecorder>,
}

/// Final result of a job as seen by every submission it served.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub provider: ProviderTag,
    pub url: String,
    pub status: JobStatus,
    /// Kind returned by the adapter, before synthesis.
    pub artifact_kind: Option<ArtifactKind>,
    pub receipt: Option<DeliveryReceipt>,
    pub failure: Option<JobFailure>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Handle returned for every submitted link.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub provider: ProviderTag,
    pub url: String,
    /// Set when the submission joined an existing job.
    pub coalesced: bool,
    rx: watch::Receiver<Option<Arc<JobOutcome>>>,
}

impl JobHandle {
    /// Wait for the job to finish, including cleanup.
    pub async fn wait(mut self) -> Option<Arc<JobOutcome>> {
        let outcome = self.rx.wait_for(Option::is_some).await.ok()?;
        outcome.clone()
    }
}

#[derive(Debug, Clone)]
struct Recipient {
    target: DeliveryTarget,
    context: UsageContext,
    since: Instant,
}

type CoalesceKey = (ChatId, String);

enum Entry {
    InFlight(InFlight),
    Done {
        outcome: Arc<JobOutcome>,
        finished_at: Instant,
    },
}

struct InFlight {
    job_id: Uuid,
    recipients: VecDeque<Recipient>,
    /// Set once the first recipient was taken; cancellation is refused after.
    delivering: bool,
    cancel: CancellationToken,
    outcome_rx: watch::Receiver<Option<Arc<JobOutcome>>>,
}

enum Next {
    Deliver(Recipient),
    Closed(Arc<JobOutcome>),
}

/// Per-job bookkeeping across deliveries. `receipt` and `failure` are
/// never both set: a failed upload is not attempted again.
#[derive(Default)]
struct Progress {
    delivered: usize,
    receipt: Option<DeliveryReceipt>,
    failure: Option<JobFailure>,
}

/// Drives download jobs from submission to cleanup.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    deps: PipelineDeps,
    config: PipelineConfig,
    admission: AdmissionController,
    coalesce: Mutex<HashMap<CoalesceKey, Entry>>,
    jobs: DashMap<Uuid, DownloadJob>,
    events: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Orchestrator {
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let admission = AdmissionController::new(config.per_chat_limit, config.global_limit);
        info!(
            per_chat_limit = config.per_chat_limit,
            global_limit = config.global_limit,
            providers = ?deps.registry.providers().collect::<Vec<_>>(),
            "orchestrator ready"
        );
        Self {
            inner: Arc::new(Inner {
                deps,
                config,
                admission,
                coalesce: Mutex::new(HashMap::new()),
                jobs: DashMap::new(),
                events,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Start one job per link, in link order. Must be called inside a Tokio
    /// runtime. A request without links yields no handles.
    pub fn submit(&self, request: &Request) -> Vec<JobHandle> {
        self.inner.purge_expired();
        request
            .links
            .iter()
            .map(|link| self.inner.submit_link(request, link))
            .collect()
    }

    /// Submit and wait for every job of the request.
    pub async fn run_request(&self, request: &Request) -> Vec<Option<Arc<JobOutcome>>> {
        let handles = self.submit(request);
        futures::future::join_all(handles.into_iter().map(JobHandle::wait)).await
    }

    /// Withdraw the recipient(s) registered for a chat message. Jobs left
    /// without recipients before delivery started are cancelled. Returns the
    /// number of withdrawn recipients.
    pub fn cancel_message(&self, chat_id: ChatId, message_id: MessageId) -> usize {
        let mut withdrawn = 0;
        let mut table = self.inner.coalesce.lock();
        for ((chat, url), entry) in table.iter_mut() {
            if *chat != chat_id {
                continue;
            }
            let Entry::InFlight(flight) = entry else {
                continue;
            };
            let before = flight.recipients.len();
            flight.recipients.retain(|r| r.target.message_id != message_id);
            let removed = before - flight.recipients.len();
            if removed == 0 {
                continue;
            }
            withdrawn += removed;
            if flight.recipients.is_empty() && !flight.delivering {
                info!(job_id = %flight.job_id, chat_id, %url, "no recipients left, cancelling job");
                flight.cancel.cancel();
            }
        }
        withdrawn
    }

    /// Snapshot of a job.
    pub fn job(&self, job_id: Uuid) -> Option<DownloadJob> {
        self.inner.jobs.get(&job_id).map(|j| j.clone())
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.inner.admission.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Stop admitting, cancel running jobs and wait for their cleanup.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.admission.close();
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("orchestrator stopped");
    }
}

impl Inner {
    fn submit_link(self: &Arc<Self>, request: &Request, link: &ClassifiedLink) -> JobHandle {
        let chat_id = request.target.chat_id;
        let key: CoalesceKey = (chat_id, link.url.clone());
        let recipient = Recipient {
            target: request.target.clone(),
            context: request.context,
            since: Instant::now(),
        };

        let mut table = self.coalesce.lock();
        match table.get_mut(&key) {
            Some(Entry::InFlight(flight)) if !flight.cancel.is_cancelled() => {
                flight.recipients.push_back(recipient);
                info!(job_id = %flight.job_id, chat_id, url = %link.url, "joined in-flight job");
                return JobHandle {
                    job_id: flight.job_id,
                    provider: link.provider,
                    url: link.url.clone(),
                    coalesced: true,
                    rx: flight.outcome_rx.clone(),
                };
            }
            _ => {}
        }
        let recent = match table.get(&key) {
            Some(Entry::Done { outcome, finished_at })
                if finished_at.elapsed() < self.config.coalesce_window() =>
            {
                Some(outcome.clone())
            }
            _ => None,
        };
        if let Some(outcome) = recent {
            drop(table);
            info!(job_id = %outcome.job_id, chat_id, url = %link.url, "answering from recent job");
            return self.replay(outcome, recipient);
        }

        let job = DownloadJob::new(request.id, chat_id, link);
        let job_id = job.id;
        let cancel = self.shutdown.child_token();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        table.insert(
            key.clone(),
            Entry::InFlight(InFlight {
                job_id,
                recipients: VecDeque::from([recipient]),
                delivering: false,
                cancel: cancel.clone(),
                outcome_rx: outcome_rx.clone(),
            }),
        );
        drop(table);

        self.jobs.insert(job_id, job);
        let pending = self.admission.enqueue(chat_id);
        let _ = self.events.send(JobEvent::Queued {
            job_id,
            chat_id,
            provider: link.provider,
        });
        debug!(%job_id, chat_id, provider = %link.provider, url = %link.url, "job queued");

        let span = info_span!("job", %job_id, chat_id, provider = %link.provider);
        let inner = self.clone();
        let provider = link.provider;
        self.tracker.spawn(
            async move {
                let outcome = inner.run_job(key, job_id, provider, pending, cancel).await;
                let _ = outcome_tx.send(Some(outcome));
            }
            .instrument(span),
        );

        JobHandle {
            job_id,
            provider: link.provider,
            url: link.url.clone(),
            coalesced: false,
            rx: outcome_rx,
        }
    }

    /// Serve a late duplicate from a finished job without fetching again.
    fn replay(self: &Arc<Self>, outcome: Arc<JobOutcome>, recipient: Recipient) -> JobHandle {
        let (tx, rx) = watch::channel(None);
        let handle = JobHandle {
            job_id: outcome.job_id,
            provider: outcome.provider,
            url: outcome.url.clone(),
            coalesced: true,
            rx,
        };
        let inner = self.clone();
        self.tracker.spawn(async move {
            let result = match (&outcome.receipt, &outcome.failure) {
                (Some(receipt), None) => {
                    let mut progress = Progress {
                        receipt: Some(receipt.clone()),
                        ..Progress::default()
                    };
                    inner
                        .deliver_to(&recipient, outcome.provider, None, &mut progress)
                        .await
                }
                (_, Some(failure)) => {
                    inner.report(&recipient, outcome.provider, failure).await;
                    Err(failure.clone())
                }
                (None, None) => Ok(()),
            };
            inner.record(&recipient, Some(outcome.provider), &result);
            let _ = tx.send(Some(outcome));
        });
        handle
    }

    async fn run_job(
        self: Arc<Self>,
        key: CoalesceKey,
        job_id: Uuid,
        provider: ProviderTag,
        pending: PendingAdmission,
        cancel: CancellationToken,
    ) -> Arc<JobOutcome> {
        let started = Instant::now();
        let url = key.1.clone();

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            admitted = pending.admitted() => admitted.ok(),
        };

        let (produced, slot, workdir) = match slot {
            None => (Err(cancelled(provider, "withdrawn before admission")), None, None),
            Some(slot) => match self.start(job_id, provider).await {
                Ok(workdir) => {
                    let produced = self
                        .produce(job_id, provider, &url, workdir.path(), &cancel)
                        .await;
                    (produced, Some(slot), Some(workdir))
                }
                Err(failure) => (Err(failure), Some(slot), None),
            },
        };
        let artifact_kind = self.jobs.get(&job_id).and_then(|j| j.artifact_kind);

        let mut progress = Progress::default();
        let outcome = loop {
            let next = self.take_next(&key, job_id, || {
                settle(job_id, provider, &url, artifact_kind, &produced, &progress)
            });
            let recipient = match next {
                Next::Deliver(recipient) => recipient,
                Next::Closed(outcome) => break outcome,
            };
            let result = match &produced {
                Ok(artifact) => {
                    self.deliver_to(&recipient, provider, Some(artifact), &mut progress)
                        .await
                }
                Err(failure) => {
                    self.report(&recipient, provider, failure).await;
                    Err(failure.clone())
                }
            };
            self.record(&recipient, Some(provider), &result);
        };

        // Artifact paths are no longer referenced past this point.
        drop(produced);
        if let Some(workdir) = workdir
            && let Err(e) = workdir.close().await
        {
            error!(error = %e, "failed to remove job directory");
        }

        self.finish(job_id, &outcome, started);
        drop(slot);
        outcome
    }

    /// Create the working directory and move the job to `running`.
    async fn start(&self, job_id: Uuid, provider: ProviderTag) -> Result<WorkDir, JobFailure> {
        let workdir = WorkDir::create(&self.config.temp_root, job_id)
            .await
            .map_err(|e| JobFailure::new(FailureKind::ProviderError, provider, e.to_string()))?;
        let path = workdir.path().to_path_buf();
        self.update_job(job_id, |job| {
            job.working_directory = Some(path);
            job.transition(JobStatus::Running)
        });
        let _ = self.events.send(JobEvent::Started { job_id });
        Ok(workdir)
    }

    async fn produce(
        &self,
        job_id: Uuid,
        provider: ProviderTag,
        url: &str,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaArtifact, JobFailure> {
        let adapter = self.deps.registry.get(provider).ok_or_else(|| {
            JobFailure::new(
                FailureKind::InvalidLink,
                provider,
                format!("no adapter registered for {provider}"),
            )
        })?;

        let timeout = self.config.adapter_timeout();
        let request = FetchRequest::new(provider, url, work_dir, timeout, cancel.clone());
        let fetched = tokio::time::timeout(
            timeout,
            fetch_with_retry(adapter.as_ref(), &request, &self.config.retry),
        )
        .await;
        let artifact = match fetched {
            Ok(outcome) => {
                let attempts = outcome.attempts;
                self.update_job(job_id, |job| {
                    job.attempt_count = attempts;
                    Ok(())
                });
                outcome
                    .result
                    .map_err(|e| JobFailure::new(e.kind(), provider, e.to_string()))?
            }
            Err(_) => {
                return Err(JobFailure::new(
                    FailureKind::Timeout,
                    provider,
                    format!("{} exceeded {timeout:?}", adapter.name()),
                ));
            }
        };

        let kind = artifact.kind();
        self.update_job(job_id, |job| {
            job.artifact_kind = Some(kind);
            Ok(())
        });
        info!(adapter = adapter.name(), ?kind, size_bytes = artifact.size_bytes(), "media fetched");

        if cancel.is_cancelled() {
            return Err(cancelled(provider, "withdrawn after fetch"));
        }
        match artifact {
            MediaArtifact::ImageSequence {
                images,
                audio,
                frame_durations,
                ..
            } => {
                let input = SlideshowInput {
                    images,
                    audio,
                    frame_durations,
                    output_dir: work_dir.join("render"),
                };
                self.synthesize(provider, input, cancel).await
            }
            MediaArtifact::Video { path, size_bytes } => {
                self.optimize(provider, path, size_bytes, work_dir, cancel).await
            }
            other => Ok(other),
        }
    }

    /// Re-encode a downloaded video. Any failure other than cancellation
    /// falls back to the downloaded file.
    async fn optimize(
        &self,
        provider: ProviderTag,
        path: PathBuf,
        size_bytes: u64,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaArtifact, JobFailure> {
        let timeout = self.config.synthesis_timeout();
        let optimized = tokio::time::timeout(
            timeout,
            self.deps
                .synthesizer
                .optimize(&path, &work_dir.join("optimized"), cancel),
        )
        .await;
        match optimized {
            Ok(Ok(Some(video))) => {
                debug!(path = %video.path.display(), before = size_bytes, after = video.size_bytes, "video re-encoded");
                Ok(MediaArtifact::Video {
                    path: video.path,
                    size_bytes: video.size_bytes,
                })
            }
            Ok(Ok(None)) => Ok(MediaArtifact::Video { path, size_bytes }),
            Ok(Err(e)) if e.kind() == FailureKind::Cancelled => Err(cancelled(provider, "withdrawn while re-encoding")),
            Ok(Err(e)) => {
                warn!(error = %e, "re-encoding failed, sending the downloaded file");
                Ok(MediaArtifact::Video { path, size_bytes })
            }
            Err(_) => {
                warn!(?timeout, "re-encoding timed out, sending the downloaded file");
                Ok(MediaArtifact::Video { path, size_bytes })
            }
        }
    }

    async fn synthesize(
        &self,
        provider: ProviderTag,
        input: SlideshowInput,
        cancel: &CancellationToken,
    ) -> Result<MediaArtifact, JobFailure> {
        let timeout = self.config.synthesis_timeout();
        let synthesized =
            tokio::time::timeout(timeout, self.deps.synthesizer.synthesize(&input, cancel)).await;
        match synthesized {
            Ok(Ok(video)) => {
                debug!(path = %video.path.display(), duration = ?video.duration, "slideshow rendered");
                Ok(MediaArtifact::Video {
                    path: video.path,
                    size_bytes: video.size_bytes,
                })
            }
            Ok(Err(e)) => Err(JobFailure::new(e.kind(), provider, e.to_string())),
            Err(_) => Err(JobFailure::new(
                FailureKind::Timeout,
                provider,
                format!("synthesis exceeded {timeout:?}"),
            )),
        }
    }

    /// Deliver to one recipient. The first successful upload's receipt is
    /// reused for every later recipient; after a failed upload every later
    /// recipient gets the same failure.
    async fn deliver_to(
        &self,
        recipient: &Recipient,
        provider: ProviderTag,
        artifact: Option<&MediaArtifact>,
        progress: &mut Progress,
    ) -> Result<(), JobFailure> {
        let payload = match (&progress.receipt, &progress.failure, artifact) {
            (Some(receipt), _, _) => DeliveryPayload::Reuse(receipt),
            (None, Some(failure), _) => {
                self.report(recipient, provider, failure).await;
                return Err(failure.clone());
            }
            (None, None, Some(artifact)) => DeliveryPayload::Upload(artifact),
            (None, None, None) => return Ok(()),
        };
        match self.deps.delivery.deliver(&recipient.target, payload).await {
            Ok(receipt) => {
                progress.delivered += 1;
                if progress.receipt.is_none() {
                    progress.receipt = Some(receipt);
                }
                info!(chat_id = recipient.target.chat_id, message_id = recipient.target.message_id, "delivered");
                Ok(())
            }
            Err(e) => {
                let failure = JobFailure::new(FailureKind::DeliveryError, provider, e.to_string());
                warn!(chat_id = recipient.target.chat_id, error = %e, "delivery failed");
                self.report(recipient, provider, &failure).await;
                if progress.receipt.is_none() {
                    progress.failure = Some(failure.clone());
                }
                Err(failure)
            }
        }
    }

    async fn report(&self, recipient: &Recipient, provider: ProviderTag, failure: &JobFailure) {
        if failure.kind == FailureKind::Cancelled {
            return;
        }
        warn!(
            chat_id = recipient.target.chat_id,
            kind = %failure.kind,
            detail = %failure.detail,
            "job failed"
        );
        self.deps
            .delivery
            .report_failure(&recipient.target, provider, failure)
            .await;
    }

    fn record(&self, recipient: &Recipient, provider: Option<ProviderTag>, result: &Result<(), JobFailure>) {
        let outcome = match result {
            Ok(()) => UsageOutcome::Succeeded,
            Err(failure) => UsageOutcome::Failed(failure.kind),
        };
        self.deps.recorder.record(UsageRecord {
            chat_id: recipient.target.chat_id,
            user_id: recipient.target.sender_id,
            context: recipient.context,
            provider,
            outcome,
            duration: recipient.since.elapsed(),
        });
    }

    /// Pop the next recipient of `job_id`. When none is left the outcome is
    /// settled in the same critical section, so a submission racing with
    /// the end of the job either becomes a recipient or sees the result.
    fn take_next(&self, key: &CoalesceKey, job_id: Uuid, settle: impl FnOnce() -> JobOutcome) -> Next {
        let mut table = self.coalesce.lock();
        let owned = match table.get_mut(key) {
            Some(Entry::InFlight(flight)) if flight.job_id == job_id => {
                flight.delivering = true;
                if let Some(recipient) = flight.recipients.pop_front() {
                    return Next::Deliver(recipient);
                }
                true
            }
            _ => false,
        };
        let outcome = Arc::new(settle());
        if owned {
            if outcome.failure_kind() == Some(FailureKind::Cancelled) {
                table.remove(key);
            } else {
                table.insert(
                    key.clone(),
                    Entry::Done {
                        outcome: outcome.clone(),
                        finished_at: Instant::now(),
                    },
                );
            }
        }
        Next::Closed(outcome)
    }

    fn finish(&self, job_id: Uuid, outcome: &JobOutcome, started: Instant) {
        let status = outcome.status;
        self.update_job(job_id, |job| {
            job.failure = outcome.failure.clone();
            job.transition(status)
        });
        let event = match &outcome.failure {
            None => {
                info!(elapsed = ?started.elapsed(), "job succeeded");
                JobEvent::Completed {
                    job_id,
                    duration_secs: started.elapsed().as_secs_f64(),
                }
            }
            Some(failure) => {
                info!(kind = %failure.kind, elapsed = ?started.elapsed(), "job failed");
                JobEvent::Failed {
                    job_id,
                    kind: failure.kind,
                }
            }
        };
        let _ = self.events.send(event);
    }

    fn update_job(&self, job_id: Uuid, f: impl FnOnce(&mut DownloadJob) -> crate::Result<()>) {
        if let Some(mut job) = self.jobs.get_mut(&job_id)
            && let Err(e) = f(&mut job)
        {
            error!(%job_id, error = %e, "job update rejected");
        }
    }

    fn purge_expired(&self) {
        let window = self.config.coalesce_window();
        self.coalesce.lock().retain(|_, entry| match entry {
            Entry::Done { finished_at, .. } => finished_at.elapsed() < window,
            Entry::InFlight(_) => true,
        });
        let cutoff = chrono::Utc::now() - chrono::TimeDelta::seconds(JOB_HISTORY_SECS);
        self.jobs
            .retain(|_, job| !job.status.is_terminal() || job.finished_at.is_none_or(|t| t > cutoff));
    }
}

fn cancelled(provider: ProviderTag, detail: &str) -> JobFailure {
    JobFailure::new(FailureKind::Cancelled, provider, detail)
}

fn settle(
    job_id: Uuid,
    provider: ProviderTag,
    url: &str,
    artifact_kind: Option<ArtifactKind>,
    produced: &Result<MediaArtifact, JobFailure>,
    progress: &Progress,
) -> JobOutcome {
    let failure = match produced {
        Err(failure) => Some(failure.clone()),
        Ok(_) => match &progress.failure {
            Some(failure) => Some(failure.clone()),
            None if progress.delivered == 0 => Some(cancelled(provider, "no recipients left")),
            None => None,
        },
    };
    JobOutcome {
        job_id,
        provider,
        url: url.to_string(),
        status: if failure.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        },
        artifact_kind,
        receipt: progress.receipt.clone(),
        failure,
    }
}
