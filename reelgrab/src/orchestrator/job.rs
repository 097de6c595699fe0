use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use media_providers::{ArtifactKind, ClassifiedLink, FailureKind, ProviderTag};
use serde::Serialize;
use uuid::Uuid;

use crate::recorder::UsageContext;
use crate::{Error, Result};

pub type ChatId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
}

/// Where results for a request go, and which message triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryTarget {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub chat_kind: ChatKind,
    pub sender_id: Option<i64>,
    /// Display name used in group captions.
    pub sender_name: Option<String>,
}

/// An inbound chat message after link classification.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub target: DeliveryTarget,
    pub submitted_text: String,
    pub links: Vec<ClassifiedLink>,
    pub context: UsageContext,
    pub submitted_at: DateTime<Utc>,
}

impl Request {
    pub fn new(target: DeliveryTarget, submitted_text: impl Into<String>, links: Vec<ClassifiedLink>) -> Self {
        let context = match target.chat_kind {
            ChatKind::Private => UsageContext::PrivateLink,
            ChatKind::Group => UsageContext::GroupLink,
        };
        Self {
            id: Uuid::new_v4(),
            target,
            submitted_text: submitted_text.into(),
            links,
            context,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: UsageContext) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// `pending -> running -> {succeeded | failed}`; a pending job may also
    /// fail directly when it is cancelled before admission.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a job failed: a category, a chat-safe notice and internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip)]
    pub detail: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, provider: ProviderTag, detail: impl Into<String>) -> Self {
        Self {
            kind,
            message: kind.user_message(provider),
            detail: detail.into(),
        }
    }
}

/// One classified link being fetched for a request.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: Uuid,
    pub request_id: Uuid,
    pub chat_id: ChatId,
    pub provider: ProviderTag,
    pub url: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub working_directory: Option<PathBuf>,
    pub artifact_kind: Option<ArtifactKind>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn new(request_id: Uuid, chat_id: ChatId, link: &ClassifiedLink) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            chat_id,
            provider: link.provider,
            url: link.url.clone(),
            status: JobStatus::Pending,
            attempt_count: 0,
            working_directory: None,
            artifact_kind: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Succeeded | JobStatus::Failed => self.finished_at = Some(Utc::now()),
            JobStatus::Pending => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DownloadJob {
        let link = ClassifiedLink {
            provider: ProviderTag::TikTok,
            url: "https://tiktok.com/@a/video/1".into(),
            alias: false,
        };
        DownloadJob::new(Uuid::new_v4(), 1, &link)
    }

    #[test]
    fn follows_lifecycle() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Succeeded).unwrap();
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobStatus::Succeeded, JobStatus::Failed] {
            let mut job = job();
            job.transition(JobStatus::Running).unwrap();
            job.transition(terminal).unwrap();
            for next in [JobStatus::Pending, JobStatus::Running, JobStatus::Succeeded, JobStatus::Failed] {
                assert!(job.transition(next).is_err(), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_to_success() {
        let mut job = job();
        let err = job.transition(JobStatus::Succeeded).unwrap_err();
        assert!(err.to_string().contains("pending"));
        assert!(job.transition(JobStatus::Failed).is_ok());
    }
}
