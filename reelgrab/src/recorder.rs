//! Usage statistics.
//!
//! Records go through a bounded channel and are folded into an in-memory
//! [`UsageStats`] by a background task, which writes the JSON file at most
//! once per flush interval and once more on shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use media_providers::{FailureKind, ProviderTag};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::utils::fs::write_atomic;

const CHANNEL_CAPACITY: usize = 1024;

/// How a user reached the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageContext {
    PrivateLink,
    GroupLink,
    RedditCommandPrivate,
    RedditCommandGroup,
    StatsCommand,
    StoryCommand,
    Other,
}

impl UsageContext {
    pub const ALL: [UsageContext; 7] = [
        UsageContext::PrivateLink,
        UsageContext::GroupLink,
        UsageContext::RedditCommandPrivate,
        UsageContext::RedditCommandGroup,
        UsageContext::StatsCommand,
        UsageContext::StoryCommand,
        UsageContext::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageContext::PrivateLink => "private_link",
            UsageContext::GroupLink => "group_link",
            UsageContext::RedditCommandPrivate => "reddit_command_private",
            UsageContext::RedditCommandGroup => "reddit_command_group",
            UsageContext::StatsCommand => "stats_command",
            UsageContext::StoryCommand => "story_command",
            UsageContext::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    /// A command that produced no download job.
    Handled,
    Succeeded,
    Failed(FailureKind),
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub chat_id: i64,
    pub user_id: Option<i64>,
    pub context: UsageContext,
    pub provider: Option<ProviderTag>,
    pub outcome: UsageOutcome,
    pub duration: Duration,
}

/// Observer of terminal outcomes. Must return immediately.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, record: UsageRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl UsageRecorder for NoopRecorder {
    fn record(&self, _record: UsageRecord) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUsage {
    pub call_count: u64,
    pub first_seen_iso: String,
    pub last_seen_iso: String,
    #[serde(default)]
    pub contexts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub succeeded: u64,
    pub failed: u64,
    #[serde(default)]
    pub failures: BTreeMap<String, u64>,
    #[serde(default)]
    pub total_duration_ms: u64,
}

/// Contents of the stats file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub users: BTreeMap<String, UserUsage>,
    #[serde(default)]
    pub totals: BTreeMap<String, u64>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderUsage>,
}

impl UsageStats {
    pub fn apply(&mut self, record: &UsageRecord) {
        let now = Utc::now().to_rfc3339();
        let user_key = record.user_id.unwrap_or(record.chat_id).to_string();
        let user = self.users.entry(user_key).or_default();
        user.call_count += 1;
        if user.first_seen_iso.is_empty() {
            user.first_seen_iso = now.clone();
        }
        user.last_seen_iso = now;
        *user.contexts.entry(record.context.as_str().to_string()).or_insert(0) += 1;

        if let Some(provider) = record.provider {
            let entry = self.providers.entry(provider.as_str().to_string()).or_default();
            match record.outcome {
                UsageOutcome::Succeeded => entry.succeeded += 1,
                UsageOutcome::Failed(kind) => {
                    entry.failed += 1;
                    *entry.failures.entry(kind.as_str().to_string()).or_insert(0) += 1;
                }
                UsageOutcome::Handled => {}
            }
            entry.total_duration_ms += record.duration.as_millis() as u64;
        }
        self.recompute_totals();
    }

    pub fn recompute_totals(&mut self) {
        let mut totals: BTreeMap<String, u64> = UsageContext::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), 0))
            .collect();
        let mut all_calls = 0;
        for user in self.users.values() {
            all_calls += user.call_count;
            for (context, count) in &user.contexts {
                *totals.entry(context.clone()).or_insert(0) += count;
            }
        }
        totals.insert("all_calls".to_string(), all_calls);
        self.totals = totals;
    }

    pub fn total(&self, key: &str) -> u64 {
        self.totals.get(key).copied().unwrap_or(0)
    }

    /// Users ordered by call count, busiest first.
    pub fn top_users(&self, limit: usize) -> Vec<(&str, &UserUsage)> {
        let mut users: Vec<_> = self.users.iter().map(|(k, v)| (k.as_str(), v)).collect();
        users.sort_by(|a, b| b.1.call_count.cmp(&a.1.call_count).then_with(|| a.0.cmp(b.0)));
        users.truncate(limit);
        users
    }
}

/// Read the stats file; a missing or corrupt file starts fresh.
pub async fn load_stats(path: &Path) -> UsageStats {
    let mut stats = match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<UsageStats>(&bytes) {
            Ok(stats) => {
                info!(path = %path.display(), users = stats.users.len(), "loaded usage stats");
                stats
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "stats file is not valid JSON, starting fresh");
                UsageStats::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => UsageStats::default(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read stats file, starting fresh");
            UsageStats::default()
        }
    };
    stats.recompute_totals();
    stats
}

/// JSON file backed recorder.
#[derive(Clone)]
pub struct JsonStatsRecorder {
    tx: mpsc::Sender<UsageRecord>,
    stats: Arc<Mutex<UsageStats>>,
}

impl JsonStatsRecorder {
    /// Load existing stats and start the writer task. The task flushes and
    /// exits once `cancel` fires.
    pub async fn start(
        path: PathBuf,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let stats = Arc::new(Mutex::new(load_stats(&path).await));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = StatsWriter {
            path,
            stats: stats.clone(),
            dirty: false,
        };
        let handle = tokio::spawn(writer.run(rx, flush_interval, cancel));
        (Self { tx, stats }, handle)
    }

    pub fn snapshot(&self) -> UsageStats {
        self.stats.lock().clone()
    }
}

impl UsageRecorder for JsonStatsRecorder {
    fn record(&self, record: UsageRecord) {
        if let Err(e) = self.tx.try_send(record) {
            warn!(error = %e, "usage record dropped");
        }
    }
}

struct StatsWriter {
    path: PathBuf,
    stats: Arc<Mutex<UsageStats>>,
    dirty: bool,
}

impl StatsWriter {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<UsageRecord>,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                record = rx.recv() => match record {
                    Some(record) => self.apply(&record),
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "failed to save usage stats");
                    }
                }
            }
        }

        while let Ok(record) = rx.try_recv() {
            self.apply(&record);
        }
        if let Err(e) = self.flush().await {
            error!(error = %e, "failed to save usage stats on shutdown");
        }
        debug!("usage stats writer stopped");
    }

    fn apply(&mut self, record: &UsageRecord) {
        self.stats.lock().apply(record);
        self.dirty = true;
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let bytes = {
            let stats = self.stats.lock();
            serde_json::to_vec_pretty(&*stats)?
        };
        write_atomic(&self.path, &bytes).await?;
        self.dirty = false;
        debug!(path = %self.path.display(), "saved usage stats");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: i64, context: UsageContext, outcome: UsageOutcome) -> UsageRecord {
        UsageRecord {
            chat_id: -100,
            user_id: Some(user),
            context,
            provider: Some(ProviderTag::TikTok),
            outcome,
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn apply_counts_contexts_and_outcomes() {
        let mut stats = UsageStats::default();
        stats.apply(&record(1, UsageContext::GroupLink, UsageOutcome::Succeeded));
        stats.apply(&record(1, UsageContext::PrivateLink, UsageOutcome::Failed(FailureKind::AuthRequired)));
        stats.apply(&record(2, UsageContext::GroupLink, UsageOutcome::Succeeded));

        assert_eq!(stats.total("all_calls"), 3);
        assert_eq!(stats.total("group_link"), 2);
        assert_eq!(stats.total("reddit_command_group"), 0);
        let tiktok = &stats.providers["tiktok"];
        assert_eq!((tiktok.succeeded, tiktok.failed), (2, 1));
        assert_eq!(tiktok.failures["auth_required"], 1);
        assert_eq!(stats.top_users(1)[0].0, "1");
    }

    #[tokio::test]
    async fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, "{not json").unwrap();
        let stats = load_stats(&path).await;
        assert!(stats.users.is_empty());
        assert_eq!(stats.total("all_calls"), 0);
    }

    #[tokio::test]
    async fn flushes_on_shutdown_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let cancel = CancellationToken::new();
        let (recorder, handle) =
            JsonStatsRecorder::start(path.clone(), Duration::from_secs(3600), cancel.clone()).await;

        recorder.record(record(42, UsageContext::StoryCommand, UsageOutcome::Succeeded));
        recorder.record(record(42, UsageContext::StatsCommand, UsageOutcome::Handled));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let reloaded = load_stats(&path).await;
        assert_eq!(reloaded.users["42"].call_count, 2);
        assert_eq!(reloaded.total("story_command"), 1);
        assert_eq!(reloaded, recorder.snapshot());
    }
}
