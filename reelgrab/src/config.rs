//! Runtime configuration read from the environment (and `.env`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use media_providers::adapter::Credentials;
use media_providers::adapters::ExtractorTools;
use media_providers::{ProviderTag, RetryConfig};
use serde::{Deserialize, Serialize};

use crate::logging::{LogMode, LogSettings};
use crate::{Error, Result};

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(skip_serializing)]
    pub token: String,
    /// When set, group chats other than this one are ignored.
    pub target_group_id: Option<i64>,
    pub owner_id: Option<i64>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Long-poll timeout passed to `getUpdates`.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Bot API upload ceiling.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_max_upload_mb() -> u64 {
    50
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            target_group_id: None,
            owner_id: None,
            api_base: default_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

/// Admission, timeout and retry bounds for the acquisition pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub per_chat_limit: usize,
    pub global_limit: usize,
    /// Identical (chat, url) submissions inside this window share one job.
    pub coalesce_window_secs: u64,
    pub adapter_timeout_secs: u64,
    pub synthesis_timeout_secs: u64,
    /// Parent of every job working directory.
    pub temp_root: PathBuf,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            per_chat_limit: 2,
            global_limit: 4,
            coalesce_window_secs: 30,
            adapter_timeout_secs: 300,
            synthesis_timeout_secs: 180,
            temp_root: std::env::temp_dir().join("reelgrab"),
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_secs(self.coalesce_window_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}

/// External media tools used after extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaToolsConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Display time per slideshow image when the provider gives none.
    pub default_frame_secs: f64,
    /// Re-encode downloaded videos before sending.
    pub optimize_videos: bool,
}

impl Default for MediaToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            default_frame_secs: 2.0,
            optimize_videos: true,
        }
    }
}

/// Session cookie files, one per provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub instagram_cookie_file: Option<PathBuf>,
    pub tiktok_cookie_file: Option<PathBuf>,
    pub youtube_cookie_file: Option<PathBuf>,
}

impl CredentialsConfig {
    pub fn build(&self) -> Credentials {
        let entries = [
            (ProviderTag::Instagram, &self.instagram_cookie_file),
            (ProviderTag::TikTok, &self.tiktok_cookie_file),
            (ProviderTag::YouTube, &self.youtube_cookie_file),
        ];
        entries
            .into_iter()
            .filter_map(|(tag, path)| path.as_ref().map(|p| (tag, p)))
            .fold(Credentials::new(), |creds, (tag, path)| {
                creds.with_cookie_file(tag, path)
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    pub path: PathBuf,
    pub flush_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("user_stats.json"),
            flush_interval_secs: 60,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub pipeline: PipelineConfig,
    pub extractors: ExtractorTools,
    pub media: MediaToolsConfig,
    pub credentials: CredentialsConfig,
    /// JSON file replacing the built-in link classification table.
    pub link_rules_file: Option<PathBuf>,
    pub stats: StatsConfig,
    pub logging: LogSettings,
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);
        let mut cfg = Self::default();

        if let Some(token) = env.string("TELEGRAM_BOT_TOKEN") {
            cfg.bot.token = token;
        }
        cfg.bot.target_group_id = env.parse("TARGET_GROUP_ID")?;
        cfg.bot.owner_id = env.parse("BOT_OWNER_ID")?;
        if let Some(base) = env.string("TELEGRAM_API_BASE") {
            cfg.bot.api_base = base;
        }
        env.set("MAX_UPLOAD_MB", &mut cfg.bot.max_upload_mb)?;

        let p = &mut cfg.pipeline;
        env.set("PER_CHAT_LIMIT", &mut p.per_chat_limit)?;
        env.set("GLOBAL_LIMIT", &mut p.global_limit)?;
        env.set("COALESCE_WINDOW_SECS", &mut p.coalesce_window_secs)?;
        env.set("ADAPTER_TIMEOUT_SECS", &mut p.adapter_timeout_secs)?;
        env.set("SYNTHESIS_TIMEOUT_SECS", &mut p.synthesis_timeout_secs)?;
        env.set("FETCH_MAX_RETRIES", &mut p.retry.max_retries)?;
        env.set("RETRY_INITIAL_DELAY_MS", &mut p.retry.initial_delay_ms)?;
        env.set("RETRY_MAX_DELAY_MS", &mut p.retry.max_delay_ms)?;
        if let Some(root) = env.string("TEMP_ROOT") {
            p.temp_root = PathBuf::from(root);
        }

        env.set_path("YT_DLP_PATH", &mut cfg.extractors.yt_dlp);
        env.set_path("GALLERY_DL_PATH", &mut cfg.extractors.gallery_dl);
        env.set_path("FFMPEG_PATH", &mut cfg.media.ffmpeg);
        env.set_path("FFPROBE_PATH", &mut cfg.media.ffprobe);
        env.set("SLIDE_SECS", &mut cfg.media.default_frame_secs)?;
        env.set("OPTIMIZE_VIDEOS", &mut cfg.media.optimize_videos)?;

        cfg.credentials.instagram_cookie_file = env.string("INSTAGRAM_COOKIE_FILE").map(PathBuf::from);
        cfg.credentials.tiktok_cookie_file = env.string("TIKTOK_COOKIE_FILE").map(PathBuf::from);
        cfg.credentials.youtube_cookie_file = env.string("YOUTUBE_COOKIE_FILE").map(PathBuf::from);
        cfg.link_rules_file = env.string("LINK_RULES_FILE").map(PathBuf::from);

        env.set_path("STATS_JSON_PATH", &mut cfg.stats.path);

        if let Some(mode) = env.string("LOGGING_MODE") {
            cfg.logging.mode = mode.parse::<LogMode>().map_err(Error::config)?;
        }
        env.set_path("LOG_DIR", &mut cfg.logging.dir);
        env.set("LOG_RETENTION_DAYS", &mut cfg.logging.retention_days)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.per_chat_limit == 0 || self.pipeline.global_limit == 0 {
            return Err(Error::config("concurrency limits must be at least 1"));
        }
        if !(self.media.default_frame_secs.is_finite() && self.media.default_frame_secs > 0.0) {
            return Err(Error::config("SLIDE_SECS must be a positive number"));
        }
        Ok(())
    }

    /// Fails when the bot cannot start.
    pub fn require_bot_token(&self) -> Result<&str> {
        if self.bot.token.is_empty() {
            return Err(Error::config("TELEGRAM_BOT_TOKEN is required"));
        }
        Ok(&self.bot.token)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.bot.max_upload_mb * 1024 * 1024
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| Error::config(format!("invalid {key}={raw}: {e}")))
            })
            .transpose()
    }

    fn set<T: FromStr>(&self, key: &str, slot: &mut T) -> Result<()>
    where
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse(key)? {
            *slot = value;
        }
        Ok(())
    }

    fn set_path(&self, key: &str, slot: &mut PathBuf) {
        if let Some(value) = self.string(key) {
            *slot = PathBuf::from(value);
        }
    }
}
