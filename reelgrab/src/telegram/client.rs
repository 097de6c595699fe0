use std::path::Path;
use std::time::Duration;

use media_providers::MediaKind;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::TelegramError;
use super::types::{ApiResponse, Message, Update};
use crate::utils::http_client::build_client;

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Caption limit for media messages.
const TELEGRAM_CAPTION_LIMIT: usize = 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the bytes of a media message come from.
#[derive(Debug, Clone, Copy)]
pub enum MediaSource<'a> {
    File(&'a Path),
    FileId(&'a str),
    Url(&'a str),
}

enum Body<'a> {
    Json(Value),
    Upload {
        fields: Value,
        field: &'static str,
        path: &'a Path,
    },
}

/// Minimal Bot API client.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: Client,
    base: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str) -> Result<Self, TelegramError> {
        let http = build_client(concat!("reelgrab/", env!("CARGO_PKG_VERSION")))?;
        Ok(Self {
            http,
            base: format!("{}/bot{token}", api_base.trim_end_matches('/')),
        })
    }

    /// Long-poll for new updates after `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, TelegramError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        let timeout = Duration::from_secs(timeout_secs) + REQUEST_TIMEOUT;
        self.call("getUpdates", Body::Json(body), timeout).await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<Message, TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": truncate_message(text, TELEGRAM_MESSAGE_LIMIT),
            "parse_mode": "HTML",
            "link_preview_options": {"is_disabled": true},
        });
        if let Some(message_id) = reply_to {
            body["reply_parameters"] = reply_parameters(message_id);
        }
        self.call("sendMessage", Body::Json(body), REQUEST_TIMEOUT).await
    }

    /// Send one media item, uploading it, re-sending a `file_id` or letting
    /// Telegram fetch a URL.
    pub async fn send_media(
        &self,
        chat_id: i64,
        kind: MediaKind,
        source: MediaSource<'_>,
        caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<Message, TelegramError> {
        let (method, field) = media_method(kind);
        let mut fields = json!({ "chat_id": chat_id });
        if let Some(caption) = caption {
            fields["caption"] = json!(truncate_message(caption, TELEGRAM_CAPTION_LIMIT));
            fields["parse_mode"] = json!("HTML");
        }
        if kind == MediaKind::Video {
            fields["supports_streaming"] = json!(true);
        }
        if let Some(message_id) = reply_to {
            fields["reply_parameters"] = reply_parameters(message_id);
        }

        let body = match source {
            MediaSource::File(path) => Body::Upload { fields, field, path },
            MediaSource::FileId(id) | MediaSource::Url(id) => {
                fields[field] = json!(id);
                Body::Json(fields)
            }
        };
        self.call(method, body, UPLOAD_TIMEOUT).await
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<bool, TelegramError> {
        let body = json!({ "chat_id": chat_id, "message_id": message_id });
        self.call("deleteMessage", Body::Json(body), REQUEST_TIMEOUT).await
    }

    /// Send request with rate limit handling.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: Body<'_>,
        timeout: Duration,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{method}", self.base);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let request = self.http.post(&url).timeout(timeout);
            let request = match &body {
                Body::Json(value) => request.json(value),
                Body::Upload { fields, field, path } => {
                    request.multipart(upload_form(fields, *field, path).await?)
                }
            };
            let response = request.send().await?;
            let status = response.status();
            let parsed: ApiResponse<T> = response.json().await?;

            if parsed.ok {
                return parsed.result.ok_or(TelegramError::EmptyResult(method));
            }

            let code = parsed.error_code.unwrap_or_else(|| i64::from(status.as_u16()));
            if code == 429 {
                let retry_after = parsed
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        method,
                        ?retry_after,
                        "Telegram rate limit: max retries ({MAX_RATE_LIMIT_RETRIES}) exceeded"
                    );
                    return Err(TelegramError::RateLimited(MAX_RATE_LIMIT_RETRIES));
                }

                let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    method,
                    "Telegram rate limited (429), waiting {wait_duration:?} before retry (attempt {attempts}/{MAX_RATE_LIMIT_RETRIES})"
                );
                tokio::time::sleep(wait_duration).await;
                continue;
            }

            return Err(TelegramError::Api {
                code,
                description: parsed.description.unwrap_or_else(|| status.to_string()),
            });
        }
    }
}

fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Image => ("sendPhoto", "photo"),
        MediaKind::Audio => ("sendDocument", "document"),
    }
}

fn reply_parameters(message_id: i64) -> Value {
    json!({ "message_id": message_id, "allow_sending_without_reply": true })
}

/// Multipart forms cannot be cloned, so each attempt reads the file again.
async fn upload_form(fields: &Value, field: &'static str, path: &Path) -> Result<Form, TelegramError> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| field.to_string());
    let mut form = Form::new().part(field, Part::bytes(bytes).file_name(file_name));
    if let Some(map) = fields.as_object() {
        for (key, value) in map {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }
    }
    Ok(form)
}

/// Truncate a message to fit within the Telegram character limit.
pub(crate) fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit - suffix.len();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(truncate_message("hello", TELEGRAM_MESSAGE_LIMIT), "hello");
    }

    #[test]
    fn long_messages_fit_the_limit() {
        let text = "é".repeat(5000);
        let out = truncate_message(&text, TELEGRAM_MESSAGE_LIMIT);
        assert_eq!(out.chars().count(), TELEGRAM_MESSAGE_LIMIT);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn media_kinds_map_to_methods() {
        assert_eq!(media_method(MediaKind::Video), ("sendVideo", "video"));
        assert_eq!(media_method(MediaKind::Image), ("sendPhoto", "photo"));
        assert_eq!(media_method(MediaKind::Audio).0, "sendDocument");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = TelegramClient::new("https://api.telegram.org/", "1:abc").unwrap();
        assert_eq!(client.base, "https://api.telegram.org/bot1:abc");
    }

    #[tokio::test]
    async fn upload_form_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"0123456789").unwrap();
        let fields = json!({"chat_id": 5, "supports_streaming": true});
        let form = upload_form(&fields, "video", &path).await.unwrap();
        assert!(!form.boundary().is_empty());
    }
}
