use serde::Deserialize;

use crate::orchestrator::ChatKind;

/// Envelope of every Bot API response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
    pub migrate_to_chat_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub video: Option<FileRef>,
    pub animation: Option<FileRef>,
    pub document: Option<FileRef>,
    pub audio: Option<FileRef>,
    pub photo: Option<Vec<PhotoSize>>,
    pub reply_to_message: Option<Box<Message>>,
}

impl Message {
    pub fn text_or_caption(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    pub fn chat_kind(&self) -> ChatKind {
        self.chat.kind()
    }

    /// `file_id` of the media this message carries; the largest photo size
    /// for photos.
    pub fn file_id(&self) -> Option<&str> {
        self.video
            .as_ref()
            .or(self.animation.as_ref())
            .or(self.document.as_ref())
            .or(self.audio.as_ref())
            .map(|f| f.file_id.as_str())
            .or_else(|| {
                self.photo
                    .as_ref()
                    .and_then(|sizes| sizes.iter().max_by_key(|p| p.width * p.height))
                    .map(|p| p.file_id.as_str())
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    pub title: Option<String>,
    pub username: Option<String>,
}

impl Chat {
    pub fn kind(&self) -> ChatKind {
        if self.chat_type == "private" {
            ChatKind::Private
        } else {
            ChatKind::Group
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl User {
    pub fn display_name(&self) -> String {
        match (&self.username, &self.last_name) {
            (Some(username), _) => format!("@{username}"),
            (None, Some(last)) => format!("{} {last}", self.first_name),
            (None, None) => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
}
