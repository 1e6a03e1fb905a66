use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type ChatId = i64;

/// Name shown for a counterpart whose profile has not been fetched yet.
pub const LOADING_NAME: &str = "Loading…";

/// Identity of a conversation in the directory.
///
/// `Durable` conversations exist on the server. `Pending` ones are local
/// placeholders keyed by the counterpart, created before the first message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationRef {
    Durable(ChatId),
    Pending(UserId),
}

impl ConversationRef {
    pub fn is_pending(&self) -> bool {
        matches!(self, ConversationRef::Pending(_))
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            ConversationRef::Durable(id) => Some(*id),
            ConversationRef::Pending(_) => None,
        }
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationRef::Durable(id) => write!(f, "chat {id}"),
            ConversationRef::Pending(user) => write!(f, "pending chat with user {user}"),
        }
    }
}

/// Public identity of another user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, alias = "avatar_url", alias = "avatar_path")]
    pub avatar: Option<String>,
}

impl UserSummary {
    pub fn stub(id: UserId) -> Self {
        Self {
            id,
            name: LOADING_NAME.to_string(),
            last_name: None,
            avatar: None,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.name == LOADING_NAME
    }

    pub fn display_name(&self) -> String {
        match self.last_name.as_deref().map(str::trim) {
            Some(last) if !last.is_empty() => format!("{} {}", self.name, last),
            _ if self.name.is_empty() => format!("User {}", self.id),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(alias = "media_url")]
    pub url: String,
    #[serde(default, alias = "media_type")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "media")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    pub fn is_unread_from_others(&self, me: UserId) -> bool {
        !self.is_read && self.sender_id != me
    }
}

/// One entry of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationRef,
    pub counterpart: UserSummary,
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: Option<Message>,
}

impl Conversation {
    pub fn placeholder(counterpart: UserId) -> Self {
        Self {
            id: ConversationRef::Pending(counterpart),
            counterpart: UserSummary::stub(counterpart),
            unread_count: 0,
            last_message: None,
        }
    }

    pub fn title(&self) -> String {
        self.counterpart.display_name()
    }
}

/// A conversation as the backend serialises it.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRecord {
    pub id: ChatId,
    #[serde(default, alias = "counterpart")]
    pub other_user: Option<UserSummary>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: Option<Message>,
}

impl ChatRecord {
    /// Server records must carry a positive id and a counterpart; anything
    /// else cannot be selected or messaged.
    pub fn into_conversation(self) -> Option<Conversation> {
        if self.id <= 0 {
            return None;
        }
        let counterpart = self.other_user?;
        Some(Conversation {
            id: ConversationRef::Durable(self.id),
            counterpart,
            unread_count: self.unread_count,
            last_message: self.last_message,
        })
    }
}

/// A file queued for the multipart send endpoint.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    pub async fn from_path(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let content_type = guess_content_type(&file_name).map(str::to_string);
        Ok(Self {
            file_name,
            content_type,
            bytes,
        })
    }
}

fn guess_content_type(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    Some(match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        _ => return None,
    })
}
