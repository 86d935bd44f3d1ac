use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentId, ConversationId, Credential, MessageId, UserId};

/// Body of `POST /auth/login`, `POST /auth/register` and `POST /auth/refresh`.
pub type AuthResponse = Credential;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLite {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "user1_id")]
    pub participant_a_id: UserId,
    #[serde(rename = "user2_id")]
    pub participant_b_id: UserId,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "peer")]
    pub peer_summary: Option<UserLite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateConversationRequest {
    pub partner_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(rename = "storage")]
    pub storage_provider: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<MessageId>,
}

/// Per-id outcome of `DELETE /messages/bulk`. Only `deleted` ids were removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteResult {
    #[serde(default)]
    pub deleted: Vec<MessageId>,
    #[serde(default)]
    pub forbidden: Vec<MessageId>,
    #[serde(default)]
    pub not_found: Vec<MessageId>,
}

impl BulkDeleteResult {
    pub fn is_partial(&self) -> bool {
        !self.forbidden.is_empty() || !self.not_found.is_empty()
    }
}

/// One element of the `POST /upload` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMeta {
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub storage: String,
    #[serde(default)]
    pub provider_id: Option<String>,
}

/// Attachment reference carried by an outbound `send_message` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttachment {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl From<UploadMeta> for NewAttachment {
    fn from(meta: UploadMeta) -> Self {
        Self {
            file_path: meta.file_path,
            file_name: Some(meta.file_name),
            mime: meta.mime,
            size_bytes: meta.size_bytes,
            storage: Some(meta.storage),
        }
    }
}

/// Frames pushed by the server over the per-conversation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connected")]
    Connected {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    #[serde(rename = "message:new")]
    MessageNew { message: Message },
    #[serde(rename = "message:edited")]
    MessageEdited { message: Message },
    #[serde(rename = "message:deleted")]
    MessageDeleted { message_ids: Vec<MessageId> },
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Classifies a raw text frame. Anything that is not a well-formed known
    /// frame, including a known `type` with a malformed body, is `Unknown`.
    pub fn decode(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or(ServerFrame::Unknown)
    }
}

/// Frames the client may push. There is exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "send_message")]
    SendMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<NewAttachment>,
    },
}

/// Lenient timestamp codec: RFC 3339 with offset, or a naive ISO-8601 value
/// taken as UTC. Unparseable values decode to `None` instead of failing the
/// whole payload.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}
