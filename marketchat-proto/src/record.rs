//! Typed chat records and their decoding from store documents.
//!
//! The store is schemaless, so every read passes through the
//! `from_document` constructors here. They accept what a document store
//! legitimately produces (floats for counters, missing optional fields,
//! `null` previews) and reject anything structurally wrong, so the rest of
//! the core only ever handles complete records.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::identity::ConversationId;
use crate::ids::{ItemId, MessageId, SYSTEM_SENDER, UserId};
use crate::paths;

/// Field names used in stored documents.
pub mod field {
    /// Conversation id copy inside the conversation record.
    pub const ID: &str = "id";
    /// Listing id.
    pub const ITEM_ID: &str = "itemId";
    /// Listing title snapshot.
    pub const ITEM_NAME: &str = "itemName";
    /// Listing image snapshot.
    pub const ITEM_IMAGE: &str = "itemImage";
    /// Sorted pair of participant ids.
    pub const PARTICIPANTS: &str = "participants";
    /// Participant id to display name.
    pub const USER_NAMES: &str = "userNames";
    /// Server creation time.
    pub const CREATED_AT: &str = "createdAt";
    /// Denormalized preview of the newest message.
    pub const LAST_MESSAGE: &str = "lastMessage";
    /// Time of the newest message (pointer records).
    pub const LAST_MESSAGE_TIME: &str = "lastMessageTime";
    /// Conversation id copy inside pointer records.
    pub const CONVERSATION_ID: &str = "conversationId";
    /// Counterpart id (pointer records).
    pub const OTHER_USER_ID: &str = "otherUserId";
    /// Counterpart display name (pointer records).
    pub const OTHER_USER_NAME: &str = "otherUserName";
    /// Messages not yet seen by the pointer's owner.
    pub const UNREAD_COUNT: &str = "unreadCount";
    /// Author of a message.
    pub const SENDER_ID: &str = "senderId";
    /// Message body.
    pub const TEXT: &str = "text";
    /// Server time of a message.
    pub const TIMESTAMP: &str = "timestamp";
    /// Listing owner.
    pub const OWNER_ID: &str = "ownerId";
    /// Listing title.
    pub const TITLE: &str = "title";
    /// Listing image.
    pub const IMAGE_URL: &str = "imageUrl";
}

/// Errors produced when a document does not hold a valid record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The document fields do not match the record shape.
    #[error("document {path} could not be decoded: {source}")]
    Decode {
        /// Path of the offending document.
        path: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },

    /// The document decoded but violates a record invariant.
    #[error("document {path} is invalid: {reason}")]
    Invalid {
        /// Path of the offending document.
        path: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Millisecond-precision UTC timestamp assigned by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// A pending server timestamp reads back as null; treat it as "not yet known".
impl<'de> Deserialize<'de> for Timestamp {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Self(0)),
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .or_else(|| n.as_i64().map(|_| 0))
                .map(Self)
                .ok_or_else(|| D::Error::custom("timestamp out of range")),
            other => Err(D::Error::custom(format!(
                "expected a timestamp, found {other}"
            ))),
        }
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SenderId {
    /// A participant.
    User(UserId),
    /// Automated notice posted by the application.
    System,
}

impl SenderId {
    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::User(user) => user.as_str(),
            Self::System => SYSTEM_SENDER,
        }
    }

    /// Returns `true` if the message was written by `user`.
    #[must_use]
    pub fn is_user(&self, user: &UserId) -> bool {
        matches!(self, Self::User(id) if id == user)
    }
}

impl From<String> for SenderId {
    fn from(value: String) -> Self {
        if value == SYSTEM_SENDER {
            Self::System
        } else {
            Self::User(UserId::new(value))
        }
    }
}

impl From<SenderId> for String {
    fn from(value: SenderId) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing fields copied into chat records when a conversation starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemSnapshot {
    /// Listing title at the time of the snapshot.
    pub title: String,
    /// Listing image URL, if the listing had one.
    pub image_url: Option<String>,
}

impl ItemSnapshot {
    /// Creates a snapshot with a title and optional image.
    pub fn new(title: impl Into<String>, image_url: Option<String>) -> Self {
        Self {
            title: title.into(),
            image_url,
        }
    }
}

/// Denormalized copy of the newest message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    /// Message body.
    #[serde(default)]
    pub text: String,
    /// Server time of the message.
    #[serde(default)]
    pub timestamp: Timestamp,
    /// Who wrote it.
    pub sender_id: SenderId,
}

/// The global record of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Derived conversation id.
    pub id: ConversationId,
    /// Listing the conversation is about.
    pub item_id: ItemId,
    /// Listing snapshot taken when the conversation started.
    pub item: ItemSnapshot,
    /// The two participants, in stored order.
    pub participants: [UserId; 2],
    /// Display names known at creation time.
    pub user_names: BTreeMap<UserId, String>,
    /// Server creation time.
    pub created_at: Timestamp,
    /// Preview of the newest message, if any was sent.
    pub last_message: Option<LastMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConversation {
    item_id: ItemId,
    #[serde(default)]
    item_name: Option<String>,
    #[serde(default)]
    item_image: Option<String>,
    participants: Vec<UserId>,
    #[serde(default)]
    user_names: BTreeMap<UserId, String>,
    #[serde(default)]
    created_at: Timestamp,
    #[serde(default)]
    last_message: Option<LastMessage>,
}

impl Conversation {
    /// Decodes a document at `chats/{id}`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the fields do not decode or the record does
    /// not have exactly two distinct participants.
    pub fn from_document(doc: &Document) -> Result<Self, RecordError> {
        if doc.path.parent() != paths::conversations() {
            return Err(invalid(doc, "not a conversation path"));
        }
        let raw: RawConversation = decode(doc)?;
        let [first, second]: [UserId; 2] = raw
            .participants
            .try_into()
            .map_err(|_| invalid(doc, "participants must hold exactly two users"))?;
        if first == second || first.is_empty() || second.is_empty() {
            return Err(invalid(doc, "participants must be two distinct users"));
        }

        Ok(Self {
            id: ConversationId::from_raw(doc.id()),
            item_id: raw.item_id,
            item: ItemSnapshot {
                title: raw.item_name.unwrap_or_default(),
                image_url: raw.item_image,
            },
            participants: [first, second],
            user_names: raw.user_names,
            created_at: raw.created_at,
            last_message: raw.last_message,
        })
    }

    /// Returns `true` if `user` is a participant.
    #[must_use]
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Returns the participant that is not `user`.
    #[must_use]
    pub fn other_participant(&self, user: &UserId) -> Option<&UserId> {
        match &self.participants {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }

    /// Returns the display name recorded for `user`, if any.
    #[must_use]
    pub fn name_of(&self, user: &UserId) -> Option<&str> {
        self.user_names.get(user).map(String::as_str)
    }
}

/// One participant's index entry for a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPointer {
    /// User whose chat list this entry belongs to.
    pub owner: UserId,
    /// Conversation the entry points at.
    pub conversation_id: ConversationId,
    /// The other participant.
    pub other_user_id: UserId,
    /// The other participant's display name.
    pub other_user_name: String,
    /// Listing the conversation is about.
    pub item_id: ItemId,
    /// Listing snapshot.
    pub item: ItemSnapshot,
    /// Preview text of the newest message.
    pub last_message: String,
    /// Time of the newest message.
    pub last_message_time: Timestamp,
    /// Messages the owner has not seen yet.
    pub unread_count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPointer {
    other_user_id: UserId,
    #[serde(default)]
    other_user_name: Option<String>,
    item_id: ItemId,
    #[serde(default)]
    item_name: Option<String>,
    #[serde(default)]
    item_image: Option<String>,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_time: Timestamp,
    #[serde(default, deserialize_with = "lenient_count")]
    unread_count: u32,
}

impl ConversationPointer {
    /// Decodes a document at `userChats/{owner}/chats/{conversationId}`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the path or fields do not match.
    pub fn from_document(doc: &Document) -> Result<Self, RecordError> {
        let segments: Vec<&str> = doc.path.segments().collect();
        let &[paths::USER_CHATS, owner, paths::USER_CHAT_ENTRIES, conversation] =
            segments.as_slice()
        else {
            return Err(invalid(doc, "not a conversation pointer path"));
        };
        let raw: RawPointer = decode(doc)?;

        Ok(Self {
            owner: UserId::new(owner),
            conversation_id: ConversationId::from_raw(conversation),
            other_user_id: raw.other_user_id,
            other_user_name: raw.other_user_name.unwrap_or_default(),
            item_id: raw.item_id,
            item: ItemSnapshot {
                title: raw.item_name.unwrap_or_default(),
                image_url: raw.item_image,
            },
            last_message: raw.last_message.unwrap_or_default(),
            last_message_time: raw.last_message_time,
            unread_count: raw.unread_count,
        })
    }
}

/// One line in a conversation's append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Store-assigned id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender: SenderId,
    /// Body.
    pub text: String,
    /// Server time; messages are ordered by this field.
    pub timestamp: Timestamp,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    sender_id: SenderId,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    timestamp: Timestamp,
}

impl Message {
    /// Decodes a document at `chats/{conversationId}/messages/{messageId}`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the path or fields do not match.
    pub fn from_document(doc: &Document) -> Result<Self, RecordError> {
        let segments: Vec<&str> = doc.path.segments().collect();
        let &[paths::CHATS, conversation, paths::MESSAGES, id] = segments.as_slice() else {
            return Err(invalid(doc, "not a message path"));
        };
        let raw: RawMessage = decode(doc)?;

        Ok(Self {
            id: MessageId::new(id),
            conversation_id: ConversationId::from_raw(conversation),
            sender: raw.sender_id,
            text: raw.text.unwrap_or_default(),
            timestamp: raw.timestamp,
        })
    }

    /// Returns `true` if `user` wrote this message.
    #[must_use]
    pub fn is_from(&self, user: &UserId) -> bool {
        self.sender.is_user(user)
    }
}

/// A marketplace listing, as far as the chat core needs to know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    /// Listing id.
    pub id: ItemId,
    /// User who posted it.
    pub owner_id: UserId,
    /// Current title.
    pub title: String,
    /// Current image URL.
    pub image_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawListing {
    owner_id: UserId,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

impl Listing {
    /// Decodes a document at `items/{itemId}`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the fields do not match.
    pub fn from_document(doc: &Document) -> Result<Self, RecordError> {
        if doc.path.parent() != paths::listings() {
            return Err(invalid(doc, "not a listing path"));
        }
        let raw: RawListing = decode(doc)?;
        Ok(Self {
            id: ItemId::new(doc.id()),
            owner_id: raw.owner_id,
            title: raw.title.unwrap_or_default(),
            image_url: raw.image_url,
        })
    }

    /// Returns the fields copied into chat records.
    #[must_use]
    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot::new(self.title.clone(), self.image_url.clone())
    }
}

fn decode<T: serde::de::DeserializeOwned>(doc: &Document) -> Result<T, RecordError> {
    serde_json::from_value(Value::Object(doc.data.clone())).map_err(|source| RecordError::Decode {
        path: doc.path.to_string(),
        source,
    })
}

fn invalid(doc: &Document, reason: &str) -> RecordError {
    RecordError::Invalid {
        path: doc.path.to_string(),
        reason: reason.to_string(),
    }
}

/// Counters written by concurrent increments may come back as floats or,
/// after a bad manual edit, negative; clamp into `u32`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn lenient_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => {
            let value = n
                .as_i64()
                .map_or_else(|| n.as_f64().unwrap_or_default(), |i| i as f64);
            Ok(value.clamp(0.0, f64::from(u32::MAX)) as u32)
        }
        other => Err(D::Error::custom(format!("expected a count, found {other}"))),
    }
}
