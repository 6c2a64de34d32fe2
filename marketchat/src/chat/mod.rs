//! Chat core for `MarketChat`.
//!
//! [`ConversationStore`] reads and writes conversations, pointers and
//! messages; [`SubscriptionManager`] keeps the live chat list and the active
//! conversation's messages in memory; [`ChatSession`] ties both to one
//! logged-in user.

pub mod denorm;
pub mod retry;
pub mod session;
pub mod store;
pub mod subscription;
pub mod unread;

use marketchat_proto::identity::{ConversationId, IdentityError};
use marketchat_proto::ids::UserId;
use marketchat_proto::record::{ItemSnapshot, RecordError};
use marketchat_proto::store::StoreError;

pub use session::{ChatSession, ConversationDetails, SessionConfig};
pub use store::{ConversationStore, SentMessage};
pub use subscription::{ChatListView, MessagesView, SubscriptionManager};

/// The signed-in user, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Stable user id.
    pub id: UserId,
    /// Display name shown to counterparts.
    pub display_name: String,
}

impl AuthUser {
    /// Creates a user from an id and display name.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
        }
    }
}

/// One side of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// User id.
    pub id: UserId,
    /// Display name recorded for the counterpart.
    pub name: String,
}

impl Participant {
    /// Creates a participant.
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl From<&AuthUser> for Participant {
    fn from(user: &AuthUser) -> Self {
        Self::new(user.id.clone(), user.display_name.clone())
    }
}

/// What a first message needs to create its conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackInit {
    /// The user being written to.
    pub recipient: Participant,
    /// Listing snapshot to store with the conversation.
    pub item: ItemSnapshot,
}

/// Input rejected before any store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A participant id is missing.
    #[error("user id is required")]
    MissingUserId,

    /// The listing id is missing.
    #[error("item id is required")]
    MissingItemId,

    /// The listing title is missing.
    #[error("item title is required")]
    MissingItemTitle,

    /// The message has no text.
    #[error("message text is empty")]
    EmptyMessage,
}

/// Errors returned by chat write operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Input failed validation; nothing was written.
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    /// The conversation id could not be derived or decomposed.
    #[error("invalid conversation identity: {0}")]
    Identity(#[from] IdentityError),

    /// No user is signed in.
    #[error("not signed in")]
    NotAuthenticated,

    /// The user is not one of the conversation's participants.
    #[error("{user} is not a participant of {conversation}")]
    NotParticipant {
        /// Acting user.
        user: UserId,
        /// Conversation they tried to use.
        conversation: ConversationId,
    },

    /// The conversation does not exist and could not be created.
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    /// A write was acknowledged but is not visible as written.
    #[error("conversation {id} is inconsistent after write: {reason}")]
    InconsistentWrite {
        /// Conversation being initialized.
        id: ConversationId,
        /// What the verification read found.
        reason: String,
    },

    /// The document store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A stored record could not be decoded.
    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

impl ChatError {
    /// Returns a generic notice for end users that does not reveal store
    /// internals.
    #[must_use]
    pub const fn user_notice(&self) -> &'static str {
        match self {
            Self::Validation(ValidationError::EmptyMessage) => "Type a message first.",
            Self::Validation(_) | Self::Identity(_) => {
                "Some required information is missing. Please check and try again."
            }
            Self::NotAuthenticated => "Please sign in to chat.",
            Self::NotParticipant { .. } | Self::ConversationNotFound(_) => {
                "This conversation is not available."
            }
            Self::Store(StoreError::Unavailable(_)) => {
                "You are offline. Your message was not sent."
            }
            Self::InconsistentWrite { .. } | Self::Store(_) | Self::Record(_) => {
                "Something went wrong. Please try again."
            }
        }
    }
}
