//! Deterministic conversation identity.
//!
//! A conversation is identified by the two participants and the listing it
//! is about. The id is built by sorting the two user ids, joining them with
//! [`SEPARATOR`], and appending the item id after a second separator:
//!
//! ```text
//! derive("U2", "U1", "ITEM42") == "U1_U2_ITEM42"
//! ```
//!
//! User ids must never contain the separator, which is enforced at
//! derivation time. Item ids may contain it: decomposition splits off
//! exactly two leading segments and keeps the remainder verbatim.

use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, UserId};

/// Separator placed between the id segments.
pub const SEPARATOR: char = '_';

/// Errors produced when deriving or decomposing a conversation id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// One of the user ids is empty.
    #[error("user id is empty")]
    EmptyUserId,

    /// The item id is empty.
    #[error("item id is empty")]
    EmptyItemId,

    /// Both participants are the same user.
    #[error("a conversation needs two distinct users, got {0} twice")]
    SameUser(UserId),

    /// A user id contains the separator and would make the id ambiguous.
    #[error("user id {0:?} contains the reserved separator '{SEPARATOR}'")]
    SeparatorInUserId(String),

    /// An id contains a character that cannot appear in a document path.
    #[error("id {0:?} contains '/'")]
    SlashInId(String),

    /// The string is not of the form `<user>_<user>_<item>`.
    #[error("malformed conversation id {0:?}")]
    Malformed(String),
}

/// Identifier of a conversation between two users about one listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Derives the conversation id for `a`, `b` and `item`.
    ///
    /// The result does not depend on the order of `a` and `b`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if any id is empty, the users are equal,
    /// a user id contains [`SEPARATOR`], or any id contains `/`.
    pub fn derive(a: &UserId, b: &UserId, item: &ItemId) -> Result<Self, IdentityError> {
        check_user(a)?;
        check_user(b)?;
        if item.is_empty() {
            return Err(IdentityError::EmptyItemId);
        }
        if item.as_str().contains('/') {
            return Err(IdentityError::SlashInId(item.to_string()));
        }
        if a == b {
            return Err(IdentityError::SameUser(a.clone()));
        }

        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{low}{SEPARATOR}{high}{SEPARATOR}{item}")))
    }

    /// Wraps an id read back from the store without re-deriving it.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the id back into its participants and item id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Malformed`] if the id does not contain two
    /// non-empty, strictly ascending user segments followed by a non-empty
    /// item segment.
    pub fn parts(&self) -> Result<ConversationParts, IdentityError> {
        let mut segments = self.0.splitn(3, SEPARATOR);
        let (Some(low), Some(high), Some(item)) = (segments.next(), segments.next(), segments.next())
        else {
            return Err(IdentityError::Malformed(self.0.clone()));
        };
        if low.is_empty() || high.is_empty() || item.is_empty() || low >= high {
            return Err(IdentityError::Malformed(self.0.clone()));
        }
        Ok(ConversationParts {
            low: UserId::new(low),
            high: UserId::new(high),
            item_id: ItemId::new(item),
        })
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The decomposed segments of a [`ConversationId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationParts {
    /// The lexicographically smaller participant.
    pub low: UserId,
    /// The lexicographically larger participant.
    pub high: UserId,
    /// The listing the conversation is about.
    pub item_id: ItemId,
}

impl ConversationParts {
    /// Returns `true` if `user` is one of the two participants.
    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        self.low == *user || self.high == *user
    }

    /// Returns the participant that is not `user`, if `user` participates.
    #[must_use]
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        if self.low == *user {
            Some(&self.high)
        } else if self.high == *user {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Returns both participants in stored (sorted) order.
    #[must_use]
    pub fn participants(&self) -> [&UserId; 2] {
        [&self.low, &self.high]
    }
}

fn check_user(user: &UserId) -> Result<(), IdentityError> {
    if user.is_empty() {
        return Err(IdentityError::EmptyUserId);
    }
    if user.as_str().contains(SEPARATOR) {
        return Err(IdentityError::SeparatorInUserId(user.to_string()));
    }
    if user.as_str().contains('/') {
        return Err(IdentityError::SlashInId(user.to_string()));
    }
    Ok(())
}
