//! Access rules evaluated on every read, write and query.
//!
//! [`MarketplaceRules`] encodes who may touch which chat records: only
//! participants can see a conversation or its messages, only the owner can
//! read their chat list, and a participant may write the counterpart's
//! pointer for a conversation they are part of. A conversation that does
//! not exist is not readable by anyone but an admin.

use marketchat_proto::document::{DocPath, DocumentData};
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{SYSTEM_SENDER, UserId};
use marketchat_proto::paths;
use marketchat_proto::query::{Filter, Query};
use marketchat_proto::record::field;
use serde_json::Value;

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// No signed-in user.
    Anonymous,
    /// A signed-in user.
    User(UserId),
    /// Server-side code with full access (the admin cascade).
    Admin,
}

impl Principal {
    /// Returns the signed-in user, if any.
    #[must_use]
    pub const fn user(&self) -> Option<&UserId> {
        match self {
            Self::User(user) => Some(user),
            Self::Anonymous | Self::Admin => None,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::User(user) => write!(f, "user:{user}"),
            Self::Admin => f.write_str("admin"),
        }
    }
}

/// The kind of access being checked, with the document state involved.
#[derive(Debug, Clone, Copy)]
pub enum Access<'a> {
    /// A single-document read. `None` if the document does not exist.
    Read(Option<&'a DocumentData>),
    /// A write that creates the document.
    Create {
        /// Document contents after the write.
        after: &'a DocumentData,
    },
    /// A write that changes an existing document.
    Update {
        /// Contents before the write.
        before: &'a DocumentData,
        /// Contents after the write.
        after: &'a DocumentData,
    },
    /// A delete. `None` if the document did not exist.
    Delete(Option<&'a DocumentData>),
}

/// Read access to store contents while rules are evaluated.
///
/// During a batch this reflects the writes staged so far.
pub trait StoreView {
    /// Returns the current contents of `path`.
    fn read(&self, path: &DocPath) -> Option<&DocumentData>;
}

/// A rule set deciding every request.
pub trait Rules: Send + Sync {
    /// Decides a single-document access.
    fn allow(
        &self,
        principal: &Principal,
        path: &DocPath,
        access: Access<'_>,
        view: &dyn StoreView,
    ) -> bool;

    /// Decides a query or live listen.
    fn allow_query(&self, principal: &Principal, query: &Query, view: &dyn StoreView) -> bool;
}

/// Allows everything. Useful for tests that exercise store mechanics only.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenRules;

impl Rules for OpenRules {
    fn allow(&self, _: &Principal, _: &DocPath, _: Access<'_>, _: &dyn StoreView) -> bool {
        true
    }

    fn allow_query(&self, _: &Principal, _: &Query, _: &dyn StoreView) -> bool {
        true
    }
}

/// Access rules for the marketplace chat layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketplaceRules;

impl Rules for MarketplaceRules {
    fn allow(
        &self,
        principal: &Principal,
        path: &DocPath,
        access: Access<'_>,
        view: &dyn StoreView,
    ) -> bool {
        if *principal == Principal::Admin {
            return true;
        }
        let segments: Vec<&str> = path.segments().collect();
        match segments.as_slice() {
            &[paths::ITEMS, _] => listing_access(principal, access),
            &[paths::CHATS, _] => conversation_access(principal, access),
            &[paths::CHATS, conversation, paths::MESSAGES, _] => {
                message_access(principal, conversation, access, view)
            }
            &[paths::USER_CHATS, owner, paths::USER_CHAT_ENTRIES, conversation] => {
                pointer_access(principal, owner, conversation, access)
            }
            _ => false,
        }
    }

    fn allow_query(&self, principal: &Principal, query: &Query, view: &dyn StoreView) -> bool {
        if *principal == Principal::Admin {
            return true;
        }
        let segments: Vec<&str> = query.collection.segments().collect();
        let Some(user) = principal.user() else {
            return segments.as_slice() == [paths::ITEMS];
        };

        match segments.as_slice() {
            &[paths::ITEMS] => true,
            // Conversations can only be listed through the caller's own membership.
            &[paths::CHATS] => query.filters.iter().any(|filter| {
                matches!(filter, Filter::ArrayContains { field, value }
                    if field == field::PARTICIPANTS && value.as_str() == Some(user.as_str()))
            }),
            &[paths::CHATS, conversation, paths::MESSAGES] => {
                is_participant_of_stored(user, conversation, view)
            }
            &[paths::USER_CHATS, owner, paths::USER_CHAT_ENTRIES] => owner == user.as_str(),
            _ => false,
        }
    }
}

fn listing_access(principal: &Principal, access: Access<'_>) -> bool {
    match access {
        Access::Read(_) => true,
        Access::Create { after } => principal
            .user()
            .is_some_and(|user| string_field(after, field::OWNER_ID) == Some(user.as_str())),
        Access::Update { before, after } => principal.user().is_some_and(|user| {
            string_field(before, field::OWNER_ID) == Some(user.as_str())
                && after.get(field::OWNER_ID) == before.get(field::OWNER_ID)
        }),
        Access::Delete(before) => principal.user().is_some_and(|user| {
            before.is_none_or(|doc| string_field(doc, field::OWNER_ID) == Some(user.as_str()))
        }),
    }
}

fn conversation_access(principal: &Principal, access: Access<'_>) -> bool {
    let Some(user) = principal.user() else {
        return false;
    };
    match access {
        Access::Read(doc) => doc.is_some_and(|doc| lists_participant(doc, user)),
        Access::Create { after } => lists_participant(after, user),
        Access::Update { before, after } => {
            lists_participant(before, user)
                && after.get(field::PARTICIPANTS) == before.get(field::PARTICIPANTS)
        }
        Access::Delete(_) => false,
    }
}

fn message_access(
    principal: &Principal,
    conversation: &str,
    access: Access<'_>,
    view: &dyn StoreView,
) -> bool {
    let Some(user) = principal.user() else {
        return false;
    };
    if !is_participant_of_stored(user, conversation, view) {
        return false;
    }
    match access {
        Access::Read(_) => true,
        Access::Create { after } => string_field(after, field::SENDER_ID)
            .is_some_and(|sender| sender == user.as_str() || sender == SYSTEM_SENDER),
        Access::Update { .. } | Access::Delete(_) => false,
    }
}

fn pointer_access(
    principal: &Principal,
    owner: &str,
    conversation: &str,
    access: Access<'_>,
) -> bool {
    let Some(user) = principal.user() else {
        return false;
    };
    let is_owner = owner == user.as_str();
    match access {
        Access::Read(_) | Access::Delete(_) => is_owner,
        // Senders maintain the recipient's preview and unread count.
        Access::Create { .. } | Access::Update { .. } => {
            is_owner
                || ConversationId::from_raw(conversation)
                    .parts()
                    .is_ok_and(|parts| parts.involves(user) && parts.involves(&UserId::new(owner)))
        }
    }
}

fn is_participant_of_stored(user: &UserId, conversation: &str, view: &dyn StoreView) -> bool {
    view.read(&paths::conversations().doc(conversation))
        .is_some_and(|doc| lists_participant(doc, user))
}

fn lists_participant(doc: &DocumentData, user: &UserId) -> bool {
    doc.get(field::PARTICIPANTS)
        .and_then(Value::as_array)
        .is_some_and(|participants| {
            participants
                .iter()
                .any(|p| p.as_str() == Some(user.as_str()))
        })
}

fn string_field<'a>(doc: &'a DocumentData, name: &str) -> Option<&'a str> {
    doc.get(name).and_then(Value::as_str)
}
