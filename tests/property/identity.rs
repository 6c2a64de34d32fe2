//! Property-based tests for conversation identity and record decoding.
//!
//! Uses proptest to verify:
//! 1. Derivation is commutative in the two user ids.
//! 2. Distinct (unordered pair, item) inputs never collide.
//! 3. Derived ids decompose back into exactly their inputs, including item
//!    ids that contain the separator.
//! 4. Arbitrary JSON never makes record decoding panic.

use marketchat_proto::document::{DocPath, Document};
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, UserId};
use marketchat_proto::record::{Conversation, ConversationPointer, Message};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

/// Strategy for user ids: never empty, never containing `_` or `/`.
fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[A-Za-z0-9-]{1,12}".prop_map(UserId::new)
}

/// Strategy for item ids: may contain the separator, never `/`.
fn arb_item_id() -> impl Strategy<Value = ItemId> {
    "[A-Za-z0-9_-]{1,16}".prop_map(ItemId::new)
}

/// Strategy for two distinct user ids.
fn arb_user_pair() -> impl Strategy<Value = (UserId, UserId)> {
    (arb_user_id(), arb_user_id()).prop_filter("users must differ", |(a, b)| a != b)
}

/// Strategy for loosely shaped JSON field values.
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(|f| json!(f)),
        ".{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-zA-Z]{1,12}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// Strategy for documents carrying the field names the decoders look at.
fn arb_fields() -> impl Strategy<Value = Map<String, Value>> {
    let key = prop_oneof![
        Just("itemId".to_string()),
        Just("participants".to_string()),
        Just("userNames".to_string()),
        Just("lastMessage".to_string()),
        Just("unreadCount".to_string()),
        Just("senderId".to_string()),
        Just("timestamp".to_string()),
        Just("otherUserId".to_string()),
        "[a-z]{1,8}",
    ];
    prop::collection::btree_map(key, arb_json(), 0..8).prop_map(|m| m.into_iter().collect())
}

proptest! {
    /// Swapping the participants never changes the id.
    #[test]
    fn derive_is_commutative((a, b) in arb_user_pair(), item in arb_item_id()) {
        let ab = ConversationId::derive(&a, &b, &item).expect("valid inputs");
        let ba = ConversationId::derive(&b, &a, &item).expect("valid inputs");
        prop_assert_eq!(ab, ba);
    }

    /// Different unordered pairs or items never produce the same id.
    #[test]
    fn distinct_inputs_give_distinct_ids(
        (a, b) in arb_user_pair(),
        (c, d) in arb_user_pair(),
        item1 in arb_item_id(),
        item2 in arb_item_id(),
    ) {
        let same_pair = (a == c && b == d) || (a == d && b == c);
        prop_assume!(!(same_pair && item1 == item2));

        let first = ConversationId::derive(&a, &b, &item1).expect("valid inputs");
        let second = ConversationId::derive(&c, &d, &item2).expect("valid inputs");
        prop_assert_ne!(first, second);
    }

    /// Decomposition recovers the sorted pair and the item verbatim.
    #[test]
    fn parts_recover_inputs((a, b) in arb_user_pair(), item in arb_item_id()) {
        let id = ConversationId::derive(&a, &b, &item).expect("valid inputs");
        let parts = id.parts().expect("derived ids decompose");
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        prop_assert_eq!(parts.low, low);
        prop_assert_eq!(parts.high, high);
        prop_assert_eq!(parts.item_id, item);
    }

    /// Arbitrary field contents are either decoded or rejected, never a panic.
    #[test]
    fn record_decoding_never_panics(data in arb_fields()) {
        let conversation = Document {
            path: DocPath::parse("chats/a_b_item").expect("valid path"),
            data: data.clone(),
        };
        let pointer = Document {
            path: DocPath::parse("userChats/a/chats/a_b_item").expect("valid path"),
            data: data.clone(),
        };
        let message = Document {
            path: DocPath::parse("chats/a_b_item/messages/m1").expect("valid path"),
            data,
        };
        let _ = Conversation::from_document(&conversation);
        let _ = ConversationPointer::from_document(&pointer);
        let _ = Message::from_document(&message);
    }
}
