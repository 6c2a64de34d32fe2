//! Shared record shapes and document-store contract for `MarketChat`.
//!
//! Everything that both the chat core and a store implementation must agree
//! on lives here: identifier types, conversation identity derivation, the
//! document paths records are stored under, and the [`store::DocumentStore`]
//! operation vocabulary.

pub mod document;
pub mod ids;
pub mod identity;
pub mod paths;
pub mod query;
pub mod record;
pub mod store;
