//! `MarketChat` client library.
//!
//! Listing-scoped chat between buyers and sellers: conversation identity,
//! live chat lists with unread counts, connectivity-aware subscriptions and
//! a line-oriented front end used by the `marketchat` binary.

pub mod app;
pub mod chat;
pub mod config;
pub mod connectivity;
