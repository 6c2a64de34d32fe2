//! In-process document store for `MarketChat`.
//!
//! [`MemoryBackend`] holds every document and live listener; each
//! [`DocClient`] is one principal's view of it and implements
//! [`DocumentStore`](marketchat_proto::store::DocumentStore). Access is
//! decided by a [`Rules`](rules::Rules) implementation, by default
//! [`MarketplaceRules`](rules::MarketplaceRules).
//!
//! Tests use [`FaultInjector`](fault::FaultInjector) to script failures and
//! [`MemoryBackend::interrupt_listeners`] to simulate dropped streams.

pub mod admin;
pub mod client;
pub mod engine;
pub mod fault;
pub mod rules;

pub use client::DocClient;
pub use engine::MemoryBackend;
pub use rules::Principal;
