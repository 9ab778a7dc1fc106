//! # Campaign escrow engine
//!
//! Participants commit funds to group-purchase campaigns. Money is tracked
//! in an append-only ledger whose balances are always derived, never stored.
//! Every money-moving request is guarded by an idempotency key, every state
//! change is checked against one transition table, and a background worker
//! settles campaigns once their aggregation deadline passes.
//!
//! Module map:
//!
//! | module            | role                                              |
//! |-------------------|---------------------------------------------------|
//! | [`ledger`]        | append-only entries and derived balances          |
//! | [`state_machine`] | campaign states and the legal transition table    |
//! | [`idempotency`]   | at-most-once execution per `(key, scope)`         |
//! | [`service`]       | commit / refund / release / transition handlers   |
//! | [`lifecycle`]     | deadline worker with a processing lease           |
//! | [`api`]           | thin axum adapter                                 |

pub mod api;
pub mod audit;
pub mod config;
pub mod db;
pub mod errors;
pub mod idempotency;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod money;
pub mod repository;
pub mod service;
pub mod settlement;
pub mod state_machine;

pub use errors::{EscrowError, Result};
pub use money::Money;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod test_ledger;
#[cfg(test)]
mod test_lifecycle;
#[cfg(test)]
mod test_concurrency;
