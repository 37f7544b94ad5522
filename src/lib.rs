//! Proof-of-work ledger with GHOST fork choice.
//!
//! The [`blockchain`] module holds the consensus core; [`network`] and
//! [`api`] expose it to peers and to HTTP clients.

pub mod api;
pub mod blockchain;
pub mod config;
pub mod network;
