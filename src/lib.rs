//! Library crate for duel-client, exposing modules for the runner binary and embedding
//! applications.

/// Time source used by the countdown.
pub mod clock;
/// Configuration loading.
pub mod config;
/// Local persistence: key-value backends and the token store.
pub mod dao;
/// Wire and REST payloads.
pub mod dto;
/// Error types shared across layers.
pub mod error;
/// Connection, REST and session services.
pub mod services;
/// Client-side duel state.
pub mod state;
