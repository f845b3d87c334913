//! Hot-state cache and durable persistence for the Gridvale server.
//!
//! Two tiers: an in-process cache holds the authoritative live state of every
//! online player, entity instance, and ground item; a SQLite database holds
//! the durable form and is written in batches by a background flusher. See
//! [`GameStore`] for the typed facade handlers and the tick loop talk to.

pub mod cache;
pub mod catalog;
pub mod durable;
pub mod flusher;
pub mod state;
mod store;

use gridvale_protocol::PlayerId;
use thiserror::Error;

pub use cache::{Cache, CacheKey, CacheValue, TxSnapshot, TxWrite};
pub use catalog::{seed_defs, ItemCatalog};
pub use durable::{DurableStore, PlayerRecord};
pub use flusher::spawn_flusher;
pub use store::{GameStore, GameStoreConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// An atomic cache transaction kept conflicting after its retry budget.
    /// Surfaced to handlers as a system error; never silently downgraded to
    /// non-atomic writes.
    #[error("cache transaction conflicted too many times")]
    TransactionConflict,

    #[error("cache entry kind mismatch: expected {expected}, got {got}")]
    WrongKind {
        expected: &'static str,
        got: &'static str,
    },

    #[error("player {0} does not exist")]
    PlayerNotFound(PlayerId),
}
