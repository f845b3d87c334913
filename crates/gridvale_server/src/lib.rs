//! Game logic, sessions, and the tick loop for the Gridvale server.
//!
//! All managers live in one [`GameContext`] passed explicitly into handlers
//! and the tick loop; there are no module-level singletons. Stable numeric
//! ids are the only cross-manager references, and an id that no longer
//! resolves is treated as a normal "gone" case everywhere.

pub mod auth;
pub mod combat;
pub mod config;
pub mod entity;
pub mod ground;
pub mod handler;
pub mod items;
pub mod locks;
pub mod net;
pub mod rate_limit;
pub mod registry;
pub mod skill;
pub mod tick;
pub mod visibility;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gridvale_map::MapService;
use gridvale_store::GameStore;

pub use config::ServerConfig;

/// The root context: every manager the handlers and the tick loop touch.
pub struct GameContext {
    pub store: Arc<GameStore>,
    pub maps: Arc<MapService>,
    pub entities: entity::EntityCatalog,
    pub registry: registry::SessionRegistry,
    pub visibility: visibility::VisibilityCache,
    pub rate_limiter: rate_limit::RateLimiter,
    pub locks: locks::PlayerLocks,
    pub tokens: auth::TokenKey,
    pub config: ServerConfig,
    tick: AtomicU64,
    session_serial: AtomicU64,
}

impl GameContext {
    pub fn new(
        store: Arc<GameStore>,
        maps: Arc<MapService>,
        tokens: auth::TokenKey,
        config: ServerConfig,
    ) -> Self {
        Self {
            visibility: visibility::VisibilityCache::new(config.max_players),
            locks: locks::PlayerLocks::new(config.lock_timeout),
            store,
            maps,
            entities: entity::EntityCatalog::new(),
            registry: registry::SessionRegistry::new(),
            rate_limiter: rate_limit::RateLimiter::new(),
            tokens,
            config,
            tick: AtomicU64::new(0),
            session_serial: AtomicU64::new(1),
        }
    }

    /// The global tick counter, advanced only by the tick loop.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub(crate) fn advance_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn next_session_serial(&self) -> u64 {
        self.session_serial.fetch_add(1, Ordering::Relaxed)
    }
}
