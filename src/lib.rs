//! The Gridvale server: an authoritative, tick-driven world for a tile-based
//! multiplayer RPG.
//!
//! This crate wires the subsystem crates together: it loads configuration and
//! maps, opens the store, spawns the background flusher and the tick loop,
//! and runs the session accept loop until shutdown.

pub mod config;

use std::sync::Arc;

use anyhow::Context;
use gridvale_map::MapService;
use gridvale_server::auth::TokenKey;
use gridvale_server::{entity, net, tick, GameContext};
use gridvale_store::{spawn_flusher, DurableStore, GameStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub use config::FileConfig;
pub use gridvale_map as map;
pub use gridvale_protocol as protocol;
pub use gridvale_server as server;
pub use gridvale_store as store;

/// Builds the world and runs the server until `shutdown` flips.
pub async fn run(config: FileConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let durable = DurableStore::connect(&config.store.database_url)
        .await
        .context("failed to open the durable store")?;
    let store = Arc::new(
        GameStore::open(durable, config.store_config())
            .await
            .context("failed to open the game store")?,
    );

    let map_dir = config.map.directory.clone();
    let collision_names = config.map.collision_layer_names.clone();
    let maps = tokio::task::spawn_blocking(move || MapService::load_dir(&map_dir, &collision_names))
        .await?
        .context("failed to load maps")?;
    let maps = Arc::new(maps);

    let tokens = TokenKey::new(config.security.token_secret.as_bytes());
    let ctx = Arc::new(GameContext::new(
        store.clone(),
        maps.clone(),
        tokens,
        config.server_config(),
    ));

    anyhow::ensure!(
        ctx.maps.get(&ctx.config.spawn_map).is_some(),
        "spawn map {:?} is not loaded",
        ctx.config.spawn_map
    );

    entity::spawn_all(&ctx.store, &ctx.maps, &ctx.entities);

    let flusher = spawn_flusher(store.clone(), config.flush_interval(), shutdown.clone());
    let tick_loop = tokio::spawn(tick::run_tick_loop(ctx.clone(), shutdown.clone()));

    let listener = TcpListener::bind(config.server.address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.address))?;
    info!(address = %config.server.address, "listening");

    net::run_accept_loop(ctx.clone(), listener, shutdown.clone()).await;

    // Accept loop exited: shutdown is in progress. The tick loop finalizes
    // its current tick and the flusher runs its final drain.
    tick_loop.await.ok();
    flusher.await.ok();
    info!("server stopped");
    Ok(())
}
