//! The background flusher task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::store::GameStore;

/// Number of attempts the shutdown drain makes before giving up. Shutdown
/// must not block forever on a dead database.
const SHUTDOWN_RETRY_BUDGET: u32 = 3;

/// Spawns the periodic dirty-bucket drain. The task exits after a final
/// bounded drain when `shutdown` flips to `true`.
pub fn spawn_flusher(
    store: Arc<GameStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = store.flush_dirty().await {
                        error!(error = %e, "periodic flush failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for attempt in 1..=SHUTDOWN_RETRY_BUDGET {
            match store.flush_dirty().await {
                Ok(()) => {
                    info!("final flush complete");
                    return;
                }
                Err(e) => {
                    error!(attempt, error = %e, "final flush failed");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        error!("giving up on final flush; dirty state may be lost");
    })
}

#[cfg(test)]
mod tests {
    use gridvale_protocol::{MapId, PlayerId, Role, TilePos};

    use super::*;
    use crate::durable::DurableStore;
    use crate::state::PlayerHp;
    use crate::store::GameStoreConfig;

    #[tokio::test(start_paused = true)]
    async fn shutdown_triggers_final_flush() {
        let durable = DurableStore::in_memory().await.unwrap();
        let record = durable
            .create_player(
                "alice",
                "hash",
                Role::Player,
                &MapId::from("meadowbrook"),
                TilePos::new(1, 1),
                10,
            )
            .await
            .unwrap();
        let store = Arc::new(
            GameStore::open(durable, GameStoreConfig::default())
                .await
                .unwrap(),
        );

        // Touch the player so HP is cached, then damage them.
        store.hp(record.id).await.unwrap();
        store.set_hp(record.id, PlayerHp { current: 3, max: 10 });

        let (tx, rx) = watch::channel(false);
        let handle = spawn_flusher(store.clone(), Duration::from_secs(3600), rx);

        tx.send(true).unwrap();
        handle.await.unwrap();

        let row = store
            .durable()
            .player_by_id(record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.current_hp, 3);
    }

    #[tokio::test]
    async fn unknown_player_flush_keeps_running() {
        let durable = DurableStore::in_memory().await.unwrap();
        let store = Arc::new(
            GameStore::open(durable, GameStoreConfig::default())
                .await
                .unwrap(),
        );

        // Dirty state for a player with no durable row: the cycle logs and
        // keeps the entry dirty rather than failing the whole drain.
        store.set_hp(PlayerId(424242), PlayerHp { current: 1, max: 10 });
        store.flush_dirty().await.unwrap();
    }
}
