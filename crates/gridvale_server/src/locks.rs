//! Per-player mutual exclusion.
//!
//! Every command handler for player P runs under P's async mutex, so a
//! player's commands are observed in send order. Operations spanning several
//! players acquire their locks in ascending id order to rule out deadlock.

use std::sync::Arc;
use std::time::Duration;

use gridvale_protocol::PlayerId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Error)]
#[error("timed out waiting for player {0} lock")]
pub struct LockTimeout(pub PlayerId);

pub struct PlayerLocks {
    locks: Mutex<FxHashMap<PlayerId, Arc<AsyncMutex<()>>>>,
    acquire_timeout: Duration,
}

impl PlayerLocks {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(FxHashMap::default()),
            acquire_timeout,
        }
    }

    fn lock_for(&self, player: PlayerId) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(player).or_default().clone()
    }

    /// Acquires one player's lock, or errors after the acquisition timeout.
    pub async fn acquire(&self, player: PlayerId) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = self.lock_for(player);
        tokio::time::timeout(self.acquire_timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout(player))
    }

    /// Acquires several players' locks in ascending id order.
    pub async fn acquire_many(
        &self,
        players: &[PlayerId],
    ) -> Result<Vec<OwnedMutexGuard<()>>, LockTimeout> {
        let mut sorted: Vec<PlayerId> = players.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for player in sorted {
            guards.push(self.acquire(player).await?);
        }
        Ok(guards)
    }

    /// Non-blocking acquisition for paths that must never wait (the tick
    /// loop's visibility emission skips busy players).
    pub fn try_acquire(&self, player: PlayerId) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(player).try_lock_owned().ok()
    }

    /// Frees a player's lock entry. Called on disconnect.
    pub fn cleanup_player(&self, player: PlayerId) {
        self.locks.lock().remove(&player);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_same_player() {
        let locks = PlayerLocks::new(Duration::from_secs(1));
        let g1 = locks.acquire(PlayerId(1)).await.unwrap();
        assert!(locks.try_acquire(PlayerId(1)).is_none());
        assert!(locks.try_acquire(PlayerId(2)).is_some());
        drop(g1);
        assert!(locks.try_acquire(PlayerId(1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_times_out() {
        let locks = PlayerLocks::new(Duration::from_secs(30));
        let _held = locks.acquire(PlayerId(1)).await.unwrap();
        let err = locks.acquire(PlayerId(1)).await.unwrap_err();
        assert_eq!(err.0, PlayerId(1));
    }

    #[tokio::test]
    async fn multi_lock_orders_and_dedups() {
        let locks = PlayerLocks::new(Duration::from_secs(1));
        let guards = locks
            .acquire_many(&[PlayerId(3), PlayerId(1), PlayerId(3)])
            .await
            .unwrap();
        assert_eq!(guards.len(), 2);
    }
}
