use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::repositories::change_feed::ChangeFeed;
use crate::services::errors::game_sync_errors::GameSyncError;
use crate::services::game_sync_service::GameSyncClient;

/// Routes store notifications for a game into the client's cache.
pub struct ChangeFeedListener {
    feed: Arc<dyn ChangeFeed>,
    client: GameSyncClient,
}

impl ChangeFeedListener {
    pub fn new(feed: Arc<dyn ChangeFeed>, client: GameSyncClient) -> Self {
        ChangeFeedListener { feed, client }
    }

    /// Subscribes to the game row and its move insertions until the returned
    /// handle is unsubscribed or dropped.
    pub async fn attach(&self, game_id: &str) -> Result<GameSubscription, GameSyncError> {
        let mut game_events = self
            .feed
            .subscribe_game(game_id)
            .await
            .map_err(GameSyncError::Remote)?;
        let mut move_events = self
            .feed
            .subscribe_moves(game_id)
            .await
            .map_err(GameSyncError::Remote)?;

        let client = self.client.clone();
        let id = game_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = game_events.recv() => match event {
                        Some(event) => client.apply_game_event(&id, event),
                        None => break,
                    },
                    event = move_events.recv() => match event {
                        Some(event) => client.apply_move_event(&id, event),
                        None => break,
                    },
                }
            }
            debug!("Change feed for game {} closed", id);
        });

        info!("Listening for changes to game {}", game_id);
        Ok(GameSubscription {
            game_id: game_id.to_string(),
            client: self.client.clone(),
            task: Some(task),
        })
    }
}

/// Live subscription to one game's changes.
pub struct GameSubscription {
    game_id: String,
    client: GameSyncClient,
    task: Option<JoinHandle<()>>,
}

impl GameSubscription {
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Tears down both feeds and cancels the game's reconciliation. Returns
    /// once the feeds are closed.
    pub async fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.client.release(&self.game_id);
        info!("Stopped listening to game {}", self.game_id);
    }
}

impl Drop for GameSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.client.release(&self.game_id);
        }
    }
}
