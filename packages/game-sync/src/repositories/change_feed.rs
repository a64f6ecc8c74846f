use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::change::ChangeEvent;
use crate::models::game::GamePatch;
use crate::models::game_move::Move;
use crate::repositories::errors::game_repository_errors::GameRepositoryError;
use crate::repositories::game_repository::GameRepository;

/// A live stream of change notifications for one filter. Dropping it unsubscribes.
pub struct FeedSubscription<T> {
    receiver: mpsc::UnboundedReceiver<ChangeEvent<T>>,
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> FeedSubscription<T> {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<ChangeEvent<T>>,
        teardown: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        FeedSubscription {
            receiver,
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Next notification, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent<T>> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.teardown_now();
    }

    fn teardown_now(&mut self) {
        self.receiver.close();
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl<T> Drop for FeedSubscription<T> {
    fn drop(&mut self) {
        self.teardown_now();
    }
}

/// Realtime notifications from the store, keyed by game id.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Row-level updates to the game record. Payloads are partial rows.
    async fn subscribe_game(
        &self,
        game_id: &str,
    ) -> Result<FeedSubscription<GamePatch>, GameRepositoryError>;

    /// Insertions into the game's move list.
    async fn subscribe_moves(
        &self,
        game_id: &str,
    ) -> Result<FeedSubscription<Move>, GameRepositoryError>;
}

/// Change feed for stores without push notifications: one background task per
/// subscription polls the store and turns observed differences into events.
pub struct PollingChangeFeed {
    repository: Arc<dyn GameRepository>,
    interval: Duration,
}

impl PollingChangeFeed {
    pub fn new(repository: Arc<dyn GameRepository>, interval: Duration) -> Self {
        PollingChangeFeed {
            repository,
            interval,
        }
    }
}

#[async_trait]
impl ChangeFeed for PollingChangeFeed {
    async fn subscribe_game(
        &self,
        game_id: &str,
    ) -> Result<FeedSubscription<GamePatch>, GameRepositoryError> {
        let mut last_seen = self.repository.get_game(game_id).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let repository = self.repository.clone();
        let interval = self.interval;
        let game_id = game_id.to_string();

        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.is_closed() {
                    break;
                }
                match repository.get_game(&game_id).await {
                    Ok(game) if game.updated_at > last_seen.updated_at => {
                        let patch = last_seen.diff(&game);
                        debug!("Game {} changed at {}", game_id, game.updated_at);
                        if sender.send(ChangeEvent::update(None, patch)).is_err() {
                            break;
                        }
                        last_seen = game;
                    }
                    Ok(_) => {}
                    Err(GameRepositoryError::NotFound) => {
                        warn!("Game {} disappeared, closing feed", game_id);
                        break;
                    }
                    Err(e) => warn!("Polling game {} failed: {}", game_id, e),
                }
            }
        });

        Ok(FeedSubscription::new(receiver, move || poller.abort()))
    }

    async fn subscribe_moves(
        &self,
        game_id: &str,
    ) -> Result<FeedSubscription<Move>, GameRepositoryError> {
        let mut last_move_number = self
            .repository
            .list_moves(game_id, 0)
            .await?
            .last()
            .map(|mv| mv.move_number)
            .unwrap_or(0);
        let (sender, receiver) = mpsc::unbounded_channel();
        let repository = self.repository.clone();
        let interval = self.interval;
        let game_id = game_id.to_string();

        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.is_closed() {
                    break;
                }
                match repository.list_moves(&game_id, last_move_number).await {
                    Ok(moves) => {
                        for mv in moves {
                            last_move_number = last_move_number.max(mv.move_number);
                            if sender.send(ChangeEvent::insert(mv)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Polling moves of game {} failed: {}", game_id, e),
                }
            }
        });

        Ok(FeedSubscription::new(receiver, move || poller.abort()))
    }
}
