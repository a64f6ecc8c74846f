use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::{next_timestamp, Clock, SystemClock};
use crate::models::change::ChangeEvent;
use crate::models::game::{Game, GamePatch, GameStatus};
use crate::models::game_move::Move;
use crate::repositories::change_feed::{ChangeFeed, FeedSubscription};
use crate::repositories::errors::game_repository_errors::GameRepositoryError;
use crate::repositories::game_repository::{GameRepository, MoveCommit, UpdatePrecondition};

type Subscribers<T> = HashMap<String, Vec<(u64, mpsc::UnboundedSender<ChangeEvent<T>>)>>;

#[derive(Default)]
struct StoreState {
    games: HashMap<String, Game>,
    moves: HashMap<String, Vec<Move>>,
    game_subscribers: Subscribers<GamePatch>,
    move_subscribers: Subscribers<Move>,
    next_subscriber_id: u64,
}

impl StoreState {
    fn publish_game(&mut self, game_id: &str, patch: GamePatch) {
        if let Some(subscribers) = self.game_subscribers.get_mut(game_id) {
            subscribers.retain(|(_, sender)| sender.send(ChangeEvent::update(None, patch.clone())).is_ok());
        }
    }

    fn publish_move(&mut self, mv: &Move) {
        if let Some(subscribers) = self.move_subscribers.get_mut(&mv.game_id) {
            subscribers.retain(|(_, sender)| sender.send(ChangeEvent::insert(mv.clone())).is_ok());
        }
    }
}

/// Authoritative store held in process memory, with a push change feed.
///
/// Backs local games and the test suites. Timestamps come from the injected
/// clock and are forced strictly increasing per game so they can serve as
/// freshness markers.
pub struct InMemoryGameStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    requests: AtomicUsize,
}

impl Default for InMemoryGameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGameStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        InMemoryGameStore {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
            unavailable: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }

    /// While set, every request fails as if the network were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of requests received, including failed ones.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self, game_id: &str) -> usize {
        let state = self.lock();
        let games = state.game_subscribers.get(game_id).map_or(0, Vec::len);
        let moves = state.move_subscribers.get(game_id).map_or(0, Vec::len);
        games + moves
    }

    /// Applies a patch directly, as another client or a backend job would.
    pub fn apply_external_update(
        &self,
        game_id: &str,
        patch: &GamePatch,
    ) -> Result<Game, GameRepositoryError> {
        let mut state = self.lock();
        self.write_patch(&mut state, game_id, patch)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self) -> Result<(), GameRepositoryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GameRepositoryError::Unavailable(
                "in-memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn write_patch(
        &self,
        state: &mut StoreState,
        game_id: &str,
        patch: &GamePatch,
    ) -> Result<Game, GameRepositoryError> {
        let game = state
            .games
            .get_mut(game_id)
            .ok_or(GameRepositoryError::NotFound)?;
        if let Some(status) = patch.status {
            if !game.status.can_transition_to(status) {
                return Err(GameRepositoryError::Rejected(format!(
                    "status cannot go from {:?} to {:?}",
                    game.status, status
                )));
            }
        }

        let mut stamped = patch.clone();
        stamped.updated_at = Some(next_timestamp(game.updated_at, self.clock.now()));
        game.apply_patch(&stamped);
        let updated = game.clone();
        state.publish_game(game_id, stamped);
        Ok(updated)
    }

    fn check(game: &Game, precondition: &UpdatePrecondition) -> Result<(), GameRepositoryError> {
        let satisfied = match precondition {
            UpdatePrecondition::NotTerminal => !game.status.is_terminal(),
            UpdatePrecondition::SeatOpen(side) => {
                game.status == GameStatus::Waiting && game.player_id(*side).is_none()
            }
            UpdatePrecondition::ActiveAt { fen } => {
                game.status == GameStatus::Active && game.fen == *fen
            }
        };
        if satisfied {
            Ok(())
        } else {
            Err(GameRepositoryError::Conflict(format!(
                "game {} no longer satisfies {:?}",
                game.id, precondition
            )))
        }
    }

    fn unsubscriber(&self, game_id: &str, id: u64, moves: bool) -> impl FnOnce() + Send + Sync {
        let state: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
        let game_id = game_id.to_string();
        move || {
            if let Some(state) = state.upgrade() {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if moves {
                    if let Some(subscribers) = state.move_subscribers.get_mut(&game_id) {
                        subscribers.retain(|(existing, _)| *existing != id);
                    }
                } else if let Some(subscribers) = state.game_subscribers.get_mut(&game_id) {
                    subscribers.retain(|(existing, _)| *existing != id);
                }
            }
        }
    }
}

#[async_trait]
impl GameRepository for InMemoryGameStore {
    async fn create_game(&self, game: &Game) -> Result<Game, GameRepositoryError> {
        self.request()?;
        game.settings
            .validate()
            .map_err(GameRepositoryError::Rejected)?;

        let mut state = self.lock();
        if state.games.contains_key(&game.id) {
            return Err(GameRepositoryError::Conflict(format!(
                "game {} already exists",
                game.id
            )));
        }
        let mut stored = game.clone();
        stored.created_at = self.clock.now();
        stored.updated_at = stored.created_at;
        state.games.insert(stored.id.clone(), stored.clone());
        state.moves.insert(stored.id.clone(), Vec::new());
        debug!("Stored game {}", stored.id);
        Ok(stored)
    }

    async fn get_game(&self, game_id: &str) -> Result<Game, GameRepositoryError> {
        self.request()?;
        self.lock()
            .games
            .get(game_id)
            .cloned()
            .ok_or(GameRepositoryError::NotFound)
    }

    async fn update_game(
        &self,
        game_id: &str,
        patch: &GamePatch,
        precondition: &UpdatePrecondition,
    ) -> Result<Game, GameRepositoryError> {
        self.request()?;
        let mut state = self.lock();
        let game = state.games.get(game_id).ok_or(GameRepositoryError::NotFound)?;
        Self::check(game, precondition)?;
        self.write_patch(&mut state, game_id, patch)
    }

    async fn commit_move(&self, commit: &MoveCommit) -> Result<Move, GameRepositoryError> {
        self.request()?;
        let mut state = self.lock();
        let game = state
            .games
            .get(&commit.game_id)
            .ok_or(GameRepositoryError::NotFound)?;
        Self::check(
            game,
            &UpdatePrecondition::ActiveAt {
                fen: commit.expected_fen.clone(),
            },
        )?;

        let existing = state.moves.get(&commit.game_id).map_or(0, Vec::len);
        if commit.record.move_number as usize != existing + 1 {
            return Err(GameRepositoryError::Conflict(format!(
                "move number {} is not next after {}",
                commit.record.move_number, existing
            )));
        }

        self.write_patch(&mut state, &commit.game_id, &commit.patch)?;
        let mut record = commit.record.clone();
        record.created_at = self.clock.now();
        state
            .moves
            .entry(commit.game_id.clone())
            .or_default()
            .push(record.clone());
        state.publish_move(&record);
        Ok(record)
    }

    async fn list_moves(&self, game_id: &str, after: u32) -> Result<Vec<Move>, GameRepositoryError> {
        self.request()?;
        let state = self.lock();
        let moves = state.moves.get(game_id).ok_or(GameRepositoryError::NotFound)?;
        Ok(moves
            .iter()
            .filter(|mv| mv.move_number > after)
            .cloned()
            .collect())
    }

    async fn list_games_for_player(
        &self,
        player_id: &str,
    ) -> Result<Vec<Game>, GameRepositoryError> {
        self.request()?;
        let state = self.lock();
        let mut games: Vec<Game> = state
            .games
            .values()
            .filter(|game| game.side_of(player_id).is_some())
            .cloned()
            .collect();
        games.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(games)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryGameStore {
    async fn subscribe_game(
        &self,
        game_id: &str,
    ) -> Result<FeedSubscription<GamePatch>, GameRepositoryError> {
        self.request()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            state.next_subscriber_id += 1;
            let id = state.next_subscriber_id;
            state
                .game_subscribers
                .entry(game_id.to_string())
                .or_default()
                .push((id, sender));
            id
        };
        Ok(FeedSubscription::new(
            receiver,
            self.unsubscriber(game_id, id, false),
        ))
    }

    async fn subscribe_moves(
        &self,
        game_id: &str,
    ) -> Result<FeedSubscription<Move>, GameRepositoryError> {
        self.request()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            state.next_subscriber_id += 1;
            let id = state.next_subscriber_id;
            state
                .move_subscribers
                .entry(game_id.to_string())
                .or_default()
                .push((id, sender));
            id
        };
        Ok(FeedSubscription::new(
            receiver,
            self.unsubscriber(game_id, id, true),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::game::{GameResult, GameSettings, Side};
    use chrono::{Duration, Utc};

    fn store_with_clock() -> (InMemoryGameStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (InMemoryGameStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_create_game_rejects_zero_time_control() {
        let store = InMemoryGameStore::new();
        let game = Game::new("player1", Side::White, GameSettings::new(0, 0));

        let result = store.create_game(&game).await;

        assert!(matches!(result, Err(GameRepositoryError::Rejected(_))));
        assert!(matches!(
            store.get_game(&game.id).await,
            Err(GameRepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_stamps_strictly_increasing_timestamps() {
        let (store, _clock) = store_with_clock();
        let game = store
            .create_game(&Game::new("player1", Side::White, GameSettings::new(600, 0)))
            .await
            .unwrap();

        let patch = GamePatch {
            black_player_id: Some("player2".to_string()),
            ..Default::default()
        };
        let first = store
            .update_game(&game.id, &patch, &UpdatePrecondition::NotTerminal)
            .await
            .unwrap();
        let second = store
            .update_game(&game.id, &patch, &UpdatePrecondition::NotTerminal)
            .await
            .unwrap();

        assert!(first.updated_at > game.updated_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn test_update_after_clock_steps_back_is_still_newer() {
        let (store, clock) = store_with_clock();
        let game = store
            .create_game(&Game::new("player1", Side::White, GameSettings::new(600, 0)))
            .await
            .unwrap();
        clock.advance(Duration::seconds(-5));

        let updated = store
            .update_game(
                &game.id,
                &GamePatch {
                    black_player_id: Some("player2".to_string()),
                    ..Default::default()
                },
                &UpdatePrecondition::NotTerminal,
            )
            .await
            .unwrap();

        assert_eq!(updated.updated_at, game.updated_at + Duration::milliseconds(1));
    }

    #[tokio::test]
    async fn test_update_rejects_backward_status() {
        let store = InMemoryGameStore::new();
        let game = store
            .create_game(&Game::new("player1", Side::White, GameSettings::new(600, 0)))
            .await
            .unwrap();
        store
            .apply_external_update(&game.id, &GamePatch::completed(GameResult::Draw, None))
            .unwrap();

        let result = store.apply_external_update(
            &game.id,
            &GamePatch {
                status: Some(GameStatus::Active),
                ..Default::default()
            },
        );

        assert!(matches!(result, Err(GameRepositoryError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_seat_open_precondition_conflicts_when_taken() {
        let store = InMemoryGameStore::new();
        let game = store
            .create_game(&Game::new("player1", Side::White, GameSettings::new(600, 0)))
            .await
            .unwrap();

        let result = store
            .update_game(
                &game.id,
                &GamePatch {
                    white_player_id: Some("intruder".to_string()),
                    ..Default::default()
                },
                &UpdatePrecondition::SeatOpen(Side::White),
            )
            .await;

        assert!(matches!(result, Err(GameRepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_and_counts_requests() {
        let store = InMemoryGameStore::new();
        store.set_unavailable(true);

        let result = store.get_game("missing").await;

        assert!(matches!(result, Err(GameRepositoryError::Unavailable(_))));
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates_and_can_leave() {
        let store = InMemoryGameStore::new();
        let game = store
            .create_game(&Game::new("player1", Side::White, GameSettings::new(600, 0)))
            .await
            .unwrap();
        let mut subscription = store.subscribe_game(&game.id).await.unwrap();
        assert_eq!(store.active_subscriptions(&game.id), 1);

        store
            .apply_external_update(
                &game.id,
                &GamePatch {
                    black_player_id: Some("player2".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let event = subscription.recv().await.unwrap();
        let patch = event.new.unwrap();
        assert_eq!(patch.black_player_id.as_deref(), Some("player2"));
        assert!(patch.updated_at.is_some());

        subscription.unsubscribe();
        assert_eq!(store.active_subscriptions(&game.id), 0);
    }
}
