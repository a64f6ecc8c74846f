use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_seconds, Clock, SystemClock};
use crate::models::change::{ChangeEvent, ChangeEventType};
use crate::models::game::{Game, GamePatch, GameResult, GameSettings, GameStatus, Side};
use crate::models::game_move::Move;
use crate::models::move_request::MoveRequest;
use crate::repositories::errors::game_repository_errors::GameRepositoryError;
use crate::repositories::game_repository::{GameRepository, MoveCommit, UpdatePrecondition};
use crate::services::auth_service::IdentityProvider;
use crate::services::chess_service::ChessService;
use crate::services::errors::game_sync_errors::GameSyncError;
use crate::services::game_cache::{CacheEntry, Freshness, GameCache};

/// Client side of the game protocol: issues writes to the store, keeps one
/// cache entry per game and reconciles it with what the store reports.
#[derive(Clone)]
pub struct GameSyncClient {
    repository: Arc<dyn GameRepository>,
    identity: Arc<dyn IdentityProvider>,
    chess: ChessService,
    cache: Arc<GameCache>,
    clock: Arc<dyn Clock>,
}

impl GameSyncClient {
    pub fn new(repository: Arc<dyn GameRepository>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self::with_clock(repository, identity, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn GameRepository>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        GameSyncClient {
            repository,
            identity,
            chess: ChessService::new(),
            cache: Arc::new(GameCache::new()),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn current_user(&self) -> Result<String, GameSyncError> {
        Ok(self.identity.user_id()?)
    }

    /// Creates a waiting game with the caller on a random side.
    pub async fn create_game(&self, settings: GameSettings) -> Result<Game, GameSyncError> {
        self.create_game_as(settings, random_side()).await
    }

    pub async fn create_game_as(
        &self,
        settings: GameSettings,
        side: Side,
    ) -> Result<Game, GameSyncError> {
        let user_id = self.current_user()?;
        let game = Game::new(&user_id, side, settings);

        let stored = self
            .repository
            .create_game(&game)
            .await
            .map_err(GameSyncError::Remote)?;

        let entry = self.cache.entry(&stored.id);
        entry.apply_fetched(entry.begin_fetch(), stored.clone());
        info!("Created game {} with {} playing {}", stored.id, user_id, side);
        Ok(stored)
    }

    /// Takes the open seat of a waiting game, which starts it.
    pub async fn join_game(&self, game_id: &str) -> Result<Game, GameSyncError> {
        let user_id = self.current_user()?;
        let entry = self.cache.entry(game_id);
        let _writer = entry.lock_writer().await;

        let game = self.refresh(&entry, game_id).await?;
        if game.side_of(&user_id).is_some() {
            return Err(GameSyncError::Validation(
                "Cannot join your own game".to_string(),
            ));
        }
        if game.status != GameStatus::Waiting || game.is_full() {
            return Err(GameSyncError::Validation(format!(
                "Game {} is not open",
                game_id
            )));
        }

        let side = if game.white_player_id.is_none() {
            Side::White
        } else {
            Side::Black
        };
        let mut patch = GamePatch {
            status: Some(GameStatus::Active),
            ..Default::default()
        };
        match side {
            Side::White => patch.white_player_id = Some(user_id.clone()),
            Side::Black => patch.black_player_id = Some(user_id.clone()),
        }

        let result = self
            .repository
            .update_game(game_id, &patch, &UpdatePrecondition::SeatOpen(side))
            .await;
        match result {
            Ok(joined) => {
                entry.apply_fetched(entry.begin_fetch(), joined.clone());
                info!("{} joined game {} as {}", user_id, game_id, side);
                Ok(joined)
            }
            Err(e) => {
                self.refetch_or_invalidate(&entry, game_id).await;
                Err(e.into())
            }
        }
    }

    /// Plays a move optimistically: the predicted state is displayed at once
    /// and either confirmed by the store or rolled back exactly.
    pub async fn make_move(
        &self,
        game_id: &str,
        from_square: &str,
        to_square: &str,
        promotion_piece: Option<&str>,
    ) -> Result<Move, GameSyncError> {
        let user_id = self.current_user()?;
        let entry = self.cache.entry(game_id);
        let _writer = entry.lock_writer().await;

        let base = match entry.displayed() {
            Some(game) if !entry.is_stale() => game,
            _ => self.refresh(&entry, game_id).await?,
        };

        let mut request = MoveRequest::new(
            game_id.to_string(),
            from_square.to_string(),
            to_square.to_string(),
        );
        if let Some(piece) = promotion_piece {
            request = request.with_promotion(piece.to_string());
        }

        let now = self.clock.now();
        let applied = self.chess.apply_move(&base, &user_id, &request, now)?;
        let patch = applied.patch();

        let mut speculative = base.clone();
        speculative.apply_patch(&patch);
        speculative.updated_at = now;
        let ticket = entry.begin_speculation(speculative);
        debug!("Speculating {} as move {} in game {}", applied.san, applied.move_number, game_id);

        let commit = MoveCommit {
            game_id: game_id.to_string(),
            expected_fen: base.fen.clone(),
            record: Move::new(
                game_id,
                &user_id,
                applied.move_number,
                &applied.san,
                &applied.fen,
                applied.captured.clone(),
            ),
            patch,
        };

        match self.repository.commit_move(&commit).await {
            Ok(stored) => {
                match self.repository.get_game(game_id).await {
                    Ok(confirmed) => entry.commit(ticket, Some(confirmed)),
                    Err(e) => {
                        warn!("Could not confirm move in game {}: {}", game_id, e);
                        entry.commit(ticket, None);
                        self.reconcile(game_id);
                    }
                }
                info!("Move {} {} stored for game {}", stored.move_number, stored.move_text, game_id);
                Ok(stored)
            }
            Err(GameRepositoryError::Conflict(msg)) => {
                entry.rollback(ticket);
                warn!("Move in game {} lost a race: {}", game_id, msg);
                self.refetch_or_invalidate(&entry, game_id).await;
                Err(GameSyncError::StaleState(msg))
            }
            Err(e) => {
                entry.rollback(ticket);
                warn!("Move in game {} failed: {}", game_id, e);
                Err(GameSyncError::Remote(e))
            }
        }
    }

    /// Concedes for `abandoning_side`. The cache is refetched whatever the outcome.
    pub async fn abandon_game(
        &self,
        game_id: &str,
        abandoning_side: Side,
    ) -> Result<Game, GameSyncError> {
        let user_id = self.current_user()?;
        let entry = self.cache.entry(game_id);
        let _writer = entry.lock_writer().await;

        let game = match entry.authoritative() {
            Some(game) => game,
            None => self.refresh(&entry, game_id).await?,
        };
        if game.player_id(abandoning_side) != Some(user_id.as_str()) {
            return Err(GameSyncError::Forbidden(format!(
                "{} does not play {} in game {}",
                user_id, abandoning_side, game_id
            )));
        }

        let patch = GamePatch::completed(
            GameResult::Abandoned,
            game.player_id(abandoning_side.opponent()).map(str::to_string),
        );
        let result = self
            .repository
            .update_game(game_id, &patch, &UpdatePrecondition::NotTerminal)
            .await;

        self.refetch_or_invalidate(&entry, game_id).await;
        match result {
            Ok(updated) => {
                info!("{} abandoned game {}", user_id, game_id);
                Ok(updated)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Completes an active game on time after the side to move ran out.
    pub async fn claim_flag_fall(&self, game_id: &str) -> Result<Game, GameSyncError> {
        self.current_user()?;
        let entry = self.cache.entry(game_id);
        let _writer = entry.lock_writer().await;

        let game = self.refresh(&entry, game_id).await?;
        if game.status != GameStatus::Active {
            return Ok(game);
        }
        let loser = game.current_turn;
        let elapsed = elapsed_seconds(game.updated_at, self.clock.now());
        if elapsed < game.time_remaining(loser) {
            return Err(GameSyncError::Validation(format!(
                "{} still has time in game {}",
                loser, game_id
            )));
        }

        let mut patch = GamePatch::completed(
            GameResult::Timeout,
            game.player_id(loser.opponent()).map(str::to_string),
        );
        match loser {
            Side::White => patch.white_time_remaining = Some(0),
            Side::Black => patch.black_time_remaining = Some(0),
        }
        let result = self
            .repository
            .update_game(
                game_id,
                &patch,
                &UpdatePrecondition::ActiveAt {
                    fen: game.fen.clone(),
                },
            )
            .await;

        self.refetch_or_invalidate(&entry, game_id).await;
        match result {
            Ok(updated) => {
                info!("{} flagged in game {}", loser, game_id);
                Ok(updated)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_game(&self, game_id: &str) -> Result<Game, GameSyncError> {
        let entry = self.cache.entry(game_id);
        self.refresh(&entry, game_id).await
    }

    pub async fn get_game_moves(&self, game_id: &str) -> Result<Vec<Move>, GameSyncError> {
        let mut moves = self
            .repository
            .list_moves(game_id, 0)
            .await
            .map_err(GameSyncError::Remote)?;
        moves.sort_by_key(|mv| mv.move_number);
        Ok(moves)
    }

    /// The caller's games in progress, newest first.
    pub async fn get_active_games(&self) -> Result<Vec<Game>, GameSyncError> {
        let user_id = self.current_user()?;
        let games = self
            .repository
            .list_games_for_player(&user_id)
            .await
            .map_err(GameSyncError::Remote)?;
        Ok(games
            .into_iter()
            .filter(|game| game.status == GameStatus::Active)
            .collect())
    }

    /// A page of all the caller's games, newest first.
    pub async fn get_game_history(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Game>, GameSyncError> {
        let user_id = self.current_user()?;
        let games = self
            .repository
            .list_games_for_player(&user_id)
            .await
            .map_err(GameSyncError::Remote)?;
        Ok(games.into_iter().skip(offset).take(limit).collect())
    }

    /// The displayed state of one game, updated as it changes.
    pub fn watch(&self, game_id: &str) -> watch::Receiver<Option<Game>> {
        self.cache.entry(game_id).subscribe()
    }

    pub fn cached(&self, game_id: &str) -> Option<Game> {
        self.cache.displayed(game_id)
    }

    /// Invalidates the entry and refetches it in the background, replacing
    /// any reconciliation already in flight.
    pub fn reconcile(&self, game_id: &str) {
        let entry = self.cache.entry(game_id);
        entry.invalidate();
        let epoch = entry.begin_fetch();
        let repository = self.repository.clone();
        let task_entry = entry.clone();
        let game_id = game_id.to_string();

        let handle = tokio::spawn(async move {
            match repository.get_game(&game_id).await {
                Ok(game) => {
                    let outcome = task_entry.apply_fetched(epoch, game);
                    debug!("Reconciled game {}: {:?}", game_id, outcome);
                }
                Err(e) => warn!("Reconciling game {} failed: {}", game_id, e),
            }
        });
        entry.set_reconcile(handle);
    }

    /// Drops interest in a game: in-flight fetches are ignored from now on and
    /// the cached state is forgotten once nothing watches it.
    pub fn release(&self, game_id: &str) {
        self.cache.release(game_id);
    }

    /// Merges a game-row notification, refetching when it cannot be merged.
    pub fn apply_game_event(&self, game_id: &str, event: ChangeEvent<GamePatch>) {
        if event.event_type == ChangeEventType::Delete {
            return;
        }
        let Some(patch) = event.new else {
            return;
        };
        match self.cache.entry(game_id).merge_patch(&patch) {
            Freshness::NeedsRefetch => self.reconcile(game_id),
            outcome => debug!("Game {} notification: {:?}", game_id, outcome),
        }
    }

    /// A new move row only signals that the game changed.
    pub fn apply_move_event(&self, game_id: &str, event: ChangeEvent<Move>) {
        if event.event_type == ChangeEventType::Insert {
            self.reconcile(game_id);
        }
    }

    /// Shows the side to move as lost on time until the store says otherwise.
    pub fn declare_flag_fall(&self, game: &Game, loser: Side) -> bool {
        self.cache
            .entry(&game.id)
            .apply_local_flag_fall(game.updated_at, loser)
    }

    async fn refresh(&self, entry: &CacheEntry, game_id: &str) -> Result<Game, GameSyncError> {
        let epoch = entry.begin_fetch();
        let fetched = self
            .repository
            .get_game(game_id)
            .await
            .map_err(GameSyncError::Remote)?;
        match entry.apply_fetched(epoch, fetched.clone()) {
            Freshness::Discarded => Ok(entry.authoritative().unwrap_or(fetched)),
            _ => Ok(fetched),
        }
    }

    async fn refetch_or_invalidate(&self, entry: &CacheEntry, game_id: &str) {
        if let Err(e) = self.refresh(entry, game_id).await {
            warn!("Refetching game {} failed: {}", game_id, e);
            entry.invalidate();
        }
    }
}

fn random_side() -> Side {
    if rand::thread_rng().gen_bool(0.5) {
        Side::White
    } else {
        Side::Black
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::repositories::game_repository::MockGameRepository;
    use crate::services::auth_service::MockIdentityProvider;
    use crate::services::errors::auth_service_errors::AuthServiceError;
    use crate::services::errors::chess_service_errors::ChessServiceError;

    fn identity(user_id: &'static str) -> Arc<MockIdentityProvider> {
        let mut identity = MockIdentityProvider::new();
        identity
            .expect_user_id()
            .returning(move || Ok(user_id.to_string()));
        Arc::new(identity)
    }

    fn active_game() -> Game {
        let mut game = Game::new("white", Side::White, GameSettings::new(600, 0));
        game.black_player_id = Some("black".to_string());
        game.status = GameStatus::Active;
        game
    }

    #[tokio::test]
    async fn test_create_game_requires_identity() {
        let mut identity = MockIdentityProvider::new();
        identity
            .expect_user_id()
            .returning(|| Err(AuthServiceError::MissingToken));
        let mut repository = MockGameRepository::new();
        repository.expect_create_game().never();
        let client = GameSyncClient::new(Arc::new(repository), Arc::new(identity));

        let result = client.create_game(GameSettings::new(600, 0)).await;

        assert_eq!(result, Err(GameSyncError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_create_game_rejection_leaves_cache_untouched() {
        let mut repository = MockGameRepository::new();
        repository
            .expect_create_game()
            .returning(|_| Err(GameRepositoryError::Rejected("time_control".to_string())));
        let client = GameSyncClient::new(Arc::new(repository), identity("white"));

        let result = client.create_game(GameSettings::new(0, 0)).await;

        assert!(matches!(result, Err(GameSyncError::Remote(GameRepositoryError::Rejected(_)))));
        assert!(client.cache.get("anything").is_none());
    }

    #[tokio::test]
    async fn test_create_game_seats_caller_on_one_side() {
        let mut repository = MockGameRepository::new();
        repository.expect_create_game().returning(|game| Ok(game.clone()));
        let client = GameSyncClient::new(Arc::new(repository), identity("creator"));

        let game = client.create_game(GameSettings::new(300, 2)).await.unwrap();

        let seats = [game.white_player_id.as_deref(), game.black_player_id.as_deref()];
        assert_eq!(seats.iter().filter(|seat| **seat == Some("creator")).count(), 1);
        assert_eq!(seats.iter().filter(|seat| seat.is_none()).count(), 1);
        assert_eq!(client.cached(&game.id), Some(game));
    }

    #[tokio::test]
    async fn test_illegal_move_never_reaches_store() {
        let game = active_game();
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .times(1)
            .returning(move |_| Ok(fetched.clone()));
        repository.expect_commit_move().never();
        let clock = Arc::new(ManualClock::new(game.updated_at));
        let client = GameSyncClient::with_clock(Arc::new(repository), identity("white"), clock);
        client.get_game(&game.id).await.unwrap();

        let result = client.make_move(&game.id, "e2", "e9", None).await;

        assert_eq!(
            result,
            Err(GameSyncError::IllegalMove(ChessServiceError::InvalidSquare("e9".to_string())))
        );
        assert_eq!(client.cached(&game.id), Some(game));
    }

    #[tokio::test]
    async fn test_remote_failure_rolls_back_exactly() {
        let game = active_game();
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .returning(move |_| Ok(fetched.clone()));
        repository
            .expect_commit_move()
            .times(1)
            .returning(|_| Err(GameRepositoryError::DynamoDb("throttled".to_string())));
        let clock = Arc::new(ManualClock::new(game.updated_at));
        let client = GameSyncClient::with_clock(Arc::new(repository), identity("white"), clock);
        client.get_game(&game.id).await.unwrap();

        let result = client.make_move(&game.id, "e2", "e4", None).await;

        assert!(matches!(result, Err(GameSyncError::Remote(_))));
        assert_eq!(client.cached(&game.id), Some(game));
    }

    #[tokio::test]
    async fn test_commit_conditions_on_snapshot_position() {
        let game = active_game();
        let expected_fen = game.fen.clone();
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .returning(move |_| Ok(fetched.clone()));
        repository
            .expect_commit_move()
            .withf(move |commit| {
                commit.expected_fen == expected_fen
                    && commit.record.move_number == 1
                    && commit.record.move_text == "e4"
                    && commit.patch.current_turn == Some(Side::Black)
            })
            .times(1)
            .returning(|commit| Ok(commit.record.clone()));
        let clock = Arc::new(ManualClock::new(game.updated_at));
        let client = GameSyncClient::with_clock(Arc::new(repository), identity("white"), clock);

        let stored = client.make_move(&game.id, "e2", "e4", None).await.unwrap();

        assert_eq!(stored.move_number, 1);
    }

    #[tokio::test]
    async fn test_abandon_requires_own_side() {
        let game = active_game();
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .returning(move |_| Ok(fetched.clone()));
        repository.expect_update_game().never();
        let client = GameSyncClient::new(Arc::new(repository), identity("white"));

        let result = client.abandon_game(&game.id, Side::Black).await;

        assert!(matches!(result, Err(GameSyncError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_abandon_refetches_even_on_failure() {
        let game = active_game();
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .times(2)
            .returning(move |_| Ok(fetched.clone()));
        repository
            .expect_update_game()
            .withf(|_, patch, precondition| {
                patch.result == Some(GameResult::Abandoned)
                    && patch.winner_id.as_deref() == Some("black")
                    && *precondition == UpdatePrecondition::NotTerminal
            })
            .returning(|_, _, _| Err(GameRepositoryError::Unavailable("offline".to_string())));
        let client = GameSyncClient::new(Arc::new(repository), identity("white"));

        let result = client.abandon_game(&game.id, Side::White).await;

        assert!(matches!(result, Err(GameSyncError::Remote(_))));
    }

    #[tokio::test]
    async fn test_join_rejects_own_game() {
        let game = Game::new("creator", Side::White, GameSettings::new(600, 0));
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .returning(move |_| Ok(fetched.clone()));
        repository.expect_update_game().never();
        let client = GameSyncClient::new(Arc::new(repository), identity("creator"));

        let result = client.join_game(&game.id).await;

        assert!(matches!(result, Err(GameSyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_release_forgets_unwatched_game() {
        let game = active_game();
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .returning(move |_| Ok(fetched.clone()));
        let client = GameSyncClient::new(Arc::new(repository), identity("white"));
        client.get_game(&game.id).await.unwrap();

        client.release(&game.id);

        assert!(client.cached(&game.id).is_none());
    }

    #[tokio::test]
    async fn test_history_pages_newest_first() {
        let mut repository = MockGameRepository::new();
        repository.expect_list_games_for_player().returning(|player| {
            Ok((0..5)
                .map(|_| Game::new(player, Side::White, GameSettings::new(60, 0)))
                .collect())
        });
        let client = GameSyncClient::new(Arc::new(repository), identity("white"));

        let page = client.get_game_history(2, 4).await.unwrap();

        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_move_event_triggers_refetch() {
        let game = active_game();
        let mut repository = MockGameRepository::new();
        let fetched = game.clone();
        repository
            .expect_get_game()
            .times(1)
            .returning(move |_| Ok(fetched.clone()));
        let client = GameSyncClient::new(Arc::new(repository), identity("white"));
        let mut view = client.watch(&game.id);

        client.apply_move_event(
            &game.id,
            ChangeEvent::insert(Move::new(&game.id, "white", 1, "e4", "fen", None)),
        );

        view.changed().await.unwrap();
        assert_eq!(view.borrow().clone(), Some(game));
    }
}
