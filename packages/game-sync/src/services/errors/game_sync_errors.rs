use crate::repositories::errors::game_repository_errors::GameRepositoryError;
use crate::services::errors::auth_service_errors::AuthServiceError;
use crate::services::errors::chess_service_errors::ChessServiceError;

#[derive(Debug, Clone, PartialEq)]
pub enum GameSyncError {
    /// Rejected locally by the rule engine. Nothing was sent to the store.
    IllegalMove(ChessServiceError),
    /// The store failed or refused the request. Any speculation was rolled back.
    Remote(GameRepositoryError),
    NotAuthenticated,
    /// The game moved on before the write landed. The cache has been refetched.
    StaleState(String),
    Validation(String),
    Forbidden(String),
}

impl std::fmt::Display for GameSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameSyncError::IllegalMove(err) => write!(f, "Illegal move: {}", err),
            GameSyncError::Remote(err) => write!(f, "Remote error: {}", err),
            GameSyncError::NotAuthenticated => write!(f, "Not authenticated"),
            GameSyncError::StaleState(msg) => write!(f, "Stale game state: {}", msg),
            GameSyncError::Validation(msg) => write!(f, "Validation error: {}", msg),
            GameSyncError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
        }
    }
}

impl std::error::Error for GameSyncError {}

impl From<ChessServiceError> for GameSyncError {
    fn from(err: ChessServiceError) -> Self {
        GameSyncError::IllegalMove(err)
    }
}

impl From<GameRepositoryError> for GameSyncError {
    fn from(err: GameRepositoryError) -> Self {
        match err {
            GameRepositoryError::Conflict(msg) => GameSyncError::StaleState(msg),
            other => GameSyncError::Remote(other),
        }
    }
}

impl From<AuthServiceError> for GameSyncError {
    fn from(_: AuthServiceError) -> Self {
        GameSyncError::NotAuthenticated
    }
}
