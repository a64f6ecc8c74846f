use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ChessServiceError {
    InvalidSquare(String),
    InvalidPromotion(String),
    InvalidPosition(String),
    IllegalMove(String),
    NotYourTurn,
    GameOver(String),
    GameNotStarted,
}

impl fmt::Display for ChessServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChessServiceError::InvalidSquare(square) => write!(f, "Invalid square: {}", square),
            ChessServiceError::InvalidPromotion(piece) => {
                write!(f, "Invalid promotion piece: {}", piece)
            }
            ChessServiceError::InvalidPosition(msg) => write!(f, "Invalid position: {}", msg),
            ChessServiceError::IllegalMove(msg) => write!(f, "Illegal move: {}", msg),
            ChessServiceError::NotYourTurn => write!(f, "Not your turn"),
            ChessServiceError::GameOver(msg) => write!(f, "Game is over: {}", msg),
            ChessServiceError::GameNotStarted => write!(f, "Game has not started"),
        }
    }
}

impl std::error::Error for ChessServiceError {}
