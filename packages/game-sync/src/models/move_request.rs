use serde::{Deserialize, Serialize};

/// A move as entered by a player, before it is checked against the position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub game_id: String,
    pub from_square: String,
    pub to_square: String,
    /// One of `q`, `r`, `b`, `n`. Pawns reaching the last rank default to a queen.
    pub promotion_piece: Option<String>,
}

impl MoveRequest {
    pub fn new(game_id: String, from_square: String, to_square: String) -> Self {
        MoveRequest {
            game_id,
            from_square,
            to_square,
            promotion_piece: None,
        }
    }

    pub fn with_promotion(mut self, piece: String) -> Self {
        self.promotion_piece = Some(piece);
        self
    }
}
