use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted ply. Never mutated after it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub id: String,
    pub game_id: String,
    pub player_id: String,
    pub move_number: u32,
    pub move_text: String,
    pub fen: String,
    pub captured_piece: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Move {
    pub fn new(
        game_id: &str,
        player_id: &str,
        move_number: u32,
        move_text: &str,
        fen: &str,
        captured_piece: Option<String>,
    ) -> Self {
        Move {
            id: Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            player_id: player_id.to_string(),
            move_number,
            move_text: move_text.to_string(),
            fen: fen.to_string(),
            captured_piece,
            created_at: Utc::now(),
        }
    }
}
