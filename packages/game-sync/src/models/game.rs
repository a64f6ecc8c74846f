use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opponent(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "white" | "w" => Ok(Side::White),
            "black" | "b" => Ok(Side::Black),
            other => Err(format!("Unknown side: {}", other)),
        }
    }
}

/// Lifecycle of a game. Transitions only move forward:
/// `waiting -> active -> {completed, abandoned}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Waiting,
    Active,
    Completed,
    Abandoned,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GameStatus::Completed | GameStatus::Abandoned)
    }

    fn rank(self) -> u8 {
        match self {
            GameStatus::Waiting => 0,
            GameStatus::Active => 1,
            GameStatus::Completed | GameStatus::Abandoned => 2,
        }
    }

    pub fn can_transition_to(self, next: GameStatus) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameResult {
    Checkmate,
    Stalemate,
    Draw,
    Abandoned,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSettings {
    /// Initial allotment per side, in seconds.
    pub time_control: u32,
    /// Seconds added to the mover's clock after each move.
    pub increment: u32,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub allow_takebacks: bool,
}

impl GameSettings {
    pub fn new(time_control: u32, increment: u32) -> Self {
        GameSettings {
            time_control,
            increment,
            is_private: false,
            allow_takebacks: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.time_control == 0 {
            return Err("time_control must be positive".to_string());
        }
        Ok(())
    }
}

/// Pieces each side has taken, as lowercase piece letters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPieces {
    #[serde(default)]
    pub white: Vec<String>,
    #[serde(default)]
    pub black: Vec<String>,
}

impl CapturedPieces {
    pub fn record(&mut self, capturer: Side, piece: &str) {
        match capturer {
            Side::White => self.white.push(piece.to_string()),
            Side::Black => self.black.push(piece.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    /// Seats are index keys in the store, so an open seat is left out of the row.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub white_player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub black_player_id: Option<String>,
    pub settings: GameSettings,
    pub status: GameStatus,
    pub result: Option<GameResult>,
    #[serde(default)]
    pub winner_id: Option<String>,
    pub current_turn: Side,
    pub fen: String,
    pub pgn: Option<String>,
    pub white_time_remaining: u32,
    pub black_time_remaining: u32,
    #[serde(default)]
    pub captured_pieces: CapturedPieces,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Game {
    /// A waiting game at the starting position with `creator_id` seated on `side`.
    pub fn new(creator_id: &str, side: Side, settings: GameSettings) -> Self {
        let now = Utc::now();
        let (white_player_id, black_player_id) = match side {
            Side::White => (Some(creator_id.to_string()), None),
            Side::Black => (None, Some(creator_id.to_string())),
        };
        Game {
            id: Uuid::new_v4().to_string(),
            white_player_id,
            black_player_id,
            status: GameStatus::Waiting,
            result: None,
            winner_id: None,
            current_turn: Side::White,
            fen: STARTING_FEN.to_string(),
            pgn: None,
            white_time_remaining: settings.time_control,
            black_time_remaining: settings.time_control,
            captured_pieces: CapturedPieces::default(),
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn player_id(&self, side: Side) -> Option<&str> {
        match side {
            Side::White => self.white_player_id.as_deref(),
            Side::Black => self.black_player_id.as_deref(),
        }
    }

    pub fn side_of(&self, player_id: &str) -> Option<Side> {
        if self.white_player_id.as_deref() == Some(player_id) {
            Some(Side::White)
        } else if self.black_player_id.as_deref() == Some(player_id) {
            Some(Side::Black)
        } else {
            None
        }
    }

    pub fn time_remaining(&self, side: Side) -> u32 {
        match side {
            Side::White => self.white_time_remaining,
            Side::Black => self.black_time_remaining,
        }
    }

    pub fn set_time_remaining(&mut self, side: Side, seconds: u32) {
        match side {
            Side::White => self.white_time_remaining = seconds,
            Side::Black => self.black_time_remaining = seconds,
        }
    }

    pub fn is_full(&self) -> bool {
        self.white_player_id.is_some() && self.black_player_id.is_some()
    }

    /// Non-destructive partial merge: only fields present in `patch` change.
    pub fn apply_patch(&mut self, patch: &GamePatch) {
        if let Some(white) = &patch.white_player_id {
            self.white_player_id = Some(white.clone());
        }
        if let Some(black) = &patch.black_player_id {
            self.black_player_id = Some(black.clone());
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(result) = patch.result {
            self.result = Some(result);
        }
        if let Some(winner) = &patch.winner_id {
            self.winner_id = Some(winner.clone());
        }
        if let Some(turn) = patch.current_turn {
            self.current_turn = turn;
        }
        if let Some(fen) = &patch.fen {
            self.fen = fen.clone();
        }
        if let Some(pgn) = &patch.pgn {
            self.pgn = Some(pgn.clone());
        }
        if let Some(white_time) = patch.white_time_remaining {
            self.white_time_remaining = white_time;
        }
        if let Some(black_time) = patch.black_time_remaining {
            self.black_time_remaining = black_time;
        }
        if let Some(captured) = &patch.captured_pieces {
            self.captured_pieces = captured.clone();
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }

    /// The patch that turns `self` into `other`, listing only changed fields.
    pub fn diff(&self, other: &Game) -> GamePatch {
        fn changed<T: PartialEq + Clone>(before: &T, after: &T) -> Option<T> {
            (before != after).then(|| after.clone())
        }

        GamePatch {
            white_player_id: changed(&self.white_player_id, &other.white_player_id).flatten(),
            black_player_id: changed(&self.black_player_id, &other.black_player_id).flatten(),
            status: changed(&self.status, &other.status),
            result: changed(&self.result, &other.result).flatten(),
            winner_id: changed(&self.winner_id, &other.winner_id).flatten(),
            current_turn: changed(&self.current_turn, &other.current_turn),
            fen: changed(&self.fen, &other.fen),
            pgn: changed(&self.pgn, &other.pgn).flatten(),
            white_time_remaining: changed(&self.white_time_remaining, &other.white_time_remaining),
            black_time_remaining: changed(&self.black_time_remaining, &other.black_time_remaining),
            captured_pieces: changed(&self.captured_pieces, &other.captured_pieces),
            updated_at: Some(other.updated_at),
        }
    }
}

/// A partial game row. Used for store updates and carried by change notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GamePatch {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub white_player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub black_player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<GameStatus>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<GameResult>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub winner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_turn: Option<Side>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pgn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub white_time_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub black_time_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub captured_pieces: Option<CapturedPieces>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl GamePatch {
    pub fn completed(result: GameResult, winner_id: Option<String>) -> Self {
        GamePatch {
            status: Some(GameStatus::Completed),
            result: Some(result),
            winner_id,
            ..Default::default()
        }
    }
}
