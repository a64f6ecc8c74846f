pub mod change;
pub mod game;
pub mod game_move;
pub mod move_request;
pub mod token_claims;
pub mod user;
