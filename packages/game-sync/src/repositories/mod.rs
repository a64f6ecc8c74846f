pub mod change_feed;
pub mod errors;
pub mod game_repository;
pub mod in_memory_game_repository;
pub mod user_repository;
