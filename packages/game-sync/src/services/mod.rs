pub mod auth_service;
pub mod change_feed_listener;
pub mod chess_service;
pub mod clock_projector;
pub mod errors;
pub mod game_cache;
pub mod game_sync_service;
pub mod user_service;
