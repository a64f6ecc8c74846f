pub mod auth_service_errors;
pub mod chess_service_errors;
pub mod game_sync_errors;
pub mod user_service_errors;
