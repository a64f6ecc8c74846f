use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub elo_rating: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: String, username: String, email: Option<String>) -> Self {
        let now = Utc::now();
        User {
            id,
            username,
            email,
            wins: 0,
            losses: 0,
            draws: 0,
            elo_rating: 1200, // Default starting rating for chess platform
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stats(&self) -> UserStats {
        UserStats {
            wins: self.wins,
            losses: self.losses,
            draws: self.draws,
            elo_rating: self.elo_rating,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub elo_rating: i32,
}

impl UserStats {
    pub fn games_played(&self) -> u32 {
        self.wins + self.losses + self.draws
    }
}
