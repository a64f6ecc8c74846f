use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::models::user::{User, UserStats};
use crate::repositories::errors::user_repository_errors::UserRepositoryError;
use crate::repositories::user_repository::UserRepository;
use crate::services::errors::user_service_errors::UserServiceError;

const MAX_USERNAME_LENGTH: usize = 50;

pub struct UserService {
    repository: Arc<dyn UserRepository + Send + Sync>,
}

impl UserService {
    pub fn new(repository: Arc<dyn UserRepository + Send + Sync>) -> Self {
        UserService { repository }
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<User, UserServiceError> {
        if user_id.is_empty() {
            return Err(UserServiceError::ValidationError(
                "User ID cannot be empty".to_string(),
            ));
        }
        self.repository
            .get_user_by_id(user_id)
            .await
            .map_err(|e| match e {
                UserRepositoryError::NotFound => UserServiceError::UserNotFound,
                _ => UserServiceError::RepositoryError(e.to_string()),
            })
    }

    pub async fn get_stats(&self, user_id: &str) -> Result<UserStats, UserServiceError> {
        Ok(self.get_profile(user_id).await?.stats())
    }

    pub async fn update_username(
        &self,
        user_id: &str,
        username: &str,
    ) -> Result<User, UserServiceError> {
        let username = username.trim();
        if username.is_empty() || username.chars().count() > MAX_USERNAME_LENGTH {
            return Err(UserServiceError::ValidationError(format!(
                "Username must be between 1 and {} characters",
                MAX_USERNAME_LENGTH
            )));
        }

        let mut user = self.get_profile(user_id).await?;
        user.username = username.to_string();
        user.updated_at = Utc::now();

        self.repository
            .update_user(&user)
            .await
            .map_err(|e| UserServiceError::RepositoryError(e.to_string()))?;

        info!("User {} is now {}", user.id, user.username);
        Ok(user)
    }

    /// Highest rated players first.
    pub async fn get_leaderboard(&self, limit: usize) -> Result<Vec<User>, UserServiceError> {
        if limit == 0 {
            return Err(UserServiceError::ValidationError(
                "Limit must be positive".to_string(),
            ));
        }
        self.repository
            .top_rated(limit)
            .await
            .map_err(|e| UserServiceError::RepositoryError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::user_repository::MockUserRepository;
    use mockall::predicate::eq;

    fn stored_user() -> User {
        let mut user = User::new("user-1".to_string(), "magnus".to_string(), None);
        user.wins = 3;
        user.losses = 1;
        user.draws = 2;
        user
    }

    #[tokio::test]
    async fn test_get_profile_maps_not_found() {
        let mut mock_repo = MockUserRepository::new();
        mock_repo
            .expect_get_user_by_id()
            .with(eq("missing"))
            .returning(|_| Err(UserRepositoryError::NotFound));
        let service = UserService::new(Arc::new(mock_repo));

        let result = service.get_profile("missing").await;

        assert_eq!(result, Err(UserServiceError::UserNotFound));
    }

    #[tokio::test]
    async fn test_get_profile_rejects_empty_id() {
        let service = UserService::new(Arc::new(MockUserRepository::new()));

        let result = service.get_profile("").await;

        assert!(matches!(result, Err(UserServiceError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_get_stats() {
        let mut mock_repo = MockUserRepository::new();
        mock_repo
            .expect_get_user_by_id()
            .returning(|_| Ok(stored_user()));
        let service = UserService::new(Arc::new(mock_repo));

        let stats = service.get_stats("user-1").await.unwrap();

        assert_eq!(stats.games_played(), 6);
        assert_eq!(stats.elo_rating, 1200);
    }

    #[tokio::test]
    async fn test_update_username_persists_trimmed_name() {
        let mut mock_repo = MockUserRepository::new();
        mock_repo
            .expect_get_user_by_id()
            .returning(|_| Ok(stored_user()));
        mock_repo
            .expect_update_user()
            .withf(|user| user.username == "hikaru")
            .times(1)
            .returning(|_| Ok(()));
        let service = UserService::new(Arc::new(mock_repo));

        let user = service.update_username("user-1", "  hikaru ").await.unwrap();

        assert_eq!(user.username, "hikaru");
    }

    #[tokio::test]
    async fn test_update_username_rejects_long_names() {
        let service = UserService::new(Arc::new(MockUserRepository::new()));

        let result = service.update_username("user-1", &"x".repeat(51)).await;

        assert!(matches!(result, Err(UserServiceError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_get_leaderboard_passes_limit() {
        let mut mock_repo = MockUserRepository::new();
        mock_repo
            .expect_top_rated()
            .with(eq(10usize))
            .returning(|_| Ok(vec![stored_user()]));
        let service = UserService::new(Arc::new(mock_repo));

        let leaders = service.get_leaderboard(10).await.unwrap();

        assert_eq!(leaders.len(), 1);
    }
}
