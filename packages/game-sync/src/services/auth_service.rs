use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};

use crate::models::token_claims::TokenClaims;
use crate::services::errors::auth_service_errors::AuthServiceError;

#[cfg(test)]
use mockall::automock;

/// Source of the signed-in user's id.
#[cfg_attr(test, automock)]
pub trait IdentityProvider: Send + Sync {
    fn user_id(&self) -> Result<String, AuthServiceError>;
}

/// An access token issued by the backend, verified locally with the shared secret.
pub struct AuthSession {
    jwt_secret: String,
    access_token: Option<String>,
}

impl AuthSession {
    pub fn new(jwt_secret: String, access_token: Option<String>) -> Self {
        AuthSession {
            jwt_secret,
            access_token,
        }
    }

    /// Reads `JWT_SECRET` and `ACCESS_TOKEN`. A missing token yields an
    /// anonymous session.
    pub fn from_env() -> Result<Self, AuthServiceError> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| AuthServiceError::JwtError("JWT_SECRET is not set".to_string()))?;
        Ok(AuthSession::new(jwt_secret, std::env::var("ACCESS_TOKEN").ok()))
    }

    pub fn sign_in(&mut self, access_token: String) {
        self.access_token = Some(access_token);
    }

    pub fn sign_out(&mut self) {
        self.access_token = None;
    }

    pub fn generate_token(&self, user_id: &str) -> Result<String, AuthServiceError> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub: user_id.to_string(),
            exp: (now + Duration::hours(24)).timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_ref()),
        )
        .map_err(|e| AuthServiceError::JwtError(format!("{:#?}", e)))
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthServiceError> {
        let decoding_key = DecodingKey::from_secret(self.jwt_secret.as_ref());

        match decode::<TokenClaims>(token, &decoding_key, &Validation::default()) {
            Ok(token_data) => Ok(token_data.claims),
            Err(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Err(AuthServiceError::ExpiredToken)
                }
                _ => Err(AuthServiceError::InvalidToken),
            },
        }
    }
}

impl IdentityProvider for AuthSession {
    fn user_id(&self) -> Result<String, AuthServiceError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or(AuthServiceError::MissingToken)?;
        Ok(self.verify_token(token)?.sub)
    }
}

/// A fixed identity, for local play and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
}

impl StaticIdentity {
    pub fn user(user_id: &str) -> Self {
        StaticIdentity {
            user_id: Some(user_id.to_string()),
        }
    }

    pub fn anonymous() -> Self {
        StaticIdentity::default()
    }
}

impl IdentityProvider for StaticIdentity {
    fn user_id(&self) -> Result<String, AuthServiceError> {
        self.user_id.clone().ok_or(AuthServiceError::MissingToken)
    }
}
