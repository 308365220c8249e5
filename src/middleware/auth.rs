use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use crate::{errors::AppError, handlers::AppState};

/// Caller identity taken from a verified bearer token. The ledger trusts
/// `user_id` as-is from here on.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: Option<String>,
}

impl AuthenticatedUser {
    /// Rejects a request body that names a different user than the token.
    pub fn ensure_same_user(&self, claimed: Option<&str>) -> Result<(), AppError> {
        match claimed {
            Some(claimed) if claimed != self.user_id => Err(AppError::Auth(
                "userId does not match the authenticated user".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::Auth("Authentication required".to_string()))?;

        let claims = state.jwt.verify_token(token.trim())?;

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}
