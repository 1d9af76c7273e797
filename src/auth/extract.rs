use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use sqlx::SqlitePool;

use crate::AppError;

use super::{authenticate, bearer_token, AuthError, Keys, Principal};

/// Read-path extractor: a bearer token that verifies, or 401.
pub struct AuthUser(pub Principal);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    SqlitePool: FromRef<S>,
    Keys: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers) else {
            return Err(AppError::Unauthorized);
        };
        let db_pool = SqlitePool::from_ref(state);
        let keys = Keys::from_ref(state);

        match authenticate(&db_pool, &keys, token).await {
            Ok(principal) => Ok(AuthUser(principal)),
            Err(AuthError::Db(e)) => Err(e.into()),
            Err(e) => {
                tracing::debug!(error = %e, "read path credential refused");
                Err(AppError::Unauthorized)
            }
        }
    }
}
