//! Access-token identity for both the gateway handshake and the read path.
//!
//! Tokens are verified against the signing key, the revocation table and the
//! user table. Callers on the real-time path only ever see "a principal" or
//! "anonymous"; the reason a credential was refused is logged here and goes no
//! further.

mod extract;
mod token;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db;

pub use extract::AuthUser;
pub use token::{ACCESS_TOKEN_TYPE, Claims, Keys};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("not an access token")]
    WrongTokenType,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("user {0} does not exist or is inactive")]
    UnknownUser(Uuid),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// An authenticated user, as established from one access token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub is_staff: bool,
    pub jti: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl Principal {
    /// Checks that the credential this principal was built from is still good:
    /// unexpired, unrevoked, and its user still active.
    pub async fn reverify(&self, db_pool: &SqlitePool) -> Result<(), AuthError> {
        if time::OffsetDateTime::now_utc().unix_timestamp() >= self.expires_at {
            return Err(AuthError::Expired);
        }
        if db::is_token_revoked(db_pool, &self.jti).await? {
            return Err(AuthError::Revoked);
        }
        if db::find_active_user(db_pool, self.user_id).await?.is_none() {
            return Err(AuthError::UnknownUser(self.user_id));
        }
        Ok(())
    }
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() || token.contains(' ') {
        return None;
    }
    Some(token)
}

pub async fn authenticate(
    db_pool: &SqlitePool,
    keys: &Keys,
    token: &str,
) -> Result<Principal, AuthError> {
    let claims = keys.decode(token)?;
    if claims.token_type != ACCESS_TOKEN_TYPE {
        return Err(AuthError::WrongTokenType);
    }
    if db::is_token_revoked(db_pool, &claims.jti).await? {
        return Err(AuthError::Revoked);
    }
    let Some(user) = db::find_active_user(db_pool, claims.user_id).await? else {
        return Err(AuthError::UnknownUser(claims.user_id));
    };

    debug!(user_id = %user.id, "token authenticated");
    Ok(Principal {
        user_id: user.id,
        is_staff: user.is_staff,
        jti: claims.jti,
        expires_at: claims.exp,
    })
}

/// Resolves handshake headers to a principal. Missing and invalid credentials
/// both come back as `None`.
pub async fn identify(db_pool: &SqlitePool, keys: &Keys, headers: &HeaderMap) -> Option<Principal> {
    let token = bearer_token(headers)?;
    match authenticate(db_pool, keys, token).await {
        Ok(principal) => Some(principal),
        Err(e) => {
            warn!(error = %e, "refusing credential");
            None
        }
    }
}

pub async fn revoke(db_pool: &SqlitePool, jti: &str) -> Result<(), sqlx::Error> {
    db::revoke_token(db_pool, jti).await
}
