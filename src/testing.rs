//! Fixtures shared by the unit tests.

use std::{str::FromStr, sync::Arc, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use crate::{
    auth::{self, Keys, Principal},
    db,
    fabric::InProcessFabric,
    AppState, GatewaySettings,
};

/// A migrated in-memory database. One connection, kept for the pool's
/// lifetime, since every new in-memory connection is a new database.
pub async fn db_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap().foreign_keys(true);
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    db::migrate(&db_pool).await.unwrap();
    db_pool
}

pub fn keys() -> Keys {
    Keys::new(b"roomchat-test-secret")
}

/// Keys nobody in the test state trusts.
pub fn other_keys() -> Keys {
    Keys::new(b"someone-else")
}

/// Creates `username` and authenticates a fresh token for them.
pub async fn principal(db_pool: &SqlitePool, username: &str) -> Principal {
    let keys = keys();
    let user = db::insert_user(db_pool, username, false).await.unwrap();
    auth::authenticate(db_pool, &keys, &keys.issue(user.id, 3600).unwrap()).await.unwrap()
}

pub async fn state() -> AppState {
    AppState {
        db_pool: db_pool().await,
        keys: keys(),
        fabric: Arc::new(InProcessFabric::new()),
        gateway: GatewaySettings { handshake_timeout: Duration::from_secs(5) },
    }
}
