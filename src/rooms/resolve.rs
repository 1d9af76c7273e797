use serde::Deserialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{self, Room};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no room or recipient selected")]
    NoSelector,
    #[error("room not found")]
    RoomNotFound,
    #[error("recipient not found")]
    RecipientNotFound,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Connect-time selectors, straight off the query string.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub room_id: Option<String>,
    pub recipient_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Room(Uuid),
    Recipient(Uuid),
}

impl ConnectQuery {
    /// `room_id` wins when both are given. An id that doesn't parse can't name
    /// anything, so it resolves the same way a missing room or user does.
    pub fn selector(&self) -> Result<Selector, ResolveError> {
        if let Some(room_id) = &self.room_id {
            return Uuid::parse_str(room_id.trim())
                .map(Selector::Room)
                .map_err(|_| ResolveError::RoomNotFound);
        }
        if let Some(recipient_id) = &self.recipient_id {
            return Uuid::parse_str(recipient_id.trim())
                .map(Selector::Recipient)
                .map_err(|_| ResolveError::RecipientNotFound);
        }
        Err(ResolveError::NoSelector)
    }
}

/// Key identifying the one-to-one room of an unordered pair.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo.simple(), hi.simple())
}

/// Finds the room a connection should bind to. Rooms named by id must exist;
/// a recipient gets the pair's one-to-one room, created on first contact.
pub async fn resolve(
    db_pool: &SqlitePool,
    requester: Uuid,
    selector: Selector,
) -> Result<Uuid, ResolveError> {
    match selector {
        Selector::Room(room_id) => {
            let room = db::find_room(db_pool, room_id).await?.ok_or(ResolveError::RoomNotFound)?;
            Ok(room.id)
        }
        Selector::Recipient(recipient_id) => {
            // A one-to-one room needs two distinct members.
            if recipient_id == requester {
                return Err(ResolveError::RecipientNotFound);
            }
            if db::find_active_user(db_pool, recipient_id).await?.is_none() {
                return Err(ResolveError::RecipientNotFound);
            }
            let room = direct_room(db_pool, requester, recipient_id).await?;
            Ok(room.id)
        }
    }
}

async fn direct_room(db_pool: &SqlitePool, a: Uuid, b: Uuid) -> Result<Room, sqlx::Error> {
    let key = direct_key(a, b);
    match db::find_direct_room(db_pool, &key).await? {
        Some(room) => Ok(room),
        None => create_direct_room(db_pool, a, b, &key).await,
    }
}

/// Inserts the pair's room, or returns the one a concurrent creator committed
/// between our lookup and insert.
async fn create_direct_room(
    db_pool: &SqlitePool,
    a: Uuid,
    b: Uuid,
    key: &str,
) -> Result<Room, sqlx::Error> {
    match db::insert_room(db_pool, None, Some(key), &[a, b]).await {
        Ok(room) => {
            info!(room_id = %room.id, %a, %b, "created one-to-one room");
            Ok(room)
        }
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            debug!(%key, "lost one-to-one creation race, refetching");
            db::find_direct_room(db_pool, key).await?.ok_or(sqlx::Error::RowNotFound)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn direct_key_ignores_order() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        assert_eq!(direct_key(a, b), direct_key(b, a));
        assert_ne!(direct_key(a, b), direct_key(a, a));
    }

    #[test]
    fn selector_precedence_and_parsing() {
        let room = Uuid::now_v7();
        let user = Uuid::now_v7();

        let both = ConnectQuery {
            room_id: Some(room.to_string()),
            recipient_id: Some(user.to_string()),
        };
        assert_eq!(both.selector().unwrap(), Selector::Room(room));

        let recipient = ConnectQuery { room_id: None, recipient_id: Some(user.to_string()) };
        assert_eq!(recipient.selector().unwrap(), Selector::Recipient(user));

        let garbage = ConnectQuery { room_id: Some("42".to_owned()), recipient_id: None };
        assert!(matches!(garbage.selector(), Err(ResolveError::RoomNotFound)));

        assert!(matches!(ConnectQuery::default().selector(), Err(ResolveError::NoSelector)));
    }

    #[tokio::test]
    async fn existing_room_by_id() {
        let db_pool = testing::db_pool().await;
        let a = db::insert_user(&db_pool, "a", false).await.unwrap();
        let room = db::insert_room(&db_pool, Some("general"), None, &[a.id]).await.unwrap();

        assert_eq!(resolve(&db_pool, a.id, Selector::Room(room.id)).await.unwrap(), room.id);
        assert!(matches!(
            resolve(&db_pool, a.id, Selector::Room(Uuid::now_v7())).await,
            Err(ResolveError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn unknown_recipient_creates_nothing() {
        let db_pool = testing::db_pool().await;
        let a = db::insert_user(&db_pool, "a", false).await.unwrap();

        assert!(matches!(
            resolve(&db_pool, a.id, Selector::Recipient(Uuid::now_v7())).await,
            Err(ResolveError::RecipientNotFound)
        ));

        assert!(matches!(
            resolve(&db_pool, a.id, Selector::Recipient(a.id)).await,
            Err(ResolveError::RecipientNotFound)
        ));

        let ghost = db::insert_user(&db_pool, "ghost", false).await.unwrap();
        db::set_user_active(&db_pool, ghost.id, false).await.unwrap();
        assert!(matches!(
            resolve(&db_pool, a.id, Selector::Recipient(ghost.id)).await,
            Err(ResolveError::RecipientNotFound)
        ));

        let (rooms,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM rooms").fetch_one(&db_pool).await.unwrap();
        assert_eq!(rooms, 0);
    }

    #[tokio::test]
    async fn first_contact_creates_then_reuses() {
        let db_pool = testing::db_pool().await;
        let a = db::insert_user(&db_pool, "a", false).await.unwrap();
        let b = db::insert_user(&db_pool, "b", false).await.unwrap();

        let created = resolve(&db_pool, a.id, Selector::Recipient(b.id)).await.unwrap();
        assert!(db::is_member(&db_pool, created, a.id).await.unwrap());
        assert!(db::is_member(&db_pool, created, b.id).await.unwrap());

        let reverse = resolve(&db_pool, b.id, Selector::Recipient(a.id)).await.unwrap();
        assert_eq!(created, reverse);
    }

    #[tokio::test]
    async fn pair_key_blocks_a_second_room() {
        let db_pool = testing::db_pool().await;
        let a = db::insert_user(&db_pool, "a", false).await.unwrap();
        let b = db::insert_user(&db_pool, "b", false).await.unwrap();
        let key = direct_key(a.id, b.id);

        // Another process got there first.
        let winner = db::insert_room(&db_pool, None, Some(&key), &[a.id, b.id]).await.unwrap();

        let err = db::insert_room(&db_pool, None, Some(&key), &[a.id, b.id]).await.unwrap_err();
        assert!(matches!(&err, sqlx::Error::Database(e) if e.is_unique_violation()));
        assert_eq!(direct_room(&db_pool, b.id, a.id).await.unwrap().id, winner.id);
    }

    #[tokio::test]
    async fn losing_the_creation_race_returns_the_winner() {
        let db_pool = testing::db_pool().await;
        let a = db::insert_user(&db_pool, "a", false).await.unwrap();
        let b = db::insert_user(&db_pool, "b", false).await.unwrap();
        let key = direct_key(a.id, b.id);

        let winner = db::insert_room(&db_pool, None, Some(&key), &[a.id, b.id]).await.unwrap();

        // Our lookup missed; the insert collides with the committed room.
        let loser = create_direct_room(&db_pool, b.id, a.id, &key).await.unwrap();
        assert_eq!(loser.id, winner.id);

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM rooms").fetch_one(&db_pool).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(db::room_members(&db_pool, winner.id).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_contact_across_pools_yields_one_room() {
        // Two pools on one file stand in for two gateway processes.
        let name = format!("roomchat-resolve-{}.db", Uuid::now_v7().simple());
        let path = std::env::temp_dir().join(name);
        let url = format!("sqlite://{}", path.display());
        let first = db::connect(&url, 4).await.unwrap();
        db::migrate(&first).await.unwrap();
        let second = db::connect(&url, 4).await.unwrap();

        let a = db::insert_user(&first, "a", false).await.unwrap();
        let b = db::insert_user(&first, "b", false).await.unwrap();

        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let db_pool = if i % 2 == 0 { first.clone() } else { second.clone() };
                let (from, to) = if i % 4 < 2 { (a.id, b.id) } else { (b.id, a.id) };
                tokio::spawn(async move { resolve(&db_pool, from, Selector::Recipient(to)).await })
            })
            .collect();

        let mut rooms = Vec::new();
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(room_id) => rooms.push(room_id),
                Err(e) => panic!("resolve failed: {e}"),
            }
        }
        rooms.dedup();
        assert_eq!(rooms.len(), 1);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rooms WHERE direct_key=?")
            .bind(direct_key(a.id, b.id))
            .fetch_one(&second)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(db::room_members(&first, rooms[0]).await.unwrap().len(), 2);

        first.close().await;
        second.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
