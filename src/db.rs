use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::appresult::SyncError;

// stored as TEXT columns, serialized as camelCase on the wire
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(SyncError::Invalid(format!("unknown {} {other:?}", stringify!($name)))),
                }
            }
        }
    };
}

text_enum!(UserStatus {
    Available => "available",
    DoNotDisturb => "doNotDisturb",
    Hidden => "hidden",
});

text_enum!(RoomKind {
    Private => "private",
    Group => "group",
});

text_enum!(ContentType {
    Text => "text",
    Image => "image",
    Audio => "audio",
    Video => "video",
    File => "file",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub display_name: String,
    pub status: UserStatus,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: Uuid,
    pub kind: RoomKind,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub username: String,
    pub room_id: Uuid,
    pub hidden: bool,
    pub blocked: bool,
    pub notification_muted: bool,
    pub admin: bool,
    pub pinned: bool,
    pub favourited: bool,
    pub last_read_message_id: Option<String>,
    pub joined_at: i64,
}

/// A room as seen by one of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
    #[serde(flatten)]
    pub room: Room,
    pub participants: Vec<String>,
    pub membership: Membership,
}

/// Messages are totally ordered within a room by `(created_at, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub key: String,
    pub room_id: Uuid,
    pub sender: String,
    pub content: String,
    pub content_type: ContentType,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    #[serde(default)]
    pub hidden: bool,
}

impl Message {
    pub fn order_key(&self) -> (i64, &str) {
        (self.created_at, self.key.as_str())
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct MessageRow {
    key: String,
    room_id: String,
    sender: String,
    content: String,
    content_type: String,
    created_at: i64,
    edited_at: Option<i64>,
    hidden: bool,
}

pub(crate) const MESSAGE_COLUMNS: &str =
    "key,room_id,sender,content,content_type,created_at,edited_at,hidden";

impl TryFrom<MessageRow> for Message {
    type Error = SyncError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            key: row.key,
            room_id: parse_uuid(&row.room_id)?,
            sender: row.sender,
            content: row.content,
            content_type: row.content_type.parse()?,
            created_at: row.created_at,
            edited_at: row.edited_at,
            hidden: row.hidden,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RoomRow {
    room_id: String,
    kind: String,
    display_name: Option<String>,
    avatar: Option<String>,
    created_at: i64,
}

impl TryFrom<RoomRow> for Room {
    type Error = SyncError;

    fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
        Ok(Room {
            room_id: parse_uuid(&row.room_id)?,
            kind: row.kind.parse()?,
            display_name: row.display_name,
            avatar: row.avatar,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    username: String,
    room_id: String,
    hidden: bool,
    blocked: bool,
    notification_muted: bool,
    admin: bool,
    pinned: bool,
    favourited: bool,
    last_read_key: Option<String>,
    joined_at: i64,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = SyncError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Membership {
            username: row.username,
            room_id: parse_uuid(&row.room_id)?,
            hidden: row.hidden,
            blocked: row.blocked,
            notification_muted: row.notification_muted,
            admin: row.admin,
            pinned: row.pinned,
            favourited: row.favourited,
            last_read_message_id: row.last_read_key,
            joined_at: row.joined_at,
        })
    }
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, SyncError> {
    Uuid::parse_str(raw).map_err(|err| SyncError::Db(sqlx::Error::Decode(Box::new(err))))
}

/// Runs a persistence call, converting an elapsed `limit` into `PersistFailed`.
pub async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(SyncError::PersistFailed(format!("no answer within {limit:?}"))))
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Creates every table and index if missing. Safe to run on each start.
pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username        TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'available',
            avatar          TEXT
        );

        CREATE TABLE IF NOT EXISTS rooms (
            room_id         TEXT PRIMARY KEY,
            kind            TEXT NOT NULL,
            display_name    TEXT,
            avatar          TEXT,
            dyad_key        TEXT UNIQUE,
            created_at      INTEGER NOT NULL,
            deleted         INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS memberships (
            username            TEXT NOT NULL REFERENCES users(username),
            room_id             TEXT NOT NULL REFERENCES rooms(room_id),
            hidden              INTEGER NOT NULL DEFAULT 0,
            blocked             INTEGER NOT NULL DEFAULT 0,
            notification_muted  INTEGER NOT NULL DEFAULT 0,
            admin               INTEGER NOT NULL DEFAULT 0,
            pinned              INTEGER NOT NULL DEFAULT 0,
            favourited          INTEGER NOT NULL DEFAULT 0,
            last_read_key       TEXT,
            joined_at           INTEGER NOT NULL,
            PRIMARY KEY (username, room_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            key             TEXT PRIMARY KEY,
            room_id         TEXT NOT NULL REFERENCES rooms(room_id),
            sender          TEXT NOT NULL,
            content         TEXT NOT NULL,
            content_type    TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            edited_at       INTEGER,
            hidden          INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS messages_room_order ON messages (room_id, created_at, key);
        CREATE INDEX IF NOT EXISTS memberships_room ON memberships (room_id);
        "#,
    )
    .execute(db_pool)
    .await?;
    Ok(())
}

/// Writes a user row. Accounts belong to the external account service; this
/// exists for seeding and tests.
pub async fn insert_user(db_pool: &SqlitePool, user: &User) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO users (username,display_name,status,avatar) VALUES (?,?,?,?)")
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(user.status.as_str())
        .bind(&user.avatar)
        .execute(db_pool)
        .await?;
    Ok(())
}

pub async fn fetch_user(db_pool: &SqlitePool, username: &str) -> Result<Option<User>, SyncError> {
    let row: Option<(String, String, String, Option<String>)> =
        sqlx::query_as("SELECT username,display_name,status,avatar FROM users WHERE username=?")
            .bind(username)
            .fetch_optional(db_pool)
            .await?;

    row.map(|(username, display_name, status, avatar)| {
        Ok::<_, SyncError>(User { username, display_name, status: status.parse()?, avatar })
    })
    .transpose()
}

pub async fn fetch_room(db_pool: &SqlitePool, room_id: Uuid) -> Result<Option<Room>, SyncError> {
    sqlx::query_as::<_, RoomRow>(
        "SELECT room_id,kind,display_name,avatar,created_at FROM rooms WHERE room_id=? AND deleted=0",
    )
    .bind(room_id.to_string())
    .fetch_optional(db_pool)
    .await?
    .map(Room::try_from)
    .transpose()
}

pub async fn fetch_membership(
    db_pool: &SqlitePool,
    username: &str,
    room_id: Uuid,
) -> Result<Option<Membership>, SyncError> {
    sqlx::query_as::<_, MembershipRow>("SELECT * FROM memberships WHERE username=? AND room_id=?")
        .bind(username)
        .bind(room_id.to_string())
        .fetch_optional(db_pool)
        .await?
        .map(Membership::try_from)
        .transpose()
}

/// Fails with `Membership` unless `username` has a membership row in the room.
pub async fn require_membership(
    db_pool: &SqlitePool,
    username: &str,
    room_id: Uuid,
) -> Result<Membership, SyncError> {
    fetch_membership(db_pool, username, room_id)
        .await?
        .ok_or(SyncError::Membership(room_id))
}

pub async fn participants(db_pool: &SqlitePool, room_id: Uuid) -> Result<Vec<String>, SyncError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT username FROM memberships WHERE room_id=? ORDER BY joined_at,username")
            .bind(room_id.to_string())
            .fetch_all(db_pool)
            .await?;
    Ok(rows.into_iter().map(|(username,)| username).collect())
}

pub async fn user_room_ids(db_pool: &SqlitePool, username: &str) -> Result<Vec<Uuid>, SyncError> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT room_id FROM memberships WHERE username=?")
        .bind(username)
        .fetch_all(db_pool)
        .await?;
    rows.iter().map(|(room_id,)| parse_uuid(room_id)).collect()
}

pub async fn user_rooms(db_pool: &SqlitePool, username: &str) -> Result<Vec<RoomDetails>, SyncError> {
    let mut rooms = Vec::new();
    for room_id in user_room_ids(db_pool, username).await? {
        let Some(room) = fetch_room(db_pool, room_id).await? else {
            continue;
        };
        let Some(membership) = fetch_membership(db_pool, username, room_id).await? else {
            continue;
        };
        rooms.push(RoomDetails {
            room,
            participants: participants(db_pool, room_id).await?,
            membership,
        });
    }
    rooms.sort_by_key(|details| (details.room.created_at, details.room.room_id));
    Ok(rooms)
}

pub async fn fetch_message(db_pool: &SqlitePool, key: &str) -> Result<Option<Message>, SyncError> {
    sqlx::query_as::<_, MessageRow>(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE key=?"))
        .bind(key)
        .fetch_optional(db_pool)
        .await?
        .map(Message::try_from)
        .transpose()
}

#[cfg(test)]
pub(crate) mod testing {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    /// One connection, so every query sees the same in-memory database.
    pub(crate) async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    pub(crate) async fn seed_users(pool: &SqlitePool, usernames: &[&str]) {
        for username in usernames {
            insert_user(
                pool,
                &User {
                    username: username.to_string(),
                    display_name: username.to_uppercase(),
                    status: UserStatus::Available,
                    avatar: None,
                },
            )
            .await
            .unwrap();
        }
    }
}
