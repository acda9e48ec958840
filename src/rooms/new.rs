use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::{
    appresult::SyncError,
    auth::ConnectionContext,
    db::{self, RoomKind},
    protocol::ServerEvent,
    AppState,
};

use super::push_rooms;

/// Unique per unordered pair of usernames.
fn dyad_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}\u{1f}{hi}")
}

async fn find_dyad(db_pool: &SqlitePool, dyad_key: &str) -> Result<Option<Uuid>, SyncError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT room_id FROM rooms WHERE dyad_key=?")
        .bind(dyad_key)
        .fetch_optional(db_pool)
        .await?;
    row.map(|(room_id,)| db::parse_uuid(&room_id)).transpose()
}

async fn require_user(db_pool: &SqlitePool, username: &str) -> Result<(), SyncError> {
    match db::fetch_user(db_pool, username).await? {
        Some(_) => Ok(()),
        None => Err(SyncError::NotFound(format!("user {username}"))),
    }
}

async fn insert_membership(
    tx: &mut Transaction<'_, Sqlite>,
    username: &str,
    room_id: Uuid,
    admin: bool,
    joined_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO memberships (username,room_id,admin,joined_at) VALUES (?,?,?,?)
         ON CONFLICT(username,room_id) DO NOTHING",
    )
    .bind(username)
    .bind(room_id.to_string())
    .bind(admin)
    .bind(joined_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Joins the live connections of `usernames` to a room they were just added
/// to, and tells each of them about it.
async fn announce(state: &AppState, room_id: Uuid, usernames: &[String]) -> Result<(), SyncError> {
    for username in usernames {
        state.registry.join_user(username, room_id);
    }
    state.registry.fanout_users(usernames, &ServerEvent::RoomCreated { room_id });
    for username in usernames {
        push_rooms(state, username).await?;
    }
    Ok(())
}

/// Creates the private room for the caller and `other`, or fails with
/// `DuplicateRoom` carrying the id of the one that already exists.
pub async fn create_private_room(
    state: &AppState,
    ctx: &ConnectionContext,
    other: &str,
) -> Result<Uuid, SyncError> {
    let db_pool = &state.db_pool;
    if other == ctx.username {
        return Err(SyncError::Invalid("a private room needs two different users".to_owned()));
    }
    require_user(db_pool, other).await?;

    let dyad_key = dyad_key(&ctx.username, other);
    if let Some(room_id) = find_dyad(db_pool, &dyad_key).await? {
        return Err(SyncError::DuplicateRoom { room_id });
    }
    let room_id = insert_dyad(db_pool, &ctx.username, other, &dyad_key).await?;

    tracing::info!(%room_id, a = %ctx.username, b = %other, "private room created");
    announce(state, room_id, &[ctx.username.clone(), other.to_owned()]).await?;
    Ok(room_id)
}

/// Stores the dyad and both memberships in one transaction. A concurrent
/// create that got there first surfaces as `DuplicateRoom` with its id.
async fn insert_dyad(
    db_pool: &SqlitePool,
    a: &str,
    b: &str,
    dyad_key: &str,
) -> Result<Uuid, SyncError> {
    let room_id = Uuid::now_v7();
    let now = db::now_millis();
    let mut tx = db_pool.begin().await?;

    let inserted = sqlx::query("INSERT INTO rooms (room_id,kind,dyad_key,created_at) VALUES (?,?,?,?)")
        .bind(room_id.to_string())
        .bind(RoomKind::Private.as_str())
        .bind(dyad_key)
        .bind(now)
        .execute(&mut *tx)
        .await;

    match inserted {
        Ok(_) => {}
        // lost a race against a concurrent create for the same pair
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            tx.rollback().await?;
            let room_id = find_dyad(db_pool, dyad_key)
                .await?
                .ok_or_else(|| SyncError::NotFound("private room".to_owned()))?;
            return Err(SyncError::DuplicateRoom { room_id });
        }
        Err(err) => return Err(err.into()),
    }

    insert_membership(&mut tx, a, room_id, false, now).await?;
    insert_membership(&mut tx, b, room_id, false, now).await?;
    tx.commit().await?;
    Ok(room_id)
}

/// Creates a group of the caller plus `usernames`. The caller becomes admin.
pub async fn create_group(
    state: &AppState,
    ctx: &ConnectionContext,
    usernames: &[String],
    display_name: &str,
) -> Result<Uuid, SyncError> {
    let db_pool = &state.db_pool;
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(SyncError::Invalid("a group needs a display name".to_owned()));
    }

    let mut participants = vec![ctx.username.clone()];
    for username in usernames {
        if !participants.contains(username) {
            participants.push(username.clone());
        }
    }
    if participants.len() < 2 {
        return Err(SyncError::Invalid("a group needs at least two participants".to_owned()));
    }
    for username in &participants[1..] {
        require_user(db_pool, username).await?;
    }

    let room_id = Uuid::now_v7();
    let now = db::now_millis();
    let mut tx = db_pool.begin().await?;
    sqlx::query("INSERT INTO rooms (room_id,kind,display_name,created_at) VALUES (?,?,?,?)")
        .bind(room_id.to_string())
        .bind(RoomKind::Group.as_str())
        .bind(display_name)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    for username in &participants {
        insert_membership(&mut tx, username, room_id, *username == ctx.username, now).await?;
    }
    tx.commit().await?;

    tracing::info!(%room_id, size = participants.len(), "group created");
    announce(state, room_id, &participants).await?;
    Ok(room_id)
}

/// Adds users to a group. Users that already belong to it are skipped.
pub async fn add_participants(
    state: &AppState,
    ctx: &ConnectionContext,
    room_id: Uuid,
    usernames: &[String],
) -> Result<(), SyncError> {
    let db_pool = &state.db_pool;
    db::require_membership(db_pool, &ctx.username, room_id).await?;
    let room = db::fetch_room(db_pool, room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?;
    if room.kind == RoomKind::Private {
        return Err(SyncError::Invalid("private rooms keep their two participants".to_owned()));
    }

    let existing = db::participants(db_pool, room_id).await?;
    let mut added: Vec<String> = Vec::new();
    for username in usernames {
        if !existing.contains(username) && !added.contains(username) {
            require_user(db_pool, username).await?;
            added.push(username.clone());
        }
    }
    if added.is_empty() {
        return Ok(());
    }

    let now = db::now_millis();
    let mut tx = db_pool.begin().await?;
    for username in &added {
        insert_membership(&mut tx, username, room_id, false, now).await?;
    }
    tx.commit().await?;

    tracing::info!(%room_id, by = %ctx.username, ?added, "participants added");
    announce(state, room_id, &added).await?;
    state.registry.fanout_room(
        room_id,
        &ServerEvent::ParticipantsChanged { room_id, usernames: db::participants(db_pool, room_id).await? },
        None,
    );
    Ok(())
}

/// Leaves a room. A private room is only hidden for the caller, since it keeps
/// both participants for its lifetime.
pub async fn leave_room(state: &AppState, ctx: &ConnectionContext, room_id: Uuid) -> Result<(), SyncError> {
    let db_pool = &state.db_pool;
    db::require_membership(db_pool, &ctx.username, room_id).await?;
    let room = db::fetch_room(db_pool, room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?;

    if room.kind == RoomKind::Private {
        sqlx::query("UPDATE memberships SET hidden=1 WHERE username=? AND room_id=?")
            .bind(&ctx.username)
            .bind(room_id.to_string())
            .execute(db_pool)
            .await?;
        push_rooms(state, &ctx.username).await?;
        return Ok(());
    }

    let mut tx = db_pool.begin().await?;
    sqlx::query("DELETE FROM memberships WHERE username=? AND room_id=?")
        .bind(&ctx.username)
        .bind(room_id.to_string())
        .execute(&mut *tx)
        .await?;
    // keep at least one admin around
    sqlx::query(
        "UPDATE memberships SET admin=1 WHERE room_id=? AND username=(
             SELECT username FROM memberships WHERE room_id=? ORDER BY joined_at,username LIMIT 1
         ) AND NOT EXISTS (SELECT 1 FROM memberships WHERE room_id=? AND admin=1)",
    )
    .bind(room_id.to_string())
    .bind(room_id.to_string())
    .bind(room_id.to_string())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    state.registry.leave_user(&ctx.username, room_id);
    state.registry.fanout_users(&[&ctx.username], &ServerEvent::RoomDeleted { room_id });

    let remaining = db::participants(db_pool, room_id).await?;
    tracing::info!(%room_id, username = %ctx.username, remaining = remaining.len(), "left group");
    if remaining.is_empty() {
        sqlx::query("UPDATE rooms SET deleted=1 WHERE room_id=?")
            .bind(room_id.to_string())
            .execute(db_pool)
            .await?;
        return Ok(());
    }
    state.registry.fanout_room(
        room_id,
        &ServerEvent::ParticipantsChanged { room_id, usernames: remaining },
        None,
    );
    Ok(())
}

/// Deletes a room for everyone. Groups need an admin; either participant may
/// delete a private room. Messages stay in storage.
pub async fn delete_room(state: &AppState, ctx: &ConnectionContext, room_id: Uuid) -> Result<(), SyncError> {
    let db_pool = &state.db_pool;
    let membership = db::require_membership(db_pool, &ctx.username, room_id).await?;
    let room = db::fetch_room(db_pool, room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?;
    if room.kind == RoomKind::Group && !membership.admin {
        return Err(SyncError::Forbidden("only an admin may delete a group"));
    }

    let participants = db::participants(db_pool, room_id).await?;
    let mut tx = db_pool.begin().await?;
    sqlx::query("DELETE FROM memberships WHERE room_id=?")
        .bind(room_id.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE rooms SET deleted=1,dyad_key=NULL WHERE room_id=?")
        .bind(room_id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    state.registry.fanout_users(&participants, &ServerEvent::RoomDeleted { room_id });
    state.registry.close_room(room_id);
    tracing::info!(%room_id, by = %ctx.username, "room deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::testing::*;

    #[test]
    fn dyad_key_ignores_argument_order() {
        assert_eq!(dyad_key("ada", "bob"), dyad_key("bob", "ada"));
        assert_ne!(dyad_key("ada", "bob"), dyad_key("ada", "bobby"));
    }

    #[tokio::test]
    async fn second_private_room_for_a_pair_returns_the_first() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, _rx) = connect(&state, "ada");
        let (bob, _rx2) = connect(&state, "bob");

        let room_id = create_private_room(&state, &ada, "bob").await.unwrap();
        let err = create_private_room(&state, &ada, "bob").await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateRoom { room_id: existing } if existing == room_id));
        let err = create_private_room(&state, &bob, "ada").await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateRoom { room_id: existing } if existing == room_id));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rooms")
            .fetch_one(&state.db_pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dyad_inserted_after_the_lookup_still_wins() {
        let state = test_state(&["ada", "bob"]).await;
        let key = dyad_key("ada", "bob");
        assert!(find_dyad(&state.db_pool, &key).await.unwrap().is_none());

        // a concurrent create lands between the lookup and our insert
        let winner = Uuid::now_v7();
        sqlx::query("INSERT INTO rooms (room_id,kind,dyad_key,created_at) VALUES (?,?,?,?)")
            .bind(winner.to_string())
            .bind(RoomKind::Private.as_str())
            .bind(&key)
            .bind(db::now_millis())
            .execute(&state.db_pool)
            .await
            .unwrap();

        let err = insert_dyad(&state.db_pool, "ada", "bob", &key).await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateRoom { room_id } if room_id == winner));

        let (rooms, memberships): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM rooms), (SELECT COUNT(*) FROM memberships)",
        )
        .fetch_one(&state.db_pool)
        .await
        .unwrap();
        assert_eq!((rooms, memberships), (1, 0));
    }

    #[tokio::test]
    async fn private_room_rejects_self_and_unknown_users() {
        let state = test_state(&["ada"]).await;
        let (ada, _rx) = connect(&state, "ada");

        assert!(matches!(create_private_room(&state, &ada, "ada").await, Err(SyncError::Invalid(_))));
        assert!(matches!(create_private_room(&state, &ada, "ghost").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn private_room_is_announced_to_both_users() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, _rx) = connect(&state, "ada");
        let (bob, mut bob_rx) = connect(&state, "bob");

        let room_id = create_private_room(&state, &ada, "bob").await.unwrap();

        assert!(state.registry.is_joined(bob.conn_id, room_id));
        let events = drain(&mut bob_rx);
        assert_eq!(events[0], ServerEvent::RoomCreated { room_id });
        assert!(matches!(&events[1], ServerEvent::RoomsUpdated { rooms } if rooms.len() == 1));
    }

    #[tokio::test]
    async fn group_needs_two_distinct_participants_and_a_name() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, _rx) = connect(&state, "ada");

        let err = create_group(&state, &ada, &["ada".into()], "solo").await.unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
        let err = create_group(&state, &ada, &["bob".into()], "  ").await.unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
        let err = create_group(&state, &ada, &["bob".into(), "ghost".into()], "crew").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn adding_participants_notifies_new_and_existing_members() {
        let state = test_state(&["ada", "bob", "cyd"]).await;
        let (ada, mut ada_rx) = connect(&state, "ada");
        let (cyd, mut cyd_rx) = connect(&state, "cyd");
        let room_id = create_group(&state, &ada, &["bob".into()], "crew").await.unwrap();
        drain(&mut ada_rx);

        add_participants(&state, &ada, room_id, &["cyd".into(), "bob".into()]).await.unwrap();

        assert!(state.registry.is_joined(cyd.conn_id, room_id));
        assert!(drain(&mut cyd_rx).contains(&ServerEvent::RoomCreated { room_id }));
        assert_eq!(
            drain(&mut ada_rx),
            vec![ServerEvent::ParticipantsChanged {
                room_id,
                usernames: vec!["ada".into(), "bob".into(), "cyd".into()],
            }]
        );

        // already members
        add_participants(&state, &ada, room_id, &["cyd".into()]).await.unwrap();
        assert!(drain(&mut ada_rx).is_empty());
    }

    #[tokio::test]
    async fn private_rooms_cannot_grow() {
        let state = test_state(&["ada", "bob", "cyd"]).await;
        let (ada, _rx) = connect(&state, "ada");
        let room_id = create_private_room(&state, &ada, "bob").await.unwrap();

        let err = add_participants(&state, &ada, room_id, &["cyd".into()]).await.unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
    }

    #[tokio::test]
    async fn leaving_a_group_hands_admin_over() {
        let state = test_state(&["ada", "bob", "cyd"]).await;
        let (ada, mut ada_rx) = connect(&state, "ada");
        let (_bob, mut bob_rx) = connect(&state, "bob");
        let room_id = create_group(&state, &ada, &["bob".into(), "cyd".into()], "crew").await.unwrap();
        drain(&mut ada_rx);
        drain(&mut bob_rx);

        leave_room(&state, &ada, room_id).await.unwrap();

        assert!(!state.registry.is_joined(ada.conn_id, room_id));
        assert_eq!(drain(&mut ada_rx), vec![ServerEvent::RoomDeleted { room_id }]);
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::ParticipantsChanged { room_id, usernames: vec!["bob".into(), "cyd".into()] }]
        );
        let membership = db::require_membership(&state.db_pool, "bob", room_id).await.unwrap();
        assert!(membership.admin);
    }

    #[tokio::test]
    async fn leaving_a_private_room_only_hides_it() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, _rx) = connect(&state, "ada");
        let room_id = create_private_room(&state, &ada, "bob").await.unwrap();

        leave_room(&state, &ada, room_id).await.unwrap();

        let membership = db::require_membership(&state.db_pool, "ada", room_id).await.unwrap();
        assert!(membership.hidden);
        assert_eq!(db::participants(&state.db_pool, room_id).await.unwrap().len(), 2);
        assert!(matches!(
            create_private_room(&state, &ada, "bob").await,
            Err(SyncError::DuplicateRoom { .. })
        ));
    }

    #[tokio::test]
    async fn deleting_a_group_requires_admin_and_frees_everyone() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, _rx) = connect(&state, "ada");
        let (bob, mut bob_rx) = connect(&state, "bob");
        let room_id = create_group(&state, &ada, &["bob".into()], "crew").await.unwrap();
        drain(&mut bob_rx);

        assert!(matches!(delete_room(&state, &bob, room_id).await, Err(SyncError::Forbidden(_))));
        delete_room(&state, &ada, room_id).await.unwrap();

        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::RoomDeleted { room_id }]);
        assert!(!state.registry.is_joined(bob.conn_id, room_id));
        assert!(db::fetch_room(&state.db_pool, room_id).await.unwrap().is_none());
        assert!(matches!(
            db::require_membership(&state.db_pool, "ada", room_id).await,
            Err(SyncError::Membership(_))
        ));
    }

    #[tokio::test]
    async fn deleted_private_room_can_be_recreated() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, _rx) = connect(&state, "ada");
        let first = create_private_room(&state, &ada, "bob").await.unwrap();

        delete_room(&state, &ada, first).await.unwrap();
        let second = create_private_room(&state, &ada, "bob").await.unwrap();
        assert_ne!(first, second);
    }
}
