use axum::{
    debug_handler,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    appresult::SyncError,
    auth::{self, ConnectionContext},
    protocol::{ClientEvent, ServerEvent},
    rooms::{self, msg, new, presence},
    session::USER_ID,
    AppResult, AppState,
};

#[derive(Debug, Deserialize)]
pub(crate) struct HandshakeQuery {
    username: Option<String>,
}

/// Upgrades to a sync connection. The identity comes from the login session;
/// a bare `username` handshake claim is honoured only when the deployment
/// allows it.
#[debug_handler(state = AppState)]
pub async fn gateway(
    State(state): State<AppState>,
    Query(HandshakeQuery { username }): Query<HandshakeQuery>,
    session: Session,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let session_user = session.get::<String>(USER_ID).await?;
    let claimed = resolve_identity(session_user, username, state.config.allow_handshake_claim)?;
    let user = auth::authenticate(&state.db_pool, &claimed).await?;

    Ok(ws.on_upgrade(move |socket| serve(state, user.username, socket)))
}

fn resolve_identity(
    session_user: Option<String>,
    claim: Option<String>,
    allow_claim: bool,
) -> Result<String, SyncError> {
    match (session_user, claim) {
        (Some(username), _) => Ok(username),
        (None, Some(username)) if allow_claim => Ok(username),
        (None, Some(_)) => Err(SyncError::Auth("<claim disabled>".to_owned())),
        (None, None) => Err(SyncError::Auth("<no session>".to_owned())),
    }
}

async fn serve(state: AppState, username: String, socket: WebSocket) {
    let (conn_id, mut rx) = state.registry.connect(&username);
    let ctx = ConnectionContext { conn_id, username };
    tracing::info!(
        conn = conn_id,
        username = %ctx.username,
        live = state.registry.connection_count(),
        "connection opened"
    );

    if let Err(err) = rooms::sync_connection(&state, &ctx).await {
        tracing::error!(conn = conn_id, error = %err, "initial sync failed");
        state.registry.disconnect(conn_id);
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(error = %err, "unserializable event dropped");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_ctx = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            let text = match frame {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => dispatch(&recv_state, &recv_ctx, event).await,
                Err(err) => {
                    let err = SyncError::Invalid(err.to_string());
                    recv_state.registry.send_to(recv_ctx.conn_id, ServerEvent::error(None, &err));
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    presence::clear_typing(&state, &ctx);
    state.registry.disconnect(conn_id);
    tracing::info!(
        conn = conn_id,
        username = %ctx.username,
        live = state.registry.connection_count(),
        "connection closed"
    );
}

/// Runs one client event to completion. Failures go back to the originating
/// connection as an `error` event and never reach other clients.
pub async fn dispatch(state: &AppState, ctx: &ConnectionContext, event: ClientEvent) {
    let request_id = event.request_id();
    match handle(state, ctx, event).await {
        Ok(Some(reply)) => {
            state.registry.send_to(ctx.conn_id, reply);
        }
        Ok(None) => {}
        Err(err) => {
            match &err {
                SyncError::Db(_) | SyncError::PersistFailed(_) => tracing::error!(conn = ctx.conn_id, error = %err, "event failed"),
                _ => tracing::debug!(conn = ctx.conn_id, error = %err, "event rejected"),
            }
            state.registry.send_to(ctx.conn_id, ServerEvent::error(request_id, &err));
        }
    }
}

fn reply(request_id: Option<u64>, room_id: Option<Uuid>) -> Option<ServerEvent> {
    Some(ServerEvent::Reply { request_id, room_id })
}

async fn handle(
    state: &AppState,
    ctx: &ConnectionContext,
    event: ClientEvent,
) -> Result<Option<ServerEvent>, SyncError> {
    use ClientEvent::*;
    match event {
        Message { message } => {
            // the persistence task reports back on its own
            msg::send_msg(state, ctx, message)?;
            Ok(None)
        }
        EditMessage { key, content, room_id } => {
            msg::edit_msg(state, ctx, &key, content, room_id).await?;
            Ok(None)
        }
        DeleteMessage { key, room_id } => {
            msg::delete_msg(state, ctx, &key, room_id).await?;
            Ok(None)
        }
        RoomSelected { room_id } => {
            rooms::join(state, ctx, room_id).await?;
            Ok(None)
        }
        TypingChanged { is_typing, room_id, .. } => {
            presence::set_typing(state, ctx, room_id, is_typing)?;
            Ok(None)
        }
        CreatePrivateRoom { request_id, other_username } => {
            let room_id = new::create_private_room(state, ctx, other_username.trim()).await?;
            Ok(reply(request_id, Some(room_id)))
        }
        CreateGroup { request_id, usernames, display_name } => {
            let room_id = new::create_group(state, ctx, &usernames, &display_name).await?;
            Ok(reply(request_id, Some(room_id)))
        }
        AddParticipants { request_id, room_id, usernames } => {
            new::add_participants(state, ctx, room_id, &usernames).await?;
            Ok(reply(request_id, Some(room_id)))
        }
        LeaveRoom { request_id, room_id } => {
            new::leave_room(state, ctx, room_id).await?;
            Ok(reply(request_id, Some(room_id)))
        }
        DeleteRoom { request_id, room_id } => {
            new::delete_room(state, ctx, room_id).await?;
            Ok(reply(request_id, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::Receiver;

    use super::*;
    use crate::{
        db::ContentType,
        protocol::NewMessage,
        rooms::{history, testing::*},
    };

    async fn next(rx: &mut Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no event within a second")
            .expect("connection closed")
    }

    fn replies(events: Vec<ServerEvent>) -> Vec<ServerEvent> {
        events
            .into_iter()
            .filter(|event| matches!(event, ServerEvent::Reply { .. } | ServerEvent::Error { .. }))
            .collect()
    }

    fn replied_room(events: Vec<ServerEvent>) -> Uuid {
        match replies(events).as_slice() {
            [ServerEvent::Reply { room_id: Some(room_id), .. }] => *room_id,
            other => panic!("expected one reply with a room id, got {other:?}"),
        }
    }

    fn text(key: &str, room_id: Uuid, content: &str) -> ClientEvent {
        ClientEvent::Message {
            message: NewMessage {
                key: key.into(),
                room_id,
                content: content.into(),
                content_type: ContentType::Text,
                created_at: Some(1_000),
            },
        }
    }

    #[test]
    fn handshake_claim_needs_the_flag() {
        let claim = || Some("mallory".to_owned());
        assert!(matches!(
            resolve_identity(None, claim(), false),
            Err(SyncError::Auth(_))
        ));
        assert_eq!(resolve_identity(None, claim(), true).unwrap(), "mallory");
        assert_eq!(resolve_identity(Some("ada".into()), claim(), false).unwrap(), "ada");
        assert!(resolve_identity(None, None, true).is_err());
    }

    #[tokio::test]
    async fn room_selected_rejoins_a_dropped_group() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, mut ada_rx) = connect(&state, "ada");
        let (bob, mut bob_rx) = connect(&state, "bob");
        let room_id = new::create_private_room(&state, &ada, "bob").await.unwrap();
        assert!(state.registry.leave(bob.conn_id, room_id));
        drain(&mut bob_rx);

        dispatch(&state, &bob, ClientEvent::RoomSelected { room_id }).await;
        assert!(drain(&mut bob_rx).is_empty());
        assert!(state.registry.is_joined(bob.conn_id, room_id));

        dispatch(&state, &ada, text("m1", room_id, "back?")).await;
        assert!(matches!(drain(&mut bob_rx).as_slice(), [ServerEvent::Message { .. }]));
        next(&mut ada_rx).await;
    }

    #[tokio::test]
    async fn message_reaches_peer_then_sender_gets_ack() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, mut ada_rx) = connect(&state, "ada");
        let (bob, mut bob_rx) = connect(&state, "bob");
        dispatch(
            &state,
            &ada,
            ClientEvent::CreatePrivateRoom { request_id: Some(1), other_username: "bob".into() },
        )
        .await;
        let room_id = replied_room(drain(&mut ada_rx));
        drain(&mut bob_rx);

        dispatch(&state, &ada, text("m1", room_id, "hi")).await;

        let Some(ServerEvent::Message { message }) = drain(&mut bob_rx).pop() else {
            panic!("bob should see the message live");
        };
        assert_eq!((message.key.as_str(), message.sender.as_str()), ("m1", "ada"));
        assert_eq!(
            next(&mut ada_rx).await,
            ServerEvent::MessageDelivered { key: "m1".into(), room_id, created_at: message.created_at }
        );

        let stored = history::page(&state.db_pool, room_id, None, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "hi");

        dispatch(
            &state,
            &bob,
            ClientEvent::TypingChanged { is_typing: true, room_id, username: Some("mallory".into()) },
        )
        .await;
        assert_eq!(
            drain(&mut ada_rx),
            vec![ServerEvent::TypingChanged { is_typing: true, room_id, username: "bob".into() }]
        );
    }

    #[tokio::test]
    async fn duplicate_private_room_error_names_existing_room() {
        let state = test_state(&["ada", "bob"]).await;
        let (ada, mut ada_rx) = connect(&state, "ada");
        let (bob, mut bob_rx) = connect(&state, "bob");

        dispatch(
            &state,
            &ada,
            ClientEvent::CreatePrivateRoom { request_id: Some(1), other_username: "bob".into() },
        )
        .await;
        let room_id = replied_room(drain(&mut ada_rx));
        drain(&mut bob_rx);

        dispatch(
            &state,
            &bob,
            ClientEvent::CreatePrivateRoom { request_id: Some(7), other_username: "ada".into() },
        )
        .await;
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::Error {
                request_id: Some(7),
                kind: "duplicateRoom".into(),
                message: SyncError::DuplicateRoom { room_id }.to_string(),
                room_id: Some(room_id),
            }]
        );
        assert!(drain(&mut ada_rx).is_empty());
    }

    #[tokio::test]
    async fn outsiders_get_membership_errors_only() {
        let state = test_state(&["ada", "bob", "eve"]).await;
        let (ada, mut ada_rx) = connect(&state, "ada");
        let (eve, mut eve_rx) = connect(&state, "eve");
        let room_id = new::create_private_room(&state, &ada, "bob").await.unwrap();
        drain(&mut ada_rx);

        dispatch(&state, &eve, text("x1", room_id, "let me in")).await;
        dispatch(&state, &eve, ClientEvent::RoomSelected { room_id }).await;

        let errors = drain(&mut eve_rx);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|event| matches!(
            event,
            ServerEvent::Error { kind, room_id: Some(id), .. } if kind == "membership" && *id == room_id
        )));
        assert!(drain(&mut ada_rx).is_empty());
        assert_eq!(history::count(&state.db_pool, room_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn group_lifecycle_over_events() {
        let state = test_state(&["ada", "bob", "cyd"]).await;
        let (ada, mut ada_rx) = connect(&state, "ada");
        let (cyd, mut cyd_rx) = connect(&state, "cyd");

        dispatch(
            &state,
            &ada,
            ClientEvent::CreateGroup {
                request_id: Some(1),
                usernames: vec!["bob".into()],
                display_name: "crew".into(),
            },
        )
        .await;
        let room_id = replied_room(drain(&mut ada_rx));

        dispatch(
            &state,
            &ada,
            ClientEvent::AddParticipants { request_id: Some(2), room_id, usernames: vec!["cyd".into()] },
        )
        .await;
        assert!(state.registry.is_joined(cyd.conn_id, room_id));
        assert!(drain(&mut cyd_rx).contains(&ServerEvent::RoomCreated { room_id }));

        dispatch(&state, &cyd, ClientEvent::DeleteRoom { request_id: Some(3), room_id }).await;
        let rejected = replies(drain(&mut cyd_rx));
        assert!(matches!(
            rejected.as_slice(),
            [ServerEvent::Error { request_id: Some(3), kind, .. }] if kind == "forbidden"
        ));

        dispatch(&state, &ada, ClientEvent::DeleteRoom { request_id: Some(4), room_id }).await;
        assert!(drain(&mut cyd_rx).contains(&ServerEvent::RoomDeleted { room_id }));
        assert!(!state.registry.is_joined(cyd.conn_id, room_id));
    }
}
