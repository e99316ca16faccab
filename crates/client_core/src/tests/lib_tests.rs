use super::*;

use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

fn login_route() -> Router {
    Router::new().route(
        "/login",
        post(|| async { Json(serde_json::json!({ "userId": 1, "token": "test-token" })) }),
    )
}

fn payload(id: i64, sender: i64, receiver: i64, text: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        sender_id: UserId(sender),
        receiver_id: UserId(receiver),
        text: Some(text.to_string()),
        image_url: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn login_stores_the_issued_identity() {
    let url = spawn_server(login_route()).await;
    let client = ChatClient::new();

    let user_id = client.login(&url, "alice").await.expect("login");
    assert_eq!(user_id, UserId(1));
    assert_eq!(client.user_id().await, Some(UserId(1)));
}

#[tokio::test]
async fn optimistic_send_is_replaced_by_the_confirmed_copy() {
    let router = login_route().route(
        "/messages/send/:id",
        post(|Path(receiver_id): Path<i64>| async move {
            (
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "messageId": 10,
                    "senderId": 1,
                    "receiverId": receiver_id,
                    "text": "hi",
                    "createdAt": Utc::now().to_rfc3339(),
                })),
            )
        }),
    );
    let url = spawn_server(router).await;

    let client = ChatClient::new();
    client.login(&url, "alice").await.expect("login");

    let confirmed = client
        .send_message(UserId(2), Some("hi".into()), None)
        .await
        .expect("send");
    assert_eq!(confirmed.message_id, MessageId(10));

    let conversation = client.conversation(UserId(2)).await;
    assert_eq!(conversation.len(), 1, "optimistic copy must collapse");
    assert_eq!(conversation[0].message_id, MessageId(10));
}

#[tokio::test]
async fn failed_send_rolls_the_optimistic_entry_back() {
    let router = login_route().route(
        "/messages/send/:id",
        post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    );
    let url = spawn_server(router).await;

    let client = ChatClient::new();
    client.login(&url, "alice").await.expect("login");

    client
        .send_message(UserId(2), Some("lost".into()), None)
        .await
        .expect_err("send fails");
    assert!(
        client.conversation(UserId(2)).await.is_empty(),
        "no ghost message may remain after a failed send"
    );
}

#[tokio::test]
async fn push_and_catch_up_converge_through_the_merge() {
    let pushed = payload(20, 2, 1, "already pushed");
    let catch_up_body = {
        let missed = payload(21, 2, 1, "missed while offline");
        serde_json::to_value(vec![pushed.clone(), missed]).expect("json")
    };
    let router = login_route().route(
        "/messages/:id",
        get(move || {
            let body = catch_up_body.clone();
            async move { Json(body) }
        }),
    );
    let url = spawn_server(router).await;

    let client = ChatClient::new();
    client.login(&url, "alice").await.expect("login");

    // push delivered one of the two messages
    client
        .apply_server_event(ServerEvent::NewMessage {
            message: pushed.clone(),
        })
        .await;
    assert_eq!(client.conversation(UserId(2)).await.len(), 1);

    // the poll replays the pushed message and brings the missed one
    let fresh = client.catch_up(UserId(2), None).await.expect("catch up");
    assert_eq!(fresh, 1, "only the missed message counts as new");

    let conversation = client.conversation(UserId(2)).await;
    let ids: Vec<_> = conversation.iter().map(|m| m.message_id.0).collect();
    assert_eq!(ids, vec![20, 21]);

    // replaying the same catch-up is a no-op
    let fresh = client.catch_up(UserId(2), None).await.expect("catch up");
    assert_eq!(fresh, 0);
    assert_eq!(client.conversation(UserId(2)).await.len(), 2);
}

#[tokio::test]
async fn refresh_uses_the_last_seen_cursor() {
    let url = spawn_server(login_route().route(
        "/messages/:id",
        get(|| async { Json(serde_json::json!([])) }),
    ))
    .await;

    let client = ChatClient::new();
    client.login(&url, "alice").await.expect("login");

    let message = payload(30, 2, 1, "sets the cursor");
    let created_at = message.created_at;
    client
        .apply_server_event(ServerEvent::NewMessage { message })
        .await;

    assert_eq!(
        client.inner.lock().await.last_synced.get(&UserId(2)).copied(),
        Some(created_at)
    );
    let fresh = client.refresh(UserId(2)).await.expect("refresh");
    assert_eq!(fresh, 0);
}

#[tokio::test]
async fn delete_and_clear_events_prune_local_state() {
    let client = ChatClient::new();
    {
        let mut state = client.inner.lock().await;
        state.user_id = Some(UserId(1));
    }

    for message in [
        payload(1, 2, 1, "from peer"),
        payload(2, 1, 2, "from me"),
        payload(3, 2, 1, "also from peer"),
    ] {
        client
            .apply_server_event(ServerEvent::NewMessage { message })
            .await;
    }
    assert_eq!(client.conversation(UserId(2)).await.len(), 3);

    client
        .apply_server_event(ServerEvent::MessageDeleted {
            message_id: MessageId(1),
            sender_id: UserId(2),
            receiver_id: UserId(1),
        })
        .await;
    assert_eq!(client.conversation(UserId(2)).await.len(), 2);

    // peer cleared their own sent messages; mine stay
    client
        .apply_server_event(ServerEvent::MessagesCleared {
            sender_id: UserId(2),
            receiver_id: UserId(1),
            deleted_count: 1,
        })
        .await;
    let remaining = client.conversation(UserId(2)).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].sender_id, UserId(1));
}

#[tokio::test]
async fn presence_events_maintain_the_online_roster() {
    let client = ChatClient::new();
    let mut events = client.subscribe_events();

    client
        .apply_server_event(ServerEvent::GetOnlineUsers {
            user_ids: vec![UserId(2), UserId(3)],
        })
        .await;
    let mut online = client.online_users().await;
    online.sort_by_key(|u| u.0);
    assert_eq!(online, vec![UserId(2), UserId(3)]);

    client
        .apply_server_event(ServerEvent::UserOffline {
            user_id: UserId(3),
            last_seen_at: Utc::now(),
        })
        .await;
    assert_eq!(client.online_users().await, vec![UserId(2)]);

    client
        .apply_server_event(ServerEvent::UserOnline { user_id: UserId(4) })
        .await;
    let mut online = client.online_users().await;
    online.sort_by_key(|u| u.0);
    assert_eq!(online, vec![UserId(2), UserId(4)]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen
        .iter()
        .any(|e| matches!(e, ClientEvent::OnlineUsers(ids) if ids.len() == 2)));
    assert!(seen.iter().any(|e| matches!(
        e,
        ClientEvent::PresenceChanged {
            user_id: UserId(4),
            status: PresenceStatus::Online
        }
    )));
}

#[tokio::test]
async fn duplicate_push_is_suppressed_and_not_rebroadcast() {
    let client = ChatClient::new();
    {
        let mut state = client.inner.lock().await;
        state.user_id = Some(UserId(1));
    }
    let mut events = client.subscribe_events();

    let message = payload(50, 2, 1, "once");
    client
        .apply_server_event(ServerEvent::NewMessage {
            message: message.clone(),
        })
        .await;
    client
        .apply_server_event(ServerEvent::NewMessage { message })
        .await;

    assert_eq!(client.conversation(UserId(2)).await.len(), 1);
    let mut received = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::MessageReceived { .. }) {
            received += 1;
        }
    }
    assert_eq!(received, 1);
}
