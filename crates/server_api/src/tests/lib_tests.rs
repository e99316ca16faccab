use super::*;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver};

struct FakeMediaStore;

#[async_trait]
impl MediaStore for FakeMediaStore {
    async fn upload(&self, _owner_id: UserId, _base64_data: &str) -> Result<String, MediaError> {
        Ok("http://localhost:3000/media/1".to_string())
    }
}

async fn setup() -> (ApiContext, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("user");
    let bob = storage.create_user("bob").await.expect("user");
    let ctx = ApiContext {
        storage,
        hub: Arc::new(RealtimeHub::new()),
        media: Arc::new(FakeMediaStore),
    };
    (ctx, alice, bob)
}

fn connect(ctx: &ApiContext, user: UserId) -> UnboundedReceiver<ServerEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    ctx.hub.connect(user, tx).expect("connect");
    // discard the presence chatter from the connect itself
    while rx.try_recv().is_ok() {}
    rx
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn text_request(text: &str) -> SendMessageRequest {
    SendMessageRequest {
        text: Some(text.to_string()),
        image: None,
    }
}

#[tokio::test]
async fn send_delivers_exactly_one_new_message_to_the_receiver() {
    let (ctx, alice, bob) = setup().await;
    let mut bob_rx = connect(&ctx, bob);

    let sent = send_message(&ctx, alice, bob, text_request("hi"))
        .await
        .expect("send");
    assert_eq!(sent.text.as_deref(), Some("hi"));
    assert!(sent.image_url.is_none());

    let events = drain(&mut bob_rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        ServerEvent::NewMessage { message } => {
            assert_eq!(message.message_id, sent.message_id);
            assert_eq!(message.text.as_deref(), Some("hi"));
            assert_eq!(message.sender_id, alice);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn send_echoes_to_the_senders_other_devices() {
    let (ctx, alice, bob) = setup().await;
    let mut device_one = connect(&ctx, alice);
    let mut device_two = connect(&ctx, alice);
    let mut bob_rx = connect(&ctx, bob);
    // bob's arrival broadcast presence to alice's devices
    drain(&mut device_one);
    drain(&mut device_two);

    let sent = send_message(&ctx, alice, bob, text_request("multi-device"))
        .await
        .expect("send");

    for rx in [&mut device_one, &mut device_two, &mut bob_rx] {
        let events = drain(rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::NewMessage { message } => {
                assert_eq!(message.message_id, sent.message_id)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn empty_messages_are_rejected_before_any_io() {
    let (ctx, alice, bob) = setup().await;

    let err = send_message(&ctx, alice, bob, SendMessageRequest::default())
        .await
        .expect_err("reject");
    assert_eq!(err.code, ErrorCode::EmptyMessage);
    assert!(!err.is_retryable());

    let err = send_message(&ctx, alice, bob, text_request("   "))
        .await
        .expect_err("reject blank text");
    assert_eq!(err.code, ErrorCode::EmptyMessage);

    let stored = ctx
        .storage
        .find_messages_between(alice, bob, None, None)
        .await
        .expect("query");
    assert!(stored.is_empty());
}

#[tokio::test]
async fn media_failure_aborts_before_persistence() {
    let (ctx, alice, bob) = setup().await;
    let ctx = ApiContext {
        media: Arc::new(MissingMediaStore),
        ..ctx
    };

    let request = SendMessageRequest {
        text: None,
        image: Some("AAAA".to_string()),
    };
    let err = send_message(&ctx, alice, bob, request)
        .await
        .expect_err("upload fails");
    assert_eq!(err.code, ErrorCode::MediaUploadFailed);

    let stored = ctx
        .storage
        .find_messages_between(alice, bob, None, None)
        .await
        .expect("query");
    assert!(stored.is_empty());
}

#[tokio::test]
async fn image_sends_carry_the_uploaded_url() {
    let (ctx, alice, bob) = setup().await;
    let request = SendMessageRequest {
        text: None,
        image: Some("AAAA".to_string()),
    };
    let sent = send_message(&ctx, alice, bob, request).await.expect("send");
    assert_eq!(sent.image_url.as_deref(), Some("http://localhost:3000/media/1"));
    assert!(sent.text.is_none());
}

#[tokio::test]
async fn only_the_sender_may_delete_and_failures_do_not_mutate_or_fan_out() {
    let (ctx, alice, bob) = setup().await;
    let sent = send_message(&ctx, alice, bob, text_request("keep me"))
        .await
        .expect("send");

    let mut alice_rx = connect(&ctx, alice);
    let mut bob_rx = connect(&ctx, bob);
    drain(&mut alice_rx);

    let err = delete_message(&ctx, bob, sent.message_id)
        .await
        .expect_err("forbidden");
    assert_eq!(err.code, ErrorCode::Forbidden);

    assert!(ctx
        .storage
        .load_message(sent.message_id)
        .await
        .expect("load")
        .is_some());
    assert!(drain(&mut alice_rx).is_empty());
    assert!(drain(&mut bob_rx).is_empty());

    let err = delete_message(&ctx, alice, MessageId(424242))
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn delete_notifies_both_parties() {
    let (ctx, alice, bob) = setup().await;
    let sent = send_message(&ctx, alice, bob, text_request("delete me"))
        .await
        .expect("send");

    let mut alice_rx = connect(&ctx, alice);
    let mut bob_rx = connect(&ctx, bob);
    drain(&mut alice_rx);

    delete_message(&ctx, alice, sent.message_id)
        .await
        .expect("delete");
    assert!(ctx
        .storage
        .load_message(sent.message_id)
        .await
        .expect("load")
        .is_none());

    for rx in [&mut alice_rx, &mut bob_rx] {
        let events = drain(rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::MessageDeleted {
                message_id,
                sender_id,
                receiver_id,
            } => {
                assert_eq!(*message_id, sent.message_id);
                assert_eq!(*sender_id, alice);
                assert_eq!(*receiver_id, bob);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn clear_removes_only_the_requesters_messages() {
    let (ctx, alice, bob) = setup().await;
    send_message(&ctx, alice, bob, text_request("mine 1"))
        .await
        .expect("send");
    send_message(&ctx, alice, bob, text_request("mine 2"))
        .await
        .expect("send");
    let bobs = send_message(&ctx, bob, alice, text_request("bob's"))
        .await
        .expect("send");

    let mut bob_rx = connect(&ctx, bob);

    let deleted = clear_conversation(&ctx, alice, bob).await.expect("clear");
    assert_eq!(deleted, 2);

    let remaining = catch_up(&ctx, alice, bob, None).await.expect("catch up");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message_id, bobs.message_id);

    let events = drain(&mut bob_rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        ServerEvent::MessagesCleared {
            sender_id,
            receiver_id,
            deleted_count,
        } => {
            assert_eq!(*sender_id, alice);
            assert_eq!(*receiver_id, bob);
            assert_eq!(*deleted_count, 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn catch_up_returns_strictly_newer_messages_in_order() {
    let (ctx, alice, bob) = setup().await;
    let first = send_message(&ctx, alice, bob, text_request("first"))
        .await
        .expect("send");
    let second = send_message(&ctx, bob, alice, text_request("second"))
        .await
        .expect("send");
    let third = send_message(&ctx, alice, bob, text_request("third"))
        .await
        .expect("send");

    let all = catch_up(&ctx, alice, bob, None).await.expect("catch up");
    let ids: Vec<_> = all.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![first.message_id, second.message_id, third.message_id]);

    let newer = catch_up(&ctx, alice, bob, Some(first.created_at))
        .await
        .expect("catch up");
    let ids: Vec<_> = newer.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![second.message_id, third.message_id]);

    let none = catch_up(&ctx, bob, alice, Some(third.created_at))
        .await
        .expect("catch up");
    assert!(none.is_empty());
}

#[tokio::test]
async fn lists_everyone_except_the_caller() {
    let (ctx, alice, bob) = setup().await;
    let users = list_users(&ctx, alice).await.expect("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id, bob);
}
