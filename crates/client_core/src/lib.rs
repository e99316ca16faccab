use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use shared::{
    domain::{MessageId, PresenceStatus, UserId},
    protocol::{ClientFrame, MessagePayload, ServerEvent},
};

pub mod merge;

use merge::{merge_message, remove_from_sender, remove_message};

/// How long push may stay silent before the polling fallback wakes up.
pub const POLL_GRACE: Duration = Duration::from_secs(10);
/// Polling cadence once the fallback is active.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageReceived {
        conversation: UserId,
        message: MessagePayload,
    },
    MessageDeleted {
        conversation: UserId,
        message_id: MessageId,
    },
    ConversationCleared {
        conversation: UserId,
        deleted_count: u64,
    },
    OnlineUsers(Vec<UserId>),
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    TypingChanged {
        user_id: UserId,
        is_typing: bool,
    },
    SocketClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user_id: UserId,
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageHttpRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearResponse {
    deleted_count: u64,
}

/// Client half of the reconciliation protocol. Live events arrive over the
/// socket, gaps are repaired through the catch-up query, and both paths
/// land in the same per-conversation merge, so replays and duplicates are
/// harmless.
pub struct ChatClient {
    http: Client,
    events: broadcast::Sender<ClientEvent>,
    ws_sink: Mutex<Option<WsSink>>,
    inner: Mutex<ClientState>,
}

struct ClientState {
    server_url: Option<String>,
    token: Option<String>,
    user_id: Option<UserId>,
    conversations: HashMap<UserId, Vec<MessagePayload>>,
    last_synced: HashMap<UserId, DateTime<Utc>>,
    online_users: HashSet<UserId>,
    last_push_at: Option<Instant>,
    socket_connected: bool,
    ws_started: bool,
    polling_started: bool,
    next_optimistic_id: i64,
}

impl ChatClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            events,
            ws_sink: Mutex::new(None),
            inner: Mutex::new(ClientState {
                server_url: None,
                token: None,
                user_id: None,
                conversations: HashMap::new(),
                last_synced: HashMap::new(),
                online_users: HashSet::new(),
                last_push_at: None,
                socket_connected: false,
                ws_started: false,
                polling_started: false,
                next_optimistic_id: -1,
            }),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn login(&self, server_url: &str, username: &str) -> Result<UserId> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let response = self
            .http
            .post(format!("{server_url}/login"))
            .json(&serde_json::json!({ "username": username }))
            .send()
            .await?
            .error_for_status()?;
        let login: LoginResponse = response.json().await?;

        let mut state = self.inner.lock().await;
        state.server_url = Some(server_url);
        state.token = Some(login.token);
        state.user_id = Some(login.user_id);
        Ok(login.user_id)
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.user_id
    }

    pub async fn conversation(&self, other_user_id: UserId) -> Vec<MessagePayload> {
        self.inner
            .lock()
            .await
            .conversations
            .get(&other_user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.inner.lock().await.online_users.iter().copied().collect()
    }

    async fn authorized(&self) -> Result<(String, String, UserId)> {
        let state = self.inner.lock().await;
        Ok((
            state.server_url.clone().context("not logged in")?,
            state.token.clone().context("not logged in")?,
            state.user_id.context("not logged in")?,
        ))
    }

    /// Opens the event socket and spawns the reader task. Safe to call
    /// again after the socket drops.
    pub async fn connect_events(self: &Arc<Self>) -> Result<()> {
        let (server_url, token) = {
            let mut state = self.inner.lock().await;
            if state.ws_started {
                return Ok(());
            }
            state.ws_started = true;
            (
                state.server_url.clone().context("not logged in")?,
                state.token.clone().context("not logged in")?,
            )
        };

        let ws_url = format!("{}/ws?token={token}", server_url.replacen("http", "ws", 1));
        let connected = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket {ws_url}"));
        let (ws_stream, _) = match connected {
            Ok(pair) => pair,
            Err(error) => {
                self.inner.lock().await.ws_started = false;
                return Err(error);
            }
        };
        info!(%ws_url, "event socket connected");

        let (sink, mut stream) = ws_stream.split();
        *self.ws_sink.lock().await = Some(sink);
        {
            let mut state = self.inner.lock().await;
            state.socket_connected = true;
            state.last_push_at = Some(Instant::now());
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.apply_server_event(event).await,
                        Err(error) => debug!(%error, "ignoring unparseable server event"),
                    },
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "socket read failed");
                        break;
                    }
                }
            }

            {
                let mut state = client.inner.lock().await;
                state.socket_connected = false;
                state.ws_started = false;
            }
            *client.ws_sink.lock().await = None;
            let _ = client.events.send(ClientEvent::SocketClosed);
            info!("event socket closed; polling covers the gap until reconnect");
        });

        Ok(())
    }

    /// Background task that repairs gaps whenever push goes quiet: if no
    /// event arrived within the grace period (or the socket is down), every
    /// known conversation is re-synced from its cursor. Polling is always
    /// safe; the merge rule absorbs anything push already delivered.
    pub fn start_polling(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut state = client.inner.lock().await;
                if state.polling_started {
                    return;
                }
                state.polling_started = true;
            }

            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let (stale, peers) = {
                    let state = client.inner.lock().await;
                    let stale = !state.socket_connected
                        || state
                            .last_push_at
                            .map_or(true, |at| at.elapsed() > POLL_GRACE);
                    let peers: Vec<UserId> = state.conversations.keys().copied().collect();
                    (stale, peers)
                };
                if !stale {
                    continue;
                }
                for peer in peers {
                    if let Err(error) = client.refresh(peer).await {
                        warn!(%error, peer = peer.0, "poll refresh failed");
                    }
                }
            }
        });
    }

    /// Optimistic send: the message shows up locally at once under a
    /// client-assigned negative id; the server's confirmed copy replaces it
    /// through the merge rule. A failed send rolls the placeholder back.
    pub async fn send_message(
        &self,
        receiver_id: UserId,
        text: Option<String>,
        image: Option<String>,
    ) -> Result<MessagePayload> {
        let (server_url, token, me) = self.authorized().await?;

        let optimistic = {
            let mut state = self.inner.lock().await;
            let id = state.next_optimistic_id;
            state.next_optimistic_id -= 1;
            let optimistic = MessagePayload {
                message_id: MessageId(id),
                sender_id: me,
                receiver_id,
                text: text.clone(),
                image_url: None,
                created_at: Utc::now(),
            };
            let conversation = state.conversations.entry(receiver_id).or_default();
            merge_message(conversation, optimistic.clone());
            optimistic
        };
        let _ = self.events.send(ClientEvent::MessageReceived {
            conversation: receiver_id,
            message: optimistic.clone(),
        });

        let request = SendMessageHttpRequest { text, image };
        let result = async {
            let response = self
                .http
                .post(format!("{server_url}/messages/send/{}", receiver_id.0))
                .bearer_auth(&token)
                .json(&request)
                .send()
                .await?
                .error_for_status()?;
            Ok::<MessagePayload, anyhow::Error>(response.json().await?)
        }
        .await;

        match result {
            Ok(confirmed) => {
                let mut guard = self.inner.lock().await;
                let state = &mut *guard;
                let conversation = state.conversations.entry(receiver_id).or_default();
                merge_message(conversation, confirmed.clone());
                advance_cursor(&mut state.last_synced, receiver_id, confirmed.created_at);
                Ok(confirmed)
            }
            Err(error) => {
                let mut state = self.inner.lock().await;
                if let Some(conversation) = state.conversations.get_mut(&receiver_id) {
                    remove_message(conversation, optimistic.message_id);
                }
                Err(error)
            }
        }
    }

    /// Catch-up query: messages newer than the cursor merged into local
    /// state. Returns how many were actually new.
    pub async fn catch_up(
        &self,
        other_user_id: UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let (server_url, token, _me) = self.authorized().await?;

        let mut request = self
            .http
            .get(format!("{server_url}/messages/{}", other_user_id.0))
            .bearer_auth(&token);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let messages: Vec<MessagePayload> =
            request.send().await?.error_for_status()?.json().await?;

        let mut fresh = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let conversation = state.conversations.entry(other_user_id).or_default();
            let mut latest: Option<DateTime<Utc>> = None;
            for message in messages {
                latest = Some(latest.map_or(message.created_at, |l| l.max(message.created_at)));
                if merge_message(conversation, message.clone()) {
                    fresh.push(message);
                }
            }
            if let Some(latest) = latest {
                advance_cursor(&mut state.last_synced, other_user_id, latest);
            }
        }

        let count = fresh.len();
        for message in fresh {
            let _ = self.events.send(ClientEvent::MessageReceived {
                conversation: other_user_id,
                message,
            });
        }
        Ok(count)
    }

    /// Catch-up from the conversation's last known cursor.
    pub async fn refresh(&self, other_user_id: UserId) -> Result<usize> {
        let since = self
            .inner
            .lock()
            .await
            .last_synced
            .get(&other_user_id)
            .copied();
        self.catch_up(other_user_id, since).await
    }

    pub async fn delete_message(
        &self,
        other_user_id: UserId,
        message_id: MessageId,
    ) -> Result<()> {
        let (server_url, token, _me) = self.authorized().await?;
        self.http
            .delete(format!("{server_url}/messages/delete/{}", message_id.0))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?;

        let mut state = self.inner.lock().await;
        if let Some(conversation) = state.conversations.get_mut(&other_user_id) {
            remove_message(conversation, message_id);
        }
        Ok(())
    }

    pub async fn clear_conversation(&self, other_user_id: UserId) -> Result<u64> {
        let (server_url, token, me) = self.authorized().await?;
        let response = self
            .http
            .delete(format!("{server_url}/messages/clear/{}", other_user_id.0))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?;
        let cleared: ClearResponse = response.json().await?;

        let mut state = self.inner.lock().await;
        if let Some(conversation) = state.conversations.get_mut(&other_user_id) {
            remove_from_sender(conversation, me);
        }
        Ok(cleared.deleted_count)
    }

    pub async fn update_presence(&self, status: PresenceStatus) -> Result<()> {
        self.send_frame(&ClientFrame::UpdatePresence { status }).await
    }

    pub async fn send_typing(&self, receiver_id: UserId, is_typing: bool) -> Result<()> {
        self.send_frame(&ClientFrame::Typing {
            receiver_id,
            is_typing,
        })
        .await
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let mut guard = self.ws_sink.lock().await;
        let sink = guard.as_mut().context("event socket not connected")?;
        let text = serde_json::to_string(frame)?;
        sink.send(Message::Text(text))
            .await
            .context("socket write failed")?;
        Ok(())
    }

    async fn apply_server_event(&self, event: ServerEvent) {
        self.inner.lock().await.last_push_at = Some(Instant::now());

        match event {
            ServerEvent::NewMessage { message } => {
                let Some(me) = self.user_id().await else {
                    return;
                };
                let peer = conversation_peer(me, message.sender_id, message.receiver_id);
                let fresh = {
                    let mut guard = self.inner.lock().await;
                    let state = &mut *guard;
                    let conversation = state.conversations.entry(peer).or_default();
                    let fresh = merge_message(conversation, message.clone());
                    advance_cursor(&mut state.last_synced, peer, message.created_at);
                    fresh
                };
                if fresh {
                    let _ = self.events.send(ClientEvent::MessageReceived {
                        conversation: peer,
                        message,
                    });
                }
            }
            ServerEvent::MessageDeleted {
                message_id,
                sender_id,
                receiver_id,
            } => {
                let Some(me) = self.user_id().await else {
                    return;
                };
                let peer = conversation_peer(me, sender_id, receiver_id);
                let removed = {
                    let mut state = self.inner.lock().await;
                    state
                        .conversations
                        .get_mut(&peer)
                        .map_or(false, |conversation| {
                            remove_message(conversation, message_id)
                        })
                };
                if removed {
                    let _ = self.events.send(ClientEvent::MessageDeleted {
                        conversation: peer,
                        message_id,
                    });
                }
            }
            ServerEvent::MessagesCleared {
                sender_id,
                receiver_id,
                deleted_count,
            } => {
                let Some(me) = self.user_id().await else {
                    return;
                };
                let peer = conversation_peer(me, sender_id, receiver_id);
                {
                    let mut state = self.inner.lock().await;
                    if let Some(conversation) = state.conversations.get_mut(&peer) {
                        remove_from_sender(conversation, sender_id);
                    }
                }
                let _ = self.events.send(ClientEvent::ConversationCleared {
                    conversation: peer,
                    deleted_count,
                });
            }
            ServerEvent::GetOnlineUsers { user_ids } => {
                self.inner.lock().await.online_users = user_ids.iter().copied().collect();
                let _ = self.events.send(ClientEvent::OnlineUsers(user_ids));
            }
            ServerEvent::UserOnline { user_id } => {
                self.inner.lock().await.online_users.insert(user_id);
                let _ = self.events.send(ClientEvent::PresenceChanged {
                    user_id,
                    status: PresenceStatus::Online,
                });
            }
            ServerEvent::UserOffline { user_id, .. } => {
                self.inner.lock().await.online_users.remove(&user_id);
                let _ = self.events.send(ClientEvent::PresenceChanged {
                    user_id,
                    status: PresenceStatus::Offline,
                });
            }
            ServerEvent::UserPresenceUpdate {
                user_id, status, ..
            } => {
                let _ = self.events.send(ClientEvent::PresenceChanged { user_id, status });
            }
            ServerEvent::UserTyping {
                sender_id,
                is_typing,
            } => {
                let _ = self.events.send(ClientEvent::TypingChanged {
                    user_id: sender_id,
                    is_typing,
                });
            }
            ServerEvent::Error(error) => {
                warn!(code = ?error.code, message = %error.message, "server reported an error");
            }
        }
    }
}

fn conversation_peer(me: UserId, sender_id: UserId, receiver_id: UserId) -> UserId {
    if sender_id == me {
        receiver_id
    } else {
        sender_id
    }
}

fn advance_cursor(
    cursors: &mut HashMap<UserId, DateTime<Utc>>,
    peer: UserId,
    seen_at: DateTime<Utc>,
) {
    let cursor = cursors.entry(peer).or_insert(seen_at);
    if seen_at > *cursor {
        *cursor = seen_at;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
