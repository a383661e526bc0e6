//! Per-connection handler
//!
//! Owns one socket's session: the authenticated identity, the outgoing event
//! queue, and the dispatch of client events to the presence engine, message
//! pipeline, and room service. Handlers catch every error, log it with
//! correlation ids, and reply with a single `error` event; a failed command
//! never cascades into a broadcast.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::error::Result;
use crate::protocol::{
    validate_content, BusEnvelope, ClientEvent, ConnectionId, MessageKind, PageLimits,
    RoomUpdateKind, ServerEvent,
};
use crate::server::session_registry::ConnectionHandle;
use crate::server::socket_server::AppState;

/// One socket's session
pub struct ConnectionHandler {
    state: AppState,
    connection_id: ConnectionId,
    user: AuthedUser,
    /// Direct handle to this socket's outgoing queue
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandler {
    /// Run a freshly upgraded socket to completion. This is the task entry
    /// point; it returns when the peer disconnects or the writer dies.
    pub async fn run(state: AppState, user: AuthedUser, socket: WebSocket) {
        let connection_id = Uuid::new_v4();
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();

        state.registry.add_connection(
            connection_id,
            ConnectionHandle {
                user_id: user.id,
                username: user.username.clone(),
                tx: tx.clone(),
            },
        );

        let writer = tokio::spawn(write_loop(rx, sink));

        let handler = ConnectionHandler {
            state,
            connection_id,
            user,
            tx,
        };

        info!(
            connection_id = %handler.connection_id,
            user_id = %handler.user.id,
            "socket connected"
        );

        if let Err(e) = handler.on_connect().await {
            warn!(
                connection_id = %handler.connection_id,
                user_id = %handler.user.id,
                "connect lifecycle failed: {}",
                e
            );
        }

        handler.read_loop(stream).await;
        handler.on_disconnect().await;
        writer.abort();

        info!(
            connection_id = %handler.connection_id,
            user_id = %handler.user.id,
            "socket closed"
        );
    }

    /// Connect lifecycle: presence goes online and every room the user
    /// belongs to learns about it. Socket-level room buckets are joined only
    /// on explicit `join_room` events.
    async fn on_connect(&self) -> Result<()> {
        if let Err(e) = self
            .state
            .kv
            .set_session(self.user.id, self.connection_id)
            .await
        {
            debug!(user_id = %self.user.id, "session key write failed: {}", e);
        }
        self.state.presence.touch(self.user.id).await?;
        let rooms = self.state.presence.mark_online(&self.user).await?;
        self.broadcast_presence(RoomUpdateKind::UserConnected, &rooms)
            .await;
        Ok(())
    }

    /// Disconnect lifecycle. The offline emit is gated on the online-set
    /// removal, so when the reaper (or another node) got there first this
    /// stays silent.
    async fn on_disconnect(&self) {
        self.state.registry.remove_connection(self.connection_id);

        // A reconnect may already own the session key; if so the user is
        // still online somewhere and this socket must not demote them.
        match self.state.kv.get_session(self.user.id).await {
            Ok(Some(owner)) if owner != self.connection_id => {
                debug!(
                    user_id = %self.user.id,
                    "session superseded by another socket, skipping offline"
                );
                return;
            }
            Ok(_) => {
                if let Err(e) = self.state.kv.delete_session(self.user.id).await {
                    debug!(user_id = %self.user.id, "session key delete failed: {}", e);
                }
            }
            Err(e) => {
                debug!(user_id = %self.user.id, "session key read failed: {}", e);
            }
        }

        match self.state.presence.mark_offline(self.user.id).await {
            Ok(Some(rooms)) => {
                self.broadcast_presence(RoomUpdateKind::UserDisconnected, &rooms)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(user_id = %self.user.id, "offline transition failed: {}", e);
            }
        }
    }

    async fn read_loop(&self, mut stream: SplitStream<WebSocket>) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match ClientEvent::parse(text.as_str()) {
                    Ok(event) => self.dispatch(event).await,
                    Err(e) => {
                        debug!(
                            connection_id = %self.connection_id,
                            user_id = %self.user.id,
                            "unparseable frame: {}",
                            e
                        );
                        self.reply(ServerEvent::from_error(&e));
                    }
                },
                Ok(Message::Close(_)) => break,
                // Binary frames are not part of the protocol; pings are
                // answered by the socket layer.
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        connection_id = %self.connection_id,
                        "socket read error: {}",
                        e
                    );
                    break;
                }
            }
        }
    }

    /// Route one event under the per-event deadline, converting any failure
    /// into a single `error` reply.
    async fn dispatch(&self, event: ClientEvent) {
        let name = event.name();
        let outcome = match tokio::time::timeout(
            self.state.config.event_deadline,
            self.handle_event(event),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        if let Err(e) = outcome {
            error!(
                connection_id = %self.connection_id,
                user_id = %self.user.id,
                event = name,
                "handler failed: {}",
                e
            );
            self.reply(ServerEvent::from_error(&e));
        }
    }

    async fn handle_event(&self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::JoinRoom {
                room_id,
                already_joined,
            } => self.handle_join_room(room_id, already_joined).await,
            ClientEvent::LeaveRoom { room_id } => self.handle_leave_room(room_id).await,
            ClientEvent::SendMessage { room_id, content } => {
                self.handle_send_message(room_id, &content).await
            }
            ClientEvent::LoadMoreMessages {
                room_id,
                limit,
                before,
            } => self.handle_load_more(room_id, limit, before).await,
            ClientEvent::TypingStart { room_id } => self.handle_typing(room_id, true).await,
            ClientEvent::TypingStop { room_id } => self.handle_typing(room_id, false).await,
            ClientEvent::Heartbeat => self.handle_heartbeat().await,
            ClientEvent::GetRoomPresences { room_id } => {
                let presences = self.state.presence.snapshot(room_id).await?;
                self.reply(ServerEvent::RoomPresences { room_id, presences });
                Ok(())
            }
            ClientEvent::GetMyRooms => {
                let rooms = self.state.db.rooms_for_user(self.user.id).await?;
                self.reply(ServerEvent::MyRooms {
                    rooms: rooms.iter().map(|r| r.to_summary()).collect(),
                });
                Ok(())
            }
        }
    }

    async fn handle_join_room(&self, room_id: Uuid, already_joined: bool) -> Result<()> {
        // The socket protocol carries no passcode; private rooms are entered
        // through the REST join flow first, after which the membership check
        // inside the service short-circuits.
        let outcome = self.state.rooms.join(&self.user, room_id, None).await?;
        if outcome.newly_joined && already_joined {
            debug!(
                user_id = %self.user.id,
                room_id = %room_id,
                "client claimed membership it did not have"
            );
        }

        self.state.registry.join_room(self.connection_id, room_id);

        // Refresh the presence record's active-rooms from the DB; no emits
        // here, the service already announced a fresh join.
        self.state.presence.mark_online(&self.user).await?;

        // Cache warm-up must not block the join reply.
        let pipeline = self.state.pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.preload(room_id).await {
                warn!(room_id = %room_id, "cache preload failed: {}", e);
            }
        });

        let presences = self.state.presence.snapshot(room_id).await?;
        self.reply(ServerEvent::RoomJoined { room_id, presences });

        let page = self
            .state
            .pipeline
            .recent(room_id, PageLimits::DEFAULT)
            .await?;
        self.reply(ServerEvent::RecentMessages {
            room_id,
            messages: page.messages,
            has_more: page.has_more,
            next_cursor: page.next_cursor,
        });
        Ok(())
    }

    async fn handle_leave_room(&self, room_id: Uuid) -> Result<()> {
        self.state.registry.leave_room(self.connection_id, room_id);
        self.state.rooms.leave(&self.user, room_id).await?;
        self.state.presence.mark_online(&self.user).await?;
        self.reply(ServerEvent::RoomLeft { room_id });
        Ok(())
    }

    async fn handle_send_message(&self, room_id: Uuid, content: &str) -> Result<()> {
        let content = validate_content(content)?;

        // Membership gate: the room-members set is consulted first, the
        // database decides when the set is cold.
        let is_member = match self.state.kv.is_room_member(room_id, self.user.id).await {
            Ok(true) => true,
            _ => self.state.db.is_active_member(self.user.id, room_id).await?,
        };
        if !is_member {
            return Err(crate::error::ChatError::forbidden(
                "not a member of this room",
            ));
        }

        self.bump_activity().await?;
        // The pipeline owns the fan-out; the sender receives the message the
        // same way every other subscriber does.
        self.state
            .pipeline
            .create_message(room_id, Some(&self.user), &content, MessageKind::Text)
            .await?;
        Ok(())
    }

    async fn handle_load_more(
        &self,
        room_id: Uuid,
        limit: Option<u32>,
        before: Option<Uuid>,
    ) -> Result<()> {
        let limit = PageLimits::clamp(limit);
        let page = match before {
            Some(cursor) => self.state.pipeline.older(room_id, limit, cursor).await?,
            None => self.state.pipeline.recent(room_id, limit).await?,
        };
        self.reply(ServerEvent::MoreMessagesLoaded {
            room_id,
            messages: page.messages,
            has_more: page.has_more,
            next_cursor: page.next_cursor,
        });
        Ok(())
    }

    async fn handle_typing(&self, room_id: Uuid, is_typing: bool) -> Result<()> {
        if is_typing {
            self.bump_activity().await?;
        }
        let envelope = BusEnvelope {
            room_id,
            exclude: Some(self.connection_id),
            event: ServerEvent::UserTyping {
                user_id: self.user.id,
                username: self.user.username.clone(),
                room_id,
                is_typing,
            },
        };
        if let Err(e) = self.state.bus.publish(&envelope).await {
            warn!(room_id = %room_id, "typing broadcast failed: {}", e);
        }
        Ok(())
    }

    async fn handle_heartbeat(&self) -> Result<()> {
        self.bump_activity().await?;
        self.reply(ServerEvent::HeartbeatAck);
        Ok(())
    }

    /// Touch the heartbeat and, when this flips the user back online,
    /// announce the rehydration to every room they belong to.
    async fn bump_activity(&self) -> Result<()> {
        if let Some(rooms) = self.state.presence.bump_activity(&self.user).await? {
            self.broadcast_presence(RoomUpdateKind::UserConnected, &rooms)
                .await;
        }
        Ok(())
    }

    /// Emit a presence room update with a fresh snapshot to each room.
    /// Best-effort: fan-out losses are logged, never retried.
    async fn broadcast_presence(&self, kind: RoomUpdateKind, rooms: &[Uuid]) {
        for &room_id in rooms {
            let presences = match self.state.presence.snapshot(room_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(room_id = %room_id, "presence snapshot failed: {}", e);
                    continue;
                }
            };
            let envelope = BusEnvelope {
                room_id,
                exclude: None,
                event: ServerEvent::presence_change(kind, room_id, presences),
            };
            if let Err(e) = self.state.bus.publish(&envelope).await {
                warn!(room_id = %room_id, "presence broadcast failed: {}", e);
            }
        }
    }

    /// Queue an event for this socket only
    fn reply(&self, event: ServerEvent) {
        if self.tx.send(event).is_err() {
            debug!(
                connection_id = %self.connection_id,
                "reply dropped, writer already gone"
            );
        }
    }
}

/// Drain the outgoing queue onto the socket. Runs as its own task so slow
/// clients never block handler acknowledgments.
async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(event) = rx.recv().await {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode outgoing event: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
