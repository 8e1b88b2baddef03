//! Dispatches decoded envelopes to the room hub, the directory and the
//! collaborators.
//!
//! Every handler returns `Result<(), RelayError>`; an error becomes an
//! `ERROR: ...` reply to the sender and never closes the connection.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    auth::CredentialStore,
    directory::Directory,
    envelope::{AuthAction, Body, Envelope, FileChunk, UserStatus},
    error::RelayError,
    history::{HistoryStore, Scope},
    rooms::{Departure, Room, RoomEvent, RoomHub},
    session::{CloseReason, Session, SessionId},
    storage::FileStore,
    transfer::Progress,
};

/// Messages replayed to a session that joins a room.
const JOIN_REPLAY: usize = 10;
/// Messages returned by `history` for the current room.
const ROOM_HISTORY_LIMIT: usize = 20;

pub const EVICTION_NOTICE: &str = "You have been logged in from another connection";
const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted message]";

pub struct Router {
    hub: Arc<RoomHub>,
    directory: Arc<Directory>,
    credentials: Arc<dyn CredentialStore>,
    history: Arc<dyn HistoryStore>,
    files: Arc<dyn FileStore>,
    connected: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl Router {
    pub fn new(
        hub: Arc<RoomHub>,
        directory: Arc<Directory>,
        credentials: Arc<dyn CredentialStore>,
        history: Arc<dyn HistoryStore>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            hub,
            directory,
            credentials,
            history,
            files,
            connected: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub async fn connect(&self, session: &Arc<Session>) {
        self.connected
            .lock()
            .await
            .insert(session.id(), Arc::clone(session));
        info!(session = session.id(), peer = ?session.peer(), "client connected");
    }

    /// Tears a session down: closes it, takes it out of its room and the
    /// directory. Safe to call more than once.
    pub async fn disconnect(&self, session: &Arc<Session>, reason: CloseReason) {
        session.close(reason);
        if self.connected.lock().await.remove(&session.id()).is_none() {
            return;
        }

        self.hub.leave(session, Departure::Disconnected).await;
        let username = session.username().await;
        if let Some(username) = &username {
            self.directory.remove(username, session.id()).await;
        }

        let reason = session.close_reason().unwrap_or(reason);
        info!(session = session.id(), ?username, %reason, "client disconnected");
    }

    /// Notifies and closes every live session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.connected.lock().await.values().cloned().collect();
        for session in sessions {
            session.send(Envelope::error("server shutting down"));
            session.close(CloseReason::Shutdown);
        }
    }

    pub async fn route(&self, session: &Arc<Session>, envelope: Envelope) {
        if session.is_closed() {
            debug!(
                session = session.id(),
                kind = envelope.kind(),
                "dropping request from closed session"
            );
            return;
        }
        debug!(session = session.id(), kind = envelope.kind(), "routing envelope");
        let room_hint = envelope.room;
        let result = match envelope.body {
            Body::Auth {
                action,
                username,
                password,
            } => self.handle_auth(session, action, username, password).await,
            Body::Command { content } => self.handle_command(session, &content, &room_hint).await,
            Body::Text { content } => self.handle_text(session, content).await,
            Body::Direct { recipient, content } => {
                self.handle_direct(session, &recipient, content, false).await
            }
            Body::Encrypted { recipient, content } => {
                self.handle_direct(session, &recipient, content, true).await
            }
            Body::Status { status } => self.handle_status(session, status).await,
            Body::File(chunk) => self.handle_file(session, chunk).await,
        };

        if let Err(err) = result {
            debug!(session = session.id(), error = %err, "request rejected");
            session.send(Envelope::error(err));
        }
    }

    async fn handle_auth(
        &self,
        session: &Arc<Session>,
        action: AuthAction,
        username: String,
        password: String,
    ) -> Result<(), RelayError> {
        if let Some(current) = session.username().await {
            return Err(RelayError::AlreadyAuthenticated(current));
        }
        let username = username.trim().to_string();
        if username.is_empty() || password.is_empty() {
            return Err(RelayError::EmptyCredentials);
        }

        let credentials = Arc::clone(&self.credentials);
        let name = username.clone();
        let accepted = tokio::task::spawn_blocking(move || match action {
            AuthAction::Register => credentials.register(&name, &password),
            AuthAction::Login => credentials.verify(&name, &password),
        })
        .await
        .map_err(|err| RelayError::Internal(err.to_string()))?;

        if !accepted {
            info!(session = session.id(), %username, ?action, "authentication failed");
            return Err(match action {
                AuthAction::Register => RelayError::UsernameTaken,
                AuthAction::Login => RelayError::InvalidCredentials,
            });
        }

        if let Some(previous) = self.directory.register(&username, Arc::clone(session)).await {
            if previous.id() != session.id() {
                self.evict(&previous).await;
            }
        }

        {
            let mut state = session.state().await;
            state.username = username.clone();
            state.authenticated = true;
        }
        info!(session = session.id(), %username, ?action, "authenticated");

        session.send(Envelope::success(match action {
            AuthAction::Register => "Registered and logged in successfully",
            AuthAction::Login => "Logged in successfully",
        }));
        Ok(())
    }

    /// Closes `previous` before taking it out of its room, so a request it
    /// still has in flight cannot put it back. The notice is queued first
    /// and flushed by its writer.
    async fn evict(&self, previous: &Arc<Session>) {
        previous.send(Envelope::server_reply(EVICTION_NOTICE));
        previous.close(CloseReason::Evicted);
        self.hub.leave(previous, Departure::Left).await;
        info!(session = previous.id(), "evicted by a newer login");
    }

    async fn handle_command(
        &self,
        session: &Arc<Session>,
        content: &str,
        room_hint: &str,
    ) -> Result<(), RelayError> {
        let content = content.trim();
        let (name, args) = content.split_once(' ').unwrap_or((content, ""));
        let args = args.trim_start();

        if name == "quit" {
            session.send(Envelope::success("Goodbye"));
            session.close(CloseReason::Quit);
            return Ok(());
        }

        let username = self.require_auth(session).await?;
        match name {
            "rooms" => self.list_rooms(session).await,
            "create" => self.create_room(session, &username, room_arg(room_hint, args)).await,
            "join" => self.join_room(session, room_arg(room_hint, args)).await,
            "leave" => self.leave_room(session).await,
            "msg" | "encrypt" => {
                let (recipient, text) = args
                    .split_once(' ')
                    .filter(|(recipient, text)| !recipient.is_empty() && !text.is_empty())
                    .ok_or(RelayError::Usage(if name == "msg" {
                        "msg <username> <message>"
                    } else {
                        "encrypt <username> <ciphertext>"
                    }))?;
                self.handle_direct(session, recipient, text.to_string(), name == "encrypt")
                    .await
            }
            "status" => {
                let status = args
                    .split_whitespace()
                    .next()
                    .ok_or(RelayError::Usage("status <online|away|busy|offline>"))?
                    .parse::<UserStatus>()
                    .map_err(|_| RelayError::InvalidStatus)?;
                self.handle_status(session, status).await?;
                session.send(Envelope::success(format!("Status updated to: {status}")));
                Ok(())
            }
            "history" => match args.split_whitespace().next() {
                Some(other) => self.conversation_history(session, &username, other).await,
                None => self.room_history(session).await,
            },
            other => Err(RelayError::UnknownCommand(other.to_string())),
        }
    }

    async fn list_rooms(&self, session: &Arc<Session>) -> Result<(), RelayError> {
        let rooms = self.hub.list_rooms().await;
        let listing =
            serde_json::to_string(&rooms).map_err(|err| RelayError::Internal(err.to_string()))?;
        session.send(Envelope::server_reply(listing));
        Ok(())
    }

    async fn create_room(
        &self,
        session: &Arc<Session>,
        username: &str,
        name: Option<&str>,
    ) -> Result<(), RelayError> {
        let name = name.ok_or(RelayError::MissingRoomName)?;
        let (room, created) = self.hub.create_or_get(name).await;
        self.hub.join(session, &room).await;
        if created {
            room.announce(RoomEvent::Created(username.to_string())).await;
        }
        session.send(Envelope::success(format!("Room created and joined: {name}")));
        Ok(())
    }

    async fn join_room(&self, session: &Arc<Session>, name: Option<&str>) -> Result<(), RelayError> {
        let name = name.ok_or(RelayError::MissingRoomName)?;
        let room = self
            .hub
            .get(name)
            .await
            .ok_or_else(|| RelayError::RoomNotFound(name.to_string()))?;

        if !self.hub.join(session, &room).await {
            session.send(Envelope::success(format!("Already in room: {name}")));
            return Ok(());
        }

        let history = self.load_history(&Scope::room(name)).await;
        if !history.is_empty() {
            session.send(Envelope::server_reply("Recent messages:"));
            for message in tail(history, JOIN_REPLAY) {
                session.send(message);
            }
        }
        session.send(Envelope::success(format!("Joined room: {name}")));
        Ok(())
    }

    async fn leave_room(&self, session: &Arc<Session>) -> Result<(), RelayError> {
        let room = self
            .hub
            .leave(session, Departure::Left)
            .await
            .ok_or(RelayError::NotInRoom)?;
        session.send(Envelope::success(format!("Left room: {}", room.name())));
        Ok(())
    }

    async fn room_history(&self, session: &Arc<Session>) -> Result<(), RelayError> {
        let room = self.require_room(session).await?;
        let history = self.load_history(&Scope::room(room.name())).await;
        if history.is_empty() {
            session.send(Envelope::success(format!(
                "No message history for room: {}",
                room.name()
            )));
            return Ok(());
        }

        session.send(Envelope::server_reply(format!(
            "Message history for room {}:",
            room.name()
        )));
        for message in tail(history, ROOM_HISTORY_LIMIT) {
            session.send(message);
        }
        Ok(())
    }

    async fn conversation_history(
        &self,
        session: &Arc<Session>,
        username: &str,
        other: &str,
    ) -> Result<(), RelayError> {
        let history = self.load_history(&Scope::conversation(username, other)).await;
        if history.is_empty() {
            session.send(Envelope::success(format!(
                "No message history with user: {other}"
            )));
            return Ok(());
        }

        session.send(Envelope::server_reply(format!(
            "Message history with {other}:"
        )));
        for message in history {
            session.send(message);
        }
        Ok(())
    }

    async fn handle_text(&self, session: &Arc<Session>, content: String) -> Result<(), RelayError> {
        let username = self.require_auth(session).await?;
        let room = self.require_room(session).await?;

        let message = Envelope::text(username, room.name(), content);
        // The sender gets its own copy back as confirmation.
        room.broadcast(message.clone(), None).await;
        self.record(&Scope::room(room.name()), &message).await;
        Ok(())
    }

    async fn handle_direct(
        &self,
        session: &Arc<Session>,
        recipient: &str,
        content: String,
        encrypted: bool,
    ) -> Result<(), RelayError> {
        let username = self.require_auth(session).await?;
        let target = self
            .directory
            .lookup(recipient)
            .await
            .ok_or_else(|| RelayError::UserNotFound(recipient.to_string()))?;

        let scope = Scope::conversation(&username, recipient);
        let recipient = recipient.to_string();
        let body = if encrypted {
            Body::Encrypted { recipient, content }
        } else {
            Body::Direct { recipient, content }
        };
        let message = Envelope {
            sender: username.clone(),
            timestamp: Utc::now(),
            encrypted,
            ..Envelope::new(body)
        };

        let record = if encrypted {
            redact(&message)
        } else {
            message.clone()
        };

        let message = Arc::new(message);
        target.send(Arc::clone(&message));
        if target.id() != session.id() {
            session.send(message);
        }
        self.record(&scope, &record).await;
        Ok(())
    }

    async fn handle_status(&self, session: &Arc<Session>, status: UserStatus) -> Result<(), RelayError> {
        let username = self.require_auth(session).await?;
        let room = {
            let mut state = session.state().await;
            state.status = status;
            state.current_room.clone()
        };

        info!(session = session.id(), %username, %status, "status changed");
        if let Some(room) = room {
            room.announce(RoomEvent::StatusChanged {
                user: username,
                status,
            })
            .await;
        }
        Ok(())
    }

    async fn handle_file(&self, session: &Arc<Session>, chunk: FileChunk) -> Result<(), RelayError> {
        let username = self.require_auth(session).await?;
        let room = self.require_room(session).await?;

        let receipt = room
            .accept_chunk(&username, &chunk)
            .await
            .map_err(|err| RelayError::BadChunk(err.to_string()))?;
        debug!(
            room = %room.name(),
            sender = %username,
            filename = %chunk.filename,
            chunk = chunk.chunk_id + 1,
            total = chunk.total_chunks,
            "file chunk received"
        );

        if chunk.chunk_id == 0 && receipt.first_copy {
            room.announce(RoomEvent::FileSending {
                user: username.clone(),
                filename: chunk.filename.clone(),
            })
            .await;
        }

        let forwarded = Envelope {
            sender: username.clone(),
            room: room.name().to_string(),
            timestamp: Utc::now(),
            ..Envelope::new(Body::File(chunk))
        };
        room.broadcast(forwarded, Some(session.id())).await;

        if let Progress::Complete(file) = receipt.progress {
            self.store_upload(&room, file.sender, file.filename, file.bytes)
                .await;
        }
        Ok(())
    }

    async fn store_upload(&self, room: &Room, sender: String, filename: String, bytes: Vec<u8>) {
        match self.files.save_assembled(&bytes, &filename, room.name()).await {
            Ok(path) => {
                info!(room = %room.name(), %sender, path = %path.display(), "upload complete");
                room.announce(RoomEvent::FileUploaded {
                    user: sender,
                    filename,
                })
                .await;
            }
            Err(err) => {
                warn!(room = %room.name(), %sender, %filename, error = %err, "failed to store upload");
            }
        }
    }

    async fn require_auth(&self, session: &Session) -> Result<String, RelayError> {
        session.username().await.ok_or(RelayError::NotAuthenticated)
    }

    async fn require_room(&self, session: &Session) -> Result<Arc<Room>, RelayError> {
        session
            .state()
            .await
            .current_room
            .clone()
            .ok_or(RelayError::NotInRoom)
    }

    async fn record(&self, scope: &Scope, message: &Envelope) {
        if let Err(err) = self.history.append(scope, message).await {
            warn!(%scope, error = %err, "failed to record history");
        }
    }

    async fn load_history(&self, scope: &Scope) -> Vec<Envelope> {
        match self.history.history(scope).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(%scope, error = %err, "failed to load history");
                Vec::new()
            }
        }
    }
}

/// Room named by the envelope's `room` field, falling back to the first
/// argument token.
fn room_arg<'a>(room_hint: &'a str, args: &'a str) -> Option<&'a str> {
    let hint = room_hint.trim();
    if !hint.is_empty() {
        return Some(hint);
    }
    args.split_whitespace().next()
}

fn tail(mut messages: Vec<Envelope>, limit: usize) -> Vec<Envelope> {
    let start = messages.len().saturating_sub(limit);
    messages.split_off(start)
}

fn redact(message: &Envelope) -> Envelope {
    let mut record = message.clone();
    if let Body::Encrypted { content, .. } = &mut record.body {
        *content = ENCRYPTED_PLACEHOLDER.to_string();
    }
    record
}
