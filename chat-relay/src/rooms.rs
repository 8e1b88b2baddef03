//! Room hub: named rooms, their membership, and in-flight uploads.

use std::{collections::HashMap, fmt, sync::Arc};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    envelope::{Envelope, FileChunk, SERVER_SENDER, UserStatus},
    session::{Session, SessionId},
    transfer::{PendingTransfers, Progress, TransferError},
};

pub const DEFAULT_ROOM: &str = "general";

/// Lifecycle notices the relay posts into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Joined(String),
    Left(String),
    Disconnected(String),
    Created(String),
    FileSending { user: String, filename: String },
    FileUploaded { user: String, filename: String },
    StatusChanged { user: String, status: UserStatus },
}

impl RoomEvent {
    fn describe(&self, room: &str) -> String {
        match self {
            RoomEvent::Joined(user) => format!("{user} has joined the room"),
            RoomEvent::Left(user) => format!("{user} has left the room"),
            RoomEvent::Disconnected(user) => format!("{user} has disconnected from the server"),
            RoomEvent::Created(user) => format!("Room {room} has been created by {user}"),
            RoomEvent::FileSending { user, filename } => {
                format!("{user} is sending file: {filename}")
            }
            RoomEvent::FileUploaded { user, filename } => {
                format!("File {filename} uploaded by {user} is available")
            }
            RoomEvent::StatusChanged { user, status } => format!("{user} is now {status}"),
        }
    }
}

/// How a session left its room; decides which event the others see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Left,
    Disconnected,
}

/// Outcome of [`Room::accept_chunk`]. `first_copy` is false when the same
/// chunk id had already been stored for this transfer.
#[derive(Debug)]
pub struct ChunkReceipt {
    pub progress: Progress,
    pub first_copy: bool,
}

#[derive(Clone)]
struct Member {
    username: String,
    session: Arc<Session>,
}

pub struct Room {
    name: String,
    members: RwLock<HashMap<SessionId, Member>>,
    transfers: Mutex<PendingTransfers>,
}

/// Membership and transfers sit behind async locks, so only the name is shown.
impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Room {
    fn new(name: String) -> Self {
        Self {
            name,
            members: RwLock::new(HashMap::new()),
            transfers: Mutex::new(PendingTransfers::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `envelope` for every member except `exclude`. Returns how
    /// many members accepted it; a member whose queue overflows is closed
    /// and skipped without affecting the rest.
    pub async fn broadcast(
        &self,
        envelope: impl Into<Arc<Envelope>>,
        exclude: Option<SessionId>,
    ) -> usize {
        let envelope = envelope.into();
        let members = self.members.read().await;
        let mut delivered = 0;
        for (id, member) in members.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if member.session.send(Arc::clone(&envelope)) {
                delivered += 1;
            }
        }
        debug!(room = %self.name, delivered, kind = envelope.kind(), "broadcast");
        delivered
    }

    pub async fn announce(&self, event: RoomEvent) -> usize {
        let notice = Envelope::text(SERVER_SENDER, self.name.clone(), event.describe(&self.name));
        self.broadcast(notice, None).await
    }

    /// Records a chunk for its `(sender, filename)` transfer.
    pub async fn accept_chunk(
        &self,
        sender: &str,
        chunk: &FileChunk,
    ) -> Result<ChunkReceipt, TransferError> {
        let mut transfers = self.transfers.lock().await;
        let first_copy = !transfers.has_chunk(sender, &chunk.filename, chunk.chunk_id);
        let progress = transfers.accept(sender, chunk)?;
        Ok(ChunkReceipt {
            progress,
            first_copy,
        })
    }

    /// Drops every unfinished upload from `sender`.
    pub async fn discard_transfers(&self, sender: &str) -> usize {
        let discarded = self.transfers.lock().await.discard_sender(sender);
        if discarded > 0 {
            debug!(room = %self.name, %sender, discarded, "unfinished uploads dropped");
        }
        discarded
    }

    pub async fn pending_transfers(&self) -> usize {
        self.transfers.lock().await.len()
    }

    /// Usernames of the current members, sorted.
    pub async fn member_names(&self) -> Vec<String> {
        let members = self.members.read().await;
        let mut names: Vec<String> = members.values().map(|m| m.username.clone()).collect();
        names.sort();
        names
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    async fn insert(&self, username: String, session: Arc<Session>) {
        self.members
            .write()
            .await
            .insert(session.id(), Member { username, session });
    }

    async fn remove(&self, id: SessionId) -> bool {
        self.members.write().await.remove(&id).is_some()
    }
}

/// Owns every room. Rooms are created on demand and never removed.
pub struct RoomHub {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::with_rooms([DEFAULT_ROOM])
    }
}

impl RoomHub {
    pub fn with_rooms<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), Arc::new(Room::new(name)))
            })
            .collect();
        Self {
            rooms: RwLock::new(rooms),
        }
    }

    /// Returns the room called `name`, creating it if needed. The flag is
    /// `true` when this call created it.
    pub async fn create_or_get(&self, name: &str) -> (Arc<Room>, bool) {
        if let Some(room) = self.get(name).await {
            return (room, false);
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return (Arc::clone(room), false);
        }
        let room = Arc::new(Room::new(name.to_string()));
        rooms.insert(name.to_string(), Arc::clone(&room));
        info!(room = %name, "room created");
        (room, true)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn list_rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Moves `session` into `room`, leaving its previous room first.
    ///
    /// The session's state lock is held for the whole move, so it is never
    /// a member of two rooms. Returns `false` if it was already in `room`
    /// or has been closed.
    pub async fn join(&self, session: &Arc<Session>, room: &Arc<Room>) -> bool {
        let mut state = session.state().await;
        if session.is_closed() {
            return false;
        }
        let username = state.username.clone();

        if let Some(previous) = state.current_room.take() {
            if Arc::ptr_eq(&previous, room) {
                state.current_room = Some(previous);
                return false;
            }
            previous.remove(session.id()).await;
            previous.discard_transfers(&username).await;
            previous.announce(RoomEvent::Left(username.clone())).await;
        }

        room.insert(username.clone(), Arc::clone(session)).await;
        state.current_room = Some(Arc::clone(room));
        drop(state);

        info!(session = session.id(), %username, room = %room.name(), "joined room");
        room.announce(RoomEvent::Joined(username)).await;
        true
    }

    /// Takes `session` out of its current room, if any, and tells the
    /// remaining members. Returns the room it left.
    pub async fn leave(&self, session: &Arc<Session>, departure: Departure) -> Option<Arc<Room>> {
        let mut state = session.state().await;
        let room = state.current_room.take()?;
        let username = state.username.clone();
        let removed = room.remove(session.id()).await;
        drop(state);
        room.discard_transfers(&username).await;

        if removed {
            info!(session = session.id(), %username, room = %room.name(), ?departure, "left room");
            let event = match departure {
                Departure::Left => RoomEvent::Left(username),
                Departure::Disconnected => RoomEvent::Disconnected(username),
            };
            room.announce(event).await;
        }
        Some(room)
    }
}
