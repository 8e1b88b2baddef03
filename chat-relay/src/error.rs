use thiserror::Error;

/// Errors reported back to a client as an `ERROR: ...` response.
///
/// None of these close the connection; the session state is left untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Already authenticated as {0}")]
    AlreadyAuthenticated(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Username already exists")]
    UsernameTaken,

    #[error("Username and password must not be empty")]
    EmptyCredentials,

    #[error("You are not in a room. Join a room first.")]
    NotInRoom,

    #[error("Room name not specified")]
    MissingRoomName,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid status. Use: online, away, busy, or offline")]
    InvalidStatus,

    #[error("Rejected file chunk: {0}")]
    BadChunk(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
