use std::{fmt, io};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Sender name stamped on responses and lifecycle events produced by the relay.
pub const SERVER_SENDER: &str = "Server";

/// One logical message on the wire.
///
/// The `type` tag selects the [`Body`] variant; header fields shared by every
/// variant live next to it in the same JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: Body,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Text {
        #[serde(default)]
        content: String,
    },
    Command {
        #[serde(default)]
        content: String,
    },
    Auth {
        #[serde(rename = "content", default)]
        action: AuthAction,
        username: String,
        password: String,
    },
    Direct {
        recipient: String,
        #[serde(default)]
        content: String,
    },
    /// Ciphertext produced by the sender; the relay never looks inside.
    Encrypted {
        recipient: String,
        #[serde(default)]
        content: String,
    },
    Status {
        status: UserStatus,
    },
    File(FileChunk),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    #[default]
    Login,
    Register,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Busy => "busy",
            UserStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "online" => Ok(UserStatus::Online),
            "away" => Ok(UserStatus::Away),
            "busy" => Ok(UserStatus::Busy),
            "offline" => Ok(UserStatus::Offline),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// One slice of a file transfer.
///
/// `data` holds the raw bytes; on the wire it travels as standard base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChunk {
    pub filename: String,
    pub total_size: u64,
    pub chunk_id: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            sender: String::new(),
            room: String::new(),
            timestamp: Utc::now(),
            encrypted: false,
        }
    }

    pub fn text(
        sender: impl Into<String>,
        room: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            room: room.into(),
            ..Self::new(Body::Text {
                content: content.into(),
            })
        }
    }

    pub fn command(content: impl Into<String>) -> Self {
        Self::new(Body::Command {
            content: content.into(),
        })
    }

    /// A command addressed at a room, e.g. `join` or `create`.
    pub fn room_command(content: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            ..Self::command(content)
        }
    }

    pub fn success(message: impl fmt::Display) -> Self {
        Self::server_reply(format!("SUCCESS: {message}"))
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self::server_reply(format!("ERROR: {message}"))
    }

    /// A `command` envelope from the relay carrying free-form content.
    pub fn server_reply(content: impl Into<String>) -> Self {
        Self {
            sender: SERVER_SENDER.to_string(),
            ..Self::command(content)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            Body::Text { .. } => "text",
            Body::Command { .. } => "command",
            Body::Auth { .. } => "auth",
            Body::Direct { .. } => "direct",
            Body::Encrypted { .. } => "encrypted",
            Body::Status { .. } => "status",
            Body::File(_) => "file",
        }
    }

    /// Textual payload for the variants that carry one.
    pub fn content(&self) -> Option<&str> {
        match &self.body {
            Body::Text { content }
            | Body::Command { content }
            | Body::Direct { content, .. }
            | Body::Encrypted { content, .. } => Some(content),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn decode(line: &str) -> Result<Envelope, DecodeError> {
    Ok(serde_json::from_str(line)?)
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let mut encoded = serde_json::to_vec(envelope)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Reads the next non-empty line, without interpreting it.
///
/// Bytes are appended to `line`, and callers clear it once they have used a
/// frame. A read cancelled part way through keeps what it already consumed
/// in `line`, so passing the same buffer again picks the frame back up.
///
/// Returns `Ok(false)` once the peer has closed the stream.
pub async fn read_frame<R>(reader: &mut R, line: &mut String) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let bytes = reader.read_line(line).await?;
        if bytes == 0 {
            return Ok(false);
        }

        let trimmed_len = line.trim_end_matches(LINE_ENDINGS).len();
        line.truncate(trimmed_len);
        if !line.is_empty() {
            return Ok(true);
        }
    }
}

/// Reads and decodes the next envelope. A malformed unit is reported as
/// `InvalidData`, which callers that must survive bad input can match on.
pub async fn read_envelope<R>(reader: &mut R) -> io::Result<Option<Envelope>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if !read_frame(reader, &mut line).await? {
        return Ok(None);
    }
    decode(&line)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode(envelope).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn is_false(value: &bool) -> bool {
    !*value
}

mod base64_data {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}
