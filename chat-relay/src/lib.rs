//! A multi-room chat relay speaking newline-delimited JSON over TCP.
//!
//! Clients authenticate, join rooms, exchange room messages and direct
//! messages, and push files in base64 chunks that the relay reassembles.
//! The pieces:
//!
//! - [`envelope`] is the wire format plus async line read/write helpers.
//! - [`server`] accepts connections and drives one reader and one writer
//!   task per client.
//! - [`session`] owns a client's bounded outbound queue and close signal.
//! - [`router`] dispatches each envelope to [`rooms`], [`directory`],
//!   [`auth`], [`history`] and [`storage`].
//! - [`transfer`] splits files into chunks and tracks reassembly.
//! - [`cli`], [`config`] and [`client`] make up the binary.
//!
//! Integration tests under `tests/` talk to a real listener on an
//! ephemeral port.

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod history;
pub mod rooms;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod transfer;
