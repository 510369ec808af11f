//! `chirp` — an embeddable, event-driven message-passing library with
//! optional TLS, slot-pool backpressure, and ack/noop control flow.
//!
//! The entry point is [`Chirp`]; see [`Config`] for node setup and
//! [`Message`] for constructing sends.

mod address;
mod callback_log;
mod chirp;
mod config;
mod connection;
mod error;
mod message;
mod protocol;
mod reader;
mod remote;
mod slot;
mod tls;
mod writer;

pub use address::{Identity, IpFamily, PeerAddress};
pub use callback_log::{set_log_callback, LogCallback};
pub use chirp::{cleanup_library, chirp_version, init_library, Callbacks, Chirp, Received};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, ErrorKind, Result};
pub use message::{Message, MessageFlags, MessageId, MessageType};
pub use protocol::{Delivery, RecvCallback};
pub use slot::{SlotHandle, SlotPool};
