//! The TLS-optional transport (spec §4.4) and its staged shutdown.
//!
//! Grounded in the teacher's `Socket`
//! (`communication::socket::async_std_tcp::Socket`), which wraps a raw
//! stream behind `AsyncRead`/`AsyncWrite`. This port generalizes that to
//! an optionally-TLS-wrapped stream by splitting whichever concrete
//! stream type `conn_start` produces (`TcpStream`,
//! `tokio_rustls::server::TlsStream`, or `tokio_rustls::client::TlsStream`)
//! into boxed read/write halves, so `Connection` itself stays agnostic
//! to which one it is holding — the "pluggable transport" spec §9 asks
//! for, expressed with ordinary trait objects instead of a manual vtable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::address::{Identity, PeerAddress};
use crate::error::{Error, ErrorKind, Result, ResultWrappedExt};
use crate::message::Message;
use crate::reader::{Reader, ReaderEvent};
use crate::slot::SlotPool;
use crate::writer;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Events a connection's read task reports to the protocol's single
/// event loop. Mutation of shared state (the remotes tree, the
/// old-connections set, ...) only ever happens in the task draining
/// these, preserving the single-threaded cooperative model of spec §5
/// even though the read task itself runs concurrently.
pub enum ConnectionEvent {
    Handshake { conn: Arc<Connection>, key: PeerAddress, identity: Identity },
    Noop { conn: Arc<Connection> },
    Ack { conn: Arc<Connection>, id: crate::message::MessageId },
    Delivered { conn: Arc<Connection>, slot: crate::slot::SlotHandle },
    Closed { conn: Arc<Connection>, reason: ErrorKind },
}

/// One TCP stream, optionally wrapped in TLS, between this node and one
/// remote (spec §3 "Connection").
pub struct Connection {
    pub peer: PeerAddress,
    pub incoming: bool,
    pub encrypted: bool,
    pub remote_identity: parking_lot::Mutex<Identity>,
    /// The remote key this connection is bound to, set once the
    /// application-level handshake completes. For incoming connections
    /// this differs from `peer` (an ephemeral client port) — it carries
    /// the peer's advertised listening port instead.
    remote_key: parking_lot::Mutex<Option<PeerAddress>>,
    pub pool: Arc<SlotPool>,
    write_half: tokio::sync::Mutex<BoxedWriter>,
    shutdown_notify: Notify,
    shutting_down: AtomicBool,
    connected: AtomicBool,
    write_in_flight: AtomicBool,
    /// Monotonic tick count of the last send or receive on this
    /// connection, used for GC / probe timing (spec §3 "last-used
    /// timestamp"). Measured in milliseconds since the node started.
    last_used_ms: AtomicU64,
    timeout: Duration,
    started_at: std::time::Instant,
}

impl Connection {
    fn now_ms(started_at: std::time::Instant) -> u64 {
        started_at.elapsed().as_millis() as u64
    }

    pub fn touch(&self) {
        self.last_used_ms
            .store(Self::now_ms(self.started_at), Ordering::Relaxed);
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn is_write_busy(&self) -> bool {
        self.write_in_flight.load(Ordering::Acquire)
    }

    /// Writes `msg` out over this connection. Bounded by the configured
    /// timeout (spec §4.3). Only one write may be in flight at a time;
    /// callers (the remote dispatcher) must check [`Connection::is_write_busy`]
    /// first — this mirrors the writer's single current-message pointer
    /// (spec §4.3) without needing a separate `Writer` type, since
    /// tokio's mutex already serializes access to the socket half.
    pub async fn write_message(&self, msg: &Message) -> Result<()> {
        self.write_in_flight.store(true, Ordering::Release);
        let mut guard = self.write_half.lock().await;
        let result = writer::write_message(&mut *guard, msg, self.timeout).await;
        drop(guard);
        self.write_in_flight.store(false, Ordering::Release);
        if result.is_ok() {
            self.touch();
        }
        result
    }

    /// Idempotent shutdown: returns [`ErrorKind::InProgress`] if shutdown
    /// was already signaled. Wakes the read task, which performs the
    /// actual socket teardown and reports [`ConnectionEvent::Closed`].
    pub fn shutdown(&self, _reason: ErrorKind) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(Error::simple(ErrorKind::InProgress));
        }
        self.connected.store(false, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        Ok(())
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn set_remote_identity(&self, identity: Identity) {
        *self.remote_identity.lock() = identity;
    }

    pub fn remote_key(&self) -> Option<PeerAddress> {
        *self.remote_key.lock()
    }

    pub fn set_remote_key(&self, key: PeerAddress) {
        *self.remote_key.lock() = Some(key);
    }
}

/// Builds a [`Connection`] around an already-established (and, if
/// applicable, already TLS-handshaken) stream, splits it, and spawns its
/// read task. Returns the connection handle; the read task runs until
/// shutdown and reports every frame event on `events_tx`.
pub fn conn_start<S>(
    stream: S,
    peer: PeerAddress,
    incoming: bool,
    encrypted: bool,
    pool: Arc<SlotPool>,
    max_msg_size: u32,
    timeout: Duration,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
) -> (Arc<Connection>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let conn = Arc::new(Connection {
        peer,
        incoming,
        encrypted,
        remote_identity: parking_lot::Mutex::new([0; 16]),
        remote_key: parking_lot::Mutex::new(None),
        pool: pool.clone(),
        write_half: tokio::sync::Mutex::new(Box::new(write_half)),
        shutdown_notify: Notify::new(),
        shutting_down: AtomicBool::new(false),
        connected: AtomicBool::new(false),
        write_in_flight: AtomicBool::new(false),
        last_used_ms: AtomicU64::new(0),
        timeout,
        started_at: std::time::Instant::now(),
    });

    let reader = Reader::new(pool, max_msg_size);
    let handle = tokio::spawn(read_loop(
        conn.clone(),
        Box::new(read_half),
        reader,
        events_tx,
    ));
    (conn, handle)
}

async fn read_loop(
    conn: Arc<Connection>,
    mut read_half: BoxedReader,
    mut reader: Reader,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    use tokio::io::AsyncReadExt;

    let buf_size = 65536;
    let mut buf = vec![0u8; buf_size];
    let reason = loop {
        let n = tokio::select! {
            _ = conn.shutdown_notify.notified() => break ErrorKind::Shutdown,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break ErrorKind::Shutdown,
                Ok(n) => n,
                Err(e) => {
                    log::warn!("read error on connection to {:?}: {}", conn.peer, e);
                    break ErrorKind::IoError;
                }
            },
        };

        let events = match reader.feed(&buf[..n]) {
            Ok(events) => events,
            Err(e) => {
                log::warn!("protocol error from {:?}: {}", conn.peer, e);
                break ErrorKind::ProtocolError;
            }
        };

        let mut stopped = false;
        for event in events {
            match event {
                ReaderEvent::HandshakeComplete { port, identity } => {
                    let key = conn.peer.with_port(port);
                    conn.set_remote_identity(identity);
                    conn.set_remote_key(key);
                    conn.mark_connected();
                    conn.touch();
                    if events_tx
                        .send(ConnectionEvent::Handshake {
                            conn: conn.clone(),
                            key,
                            identity,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                ReaderEvent::NoopReceived => {
                    conn.touch();
                    if events_tx
                        .send(ConnectionEvent::Noop { conn: conn.clone() })
                        .is_err()
                    {
                        return;
                    }
                }
                ReaderEvent::AckReceived(id) => {
                    conn.touch();
                    if events_tx
                        .send(ConnectionEvent::Ack {
                            conn: conn.clone(),
                            id,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                ReaderEvent::MessageDelivered(slot) => {
                    conn.touch();
                    if events_tx
                        .send(ConnectionEvent::Delivered {
                            conn: conn.clone(),
                            slot,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                ReaderEvent::NeedSlot => {
                    stopped = true;
                }
            }
        }

        if stopped {
            // Backpressure: stop reading until a slot frees (spec
            // §4.1/§4.2). We still must watch for shutdown meanwhile.
            loop {
                tokio::select! {
                    _ = conn.shutdown_notify.notified() => break,
                    _ = conn.pool.notify.notified() => {
                        match reader.resume_after_slot_free() {
                            Ok(events) => {
                                let mut still_stopped = false;
                                for event in events {
                                    match event {
                                        ReaderEvent::MessageDelivered(slot) => {
                                            conn.touch();
                                            if events_tx.send(ConnectionEvent::Delivered { conn: conn.clone(), slot }).is_err() {
                                                return;
                                            }
                                        }
                                        ReaderEvent::NeedSlot => still_stopped = true,
                                        _ => {}
                                    }
                                }
                                if !still_stopped {
                                    break;
                                }
                            }
                            Err(_) => {
                                let _ = events_tx.send(ConnectionEvent::Closed {
                                    conn: conn.clone(),
                                    reason: ErrorKind::ProtocolError,
                                });
                                return;
                            }
                        }
                    }
                }
                if conn.is_shutting_down() {
                    break;
                }
            }
        }

        if conn.is_shutting_down() {
            break ErrorKind::Shutdown;
        }
    };

    log::debug!("connection to {:?} closing: {:?}", conn.peer, reason);
    let mut write_half = conn.write_half.lock().await;
    let _ = write_half.shutdown().await;
    drop(write_half);
    let _ = events_tx.send(ConnectionEvent::Closed { conn, reason });
}

/// Performs the application-level handshake write (spec §4.4): a fixed
/// record containing this node's public port and identity, sent
/// immediately once the transport (and TLS, if any) is up.
pub async fn send_handshake(conn: &Connection, public_port: u16, identity: Identity) -> Result<()> {
    let framed = crate::message::encode_handshake(public_port, identity);
    let mut guard = conn.write_half.lock().await;
    tokio::time::timeout(conn.timeout, async {
        guard.write_all(&framed).await?;
        guard.flush().await
    })
    .await
    .map_err(|_| Error::simple(ErrorKind::Timeout))?
    .wrapped(ErrorKind::WriteError)
}

/// Connects to `peer` with a bounded timeout, returning a plain
/// [`TcpStream`] (TLS, if required, is layered on by the caller).
pub async fn connect(peer: PeerAddress, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(peer.to_socket_addr())).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::wrapped(ErrorKind::CannotConnect, e)),
        Err(_) => Err(Error::simple(ErrorKind::Timeout)),
    }
}
