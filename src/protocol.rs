//! The node root: listening sockets, the remotes tree, old-connection
//! and handshake bookkeeping, reconnect debounce, garbage collection,
//! and the single event loop that owns all of it (spec §3 "Protocol
//! state", §4.5, §5).
//!
//! Grounded in the teacher's `Node` (`communication::Node`), which owns
//! the listening sockets and the peer table and is driven by a single
//! `tokio::select!`-style accept/dispatch loop
//! (`communication::socket::async_std_tcp`'s server task); this port
//! widens that loop to also drain connection events, remote dispatch
//! results, GC ticks, and the reconnect-debounce timer, since spec's
//! "single-threaded cooperative" model (§5) is expressed here as "one
//! task is the only mutator of shared state", not literal OS-thread
//! singularity.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::address::{Identity, PeerAddress};
use crate::config::Config;
use crate::connection::{self, Connection, ConnectionEvent};
use crate::error::{ErrorKind, Result};
use crate::message::Message;
use crate::remote::{NodeContext, Remote, RemoteEvent, RemoteFlags};
use crate::slot::{SlotHandle, SlotPool};
use crate::tls::TlsContext;

/// A message delivered into a slot, handed to the user's receive
/// callback (spec §4.2 "Delivery").
pub struct Delivery {
    pub peer: PeerAddress,
    pub remote_identity: Identity,
    pub slot: SlotHandle,
}

pub type RecvCallback = Box<dyn FnMut(Delivery) + Send>;

/// Everything the event loop needs to drain. Connection- and
/// remote-originated events arrive via their own typed channels (so
/// `connection.rs`/`remote.rs` stay decoupled from this module) and are
/// relayed in here by small forwarder tasks spawned in [`Protocol::run`].
pub enum Event {
    Conn(ConnectionEvent),
    Remote(RemoteEvent),
    Accepted(Arc<Connection>),
    AcceptFailed,
    GcTick,
    DebounceElapsed,
    Send(Message),
    ReleaseSlot(SlotHandle),
    SetRecvCallback(RecvCallback),
    SetAutoStop,
    Shutdown,
}

/// The per-node root (spec §3 "Protocol state").
pub struct Protocol {
    config: Arc<Config>,
    ctx: Arc<NodeContext>,
    identity: Identity,
    public_port: Arc<AtomicU16>,
    remotes: BTreeMap<PeerAddress, Remote>,
    old_connections: Vec<Arc<Connection>>,
    handshake_pending: Vec<Arc<Connection>>,
    debounce_stack: Vec<PeerAddress>,
    debounce_pending: bool,
    closing: bool,
    auto_stop: bool,
    started_at: Instant,
    recv_cb: Option<RecvCallback>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Protocol {
    /// Builds a node from `config`. Does not bind sockets or start the
    /// event loop yet; call [`Protocol::run`] for that (spec §6 `init`
    /// vs `run`).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let identity = if config.identity == [0u8; 16] {
            crate::address::random_identity()
        } else {
            config.identity
        };
        let tls = TlsContext::build(&config)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel::<RemoteEvent>();

        let forward_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = conn_rx.recv().await {
                if forward_tx.send(Event::Conn(ev)).is_err() {
                    break;
                }
            }
        });
        let forward_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = remote_rx.recv().await {
                if forward_tx.send(Event::Remote(ev)).is_err() {
                    break;
                }
            }
        });

        let public_port = Arc::new(AtomicU16::new(config.port));
        let ctx = Arc::new(NodeContext {
            timeout: config.timeout,
            synchronous: config.synchronous,
            max_slots: config.effective_max_slots(),
            max_msg_size: config.max_msg_size,
            disable_encryption: config.disable_encryption,
            tls,
            identity,
            public_port: public_port.clone(),
            conn_events_tx: conn_tx,
            remote_events_tx: remote_tx,
        });

        Ok(Protocol {
            config,
            ctx,
            identity,
            public_port,
            remotes: BTreeMap::new(),
            old_connections: Vec::new(),
            handshake_pending: Vec::new(),
            debounce_stack: Vec::new(),
            debounce_pending: false,
            closing: false,
            auto_stop: false,
            started_at: Instant::now(),
            recv_cb: None,
            events_tx,
            events_rx,
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn set_recv_callback(&mut self, cb: RecvCallback) {
        self.recv_cb = Some(cb);
    }

    pub fn set_public_port(&self, port: u16) {
        self.public_port.store(port, Ordering::Relaxed);
    }

    /// A cheap clone of the public-port cell, usable by [`crate::chirp::Chirp`]
    /// to expose [`Protocol::set_public_port`]'s effect without routing
    /// through the event loop.
    pub fn public_port_handle(&self) -> Arc<AtomicU16> {
        self.public_port.clone()
    }

    /// A sender usable from any task to enqueue work onto this node's
    /// single event loop: the cooperative equivalent of spec §5's
    /// mutex-protected cross-thread send/release queues, since tokio's
    /// mpsc sender already provides that synchronization.
    pub fn handle(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Binds the v4/v6 listening sockets and runs the event loop until
    /// a shutdown is requested (spec §4.5 "Start").
    pub async fn run(mut self) -> Result<()> {
        let listener_v4 = self.bind_v4()?;
        let listener_v6 = self.bind_v6()?;

        let tx = self.events_tx.clone();
        tokio::spawn(accept_loop(listener_v4, self.ctx.clone(), tx.clone()));
        tokio::spawn(accept_loop(listener_v6, self.ctx.clone(), tx.clone()));

        if !self.config.disable_signals {
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                let _ = tx.send(Event::Shutdown);
            });
        }

        let tx = self.events_tx.clone();
        let reuse_time = self.config.reuse_time;
        tokio::spawn(gc_loop(reuse_time, tx));

        while let Some(ev) = self.events_rx.recv().await {
            match ev {
                Event::Conn(ce) => self.handle_conn_event(ce),
                Event::Remote(re) => self.handle_remote_event(re),
                Event::Accepted(conn) => self.handshake_pending.push(conn),
                Event::AcceptFailed => {}
                Event::GcTick => {
                    self.gc_sweep();
                    if self.auto_stop
                        && self.remotes.is_empty()
                        && self.handshake_pending.is_empty()
                        && self.old_connections.is_empty()
                    {
                        self.close_down(false);
                        break;
                    }
                }
                Event::DebounceElapsed => self.drain_debounce(),
                Event::Send(msg) => self.handle_send(msg),
                Event::ReleaseSlot(slot) => self.handle_release(slot),
                Event::SetRecvCallback(cb) => self.recv_cb = Some(cb),
                Event::SetAutoStop => self.auto_stop = true,
                Event::Shutdown => {
                    self.close_down(false);
                    break;
                }
            }
        }
        Ok(())
    }

    fn bind_v4(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from((Ipv4Addr::from(self.config.bind_v4), self.config.port));
        bind_listener(addr, self.config.backlog, false)
    }

    fn bind_v6(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from((self.config.bind_v6, self.config.port));
        bind_listener(addr, self.config.backlog, true)
    }

    fn handle_conn_event(&mut self, ev: ConnectionEvent) {
        match ev {
            ConnectionEvent::Handshake { conn, key, identity } => {
                self.handshake_pending.retain(|c| !Arc::ptr_eq(c, &conn));
                let now = self.now_ms();
                let remote = self
                    .remotes
                    .entry(key)
                    .or_insert_with(|| Remote::new_alloc(key, now));
                if let Some(old) = remote.connection.take() {
                    if !Arc::ptr_eq(&old, &conn) {
                        self.old_connections.push(old);
                    }
                }
                remote.set_connection(conn, identity);
                remote.touch(now);
                self.dispatch(key);
            }
            ConnectionEvent::Noop { conn } => {
                if let Some(key) = conn.remote_key() {
                    let now = self.now_ms();
                    if let Some(remote) = self.remotes.get_mut(&key) {
                        remote.touch(now);
                    }
                }
            }
            ConnectionEvent::Ack { conn, id } => {
                if let Some(key) = conn.remote_key() {
                    let now = self.now_ms();
                    if let Some(remote) = self.remotes.get_mut(&key) {
                        remote.on_ack_received(id);
                        remote.touch(now);
                    }
                    self.dispatch(key);
                }
            }
            ConnectionEvent::Delivered { conn, slot } => {
                let peer = conn.peer;
                let remote_identity = *conn.remote_identity.lock();
                let key = conn.remote_key();
                if let Some(key) = key {
                    let now = self.now_ms();
                    if let Some(remote) = self.remotes.get_mut(&key) {
                        remote.touch(now);
                    }
                }
                // Stamp the remote this message is owed to, so a later
                // release can route a SEND_ACK back without re-deriving
                // it from the connection (spec.md line 55).
                slot.with_message(|m| m.peer = key.unwrap_or(peer));
                self.deliver(peer, remote_identity, slot);
            }
            ConnectionEvent::Closed { conn, reason } => {
                self.handshake_pending.retain(|c| !Arc::ptr_eq(c, &conn));
                self.old_connections.retain(|c| !Arc::ptr_eq(c, &conn));
                if let Some(key) = conn.remote_key() {
                    if let Some(remote) = self.remotes.get_mut(&key) {
                        remote.clear_connection_if(&conn);
                        if reason != ErrorKind::Shutdown {
                            self.block_and_debounce(key);
                        }
                    }
                    self.dispatch(key);
                }
            }
        }
    }

    fn handle_remote_event(&mut self, ev: RemoteEvent) {
        match ev {
            RemoteEvent::Connected { key, conn } => {
                let now = self.now_ms();
                if let Some(remote) = self.remotes.get_mut(&key) {
                    remote.set_connection(conn, [0; 16]);
                    remote.touch(now);
                }
                self.dispatch(key);
            }
            RemoteEvent::ConnectFailed { key, .. } => {
                if let Some(remote) = self.remotes.get_mut(&key) {
                    remote.reset_connecting();
                }
                self.block_and_debounce(key);
            }
            RemoteEvent::WriteDone { key, msg, result } => {
                if let Some(remote) = self.remotes.get_mut(&key) {
                    remote.on_write_done(msg, result);
                }
                self.dispatch(key);
            }
        }
    }

    fn deliver(&mut self, peer: PeerAddress, remote_identity: Identity, slot: SlotHandle) {
        if let Some(cb) = self.recv_cb.as_mut() {
            cb(Delivery {
                peer,
                remote_identity,
                slot,
            });
        } else {
            slot.release();
        }
    }

    fn dispatch(&mut self, key: PeerAddress) {
        if let Some(remote) = self.remotes.get_mut(&key) {
            let _ = remote.process_queues(&self.ctx);
        }
    }

    fn block_and_debounce(&mut self, key: PeerAddress) {
        if let Some(remote) = self.remotes.get_mut(&key) {
            remote.flags.insert(RemoteFlags::CONN_BLOCKED);
        }
        self.debounce_stack.push(key);
        if !self.debounce_pending {
            self.debounce_pending = true;
            let ms = rand::thread_rng().gen_range(50..=550);
            log::debug!("reconnect to {:?} debounced for {}ms", key, ms);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = tx.send(Event::DebounceElapsed);
            });
        }
    }

    fn drain_debounce(&mut self) {
        self.debounce_pending = false;
        for key in self.debounce_stack.drain(..).collect::<Vec<_>>() {
            if let Some(remote) = self.remotes.get_mut(&key) {
                remote.flags.remove(RemoteFlags::CONN_BLOCKED);
            }
            self.dispatch(key);
        }
    }

    /// Public send path (spec §4.3 "Sending"). Rejects reuse of a USED
    /// message and rejects outright while closing.
    fn handle_send(&mut self, mut msg: Message) {
        use crate::message::{MessageFlags, MessageType};

        if self.closing {
            msg.finish(Err(crate::error::Error::simple(ErrorKind::Shutdown)));
            return;
        }
        if msg.flags.contains(MessageFlags::USED) {
            msg.finish(Err(crate::error::Error::simple(ErrorKind::Used)));
            return;
        }
        msg.flags.insert(MessageFlags::USED);

        let is_control = msg.msg_type.is_control();
        if self.config.synchronous && !is_control {
            msg.msg_type.insert(MessageType::REQ_ACK);
        }

        let key = msg.peer;
        let now = self.now_ms();
        let remote = self
            .remotes
            .entry(key)
            .or_insert_with(|| Remote::new_alloc(key, now));
        remote.maybe_probe(now, self.config.reuse_time.as_millis() as u64);

        if is_control {
            remote.enqueue_control(msg);
        } else {
            remote.enqueue_data(msg);
        }
        self.dispatch(key);
    }

    /// Release path (spec.md line 55: releasing a slot whose message
    /// arrived with `REQ_ACK` must send an ack back to the owning
    /// remote). The SEND_ACK flag was set by the reader at delivery time
    /// (spec §4.2); we read it (and the id/peer to ack) before the slot
    /// is returned to its pool.
    fn handle_release(&mut self, slot: SlotHandle) {
        use crate::message::MessageFlags;

        let ack_target = slot
            .with_message(|m| {
                if m.flags.contains(MessageFlags::SEND_ACK) {
                    Some((m.id, m.peer))
                } else {
                    None
                }
            })
            .flatten();
        slot.release();

        if let Some((id, peer)) = ack_target {
            let now = self.now_ms();
            let remote = self
                .remotes
                .entry(peer)
                .or_insert_with(|| Remote::new_alloc(peer, now));
            let mut ack = Message::ack_for(id, peer);
            ack.flags.insert(MessageFlags::USED);
            remote.enqueue_control(ack);
            self.dispatch(peer);
        }
    }

    fn gc_sweep(&mut self) {
        let now = self.now_ms();
        let reuse_ms = self.config.reuse_time.as_millis() as u64;

        self.old_connections.retain(|conn| {
            if now.saturating_sub(conn.last_used_ms()) >= reuse_ms {
                let _ = conn.shutdown(ErrorKind::Timeout);
                false
            } else {
                true
            }
        });

        let stale: Vec<PeerAddress> = self
            .remotes
            .iter()
            .filter(|(_, r)| {
                !r.flags.contains(RemoteFlags::CONN_BLOCKED)
                    && now.saturating_sub(r.last_used_ms()) >= reuse_ms
            })
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(mut remote) = self.remotes.remove(&key) {
                log::debug!("gc reclaiming idle remote {:?}", key);
                remote.abort_all(ErrorKind::Shutdown);
                if let Some(conn) = remote.connection.take() {
                    remote.flags.insert(RemoteFlags::CONN_BLOCKED);
                    let _ = conn.shutdown(ErrorKind::Shutdown);
                }
            }
        }
    }

    /// Close-down (spec §4.5 "Close down"). `only_conns` leaves remotes
    /// in place so pending send callbacks still observe SHUTDOWN cleanly
    /// (used by the test harness).
    pub fn close_down(&mut self, only_conns: bool) {
        self.closing = true;
        for remote in self.remotes.values_mut() {
            remote.abort_all(ErrorKind::Shutdown);
            if let Some(conn) = remote.connection.take() {
                let _ = conn.shutdown(ErrorKind::Shutdown);
            }
        }
        if !only_conns {
            self.remotes.clear();
        }
        for conn in self.handshake_pending.drain(..) {
            let _ = conn.shutdown(ErrorKind::Shutdown);
        }
        for conn in self.old_connections.drain(..) {
            let _ = conn.shutdown(ErrorKind::Shutdown);
        }
        self.debounce_stack.clear();
    }
}

fn bind_listener(addr: SocketAddr, backlog: u16, v6_only: bool) -> Result<TcpListener> {
    use socket2::{Domain, Protocol as SockProto, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(SockProto::TCP))
        .map_err(|e| crate::error::Error::wrapped(ErrorKind::AddrInUse, e))?;
    socket.set_reuse_address(true).ok();
    if v6_only {
        socket
            .set_only_v6(true)
            .map_err(|e| crate::error::Error::wrapped(ErrorKind::AddrInUse, e))?;
    }
    socket
        .bind(&addr.into())
        .map_err(|e| crate::error::Error::wrapped(ErrorKind::AddrInUse, e))?;
    socket
        .listen(backlog.min(127u16) as i32)
        .map_err(|e| crate::error::Error::wrapped(ErrorKind::AddrInUse, e))?;
    socket.set_nonblocking(true).ok();
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| crate::error::Error::wrapped(ErrorKind::AddrInUse, e))
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<NodeContext>,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                apply_keepalive(&stream);
                spawn_accept(stream, addr.into(), ctx.clone(), events_tx.clone());
            }
            Err(_) => {
                let _ = events_tx.send(Event::AcceptFailed);
            }
        }
        if events_tx.is_closed() {
            break;
        }
    }
}

fn apply_keepalive(stream: &TcpStream) {
    if let Ok(raw) = socket2::SockRef::try_from(stream) {
        let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(45));
        let _ = raw.set_tcp_keepalive(&keepalive);
    }
}

/// Spawns the accept-side handshake: optional TLS upgrade, `conn_start`,
/// and the immediate application-level handshake write (spec §4.5
/// "Accept", §4.4 "Handshake payload"). The resulting connection is
/// handed to the event loop as [`Event::Accepted`] so it lands in the
/// handshake-pending set the same as spec describes.
fn spawn_accept(
    stream: TcpStream,
    peer: PeerAddress,
    ctx: Arc<NodeContext>,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let encrypted = !ctx.disable_encryption && !peer.is_loopback();
        let pool = SlotPool::new(ctx.max_slots);

        let conn = if encrypted {
            let Some(tls) = ctx.tls.as_ref() else {
                let _ = events_tx.send(Event::AcceptFailed);
                return;
            };
            let tls_stream = match tls.acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("tls handshake from {:?} failed: {}", peer, e);
                    let _ = events_tx.send(Event::AcceptFailed);
                    return;
                }
            };
            connection::conn_start(
                tls_stream,
                peer,
                true,
                true,
                pool,
                ctx.max_msg_size,
                ctx.timeout,
                ctx.conn_events_tx.clone(),
            )
            .0
        } else {
            connection::conn_start(
                stream,
                peer,
                true,
                false,
                pool,
                ctx.max_msg_size,
                ctx.timeout,
                ctx.conn_events_tx.clone(),
            )
            .0
        };

        let public_port = ctx.public_port.load(Ordering::Relaxed);
        if connection::send_handshake(&conn, public_port, ctx.identity)
            .await
            .is_err()
        {
            let _ = conn.shutdown(ErrorKind::WriteError);
        }
        let _ = events_tx.send(Event::Accepted(conn));
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return,
    };
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn gc_loop(reuse_time: Duration, events_tx: mpsc::UnboundedSender<Event>) {
    loop {
        let lo = (reuse_time.as_millis() / 2).max(1) as u64;
        let hi = reuse_time.as_millis().max(lo as u128 + 1) as u64;
        let fuzz_ms = rand::thread_rng().gen_range(lo..=hi);
        tokio::time::sleep(Duration::from_millis(fuzz_ms)).await;
        if events_tx.send(Event::GcTick).is_err() {
            break;
        }
    }
}
