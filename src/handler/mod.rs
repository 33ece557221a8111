//! Connection handler
//!
//! [`ConnectionHandler`] owns the event loop that drives every connection:
//! it partitions live state into the `connecting`, `connected`, `dns_resolves`
//! and `binds` maps, schedules outbound slot refills, translates network
//! events into embedder callbacks, and tears everything down on shutdown.
//!
//! All state mutation and every embedder callback happens inside the loop.
//! The embedder either drives the loop itself with [`pump`], making the
//! calling thread the loop thread, or moves the handler onto a task with
//! [`spawn`]. Cross-thread commands go through [`HandlerControl`], which
//! shares only the connected map and the event channel.
//!
//! [`pump`]: ConnectionHandler::pump
//! [`spawn`]: ConnectionHandler::spawn

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Destination, HandlerConfig, RateLimit, ResolveFamily, ResolveMode};
use crate::conn::attempt::{connect_direct, Attempt, AttemptPhase};
use crate::conn::established::{spawn_established, ConnHandle, ConnIo};
use crate::conn::socks5::{connect_via_proxy, ProxyFailure};
use crate::conn::{consume_retry, AttemptOutcome, ConnId, DisconnectReason};
use crate::error::{BindError, HandlerError, ResolveError};
use crate::events::NetworkEvents;
use crate::listener::PeerListener;
use crate::rate::{ConnRate, RateGroup};
use crate::resolver::{resolved_destinations, Resolver, SystemResolver};

pub mod stats;

pub use stats::{HandlerStats, StatsSnapshot};

/// Upper bound on concurrent outbound handshakes
const MAX_SIMULTANEOUS_CONNECTING: usize = 8;

/// Period of the outbound slot refill timer
const REFILL_INTERVAL: Duration = Duration::from_millis(500);

/// Events processed by the handler loop
#[derive(Debug)]
pub(crate) enum LoopEvent {
    /// A step of an outbound attempt finished
    Attempt { id: ConnId, outcome: AttemptOutcome },
    /// A resolve-only lookup finished
    ResolveOnly {
        id: ConnId,
        result: Result<Vec<SocketAddr>, ResolveError>,
    },
    /// A listener accepted a socket
    Accepted {
        bind_id: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
    },
    /// A listener died after binding
    ListenFailed { bind_id: ConnId, error: BindError },
    /// Complete inbound messages from an established connection
    Messages {
        id: ConnId,
        messages: Vec<Bytes>,
        total: usize,
    },
    /// The framer rejected the inbound stream
    Malformed { id: ConnId },
    /// The write buffer crossed its high watermark
    WriteBufferFull { id: ConnId, bufsize: usize },
    /// The write buffer drained below its low watermark
    WriteBufferReady { id: ConnId, bufsize: usize },
    /// An established connection ended
    Disconnected { id: ConnId, reason: DisconnectReason },
    /// Refill outbound slots now
    RequestOutgoing,
    /// Begin the tear-down sequence
    Shutdown,
}

/// Entry in the shared connected map
pub(crate) struct ConnEntry {
    pub(crate) handle: ConnHandle,
    requested: Destination,
}

/// An outbound connection still connecting
struct Connecting {
    attempt: Attempt,
    task: JoinHandle<()>,
}

/// An in-flight resolve-only request
struct DnsResolve {
    dest: Destination,
    retries_remaining: i32,
    task: JoinHandle<()>,
}

/// The connection handler core
///
/// See the [module documentation](self) for the threading model.
pub struct ConnectionHandler {
    config: HandlerConfig,
    callbacks: Arc<dyn NetworkEvents>,
    resolver: Arc<dyn Resolver>,

    connected: Arc<DashMap<ConnId, ConnEntry>>,
    connecting: HashMap<ConnId, Connecting>,
    dns_resolves: HashMap<ConnId, DnsResolve>,
    binds: HashMap<ConnId, PeerListener>,

    incoming_group: Arc<RateGroup>,
    outgoing_group: Arc<RateGroup>,
    stats: Arc<HandlerStats>,

    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,

    next_conn_id: u64,
    outgoing_limit: usize,
    outgoing_count: usize,
    incoming_count: usize,
    next_refill: Instant,

    started: bool,
    shutdown: bool,
    shutdown_reported: bool,
}

impl ConnectionHandler {
    /// Create a handler with the system resolver
    #[must_use]
    pub fn new(config: HandlerConfig, callbacks: Arc<dyn NetworkEvents>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            callbacks,
            resolver: Arc::new(SystemResolver::new()),
            connected: Arc::new(DashMap::new()),
            connecting: HashMap::new(),
            dns_resolves: HashMap::new(),
            binds: HashMap::new(),
            incoming_group: Arc::new(RateGroup::unlimited()),
            outgoing_group: Arc::new(RateGroup::unlimited()),
            stats: Arc::new(HandlerStats::new()),
            events_tx,
            events_rx,
            next_conn_id: 1,
            outgoing_limit: 0,
            outgoing_count: 0,
            incoming_count: 0,
            next_refill: Instant::now() + REFILL_INTERVAL,
            started: false,
            shutdown: false,
            shutdown_reported: false,
        }
    }

    /// Substitute the resolver (test scripts, caching resolvers)
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Initialize and emit `on_startup`
    ///
    /// `outgoing_limit` is the target population of established outbound
    /// connections. Must not be called again without an intervening
    /// completed shutdown.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError` if already started or the configuration is
    /// inconsistent.
    pub fn start(&mut self, outgoing_limit: usize) -> Result<(), HandlerError> {
        if self.started {
            return Err(HandlerError::AlreadyStarted);
        }
        self.config
            .validate()
            .map_err(|reason| HandlerError::InvalidConfig { reason })?;

        debug_assert_eq!(self.outgoing_count, 0);
        debug_assert_eq!(self.incoming_count, 0);

        // Drop anything left over from a previous run
        while self.events_rx.try_recv().is_ok() {}

        self.outgoing_limit = outgoing_limit;
        self.started = true;
        self.shutdown = false;
        self.shutdown_reported = false;
        self.next_refill = Instant::now() + REFILL_INTERVAL;

        info!(outgoing_limit, "handler started");

        let callbacks = Arc::clone(&self.callbacks);
        callbacks.on_startup(self);

        let _ = self.events_tx.send(LoopEvent::RequestOutgoing);
        Ok(())
    }

    /// Run one loop iteration
    ///
    /// With `block` the call waits for the next event or refill tick;
    /// without it only already-pending work is processed. Returns `false`
    /// once shutdown has completed (after delivering `on_shutdown`).
    pub async fn pump(&mut self, block: bool) -> bool {
        if !self.started {
            return false;
        }

        if !self.shutdown {
            if block {
                let wake = tokio::select! {
                    ev = self.events_rx.recv() => ev,
                    () = tokio::time::sleep_until(self.next_refill) => None,
                };
                if let Some(ev) = wake {
                    self.dispatch(ev);
                }
            }
            while !self.shutdown {
                match self.events_rx.try_recv() {
                    Ok(ev) => self.dispatch(ev),
                    Err(_) => break,
                }
            }
            if !self.shutdown && Instant::now() >= self.next_refill {
                self.next_refill = Instant::now() + REFILL_INTERVAL;
                self.refill();
            }
        }

        if self.shutdown {
            self.finish_shutdown();
            return false;
        }
        true
    }

    /// Drive the loop until shutdown completes
    pub async fn run(&mut self) {
        while self.pump(true).await {}
    }

    /// Move the handler onto its own task
    ///
    /// Returns the cross-thread control handle and the task handle, which
    /// resolves to the handler once shutdown completes.
    #[must_use]
    pub fn spawn(mut self) -> (HandlerControl, JoinHandle<ConnectionHandler>) {
        let control = self.control();
        let task = tokio::spawn(async move {
            self.run().await;
            self
        });
        (control, task)
    }

    /// Get a cross-thread command handle
    #[must_use]
    pub fn control(&self) -> HandlerControl {
        HandlerControl {
            connected: Arc::clone(&self.connected),
            events_tx: self.events_tx.clone(),
            incoming_group: Arc::clone(&self.incoming_group),
            outgoing_group: Arc::clone(&self.outgoing_group),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Schedule shutdown; safe from any thread via [`HandlerControl`], and
    /// from the loop thread through this method
    pub fn shutdown(&self) {
        let _ = self.events_tx.send(LoopEvent::Shutdown);
    }

    /// Create a listener from a bind descriptor
    ///
    /// Loop-thread only (requires `&mut self`). Returns whether the bind
    /// succeeded and accepting began.
    pub fn bind(&mut self, dest: Destination) -> bool {
        if !self.started || self.shutdown {
            warn!(dest = %dest, "bind ignored: handler not running");
            return false;
        }
        if self.binds.len() >= self.config.bind_limit {
            warn!(dest = %dest, limit = self.config.bind_limit, "bind rejected: listener limit");
            return false;
        }

        let id = self.alloc_id();
        match PeerListener::bind(id, dest, self.config.accept_backlog) {
            Ok(mut listener) => {
                listener.enable(self.events_tx.clone());
                self.binds.insert(id, listener);
                true
            }
            Err(e) => {
                warn!(error = %e, "bind failed");
                false
            }
        }
    }

    /// Locally bound addresses of all live listeners
    #[must_use]
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.binds.values().map(PeerListener::local_addr).collect()
    }

    /// Begin connecting to a destination
    ///
    /// Loop-thread only. Picks the variant from the descriptor: proxied
    /// destinations tunnel through their proxy, resolve-only destinations
    /// perform a bare lookup, literal hosts connect directly, everything
    /// else resolves first and walks the resulting addresses.
    pub fn start_connection(&mut self, dest: Destination) {
        if !self.started || self.shutdown || !dest.is_set() {
            return;
        }
        if dest.resolve == ResolveMode::NoResolve && dest.family != ResolveFamily::Any {
            warn!(dest = %dest, "rejecting destination: family filter with resolution disabled");
            let callbacks = Arc::clone(&self.callbacks);
            callbacks.on_connection_failure(&dest, &dest, false);
            return;
        }
        if dest.resolve == ResolveMode::ResolveOnly {
            let id = self.alloc_id();
            let task = self.spawn_resolve_only(id, &dest);
            self.dns_resolves.insert(
                id,
                DnsResolve {
                    retries_remaining: dest.retries,
                    dest,
                    task,
                },
            );
            return;
        }

        // A literal host connects without ever reaching the resolver, so its
        // family filter is enforced here
        if let Some(addr) = dest.literal_addr() {
            if !dest.family.admits(&addr) {
                warn!(dest = %dest, family = %dest.family, "rejecting destination: family filter excludes literal address");
                let callbacks = Arc::clone(&self.callbacks);
                callbacks.on_connection_failure(&dest, &dest, false);
                return;
            }
        }

        let id = self.alloc_id();
        let attempt = Attempt::new(dest);
        let task = self.spawn_attempt_step(id, &attempt);
        self.connecting.insert(id, Connecting { attempt, task });
    }

    /// Established outbound connection count
    #[must_use]
    pub fn outgoing_connections(&self) -> usize {
        self.outgoing_count
    }

    /// Established inbound connection count
    #[must_use]
    pub fn incoming_connections(&self) -> usize {
        self.incoming_count
    }

    /// Connections currently in the connecting phase
    #[must_use]
    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Handler statistics
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn alloc_id(&mut self) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    fn poke_refill(&self) {
        if !self.shutdown {
            let _ = self.events_tx.send(LoopEvent::RequestOutgoing);
        }
    }

    fn dispatch(&mut self, ev: LoopEvent) {
        match ev {
            LoopEvent::RequestOutgoing => self.refill(),
            LoopEvent::Attempt { id, outcome } => self.handle_attempt(id, outcome),
            LoopEvent::ResolveOnly { id, result } => self.handle_resolve_only(id, result),
            LoopEvent::Accepted {
                bind_id,
                stream,
                peer,
            } => self.handle_accepted(bind_id, stream, peer),
            LoopEvent::ListenFailed { bind_id, error } => self.handle_listen_failed(bind_id, &error),
            LoopEvent::Messages {
                id,
                messages,
                total,
            } => self.handle_messages(id, messages, total),
            LoopEvent::Malformed { id } => self.handle_malformed(id),
            LoopEvent::WriteBufferFull { id, bufsize } => {
                if self.connected.contains_key(&id) {
                    let callbacks = Arc::clone(&self.callbacks);
                    callbacks.on_write_buffer_full(id, bufsize);
                }
            }
            LoopEvent::WriteBufferReady { id, bufsize } => {
                if self.connected.contains_key(&id) {
                    let callbacks = Arc::clone(&self.callbacks);
                    callbacks.on_write_buffer_ready(id, bufsize);
                }
            }
            LoopEvent::Disconnected { id, reason } => self.handle_disconnected(id, reason),
            LoopEvent::Shutdown => self.run_shutdown(),
        }
    }

    /// Top up the connecting pool from the embedder
    fn refill(&mut self) {
        if self.shutdown {
            return;
        }
        let connecting = self.connecting.len();
        let established = self.outgoing_count + self.incoming_count;
        let need = self
            .outgoing_limit
            .saturating_sub(self.outgoing_count + connecting)
            .min(MAX_SIMULTANEOUS_CONNECTING)
            .min(self.config.total_limit.saturating_sub(established + connecting));
        if need == 0 {
            return;
        }

        let callbacks = Arc::clone(&self.callbacks);
        let dests = callbacks.on_need_outgoing(need);
        for dest in dests.into_iter().take(need) {
            if dest.is_set() {
                self.start_connection(dest);
            }
        }
    }

    fn spawn_attempt_step(&self, id: ConnId, attempt: &Attempt) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        let keepalive = self.config.tcp_keepalive;

        match &attempt.phase {
            AttemptPhase::Direct { .. } | AttemptPhase::Iterating { .. } => {
                let addr = attempt
                    .current_addr()
                    .expect("connectable phase carries an address");
                let dest = attempt.dest.clone();
                tokio::spawn(async move {
                    let outcome = match connect_direct(addr, dest.timeout(), keepalive).await {
                        Ok(stream) => AttemptOutcome::Connected {
                            stream,
                            resolved: dest.resolved_to(addr),
                        },
                        Err(error) => AttemptOutcome::ConnectFailed {
                            resolved: dest.resolved_to(addr),
                            error,
                        },
                    };
                    let _ = events_tx.send(LoopEvent::Attempt { id, outcome });
                })
            }
            AttemptPhase::Resolving => {
                let resolver = Arc::clone(&self.resolver);
                let dest = attempt.dest.clone();
                tokio::spawn(async move {
                    let outcome = match resolver.resolve(&dest).await {
                        Ok(addrs) => AttemptOutcome::Resolved(addrs),
                        Err(e) => AttemptOutcome::ResolveFailed(e),
                    };
                    let _ = events_tx.send(LoopEvent::Attempt { id, outcome });
                })
            }
            AttemptPhase::Proxy => {
                let dest = attempt.dest.clone();
                tokio::spawn(async move {
                    let proxy = dest.proxy.clone().expect("proxy phase carries a proxy");
                    let outcome =
                        match connect_via_proxy(&proxy, &dest, dest.timeout(), keepalive).await {
                            Ok((stream, literal)) => {
                                let resolved =
                                    literal.map_or_else(|| dest.clone(), |a| dest.resolved_to(a));
                                AttemptOutcome::Connected { stream, resolved }
                            }
                            Err(ProxyFailure::Transport(error)) => AttemptOutcome::ConnectFailed {
                                resolved: dest.resolved_to(proxy.addr),
                                error,
                            },
                            Err(ProxyFailure::Dialogue(e)) => AttemptOutcome::ProxyFailed(e),
                        };
                    let _ = events_tx.send(LoopEvent::Attempt { id, outcome });
                })
            }
        }
    }

    fn spawn_resolve_only(&self, id: ConnId, dest: &Destination) -> JoinHandle<()> {
        let resolver = Arc::clone(&self.resolver);
        let events_tx = self.events_tx.clone();
        let dest = dest.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(&dest).await;
            let _ = events_tx.send(LoopEvent::ResolveOnly { id, result });
        })
    }

    /// Re-attempt under a fresh connection id
    fn requeue(&mut self, attempt: Attempt) {
        let new_id = self.alloc_id();
        self.stats.record_retry();
        debug!(id = new_id, dest = %attempt.dest, "retrying connection");
        let task = self.spawn_attempt_step(new_id, &attempt);
        self.connecting.insert(new_id, Connecting { attempt, task });
    }

    fn handle_attempt(&mut self, id: ConnId, outcome: AttemptOutcome) {
        // Absent means the attempt was cancelled by shutdown
        let Some(connecting) = self.connecting.remove(&id) else {
            return;
        };
        let mut attempt = connecting.attempt;
        let callbacks = Arc::clone(&self.callbacks);

        match outcome {
            AttemptOutcome::Resolved(addrs) => {
                attempt.set_resolved(addrs);
                let task = self.spawn_attempt_step(id, &attempt);
                self.connecting.insert(id, Connecting { attempt, task });
            }
            AttemptOutcome::ResolveFailed(error) => {
                self.stats.record_failure();
                let will_retry =
                    !self.shutdown && error.is_recoverable() && attempt.consume_retry();
                debug!(dest = %attempt.dest, error = %error, will_retry, "resolution failed");
                callbacks.on_dns_failure(&attempt.dest, will_retry);
                if will_retry {
                    self.requeue(attempt);
                } else {
                    self.poke_refill();
                }
            }
            AttemptOutcome::Connected { stream, resolved } => {
                self.establish_outgoing(id, attempt.dest, &resolved, stream);
            }
            AttemptOutcome::ConnectFailed { resolved, error } => {
                self.stats.record_failure();
                let iterating = matches!(attempt.phase, AttemptPhase::Iterating { .. });
                let will_retry = if self.shutdown || !error.is_recoverable() {
                    false
                } else if iterating {
                    // Walking the current resolution round is free; a new
                    // round costs budget
                    attempt.advance_cursor() || attempt.consume_retry()
                } else {
                    attempt.consume_retry()
                };
                debug!(
                    dest = %attempt.dest,
                    resolved = %resolved,
                    error = %error,
                    will_retry,
                    "connect failed"
                );
                callbacks.on_connection_failure(&attempt.dest, &resolved, will_retry);
                if will_retry {
                    self.requeue(attempt);
                } else {
                    self.poke_refill();
                }
            }
            AttemptOutcome::ProxyFailed(error) => {
                self.stats.record_failure();
                let will_retry =
                    !self.shutdown && error.is_recoverable() && attempt.consume_retry();
                debug!(dest = %attempt.dest, error = %error, will_retry, "proxy dialogue failed");
                callbacks.on_proxy_failure(&attempt.dest, will_retry);
                if will_retry {
                    self.requeue(attempt);
                } else {
                    self.poke_refill();
                }
            }
        }
    }

    fn establish_outgoing(
        &mut self,
        id: ConnId,
        requested: Destination,
        resolved: &Destination,
        stream: TcpStream,
    ) {
        let callbacks = Arc::clone(&self.callbacks);
        let framer = callbacks.create_framer(&requested.net_config);
        let rate = Arc::new(ConnRate::new(Arc::clone(&self.outgoing_group)));

        let handle = spawn_established(ConnIo {
            id,
            outgoing: true,
            stream,
            framer,
            rate,
            events_tx: self.events_tx.clone(),
            high_watermark: self.config.high_watermark,
            low_watermark: self.config.low_watermark,
            stats: Arc::clone(&self.stats),
        });

        self.connected.insert(
            id,
            ConnEntry {
                handle,
                requested: requested.clone(),
            },
        );
        self.outgoing_count += 1;
        self.stats.record_outgoing_established();

        info!(id, peer = %resolved, "outgoing connection established");
        callbacks.on_outgoing_connection(id, &requested, resolved);
        callbacks.on_ready_for_first_send(id);
    }

    fn handle_accepted(&mut self, bind_id: ConnId, stream: TcpStream, peer: SocketAddr) {
        if self.shutdown {
            return;
        }
        let Some(listener) = self.binds.get(&bind_id) else {
            return;
        };
        if self.incoming_count >= self.config.incoming_limit
            || self.outgoing_count + self.incoming_count >= self.config.total_limit
        {
            debug!(peer = %peer, "dropping accepted connection: limit reached");
            return;
        }

        let bind_dest = listener.dest().clone();
        let id = self.alloc_id();
        let resolved = Destination::from_addr(peer);

        let callbacks = Arc::clone(&self.callbacks);
        if !callbacks.on_incoming_connection(id, &bind_dest, &resolved) {
            debug!(id, peer = %peer, "incoming connection declined");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!(id, peer = %peer, error = %e, "failed to set TCP_NODELAY on accepted socket");
        }

        let framer = callbacks.create_framer(&bind_dest.net_config);
        let rate = Arc::new(ConnRate::new(Arc::clone(&self.incoming_group)));
        let handle = spawn_established(ConnIo {
            id,
            outgoing: false,
            stream,
            framer,
            rate,
            events_tx: self.events_tx.clone(),
            high_watermark: self.config.high_watermark,
            low_watermark: self.config.low_watermark,
            stats: Arc::clone(&self.stats),
        });

        self.connected.insert(
            id,
            ConnEntry {
                handle,
                requested: bind_dest,
            },
        );
        self.incoming_count += 1;
        self.stats.record_incoming_established();
        info!(id, peer = %peer, "incoming connection established");
    }

    fn handle_listen_failed(&mut self, bind_id: ConnId, error: &BindError) {
        let Some(listener) = self.binds.remove(&bind_id) else {
            return;
        };
        warn!(addr = %listener.local_addr(), error = %error, "listener removed");
        let callbacks = Arc::clone(&self.callbacks);
        callbacks.on_bind_failure(listener.dest());
    }

    fn handle_messages(&mut self, id: ConnId, messages: Vec<Bytes>, total: usize) {
        if !self.connected.contains_key(&id) {
            return;
        }
        let callbacks = Arc::clone(&self.callbacks);
        let keep_open = callbacks.on_receive_messages(id, messages, total);
        if !keep_open {
            if let Some(entry) = self.connected.get(&id) {
                entry.handle.close(true);
            }
        }
    }

    fn handle_malformed(&mut self, id: ConnId) {
        if !self.connected.contains_key(&id) {
            return;
        }
        let callbacks = Arc::clone(&self.callbacks);
        callbacks.on_malformed_message(id);
        if let Some(entry) = self.connected.get(&id) {
            entry.handle.close(true);
        }
    }

    fn handle_disconnected(&mut self, id: ConnId, reason: DisconnectReason) {
        // First removal wins; anything later for this id is dropped
        let Some((_, entry)) = self.connected.remove(&id) else {
            return;
        };
        let outgoing = entry.handle.outgoing;
        if outgoing {
            self.outgoing_count -= 1;
        } else {
            self.incoming_count -= 1;
        }
        self.stats.record_disconnect(outgoing);

        let reconnect = !self.shutdown
            && outgoing
            && reason.remote_initiated()
            && entry.requested.retries != 0;

        info!(
            id,
            ?reason,
            reconnect,
            bytes_read = entry.handle.bytes_read.load(Ordering::Relaxed),
            bytes_written = entry.handle.bytes_written.load(Ordering::Relaxed),
            "disconnected"
        );
        let callbacks = Arc::clone(&self.callbacks);
        callbacks.on_disconnected(id, reconnect);

        if reconnect {
            self.requeue(Attempt::new(entry.requested));
        } else {
            self.poke_refill();
        }
    }

    fn handle_resolve_only(&mut self, id: ConnId, result: Result<Vec<SocketAddr>, ResolveError>) {
        let callbacks = Arc::clone(&self.callbacks);
        match result {
            Ok(addrs) => {
                let Some(entry) = self.dns_resolves.remove(&id) else {
                    return;
                };
                debug!(dest = %entry.dest, count = addrs.len(), "resolve-only completed");
                callbacks.on_dns_response(&entry.dest, resolved_destinations(&entry.dest, &addrs));
            }
            Err(error) => {
                let (will_retry, dest) = {
                    let Some(entry) = self.dns_resolves.get_mut(&id) else {
                        return;
                    };
                    let will_retry = !self.shutdown
                        && error.is_recoverable()
                        && consume_retry(&mut entry.retries_remaining);
                    (will_retry, entry.dest.clone())
                };
                debug!(dest = %dest, error = %error, will_retry, "resolve-only failed");
                callbacks.on_dns_failure(&dest, will_retry);
                if will_retry {
                    // Re-arm under the same id
                    let task = self.spawn_resolve_only(id, &dest);
                    if let Some(entry) = self.dns_resolves.get_mut(&id) {
                        entry.task = task;
                    }
                } else {
                    self.dns_resolves.remove(&id);
                }
                self.poke_refill();
            }
        }
    }

    /// The tear-down sequence, executed on the loop
    fn run_shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        info!("shutdown started");
        let callbacks = Arc::clone(&self.callbacks);

        let mut ids: Vec<ConnId> = self.connected.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(removed) = self.connected.remove(&id) {
                drained.push(removed);
            }
        }
        let binds = std::mem::take(&mut self.binds);

        self.shutdown = true;

        for (id, entry) in drained {
            let outgoing = entry.handle.outgoing;
            if outgoing {
                self.outgoing_count -= 1;
            } else {
                self.incoming_count -= 1;
            }
            self.stats.record_disconnect(outgoing);
            entry.handle.abort();
            callbacks.on_disconnected(id, false);
        }

        let mut connecting: Vec<(ConnId, Connecting)> =
            std::mem::take(&mut self.connecting).into_iter().collect();
        connecting.sort_unstable_by_key(|(id, _)| *id);
        for (_, pending) in connecting {
            pending.task.abort();
            let dest = pending.attempt.dest;
            callbacks.on_connection_failure(&dest, &dest, false);
        }

        for (_, resolve) in std::mem::take(&mut self.dns_resolves) {
            resolve.task.abort();
        }
        drop(binds);

        debug_assert!(self.connected.is_empty());
        debug_assert_eq!(self.outgoing_count, 0);
        debug_assert_eq!(self.incoming_count, 0);
        info!("shutdown complete");
    }

    /// Deliver `on_shutdown` exactly once after the tear-down ran
    fn finish_shutdown(&mut self) {
        if !self.shutdown_reported {
            self.shutdown_reported = true;
            self.started = false;
            let callbacks = Arc::clone(&self.callbacks);
            callbacks.on_shutdown();
        }
    }
}

/// Cross-thread command surface of a running handler
///
/// Cheap to clone. Commands that target a connection id are no-ops once the
/// id is gone; `send` reports that through its return value.
#[derive(Clone)]
pub struct HandlerControl {
    connected: Arc<DashMap<ConnId, ConnEntry>>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    incoming_group: Arc<RateGroup>,
    outgoing_group: Arc<RateGroup>,
    stats: Arc<HandlerStats>,
}

impl HandlerControl {
    /// Queue bytes on a connection's write buffer
    ///
    /// Returns `false` if the id is unknown or the connection is closing.
    pub fn send(&self, id: ConnId, data: impl Into<Bytes>) -> bool {
        self.connected
            .get(&id)
            .map_or(false, |entry| entry.handle.send(data.into()))
    }

    /// Close a connection; `immediately` aborts in-flight I/O, otherwise
    /// the write buffer drains first
    pub fn close(&self, id: ConnId, immediately: bool) {
        if let Some(entry) = self.connected.get(&id) {
            entry.handle.close(immediately);
        }
    }

    /// Stop reading from a connection's socket
    pub fn pause_recv(&self, id: ConnId) {
        if let Some(entry) = self.connected.get(&id) {
            entry.handle.set_paused(true);
        }
    }

    /// Resume reading from a connection's socket
    pub fn unpause_recv(&self, id: ConnId) {
        if let Some(entry) = self.connected.get(&id) {
            entry.handle.set_paused(false);
        }
    }

    /// Install a per-connection rate override
    pub fn set_rate_limit(&self, id: ConnId, limit: RateLimit) {
        if let Some(entry) = self.connected.get(&id) {
            entry.handle.set_rate_limit(&limit);
        }
    }

    /// Replace the shared inbound group limit
    pub fn set_incoming_rate_limit(&self, limit: RateLimit) {
        self.incoming_group.replace(&limit);
    }

    /// Replace the shared outbound group limit
    pub fn set_outgoing_rate_limit(&self, limit: RateLimit) {
        self.outgoing_group.replace(&limit);
    }

    /// Schedule shutdown
    pub fn shutdown(&self) {
        let _ = self.events_tx.send(LoopEvent::Shutdown);
    }

    /// Whether an id is currently established
    #[must_use]
    pub fn is_connected(&self, id: ConnId) -> bool {
        self.connected.contains_key(&id)
    }

    /// Handler statistics snapshot
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
