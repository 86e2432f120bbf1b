//! # P2P Service
//!
//! The single task that owns the gossip engine, the sync coordinator and the
//! peer table. Connection tasks report [`NetEvent`]s; the service routes
//! messages to the engine or the coordinator and sends the resulting actions
//! back out through each peer's [`PeerHandle`].
//!
//! Outside code talks to the service through a cloneable [`ServiceHandle`].

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{self, ConnContext};
use super::penalty::{PenaltyPolicy, Sanction};
use super::{NetError, NetEvent, PeerHandle};
use crate::config::{P2pConfig, SAMPLE_RATE_BASE, SAMPLING_CONCURRENCY};
use crate::crypto::IdentityKeypair;
use crate::gossip::{
    GossipEngine, GossipObject, GossipVerdict, HeavyVerifier, PeerScoreTable, SampleResult,
    SamplingPool, ScoreEvent, Standing, Topic,
};
use crate::metrics::P2pMetrics;
use crate::peer::{parse_addr, AddrSource, AddressBook, DialOutcome};
use crate::sync::{
    BlockSource, ConsensusView, SyncAction, SyncCoordinator, SyncEvent, SyncRequest,
};
use crate::types::{Hash32, PeerId};
use crate::wire::messages::{bye, Data, DataItem, InvItem, InvKind, InvList, NewHead, TopicList};
use crate::wire::objects::BlockHeader;
use crate::wire::Message;

const EVENT_QUEUE: usize = 4096;
const COMMAND_QUEUE: usize = 256;
const SYNC_REQUEST_QUEUE: usize = 1024;
const SAMPLE_QUEUE: usize = 1024;
const SYNC_EVENT_BUFFER: usize = 1024;
/// Raw tx and share bodies kept for answering `getdata`.
const SERVED_OBJECTS: usize = 4096;

/// Optional collaborators of the service.
#[derive(Default)]
pub struct ServiceOptions {
    /// Topics joined at startup.
    pub topics: Vec<Topic>,
    /// Address advertised in identify.
    pub listen_addr: Option<String>,
    pub block_source: Option<Arc<dyn BlockSource>>,
    pub verifier: Option<Arc<dyn HeavyVerifier>>,
    pub metrics: Option<Arc<P2pMetrics>>,
}

/// Snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub peer_id: String,
    pub head_height: u64,
    pub head_hash: String,
    pub peers: usize,
    pub ready_peers: usize,
    pub in_safe_mode: bool,
    pub orphans: usize,
    pub fetches: usize,
    pub backpressure: bool,
    pub subscriptions: Vec<String>,
}

enum Command {
    Send {
        peer: PeerId,
        message: Message,
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    Publish {
        topic: Topic,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Hash32, NetError>>,
    },
    Subscribe(Topic),
    Unsubscribe(Topic),
    Disconnect(PeerId),
    ExitSafeMode {
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    Status {
        reply: oneshot::Sender<ServiceStatus>,
    },
}

struct Connected {
    handle: PeerHandle,
    addr: Option<SocketAddr>,
    outbound: bool,
}

/// Raw relay objects kept for `getdata`, least recently served evicted
/// first.
struct ServedObjects {
    items: LruCache<Hash32, (InvKind, Vec<u8>)>,
}

impl ServedObjects {
    fn new(cap: usize) -> Self {
        Self {
            items: LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    fn insert(&mut self, kind: InvKind, id: Hash32, body: Vec<u8>) {
        self.items.put(id, (kind, body));
    }

    fn get(&mut self, item: &InvItem) -> Option<&[u8]> {
        match self.items.get(&item.id) {
            Some((kind, body)) if *kind == item.kind => Some(body.as_slice()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to a running [`P2pService`].
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<Command>,
    ctx: ConnContext,
    book: Arc<AddressBook>,
    scores: Arc<PeerScoreTable>,
    sync_events: broadcast::Sender<SyncEvent>,
}

impl ServiceHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.ctx.identity.peer_id()
    }

    /// Run a connection over an already open transport.
    pub fn attach<T>(&self, io: T, addr: Option<SocketAddr>, outbound: bool) -> JoinHandle<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(connection::run(io, addr, outbound, self.ctx.clone()))
    }

    /// Dial `addr` over TCP and run the connection in the background.
    pub async fn connect(&self, addr: SocketAddr) -> Result<JoinHandle<()>, NetError> {
        self.book.add_candidate(addr, AddrSource::Manual, None, Instant::now());
        let stream = connect_tcp(addr, &self.ctx.config).await?;
        Ok(self.attach(stream, Some(addr), true))
    }

    /// Accept inbound TCP connections until shutdown.
    pub async fn accept_loop(&self, listener: TcpListener) -> Result<(), NetError> {
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, error = %e, "set_nodelay failed");
            }
            trace!(%addr, "inbound connection");
            self.attach(stream, Some(addr), false);
        }
    }

    pub fn add_candidate(&self, addr: SocketAddr, source: AddrSource) -> bool {
        self.book.add_candidate(addr, source, None, Instant::now())
    }

    pub async fn send(&self, peer: PeerId, message: Message) -> Result<(), NetError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send { peer, message, reply }).await?;
        rx.await.map_err(|_| NetError::ServiceStopped)?
    }

    /// Gossip a locally produced payload. Returns its content id.
    pub async fn publish(&self, topic: Topic, data: Vec<u8>) -> Result<Hash32, NetError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Publish { topic, data, reply }).await?;
        rx.await.map_err(|_| NetError::ServiceStopped)?
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<(), NetError> {
        self.request(Command::Subscribe(topic)).await
    }

    pub async fn unsubscribe(&self, topic: Topic) -> Result<(), NetError> {
        self.request(Command::Unsubscribe(topic)).await
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<(), NetError> {
        self.request(Command::Disconnect(peer)).await
    }

    /// Operator intervention after a deep reorg.
    pub async fn exit_safe_mode(&self) -> Result<(), NetError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ExitSafeMode { reply }).await?;
        rx.await.map_err(|_| NetError::ServiceStopped)?
    }

    pub async fn status(&self) -> Result<ServiceStatus, NetError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Status { reply }).await?;
        rx.await.map_err(|_| NetError::ServiceStopped)
    }

    /// Current score of `peer`; unknown peers score zero.
    pub fn peer_score(&self, peer: &PeerId) -> f64 {
        self.scores.score(peer)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync_events.subscribe()
    }

    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
    }

    async fn request(&self, command: Command) -> Result<(), NetError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetError::ServiceStopped)
    }
}

async fn connect_tcp(addr: SocketAddr, config: &P2pConfig) -> Result<TcpStream, NetError> {
    let stream = tokio::time::timeout(config.handshake.step_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| NetError::Io(std::io::ErrorKind::TimedOut.into()))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn dial(ctx: ConnContext, addr: SocketAddr) {
    match connect_tcp(addr, &ctx.config).await {
        Ok(stream) => connection::run(stream, Some(addr), true, ctx).await,
        Err(error) => {
            debug!(%addr, %error, "dial failed");
            let _ = ctx.events.send(NetEvent::Failed { addr: Some(addr), error }).await;
        }
    }
}

async fn recv_sample(rx: &mut Option<mpsc::Receiver<SampleResult>>) -> Option<SampleResult> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct P2pService {
    ctx: ConnContext,
    local: PeerId,
    engine: GossipEngine,
    sync: SyncCoordinator,
    book: Arc<AddressBook>,
    peers: HashMap<PeerId, Connected>,
    dialing: HashSet<SocketAddr>,
    served: ServedObjects,
    penalties: PenaltyPolicy,
    last_head: Hash32,
    net_events: mpsc::Receiver<NetEvent>,
    commands: mpsc::Receiver<Command>,
    sync_requests: mpsc::Receiver<SyncRequest>,
    samples: Option<mpsc::Receiver<SampleResult>>,
    sync_events: broadcast::Sender<SyncEvent>,
    metrics: Option<Arc<P2pMetrics>>,
}

impl P2pService {
    /// Build the service and its handle. Nothing runs until [`run`] is
    /// awaited or spawned.
    ///
    /// [`run`]: P2pService::run
    pub fn new(
        config: P2pConfig,
        identity: Arc<IdentityKeypair>,
        genesis: BlockHeader,
        consensus: Arc<dyn ConsensusView>,
        options: ServiceOptions,
    ) -> (Self, ServiceHandle) {
        let now = Instant::now();
        let config = Arc::new(config);
        let chain_id = genesis.chain_id;

        let mut sync = SyncCoordinator::new(
            &config.sync,
            &config.relay,
            &config.gossip,
            genesis,
            consensus.clone(),
            now,
        );
        if let Some(source) = options.block_source {
            sync = sync.with_block_source(source);
        }
        let chain = sync.chain_view();

        let (request_tx, sync_requests) = mpsc::channel(SYNC_REQUEST_QUEUE);
        let mut engine = GossipEngine::new(&config, chain_id, consensus, chain.clone(), now)
            .with_sync_requests(request_tx);
        let mut samples = None;
        if let Some(verifier) = options.verifier {
            let (pool, rx) =
                SamplingPool::new(verifier, SAMPLING_CONCURRENCY, SAMPLE_QUEUE, SAMPLE_RATE_BASE);
            engine = engine.with_sampler(pool);
            samples = Some(rx);
        }
        if let Some(m) = &options.metrics {
            engine = engine.with_metrics(m.clone());
            sync = sync.with_metrics(m.clone());
        }
        let scores = engine.scores();
        sync = sync.with_scores(scores.clone());

        for topic in &options.topics {
            // No peers yet, so joining yields no grafts.
            engine.subscribe(*topic, now);
        }

        let (events_tx, net_events) = mpsc::channel(EVENT_QUEUE);
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (sync_events, _) = broadcast::channel(SYNC_EVENT_BUFFER);
        let book = Arc::new(AddressBook::new(&config.peer));
        let penalties =
            PenaltyPolicy::new(config.sync.structural_strikes, config.sync.strike_window());
        let last_head = chain.head().hash;
        let local = identity.peer_id();

        let ctx = ConnContext {
            config,
            identity,
            chain,
            events: events_tx,
            metrics: options.metrics.clone(),
            shutdown: CancellationToken::new(),
            topics: options.topics.iter().map(|t| t.as_str().to_string()).collect(),
            listen_addr: options.listen_addr,
        };
        let handle = ServiceHandle {
            commands: command_tx,
            ctx: ctx.clone(),
            book: book.clone(),
            scores,
            sync_events: sync_events.clone(),
        };
        let service = Self {
            ctx,
            local,
            engine,
            sync,
            book,
            peers: HashMap::new(),
            dialing: HashSet::new(),
            served: ServedObjects::new(SERVED_OBJECTS),
            penalties,
            last_head,
            net_events,
            commands,
            sync_requests,
            samples,
            sync_events,
            metrics: options.metrics,
        };
        (service, handle)
    }

    /// Process events until the shutdown token fires, then say bye to
    /// every peer.
    pub async fn run(mut self) {
        let shutdown = self.ctx.shutdown.clone();
        let mut heartbeat = tokio::time::interval(self.ctx.config.mesh.heartbeat());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(peer = %self.local.short(), "p2p service started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.net_events.recv() => self.on_net_event(event),
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(request) = self.sync_requests.recv() => {
                    let actions = self.sync.on_request(request, Instant::now());
                    self.apply(actions, Instant::now());
                }
                Some(result) = recv_sample(&mut self.samples) => {
                    let now = Instant::now();
                    for peer in self.engine.apply_sample_results([result], now) {
                        self.disconnect(&peer, bye::BANNED, "banned");
                    }
                }
                _ = heartbeat.tick() => self.on_heartbeat(),
            }
            self.drain_sync_events();
        }

        for conn in self.peers.values() {
            conn.handle.close(bye::SHUTDOWN, "shutting down");
        }
        info!(peers = self.peers.len(), "p2p service stopped");
    }

    // -----------------------------------------------------------------------
    // Connection events
    // -----------------------------------------------------------------------

    fn on_net_event(&mut self, event: NetEvent) {
        let now = Instant::now();
        match event {
            NetEvent::Ready {
                peer,
                addr,
                outbound,
                identify,
                handle,
            } => {
                if outbound {
                    if let Some(addr) = addr {
                        self.dialing.remove(&addr);
                    }
                }
                if self.engine.scores().is_dial_blocked(&peer, now) {
                    handle.close(bye::BANNED, "banned");
                    return;
                }
                if self.peers.contains_key(&peer) {
                    handle.close(bye::NORMAL, "duplicate connection");
                    return;
                }
                if self.peers.len() >= self.ctx.config.peer.max_peers {
                    handle.close(bye::TOO_MANY_PEERS, "too many peers");
                    return;
                }

                if let Some(listen) = identify.listen_addr.as_deref() {
                    match parse_addr(listen) {
                        Ok(a) => {
                            self.book.add_candidate(a, AddrSource::Learned, None, now);
                        }
                        Err(e) => {
                            trace!(peer = %peer.short(), error = %e, "unusable listen address")
                        }
                    }
                }
                if let (true, Some(addr)) = (outbound, addr) {
                    self.book.report_outcome(&addr, DialOutcome::Success, Some(peer), now);
                    self.book.set_connected(&addr, true);
                }

                self.engine.add_peer(peer, outbound);
                self.engine.on_peer_subscribe(
                    peer,
                    &TopicList {
                        topics: identify.topics.clone(),
                    },
                );
                let ours: Vec<String> = self
                    .engine
                    .subscriptions()
                    .into_iter()
                    .map(|t| t.as_str().to_string())
                    .collect();
                if !ours.is_empty() {
                    handle.send(Message::Subscribe(TopicList { topics: ours }));
                }
                self.peers.insert(peer, Connected { handle, addr, outbound });
                self.update_peer_gauge();
                info!(peer = %peer.short(), outbound, peers = self.peers.len(), "peer connected");

                let actions = self
                    .sync
                    .on_peer_ready(peer, identify.head_height, identify.head_hash, now);
                self.apply(actions, now);
            }
            NetEvent::Message { peer, message } => self.on_message(peer, message, now),
            NetEvent::Oversize { peer, msg_id } => {
                debug!(peer = %peer.short(), msg_id, "oversize frame");
                if self.engine.record_oversize(peer, now) == Standing::Banned {
                    self.disconnect(&peer, bye::BANNED, "banned");
                }
            }
            NetEvent::Invalid { peer, outcome } => {
                if let Some(m) = &self.metrics {
                    m.record_drop(Some(&peer), outcome, "frame");
                }
                if self.engine.record_event(peer, ScoreEvent::Invalid, now) == Standing::Banned {
                    self.disconnect(&peer, bye::BANNED, "banned");
                }
            }
            NetEvent::Failed { addr, error } => {
                if let Some(addr) = addr {
                    self.dialing.remove(&addr);
                    let outcome = if error.is_misbehavior() {
                        DialOutcome::Misbehavior
                    } else {
                        DialOutcome::Failure
                    };
                    self.book.report_outcome(&addr, outcome, None, now);
                }
            }
            NetEvent::Closed { peer, addr, error } => {
                // A rejected duplicate closes while the original lives on.
                match self.peers.get(&peer) {
                    Some(conn) if conn.handle.is_closed() => {}
                    _ => return,
                }
                let Some(conn) = self.peers.remove(&peer) else { return };
                self.engine.remove_peer(&peer);
                self.sync.on_peer_closed(&peer);
                self.penalties.forget(&peer);
                self.update_peer_gauge();
                if let (true, Some(addr)) = (conn.outbound, addr) {
                    self.book.set_connected(&addr, false);
                    match &error {
                        Some(e) if e.is_misbehavior() => {
                            let outcome = DialOutcome::Misbehavior;
                            self.book.report_outcome(&addr, outcome, Some(peer), now)
                        }
                        Some(e) if e.severity().is_fatal() => {
                            self.book.report_outcome(&addr, DialOutcome::Failure, Some(peer), now)
                        }
                        _ => {}
                    }
                }
                info!(peer = %peer.short(), peers = self.peers.len(), "peer disconnected");
            }
        }
    }

    fn on_message(&mut self, peer: PeerId, message: Message, now: Instant) {
        match message {
            Message::Gossip(env) => match self.engine.handle_gossip(peer, &env, now) {
                GossipVerdict::Accepted {
                    topic,
                    id,
                    object,
                    forward,
                } => {
                    for target in &forward {
                        self.send_to(target, Message::Gossip(env.clone()));
                    }
                    match object {
                        GossipObject::Header(header) => {
                            let result = self.sync.on_gossip_header(peer, header, now);
                            self.apply_result(peer, result, now);
                        }
                        GossipObject::Tx(_) => {
                            self.served.insert(InvKind::Tx, id, env.data);
                            self.sync.note_gossiped(InvKind::Tx, id, peer, now);
                        }
                        GossipObject::Share(_) => {
                            self.served.insert(InvKind::Share, id, env.data);
                            self.sync.note_gossiped(InvKind::Share, id, peer, now);
                        }
                        GossipObject::Blob(_) => {
                            trace!(
                                peer = %peer.short(),
                                topic = %topic,
                                id = %id.short(),
                                "blob announced"
                            );
                        }
                    }
                }
                GossipVerdict::Dropped { disconnect, .. } => {
                    if disconnect {
                        self.disconnect(&peer, bye::BANNED, "banned");
                    }
                }
            },
            Message::Subscribe(list) => self.engine.on_peer_subscribe(peer, &list),
            Message::Unsubscribe(list) => self.engine.on_peer_unsubscribe(&peer, &list),
            Message::Graft(graft) => {
                if let Some(prune) = self.engine.on_graft(peer, &graft.topic, now) {
                    self.send_to(&peer, prune.to_message());
                }
            }
            Message::Prune(prune) => self.engine.on_prune(peer, &prune, now),

            Message::Inv(inv) => {
                let result = self.sync.on_inv(peer, &inv, now);
                self.apply_result(peer, result, now);
            }
            Message::GetData(inv) => self.serve_data(peer, &inv),
            Message::Data(data) => {
                for item in &data.items {
                    if matches!(item.kind, InvKind::Tx | InvKind::Share) {
                        self.served.insert(item.kind, item.id, item.body.clone());
                    }
                }
                let actions = self.sync.on_data(peer, data, now);
                self.apply(actions, now);
            }
            Message::NotFound(inv) => {
                let actions = self.sync.on_not_found(peer, &inv, now);
                self.apply(actions, now);
            }
            Message::GetHeaders(req) => {
                let actions = self.sync.on_get_headers(peer, &req);
                self.apply(actions, now);
            }
            Message::Headers(headers) => {
                let result = self.sync.on_headers(peer, headers, now);
                self.apply_result(peer, result, now);
            }
            Message::GetBlocks(req) => {
                let actions = self.sync.on_get_blocks(peer, &req);
                self.apply(actions, now);
            }
            Message::Blocks(blocks) => {
                let actions = self.sync.on_blocks(peer, blocks, now);
                self.apply(actions, now);
            }
            Message::NewBlock(nb) => {
                let result = self.sync.on_gossip_header(peer, nb.header, now);
                self.apply_result(peer, result, now);
            }
            Message::NewHead(head) => {
                let result = self.sync.on_new_head(peer, &head, now);
                self.apply_result(peer, result, now);
            }
            Message::Unknown { msg_id } => {
                trace!(peer = %peer.short(), msg_id, "unknown message ignored");
            }
            other => {
                trace!(peer = %peer.short(), message = other.name(), "unexpected message ignored");
            }
        }
    }

    fn serve_data(&mut self, peer: PeerId, inv: &InvList) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for item in &inv.items {
            match self.served.get(item) {
                Some(body) => found.push(DataItem {
                    kind: item.kind,
                    id: item.id,
                    body: body.to_vec(),
                }),
                None => missing.push(item.clone()),
            }
        }
        if !found.is_empty() {
            self.send_to(&peer, Message::Data(Data { items: found }));
        }
        if !missing.is_empty() {
            self.send_to(&peer, Message::NotFound(InvList { items: missing }));
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Send { peer, message, reply } => {
                let result = match self.peers.get(&peer) {
                    Some(conn) if conn.handle.send(message) => Ok(()),
                    Some(_) => Err(NetError::Closed),
                    None => Err(NetError::NotConnected(peer)),
                };
                let _ = reply.send(result);
            }
            Command::Publish { topic, data, reply } => {
                let result = match self.engine.publish(topic, data, now) {
                    Ok(published) => {
                        if let Some(kind) = inv_kind(topic) {
                            self.served.insert(kind, published.id, published.envelope.data.clone());
                        }
                        for target in &published.targets {
                            self.send_to(target, Message::Gossip(published.envelope.clone()));
                        }
                        Ok(published.id)
                    }
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Command::Subscribe(topic) => {
                for command in self.engine.subscribe(topic, now) {
                    self.send_to(&command.peer(), command.to_message());
                }
                self.broadcast(Message::Subscribe(TopicList {
                    topics: vec![topic.as_str().to_string()],
                }));
            }
            Command::Unsubscribe(topic) => {
                for command in self.engine.unsubscribe(topic, now) {
                    self.send_to(&command.peer(), command.to_message());
                }
                self.broadcast(Message::Unsubscribe(TopicList {
                    topics: vec![topic.as_str().to_string()],
                }));
            }
            Command::Disconnect(peer) => {
                self.disconnect(&peer, bye::NORMAL, "disconnect requested")
            }
            Command::ExitSafeMode { reply } => {
                let result = self.sync.exit_safe_mode(now).map_err(NetError::from);
                let result = result.map(|actions| self.apply(actions, now));
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> ServiceStatus {
        let head = self.ctx.chain.head();
        ServiceStatus {
            peer_id: self.local.to_hex(),
            head_height: head.height,
            head_hash: head.hash.to_hex(),
            peers: self.peers.len(),
            ready_peers: self.sync.ready_peers(),
            in_safe_mode: self.sync.in_safe_mode(),
            orphans: self.sync.orphan_count(),
            fetches: self.sync.fetches_tracked(),
            backpressure: self.sync.backpressure(),
            subscriptions: self
                .engine
                .subscriptions()
                .into_iter()
                .map(|t| t.as_str().to_string())
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Periodic work
    // -----------------------------------------------------------------------

    fn on_heartbeat(&mut self) {
        let now = Instant::now();
        let out = self.engine.heartbeat(now);
        for command in out.control {
            self.send_to(&command.peer(), command.to_message());
        }
        for peer in out.disconnect {
            self.disconnect(&peer, bye::BANNED, "banned");
        }
        let actions = self.sync.tick(now);
        self.apply(actions, now);
        self.dial_more(now);
    }

    fn dial_more(&mut self, now: Instant) {
        let cfg = &self.ctx.config.peer;
        let outbound = self.peers.values().filter(|c| c.outbound).count() + self.dialing.len();
        let room = cfg.max_peers.saturating_sub(self.peers.len() + self.dialing.len());
        let want = cfg.target_outbound.saturating_sub(outbound).min(room);
        if want == 0 {
            return;
        }
        let exclude: HashSet<SocketAddr> = self
            .peers
            .values()
            .filter_map(|c| c.addr)
            .chain(self.dialing.iter().copied())
            .collect();
        let scores = self.engine.scores();
        let blocked = |p: &PeerId| {
            scores.is_dial_blocked(p, now) || self.peers.contains_key(p) || *p == self.local
        };
        let candidates = self.book.dial_candidates(now, want, &exclude, &blocked);
        for addr in candidates {
            debug!(%addr, "dialing");
            self.dialing.insert(addr);
            tokio::spawn(dial(self.ctx.clone(), addr));
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    fn apply_result(
        &mut self,
        peer: PeerId,
        result: Result<Vec<SyncAction>, crate::sync::SyncError>,
        now: Instant,
    ) {
        match result {
            Ok(actions) => self.apply(actions, now),
            Err(error) => self.apply(vec![SyncAction::Penalize { peer, error }], now),
        }
    }

    fn apply(&mut self, actions: Vec<SyncAction>, now: Instant) {
        for action in actions {
            match action {
                SyncAction::Send { peer, message } => self.send_to(&peer, message),
                SyncAction::Fetch(request) => {
                    if let Some(message) = request.to_message() {
                        self.send_to(&request.peer, message);
                    }
                }
                SyncAction::Penalize { peer, error } => {
                    let severity = error.severity();
                    if let Some(m) = &self.metrics {
                        m.record_drop(Some(&peer), severity.as_str(), "sync");
                    }
                    let sanction = self.penalties.judge(peer, severity, now);
                    debug!(peer = %peer.short(), %severity, ?sanction, %error, "sync rejected input");
                    match sanction {
                        Sanction::None => {}
                        Sanction::Charge(event) => {
                            if self.engine.record_event(peer, event, now) == Standing::Banned {
                                self.disconnect(&peer, bye::BANNED, "banned");
                            }
                        }
                        Sanction::Disconnect => {
                            self.engine.record_event(peer, ScoreEvent::Invalid, now);
                            self.disconnect(&peer, bye::PROTOCOL_VIOLATION, "protocol violation");
                        }
                    }
                }
                SyncAction::Credit { peer } => {
                    self.engine.record_event(peer, ScoreEvent::Response, now);
                }
                SyncAction::Invalidate { topic, ids } => {
                    self.engine.invalidate(topic, &ids);
                }
            }
        }
    }

    fn drain_sync_events(&mut self) {
        let events = self.sync.take_events();
        if events.is_empty() {
            return;
        }
        for event in events {
            if let SyncEvent::SafeModeEntered(mode) = &event {
                warn!(candidate = %mode.candidate.short(), "safe mode entered, body import paused");
            }
            // No subscribers is fine.
            let _ = self.sync_events.send(event);
        }
        let head = self.ctx.chain.head();
        if head.hash != self.last_head {
            self.last_head = head.hash;
            self.broadcast(Message::NewHead(NewHead {
                hash: head.hash,
                height: head.height,
                total_weight: head.total_weight,
            }));
        }
    }

    fn send_to(&self, peer: &PeerId, message: Message) {
        match self.peers.get(peer) {
            Some(conn) => {
                if !conn.handle.send(message) {
                    debug!(peer = %peer.short(), "outbound queue full, message dropped");
                }
            }
            None => trace!(peer = %peer.short(), message = message.name(), "send to unknown peer"),
        }
    }

    fn broadcast(&self, message: Message) {
        for conn in self.peers.values() {
            conn.handle.send(message.clone());
        }
    }

    fn disconnect(&self, peer: &PeerId, code: u16, reason: &str) {
        if let Some(conn) = self.peers.get(peer) {
            info!(peer = %peer.short(), code, reason, "disconnecting peer");
            conn.handle.close(code, reason);
        }
    }

    fn update_peer_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.connected_peers.set(self.peers.len() as i64);
        }
    }
}

fn inv_kind(topic: Topic) -> Option<InvKind> {
    match topic {
        Topic::Tx => Some(InvKind::Tx),
        Topic::Shares => Some(InvKind::Share),
        Topic::Headers | Topic::Blobs => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHAIN_ID_DEVNET;
    use crate::net::Outbound;
    use crate::sync::chain_view::FixedConsensus;
    use crate::sync::{ConnState, SyncError};
    use crate::wire::objects::BlockBody;
    use std::time::Duration;

    fn genesis() -> BlockHeader {
        BlockHeader {
            chain_id: CHAIN_ID_DEVNET,
            height: 0,
            parent: Hash32::ZERO,
            timestamp: 1_000,
            threshold: 1_000_000,
            weight: 1,
            policy_root: vec![0; 32],
            body_root: BlockBody {
                header_hash: Hash32::ZERO,
                txs: vec![],
                proofs: vec![],
            }
            .root(),
            nonce: 0,
        }
    }

    fn service(seed: u8, topics: Vec<Topic>) -> ServiceHandle {
        let (service, handle) = P2pService::new(
            P2pConfig::default(),
            Arc::new(IdentityKeypair::ed25519_from_seed(&[seed; 32])),
            genesis(),
            Arc::new(FixedConsensus::new(1_000_000, Hash32::ZERO)),
            ServiceOptions {
                topics,
                ..ServiceOptions::default()
            },
        );
        tokio::spawn(service.run());
        handle
    }

    async fn wait_for_peers(handle: &ServiceHandle, n: usize) {
        for _ in 0..200 {
            if handle.status().await.unwrap().peers == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {n} peers");
    }

    fn bare_service() -> P2pService {
        P2pService::new(
            P2pConfig::default(),
            Arc::new(IdentityKeypair::ed25519_from_seed(&[7; 32])),
            genesis(),
            Arc::new(FixedConsensus::new(1_000_000, Hash32::ZERO)),
            ServiceOptions::default(),
        )
        .0
    }

    /// Register a fake connection; its outbound queue is returned.
    fn plug(service: &mut P2pService, n: u8) -> (PeerId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let peer = PeerId([n; 32]);
        let handle = PeerHandle::new(tx, CancellationToken::new());
        service.peers.insert(
            peer,
            Connected {
                handle,
                addr: None,
                outbound: false,
            },
        );
        (peer, rx)
    }

    fn penalize(service: &mut P2pService, peer: PeerId, error: SyncError, now: Instant) {
        service.apply(vec![SyncAction::Penalize { peer, error }], now);
    }

    #[tokio::test]
    async fn soft_sync_fault_costs_a_little() {
        let now = Instant::now();
        let mut svc = bare_service();
        let (peer, mut rx) = plug(&mut svc, 1);
        penalize(&mut svc, peer, SyncError::Unsolicited(Hash32([1; 32])), now);
        let score = svc.engine.scores().score(&peer);
        assert!(score < 0.0 && score > -2.0, "score {score}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn structural_sync_fault_counts_only_when_repeated() {
        let now = Instant::now();
        let mut svc = bare_service();
        let (peer, mut rx) = plug(&mut svc, 1);
        let mismatch = || SyncError::BodyRootMismatch(Hash32([1; 32]));
        penalize(&mut svc, peer, mismatch(), now);
        penalize(&mut svc, peer, mismatch(), now);
        assert_eq!(svc.engine.scores().score(&peer), 0.0);
        penalize(&mut svc, peer, mismatch(), now);
        assert!(svc.engine.scores().score(&peer) <= -10.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn uncorroborated_header_is_charged_as_invalid() {
        let now = Instant::now();
        let mut svc = bare_service();
        let (peer, mut rx) = plug(&mut svc, 1);
        let error = SyncError::Uncorroborated {
            hash: Hash32([1; 32]),
            announcers: 1,
            needed: 2,
        };
        penalize(&mut svc, peer, error, now);
        assert!(svc.engine.scores().score(&peer) <= -10.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fatal_sync_fault_disconnects() {
        let now = Instant::now();
        let mut svc = bare_service();
        let (peer, mut rx) = plug(&mut svc, 1);
        let error = SyncError::IllegalTransition {
            from: ConnState::Closed,
            to: ConnState::Ready,
        };
        penalize(&mut svc, peer, error, now);
        match rx.try_recv() {
            Ok(Outbound::Close(bye)) => assert_eq!(bye.code, bye::PROTOCOL_VIOLATION),
            other => panic!("expected bye, got {other:?}"),
        }
        assert!(svc.engine.scores().score(&peer) < 0.0);
    }

    #[test]
    fn served_objects_evict_least_recently_served() {
        let mut served = ServedObjects::new(2);
        let item = |i: u8| InvItem {
            kind: InvKind::Tx,
            id: Hash32([i; 32]),
        };
        served.insert(InvKind::Tx, Hash32([0; 32]), vec![0]);
        served.insert(InvKind::Tx, Hash32([1; 32]), vec![1]);
        // Serving 0 makes 1 the eviction candidate.
        assert!(served.get(&item(0)).is_some());
        served.insert(InvKind::Tx, Hash32([2; 32]), vec![2]);
        assert!(served.get(&item(1)).is_none());
        assert_eq!(served.get(&item(0)), Some(&[0u8][..]));
        assert_eq!(served.get(&item(2)), Some(&[2u8][..]));
        // Kind must match too.
        let share = InvItem {
            kind: InvKind::Share,
            id: Hash32([2; 32]),
        };
        assert!(served.get(&share).is_none());
    }

    #[tokio::test]
    async fn two_services_connect_and_report_status() {
        let a = service(1, vec![]);
        let b = service(2, vec![Topic::Headers]);
        let (io_a, io_b) = tokio::io::duplex(256 * 1024);
        a.attach(io_a, None, true);
        b.attach(io_b, None, false);
        wait_for_peers(&a, 1).await;
        wait_for_peers(&b, 1).await;

        let status = b.status().await.unwrap();
        assert_eq!(status.head_height, 0);
        assert_eq!(status.subscriptions, vec!["headers".to_string()]);
        assert!(!status.in_safe_mode);

        // Not in safe mode, so there is nothing to exit.
        assert!(b.exit_safe_mode().await.is_err());

        b.disconnect(a.local_peer_id()).await.unwrap();
        wait_for_peers(&a, 0).await;
        wait_for_peers(&b, 0).await;
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let a = service(3, vec![]);
        let err = a.send(PeerId([9; 32]), Message::Pause).await.unwrap_err();
        assert!(matches!(err, NetError::NotConnected(_)));
        a.shutdown();
    }
}
