//! One live connection: handshake, identify, then a reader and a writer.
//!
//! The reader runs in the connection's own task and owns the receive credit
//! window. The writer is spawned and owns the sink, the send credit window
//! and the ping timer. They share the session under a short mutex; neither
//! holds it across an await.
//!
//! Credit grants do not go through the outbound queue: the reader parks
//! them in [`Shared::pending_grant`] and pokes the writer, which sends them
//! even while it is itself waiting for credit. Two peers blocked on each
//! other's grants therefore still make progress.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::handshake::{initiate, respond};
use super::{NetError, NetEvent, Outbound, PeerHandle};
use crate::config::{P2pConfig, AEAD_TAG_LENGTH, FRAME_HEADER_LENGTH};
use crate::crypto::IdentityKeypair;
use crate::flow::{RecvWindow, SendWindow};
use crate::handshake::{HandshakeConfig, LocalHead};
use crate::metrics::P2pMetrics;
use crate::peer::PingTracker;
use crate::session::{Session, SessionError};
use crate::sync::{ChainView, ConnState};
use crate::types::PeerId;
use crate::wire::codec::{FrameCodec, Inbound};
use crate::wire::frame::{max_payload_len, Frame};
use crate::wire::messages::{bye, Ack, Credits, Identify, Ping, Pong};
use crate::wire::{Message, WireError};

const OUTBOUND_QUEUE: usize = 1024;

/// Everything a connection task needs from the service.
#[derive(Clone)]
pub struct ConnContext {
    pub config: Arc<P2pConfig>,
    pub identity: Arc<IdentityKeypair>,
    pub chain: Arc<dyn ChainView>,
    pub events: mpsc::Sender<NetEvent>,
    pub metrics: Option<Arc<P2pMetrics>>,
    pub shutdown: CancellationToken,
    /// Topics advertised in our identify.
    pub topics: Vec<String>,
    pub listen_addr: Option<String>,
}

impl ConnContext {
    fn local_head(&self) -> LocalHead {
        let head = self.chain.head();
        LocalHead {
            height: head.height,
            hash: head.hash,
        }
    }

    fn local_identify(&self) -> Identify {
        let head = self.chain.head();
        let hs = &self.config.handshake;
        Identify {
            version: hs.version,
            agent: hs.agent.clone(),
            chain_id: hs.chain_id,
            head_height: head.height,
            head_hash: head.hash,
            topics: self.topics.clone(),
            listen_addr: self.listen_addr.clone(),
            features: hs.features,
        }
    }
}

struct Shared {
    session: Mutex<Session>,
    send_window: SendWindow,
    ping: Mutex<PingTracker>,
    pending_grant: Mutex<Option<(Credits, Ack)>>,
    grant_ready: Notify,
}

/// Run a connection to completion. Every outcome is reported to the
/// service as a [`NetEvent`].
pub async fn run<T>(io: T, addr: Option<SocketAddr>, outbound: bool, ctx: ConnContext)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(io, FrameCodec::new());
    let started = Instant::now();
    let head = ctx.local_head();
    let result = if outbound {
        initiate(&mut framed, &ctx.config.handshake, ctx.identity.clone(), head).await
    } else {
        respond(&mut framed, &ctx.config.handshake, ctx.identity.clone(), head).await
    };
    let outcome = match result {
        Ok(outcome) => {
            if let Some(m) = &ctx.metrics {
                m.record_handshake("ok", started.elapsed().as_secs_f64());
            }
            outcome
        }
        Err(e) => {
            if let Some(m) = &ctx.metrics {
                m.record_handshake(e.reason(), started.elapsed().as_secs_f64());
            }
            warn!(addr = ?addr, outbound, error = %e, "handshake failed");
            let _ = ctx.events.send(NetEvent::Failed { addr, error: e.into() }).await;
            return;
        }
    };

    let peer = outcome.peer_id;
    let mut session = match Session::new(&outcome, ctx.config.session.clone()) {
        Ok(session) => session,
        Err(e) => {
            let _ = ctx.events.send(NetEvent::Failed { addr, error: e.into() }).await;
            return;
        }
    };

    let identify = match exchange_identify(
        &mut framed,
        &mut session,
        ctx.local_identify(),
        &ctx.config.handshake,
        ctx.config.peer.identify_timeout(),
    )
    .await
    {
        Ok(identify) => identify,
        Err(e) => {
            warn!(peer = %peer.short(), error = %e, "identify failed");
            let _ = ctx.events.send(NetEvent::Failed { addr, error: e }).await;
            return;
        }
    };
    info!(
        peer = %peer.short(),
        agent = %identify.agent,
        head = identify.head_height,
        outbound,
        "peer ready"
    );

    let error = serve(framed, session, peer, addr, outbound, identify, &ctx).await.err();
    match &error {
        Some(e) if e.severity().is_fatal() => {
            warn!(peer = %peer.short(), error = %e, "connection failed")
        }
        Some(e) => debug!(peer = %peer.short(), error = %e, "connection closed"),
        None => debug!(peer = %peer.short(), "connection closed"),
    }
    let _ = ctx.events.send(NetEvent::Closed { peer, addr, error }).await;
}

/// Swap `identify` messages over a fresh session and check the peer's.
/// Moves the session from `Authenticated` to `Ready`.
pub async fn exchange_identify<T>(
    framed: &mut Framed<T, FrameCodec>,
    session: &mut Session,
    local: Identify,
    cfg: &HandshakeConfig,
    timeout: std::time::Duration,
) -> Result<Identify, NetError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    session.set_state(session.state().advance(ConnState::Identifying)?);
    let frame = session.seal(&Message::Identify(local))?;
    framed.send(frame).await?;

    let item = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| NetError::IdentifyTimeout)?;
    let frame = match item {
        None => return Err(NetError::Closed),
        Some(Err(e)) => return Err(e.into()),
        Some(Ok(Inbound::Oversize(header))) => {
            return Err(WireError::Oversize {
                msg_id: header.msg_id,
                len: header.payload_len as usize,
                max: max_payload_len(header.msg_id),
            }
            .into())
        }
        Some(Ok(Inbound::Frame(frame))) => frame,
    };
    let remote = match session.open(&frame)? {
        Message::Identify(identify) => identify,
        other => return Err(NetError::ExpectedIdentify(other.name())),
    };
    if remote.chain_id != cfg.chain_id {
        return Err(NetError::IdentifyMismatch(format!(
            "chain {:#x}, expected {:#x}",
            remote.chain_id, cfg.chain_id
        )));
    }
    if remote.version != cfg.version {
        return Err(NetError::IdentifyMismatch(format!(
            "version {}, expected {}",
            remote.version, cfg.version
        )));
    }
    session.set_state(session.state().advance(ConnState::Ready)?);
    Ok(remote)
}

async fn serve<T>(
    framed: Framed<T, FrameCodec>,
    session: Session,
    peer: PeerId,
    addr: Option<SocketAddr>,
    outbound: bool,
    identify: Identify,
    ctx: &ConnContext,
) -> Result<(), NetError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = framed.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let cancel = ctx.shutdown.child_token();
    let shared = Arc::new(Shared {
        session: Mutex::new(session),
        send_window: SendWindow::new(&ctx.config.flow),
        ping: Mutex::new(PingTracker::new()),
        pending_grant: Mutex::new(None),
        grant_ready: Notify::new(),
    });

    ctx.events
        .send(NetEvent::Ready {
            peer,
            addr,
            outbound,
            identify,
            handle: PeerHandle::new(tx.clone(), cancel.clone()),
        })
        .await
        .map_err(|_| NetError::ServiceStopped)?;

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        shared.clone(),
        ctx.config.clone(),
        cancel.clone(),
        ctx.metrics.clone(),
    ));
    let read_result = read_loop(stream, peer, tx, &shared, ctx, &cancel).await;
    cancel.cancel();
    let write_result = writer.await.unwrap_or(Err(NetError::Closed));

    {
        let mut session = shared.session.lock();
        let state = session.state();
        if let Ok(closed) = state.advance(ConnState::Closed) {
            session.set_state(closed);
        }
    }
    read_result.and(write_result)
}

fn session_outcome(e: &SessionError) -> &'static str {
    match e {
        SessionError::DecryptFailed { .. } => "decrypt",
        SessionError::Replay { .. } => "replay",
        SessionError::DigestMismatch => "digest",
        SessionError::Wire(_) => "malformed",
        _ => "session",
    }
}

async fn read_loop<S>(
    mut stream: S,
    peer: PeerId,
    out: mpsc::Sender<Outbound>,
    shared: &Shared,
    ctx: &ConnContext,
    cancel: &CancellationToken,
) -> Result<(), NetError>
where
    S: Stream<Item = Result<Inbound, WireError>> + Unpin,
{
    let flow = &ctx.config.flow;
    let mut window = RecvWindow::new(flow);
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = stream.next() => item,
        };
        let frame = match item {
            None => return Err(NetError::Closed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Inbound::Oversize(header))) => {
                debug!(
                    peer = %peer.short(),
                    msg_id = header.msg_id,
                    len = header.payload_len,
                    "oversize frame dropped"
                );
                ctx.events
                    .send(NetEvent::Oversize {
                        peer,
                        msg_id: header.msg_id,
                    })
                    .await
                    .map_err(|_| NetError::ServiceStopped)?;
                continue;
            }
            Some(Ok(Inbound::Frame(frame))) => frame,
        };
        if let Some(m) = &ctx.metrics {
            m.frames_in.inc();
            m.bytes_in.inc_by((FRAME_HEADER_LENGTH + frame.payload.len()) as u64);
        }

        let opened = shared.session.lock().open(&frame);
        let message = match opened {
            Ok(message) => message,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "frame rejected");
                ctx.events
                    .send(NetEvent::Invalid {
                        peer,
                        outcome: session_outcome(&e),
                    })
                    .await
                    .map_err(|_| NetError::ServiceStopped)?;
                continue;
            }
        };

        if !message.is_control() {
            let charge = flow.charge(frame.header.payload_len as u64);
            if let Some(grant) = window.on_frame(charge, frame.header.seq)? {
                let ack = window.ack();
                {
                    let mut pending = shared.pending_grant.lock();
                    let merged = match pending.take() {
                        Some((prev, _)) => Credits {
                            bytes: prev.bytes + grant.bytes,
                            msgs: prev.msgs + grant.msgs,
                        },
                        None => grant,
                    };
                    *pending = Some((merged, ack));
                }
                shared.grant_ready.notify_one();
            }
        }

        match message {
            Message::Ping(ping) => {
                if out
                    .try_send(Outbound::Message(Message::Pong(Pong { nonce: ping.nonce })))
                    .is_err()
                {
                    trace!(peer = %peer.short(), "pong dropped, queue full");
                }
            }
            Message::Pong(pong) => {
                if let Some(rtt) = shared.ping.lock().on_pong(pong.nonce, Instant::now()) {
                    trace!(peer = %peer.short(), rtt_ms = rtt.as_millis() as u64, "pong");
                }
            }
            Message::Credits(credits) => shared.send_window.on_credits(&credits)?,
            Message::Pause => shared.send_window.pause(),
            Message::Resume => shared.send_window.resume(),
            Message::Ack(ack) => trace!(peer = %peer.short(), seq = ack.seq, "ack"),
            Message::Bye(b) => {
                return match b.code {
                    bye::NORMAL | bye::SHUTDOWN => Ok(()),
                    code => Err(NetError::Bye {
                        code,
                        reason: b.reason,
                    }),
                }
            }
            Message::Identify(_) => trace!(peer = %peer.short(), "repeated identify ignored"),
            message => ctx
                .events
                .send(NetEvent::Message { peer, message })
                .await
                .map_err(|_| NetError::ServiceStopped)?,
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    config: Arc<P2pConfig>,
    cancel: CancellationToken,
    metrics: Option<Arc<P2pMetrics>>,
) -> Result<(), NetError>
where
    S: Sink<Frame, Error = WireError> + Unpin,
{
    let result =
        write_until_done(&mut sink, &mut rx, &shared, &config, &cancel, metrics.as_deref()).await;
    cancel.cancel();
    let _ = sink.close().await;
    result
}

async fn write_until_done<S>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<Outbound>,
    shared: &Shared,
    config: &P2pConfig,
    cancel: &CancellationToken,
    metrics: Option<&P2pMetrics>,
) -> Result<(), NetError>
where
    S: Sink<Frame, Error = WireError> + Unpin,
{
    let peer_cfg = &config.peer;
    let mut ping = tokio::time::interval(peer_cfg.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires at once.
    ping.tick().await;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = shared.grant_ready.notified() => {
                flush_grant(sink, shared, metrics).await?;
                continue;
            }
            _ = ping.tick() => {
                let nonce = {
                    let mut tracker = shared.ping.lock();
                    let now = Instant::now();
                    tracker.expire(now, peer_cfg.ping_timeout());
                    if tracker.consecutive_lost() >= peer_cfg.max_missed_pings {
                        return Err(NetError::PingTimeout(tracker.consecutive_lost()));
                    }
                    tracker.start(now)
                };
                write_frame(sink, shared, &Message::Ping(Ping { nonce }), metrics).await?;
                continue;
            }
            item = rx.recv() => item,
        };
        match next {
            None => return Ok(()),
            Some(Outbound::Close(b)) => {
                write_frame(sink, shared, &Message::Bye(b), metrics).await?;
                return Ok(());
            }
            Some(Outbound::Message(message)) if message.is_control() => {
                write_frame(sink, shared, &message, metrics).await?;
            }
            Some(Outbound::Message(message)) => {
                let len = (message.encode_payload()?.len() + AEAD_TAG_LENGTH) as u64;
                let charge = config.flow.charge(len);
                acquire_credit(sink, shared, charge, config, cancel, metrics).await?;
                write_frame(sink, shared, &message, metrics).await?;
            }
        }
    }
}

/// Wait for send credit, still flushing our own grants meanwhile.
async fn acquire_credit<S>(
    sink: &mut S,
    shared: &Shared,
    charge: u64,
    config: &P2pConfig,
    cancel: &CancellationToken,
    metrics: Option<&P2pMetrics>,
) -> Result<(), NetError>
where
    S: Sink<Frame, Error = WireError> + Unpin,
{
    let deadline = tokio::time::Instant::now() + config.flow.stall_timeout();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetError::Closed),
            _ = tokio::time::sleep_until(deadline) => return Err(NetError::FlowStall),
            _ = shared.grant_ready.notified() => flush_grant(sink, shared, metrics).await?,
            consumed = shared.send_window.consume(charge) => return Ok(consumed?),
        }
    }
}

async fn flush_grant<S>(
    sink: &mut S,
    shared: &Shared,
    metrics: Option<&P2pMetrics>,
) -> Result<(), NetError>
where
    S: Sink<Frame, Error = WireError> + Unpin,
{
    let pending = shared.pending_grant.lock().take();
    if let Some((credits, ack)) = pending {
        write_frame(sink, shared, &Message::Credits(credits), metrics).await?;
        write_frame(sink, shared, &Message::Ack(ack), metrics).await?;
    }
    Ok(())
}

async fn write_frame<S>(
    sink: &mut S,
    shared: &Shared,
    message: &Message,
    metrics: Option<&P2pMetrics>,
) -> Result<(), NetError>
where
    S: Sink<Frame, Error = WireError> + Unpin,
{
    let (frame, rekeyed) = {
        let mut session = shared.session.lock();
        let generation = session.send_position().0;
        let frame = session.seal(message)?;
        (frame, session.send_position().0 != generation)
    };
    let len = (FRAME_HEADER_LENGTH + frame.payload.len()) as u64;
    sink.send(frame).await?;
    if let Some(m) = metrics {
        m.frames_out.inc();
        m.bytes_out.inc_by(len);
        if rekeyed {
            m.rekeys.inc();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeConfig;
    use crate::types::Hash32;

    fn identity(seed: u8) -> Arc<IdentityKeypair> {
        Arc::new(IdentityKeypair::ed25519_from_seed(&[seed; 32]))
    }

    fn identify(chain_id: u64) -> Identify {
        Identify {
            version: 1,
            agent: "test".into(),
            chain_id,
            head_height: 0,
            head_hash: Hash32::ZERO,
            topics: vec![],
            listen_addr: None,
            features: 0,
        }
    }

    async fn sessions() -> (
        (Framed<tokio::io::DuplexStream, FrameCodec>, Session),
        (Framed<tokio::io::DuplexStream, FrameCodec>, Session),
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cfg = HandshakeConfig::default();
        let mut fa = Framed::new(a, FrameCodec::new());
        let mut fb = Framed::new(b, FrameCodec::new());
        let (oi, or) = tokio::join!(
            initiate(&mut fa, &cfg, identity(1), LocalHead::default()),
            respond(&mut fb, &cfg, identity(2), LocalHead::default()),
        );
        let sa = Session::new(&oi.unwrap(), Default::default()).unwrap();
        let sb = Session::new(&or.unwrap(), Default::default()).unwrap();
        ((fa, sa), (fb, sb))
    }

    #[tokio::test]
    async fn identify_moves_both_sides_to_ready() {
        let ((mut fa, mut sa), (mut fb, mut sb)) = sessions().await;
        let cfg = HandshakeConfig::default();
        let timeout = std::time::Duration::from_secs(5);
        let (ra, rb) = tokio::join!(
            exchange_identify(&mut fa, &mut sa, identify(cfg.chain_id), &cfg, timeout),
            exchange_identify(&mut fb, &mut sb, identify(cfg.chain_id), &cfg, timeout),
        );
        assert_eq!(ra.unwrap().agent, "test");
        assert!(rb.is_ok());
        assert!(sa.state().is_ready());
        assert!(sb.state().is_ready());
    }

    #[tokio::test]
    async fn identify_chain_mismatch_is_fatal() {
        let ((mut fa, mut sa), (mut fb, mut sb)) = sessions().await;
        let cfg = HandshakeConfig::default();
        let timeout = std::time::Duration::from_secs(5);
        let (_, rb) = tokio::join!(
            exchange_identify(&mut fa, &mut sa, identify(cfg.chain_id ^ 1), &cfg, timeout),
            exchange_identify(&mut fb, &mut sb, identify(cfg.chain_id), &cfg, timeout),
        );
        let err = rb.unwrap_err();
        assert!(matches!(err, NetError::IdentifyMismatch(_)));
        assert!(err.severity().is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_identify_times_out() {
        let ((_fa, _sa), (mut fb, mut sb)) = sessions().await;
        let cfg = HandshakeConfig::default();
        let err = exchange_identify(
            &mut fb,
            &mut sb,
            identify(cfg.chain_id),
            &cfg,
            std::time::Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetError::IdentifyTimeout));
    }
}
