//! Drives the handshake state machine over a framed stream.
//!
//! Every read carries the step timeout; missing it is fatal. Handshake
//! frames are plaintext, and anything else arriving first aborts.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::crypto::IdentityKeypair;
use crate::handshake::{
    HandshakeConfig, HandshakeError, HandshakeOutcome, Initiator, LocalHead, Responder,
};
use crate::wire::codec::{FrameCodec, Inbound};
use crate::wire::frame::{max_payload_len, Frame};
use crate::wire::{Message, WireError};

async fn send<T>(framed: &mut Framed<T, FrameCodec>, message: Message) -> Result<(), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Frame::plaintext(&message)?).await?;
    Ok(())
}

async fn recv<T>(
    framed: &mut Framed<T, FrameCodec>,
    step: Duration,
    waiting_for: &'static str,
) -> Result<Message, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let item = tokio::time::timeout(step, framed.next())
        .await
        .map_err(|_| HandshakeError::Timeout(waiting_for))?;
    match item {
        None => Err(HandshakeError::Closed),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(Inbound::Oversize(header))) => Err(WireError::Oversize {
            msg_id: header.msg_id,
            len: header.payload_len as usize,
            max: max_payload_len(header.msg_id),
        }
        .into()),
        Some(Ok(Inbound::Frame(frame))) => Ok(frame.open_plaintext()?),
    }
}

fn unexpected(expected: &'static str, got: &Message) -> HandshakeError {
    HandshakeError::UnexpectedMessage {
        expected,
        got: got.name(),
    }
}

/// Run the initiator side: init, reply, finish, accept.
pub async fn initiate<T>(
    framed: &mut Framed<T, FrameCodec>,
    cfg: &HandshakeConfig,
    identity: Arc<IdentityKeypair>,
    head: LocalHead,
) -> Result<HandshakeOutcome, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let step = cfg.step_timeout();
    let (await_reply, init) = Initiator::start(cfg, identity, head)?;
    send(framed, Message::HandshakeInit(init)).await?;

    let reply = match recv(framed, step, "handshake reply").await? {
        Message::HandshakeReply(reply) => reply,
        other => return Err(unexpected("handshake reply", &other)),
    };
    let (await_accept, finish) = await_reply.on_reply(reply)?;
    send(framed, Message::HandshakeFinish(finish)).await?;

    let accept = match recv(framed, step, "handshake accept").await? {
        Message::HandshakeAccept(accept) => accept,
        other => return Err(unexpected("handshake accept", &other)),
    };
    let outcome = await_accept.on_accept(accept)?;
    debug!(
        peer = %outcome.peer_id.short(),
        aead = outcome.aead.name(),
        "outbound handshake complete"
    );
    Ok(outcome)
}

/// Run the responder side.
pub async fn respond<T>(
    framed: &mut Framed<T, FrameCodec>,
    cfg: &HandshakeConfig,
    identity: Arc<IdentityKeypair>,
    head: LocalHead,
) -> Result<HandshakeOutcome, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let step = cfg.step_timeout();
    let init = match recv(framed, step, "handshake init").await? {
        Message::HandshakeInit(init) => init,
        other => return Err(unexpected("handshake init", &other)),
    };
    let (await_finish, reply) = Responder::new(cfg, identity, head).on_init(init)?;
    send(framed, Message::HandshakeReply(reply)).await?;

    let finish = match recv(framed, step, "handshake finish").await? {
        Message::HandshakeFinish(finish) => finish,
        other => return Err(unexpected("handshake finish", &other)),
    };
    let (outcome, accept) = await_finish.on_finish(finish)?;
    send(framed, Message::HandshakeAccept(accept)).await?;
    debug!(
        peer = %outcome.peer_id.short(),
        aead = outcome.aead.name(),
        "inbound handshake complete"
    );
    Ok(outcome)
}
