//! # Message Catalog
//!
//! One closed enum, keyed by a 16-bit message id, with a single decode entry
//! point. Ids are grouped by purpose:
//!
//! | Range    | Group                                   |
//! |----------|-----------------------------------------|
//! | `0x000x` | handshake (plaintext frames)            |
//! | `0x001x` | session liveness: identify, ping, bye   |
//! | `0x002x` | inventory: inv, getdata, data, notfound |
//! | `0x003x` | header and block sync                   |
//! | `0x004x` | gossip and mesh control                 |
//! | `0x005x` | flow control                            |
//!
//! Ids we do not know decode to [`Message::Unknown`] so a newer peer is not
//! penalised for speaking a newer dialect. Unknown *fields* inside a known
//! payload are ignored by serde.

use serde::{Deserialize, Serialize};

use super::objects::{BlockBody, BlockHeader};
use super::{from_canonical_cbor, from_cbor, to_cbor, WireError};
use crate::types::{Hash32, PeerId};

/// Message ids.
pub mod ids {
    pub const HANDSHAKE_INIT: u16 = 0x0001;
    pub const HANDSHAKE_REPLY: u16 = 0x0002;
    pub const HANDSHAKE_FINISH: u16 = 0x0003;
    pub const HANDSHAKE_ACCEPT: u16 = 0x0004;

    pub const IDENTIFY: u16 = 0x0010;
    pub const PING: u16 = 0x0011;
    pub const PONG: u16 = 0x0012;
    pub const BYE: u16 = 0x0013;

    pub const INV: u16 = 0x0020;
    pub const GET_DATA: u16 = 0x0021;
    pub const DATA: u16 = 0x0022;
    pub const NOT_FOUND: u16 = 0x0023;

    pub const GET_HEADERS: u16 = 0x0030;
    pub const HEADERS: u16 = 0x0031;
    pub const GET_BLOCKS: u16 = 0x0032;
    pub const BLOCKS: u16 = 0x0033;
    pub const NEW_BLOCK: u16 = 0x0034;
    pub const NEW_HEAD: u16 = 0x0035;

    pub const SUBSCRIBE: u16 = 0x0040;
    pub const UNSUBSCRIBE: u16 = 0x0041;
    pub const GOSSIP: u16 = 0x0042;
    pub const GRAFT: u16 = 0x0043;
    pub const PRUNE: u16 = 0x0044;

    pub const CREDITS: u16 = 0x0050;
    pub const PAUSE: u16 = 0x0051;
    pub const RESUME: u16 = 0x0052;
    pub const ACK: u16 = 0x0053;

    /// True for ids that travel in plaintext frames.
    pub fn is_handshake(id: u16) -> bool {
        (HANDSHAKE_INIT..=HANDSHAKE_ACCEPT).contains(&id)
    }
}

/// `Bye` reason codes.
pub mod bye {
    pub const NORMAL: u16 = 0;
    pub const PROTOCOL_VIOLATION: u16 = 1;
    pub const BANNED: u16 = 2;
    pub const SHUTDOWN: u16 = 3;
    pub const TOO_MANY_PEERS: u16 = 4;
    pub const TIMEOUT: u16 = 5;
}

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// What each side declares about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u16,
    /// Declared identity digest. Checked against the `Auth` public key.
    pub peer_id: PeerId,
    pub chain_id: u64,
    /// Commitment to the accepted signature-algorithm policy.
    pub policy_root: Hash32,
    pub features: u64,
    pub agent: String,
    pub head_height: u64,
    pub head_hash: Hash32,
}

/// Identity proof over the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// Signature algorithm id. Kept as a raw byte so an unknown id surfaces
    /// as a policy failure rather than a decode failure.
    pub alg: u8,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Key-confirmation tag over the chaining key.
    pub confirm: Hash32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInit {
    pub version: u16,
    #[serde(with = "serde_bytes")]
    pub kem_public: Vec<u8>,
    /// AEAD ids in preference order.
    pub aead: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    #[serde(with = "serde_bytes")]
    pub kem_public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub kem_ciphertext: Vec<u8>,
    pub aead: u8,
    pub hello: Hello,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeFinish {
    #[serde(with = "serde_bytes")]
    pub kem_ciphertext: Vec<u8>,
    pub hello: Hello,
    pub auth: Auth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAccept {
    pub auth: Auth,
}

// ---------------------------------------------------------------------------
// Session liveness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub version: u16,
    pub agent: String,
    pub chain_id: u64,
    pub head_height: u64,
    pub head_hash: Hash32,
    pub topics: Vec<String>,
    pub listen_addr: Option<String>,
    pub features: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    pub code: u16,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum InvKind {
    Tx = 1,
    Block = 2,
    Share = 3,
    Blob = 4,
}

impl TryFrom<u8> for InvKind {
    type Error = WireError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            1 => Ok(Self::Tx),
            2 => Ok(Self::Block),
            3 => Ok(Self::Share),
            4 => Ok(Self::Blob),
            other => Err(WireError::UnknownInvKind(other)),
        }
    }
}

impl From<InvKind> for u8 {
    fn from(k: InvKind) -> u8 {
        k as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvItem {
    pub kind: InvKind,
    pub id: Hash32,
}

/// Payload of `inv`, `getdata` and `notfound`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvList {
    pub items: Vec<InvItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub kind: InvKind,
    pub id: Hash32,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Data {
    pub items: Vec<DataItem>,
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHeaders {
    /// Newest first, genesis last.
    pub locator: Vec<Hash32>,
    /// Stop after this hash. Zero means "as many as allowed".
    pub stop: Hash32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Headers {
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetBlocks {
    pub hashes: Vec<Hash32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Blocks {
    pub blocks: Vec<BlockBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlock {
    pub header: BlockHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewHead {
    pub hash: Hash32,
    pub height: u64,
    pub total_weight: u128,
}

// ---------------------------------------------------------------------------
// Gossip control
// ---------------------------------------------------------------------------

/// Payload of `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopicList {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub topic: String,
    pub schema: u16,
    /// `digest8` of `data`.
    pub checksum: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graft {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prune {
    pub topic: String,
    pub backoff_secs: u64,
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credits {
    pub bytes: u64,
    pub msgs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub seq: u32,
}

/// Payload of `pause` and `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeInit(HandshakeInit),
    HandshakeReply(HandshakeReply),
    HandshakeFinish(HandshakeFinish),
    HandshakeAccept(HandshakeAccept),

    Identify(Identify),
    Ping(Ping),
    Pong(Pong),
    Bye(Bye),

    Inv(InvList),
    GetData(InvList),
    Data(Data),
    NotFound(InvList),

    GetHeaders(GetHeaders),
    Headers(Headers),
    GetBlocks(GetBlocks),
    Blocks(Blocks),
    NewBlock(NewBlock),
    NewHead(NewHead),

    Subscribe(TopicList),
    Unsubscribe(TopicList),
    Gossip(GossipEnvelope),
    Graft(Graft),
    Prune(Prune),

    Credits(Credits),
    Pause,
    Resume,
    Ack(Ack),

    /// A message id this build does not know. Payload is discarded.
    Unknown { msg_id: u16 },
}

impl Message {
    pub fn msg_id(&self) -> u16 {
        match self {
            Self::HandshakeInit(_) => ids::HANDSHAKE_INIT,
            Self::HandshakeReply(_) => ids::HANDSHAKE_REPLY,
            Self::HandshakeFinish(_) => ids::HANDSHAKE_FINISH,
            Self::HandshakeAccept(_) => ids::HANDSHAKE_ACCEPT,
            Self::Identify(_) => ids::IDENTIFY,
            Self::Ping(_) => ids::PING,
            Self::Pong(_) => ids::PONG,
            Self::Bye(_) => ids::BYE,
            Self::Inv(_) => ids::INV,
            Self::GetData(_) => ids::GET_DATA,
            Self::Data(_) => ids::DATA,
            Self::NotFound(_) => ids::NOT_FOUND,
            Self::GetHeaders(_) => ids::GET_HEADERS,
            Self::Headers(_) => ids::HEADERS,
            Self::GetBlocks(_) => ids::GET_BLOCKS,
            Self::Blocks(_) => ids::BLOCKS,
            Self::NewBlock(_) => ids::NEW_BLOCK,
            Self::NewHead(_) => ids::NEW_HEAD,
            Self::Subscribe(_) => ids::SUBSCRIBE,
            Self::Unsubscribe(_) => ids::UNSUBSCRIBE,
            Self::Gossip(_) => ids::GOSSIP,
            Self::Graft(_) => ids::GRAFT,
            Self::Prune(_) => ids::PRUNE,
            Self::Credits(_) => ids::CREDITS,
            Self::Pause => ids::PAUSE,
            Self::Resume => ids::RESUME,
            Self::Ack(_) => ids::ACK,
            Self::Unknown { msg_id } => *msg_id,
        }
    }

    /// Short name for logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandshakeInit(_) => "hs_init",
            Self::HandshakeReply(_) => "hs_reply",
            Self::HandshakeFinish(_) => "hs_finish",
            Self::HandshakeAccept(_) => "hs_accept",
            Self::Identify(_) => "identify",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Bye(_) => "bye",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::Data(_) => "data",
            Self::NotFound(_) => "notfound",
            Self::GetHeaders(_) => "getheaders",
            Self::Headers(_) => "headers",
            Self::GetBlocks(_) => "getblocks",
            Self::Blocks(_) => "blocks",
            Self::NewBlock(_) => "newblock",
            Self::NewHead(_) => "newhead",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Gossip(_) => "gossip",
            Self::Graft(_) => "graft",
            Self::Prune(_) => "prune",
            Self::Credits(_) => "credits",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Ack(_) => "ack",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Canonical CBOR payload for this message.
    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Self::HandshakeInit(m) => to_cbor(m),
            Self::HandshakeReply(m) => to_cbor(m),
            Self::HandshakeFinish(m) => to_cbor(m),
            Self::HandshakeAccept(m) => to_cbor(m),
            Self::Identify(m) => to_cbor(m),
            Self::Ping(m) => to_cbor(m),
            Self::Pong(m) => to_cbor(m),
            Self::Bye(m) => to_cbor(m),
            Self::Inv(m) | Self::GetData(m) | Self::NotFound(m) => to_cbor(m),
            Self::Data(m) => to_cbor(m),
            Self::GetHeaders(m) => to_cbor(m),
            Self::Headers(m) => to_cbor(m),
            Self::GetBlocks(m) => to_cbor(m),
            Self::Blocks(m) => to_cbor(m),
            Self::NewBlock(m) => to_cbor(m),
            Self::NewHead(m) => to_cbor(m),
            Self::Subscribe(m) | Self::Unsubscribe(m) => to_cbor(m),
            Self::Gossip(m) => to_cbor(m),
            Self::Graft(m) => to_cbor(m),
            Self::Prune(m) => to_cbor(m),
            Self::Credits(m) => to_cbor(m),
            Self::Pause | Self::Resume => to_cbor(&Empty {}),
            Self::Ack(m) => to_cbor(m),
            Self::Unknown { .. } => Ok(Vec::new()),
        }
    }

    /// Decode a plaintext payload for `msg_id`. Headers and block bodies
    /// must be canonical, since their ids are derived from their contents.
    pub fn decode(msg_id: u16, payload: &[u8]) -> Result<Self, WireError> {
        let p = payload;
        Ok(match msg_id {
            ids::HANDSHAKE_INIT => Self::HandshakeInit(from_cbor(msg_id, p)?),
            ids::HANDSHAKE_REPLY => Self::HandshakeReply(from_cbor(msg_id, p)?),
            ids::HANDSHAKE_FINISH => Self::HandshakeFinish(from_cbor(msg_id, p)?),
            ids::HANDSHAKE_ACCEPT => Self::HandshakeAccept(from_cbor(msg_id, p)?),
            ids::IDENTIFY => Self::Identify(from_cbor(msg_id, p)?),
            ids::PING => Self::Ping(from_cbor(msg_id, p)?),
            ids::PONG => Self::Pong(from_cbor(msg_id, p)?),
            ids::BYE => Self::Bye(from_cbor(msg_id, p)?),
            ids::INV => Self::Inv(from_cbor(msg_id, p)?),
            ids::GET_DATA => Self::GetData(from_cbor(msg_id, p)?),
            ids::DATA => Self::Data(from_cbor(msg_id, p)?),
            ids::NOT_FOUND => Self::NotFound(from_cbor(msg_id, p)?),
            ids::GET_HEADERS => Self::GetHeaders(from_cbor(msg_id, p)?),
            ids::HEADERS => Self::Headers(from_canonical_cbor(msg_id, p)?),
            ids::GET_BLOCKS => Self::GetBlocks(from_cbor(msg_id, p)?),
            ids::BLOCKS => Self::Blocks(from_canonical_cbor(msg_id, p)?),
            ids::NEW_BLOCK => Self::NewBlock(from_cbor(msg_id, p)?),
            ids::NEW_HEAD => Self::NewHead(from_cbor(msg_id, p)?),
            ids::SUBSCRIBE => Self::Subscribe(from_cbor(msg_id, p)?),
            ids::UNSUBSCRIBE => Self::Unsubscribe(from_cbor(msg_id, p)?),
            ids::GOSSIP => Self::Gossip(from_cbor(msg_id, p)?),
            ids::GRAFT => Self::Graft(from_cbor(msg_id, p)?),
            ids::PRUNE => Self::Prune(from_cbor(msg_id, p)?),
            ids::CREDITS => Self::Credits(from_cbor(msg_id, p)?),
            ids::PAUSE => {
                from_cbor::<Empty>(msg_id, p)?;
                Self::Pause
            }
            ids::RESUME => {
                from_cbor::<Empty>(msg_id, p)?;
                Self::Resume
            }
            ids::ACK => Self::Ack(from_cbor(msg_id, p)?),
            other => Self::Unknown { msg_id: other },
        })
    }

    /// Control-plane messages bypass gossip queues and are never throttled
    /// by the per-topic buckets.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Ping(_)
                | Self::Pong(_)
                | Self::Bye(_)
                | Self::Graft(_)
                | Self::Prune(_)
                | Self::Subscribe(_)
                | Self::Unsubscribe(_)
                | Self::Credits(_)
                | Self::Pause
                | Self::Resume
                | Self::Ack(_)
        )
    }
}
