//! End-to-end scenarios over in-memory transports.
//!
//! Each test runs real services on `tokio::io::duplex` pipes: handshake,
//! identify, subscribe, gossip and body sync all go through the same code
//! paths as TCP connections. The misbehaving relay is driven by hand from
//! the public protocol API.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use prometheus::Registry;
use tokio_util::codec::Framed;

use tessera_p2p::config::CHAIN_ID_DEVNET;
use tessera_p2p::crypto::{digest8, IdentityKeypair};
use tessera_p2p::gossip::Topic;
use tessera_p2p::handshake::{HandshakeConfig, LocalHead};
use tessera_p2p::metrics::P2pMetrics;
use tessera_p2p::net::service::ServiceOptions;
use tessera_p2p::net::{exchange_identify, initiate, P2pService, ServiceHandle};
use tessera_p2p::session::{Session, SessionConfig};
use tessera_p2p::sync::chain_view::{FixedConsensus, MemoryBlockSource};
use tessera_p2p::types::{Hash32, PeerId};
use tessera_p2p::wire::messages::{ids, GossipEnvelope, Identify};
use tessera_p2p::wire::{to_cbor, BlockBody, BlockHeader, Frame, FrameCodec, FrameHeader, Message};
use tessera_p2p::P2pConfig;

// ---------------------------------------------------------------------------
// Chain helpers
// ---------------------------------------------------------------------------

fn empty_body(hash: Hash32) -> BlockBody {
    BlockBody {
        header_hash: hash,
        txs: vec![],
        proofs: vec![],
    }
}

fn genesis() -> BlockHeader {
    BlockHeader {
        chain_id: CHAIN_ID_DEVNET,
        height: 0,
        parent: Hash32::ZERO,
        timestamp: 1_000,
        threshold: 1_000_000,
        weight: 1,
        policy_root: vec![0; 32],
        body_root: empty_body(Hash32::ZERO).root(),
        nonce: 0,
    }
}

fn chain(from: &BlockHeader, n: usize) -> Vec<BlockHeader> {
    let mut out: Vec<BlockHeader> = Vec::with_capacity(n);
    for _ in 0..n {
        let parent = out.last().unwrap_or(from).clone();
        out.push(BlockHeader {
            chain_id: CHAIN_ID_DEVNET,
            height: parent.height + 1,
            parent: parent.hash(),
            timestamp: parent.timestamp + 10,
            threshold: parent.threshold,
            weight: 1,
            policy_root: vec![0; 32],
            body_root: empty_body(Hash32::ZERO).root(),
            nonce: 0,
        });
    }
    out
}

fn envelope(header: &BlockHeader) -> GossipEnvelope {
    let data = to_cbor(header).unwrap();
    GossipEnvelope {
        topic: Topic::Headers.as_str().to_string(),
        schema: Topic::Headers.schema(),
        checksum: digest8(&data),
        data,
    }
}

// ---------------------------------------------------------------------------
// Service helpers
// ---------------------------------------------------------------------------

fn identity(seed: u8) -> Arc<IdentityKeypair> {
    Arc::new(IdentityKeypair::ed25519_from_seed(&[seed; 32]))
}

fn start(seed: u8, options: ServiceOptions) -> ServiceHandle {
    let (service, handle) = P2pService::new(
        P2pConfig::default(),
        identity(seed),
        genesis(),
        Arc::new(FixedConsensus::new(1_000_000, Hash32::ZERO)),
        options,
    );
    tokio::spawn(service.run());
    handle
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn link(a: &ServiceHandle, b: &ServiceHandle) {
    let (io_a, io_b) = tokio::io::duplex(256 * 1024);
    a.attach(io_a, None, true);
    b.attach(io_b, None, false);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn header_gossip_with_duplicates_and_an_oversize_relay() {
    let headers = chain(&genesis(), 100);
    let source = Arc::new(MemoryBlockSource::new());
    for h in &headers {
        source.insert(empty_body(h.hash()));
    }

    let registry = Registry::new_custom(Some("tessera".into()), None).unwrap();
    let metrics = Arc::new(P2pMetrics::new(&registry).unwrap());

    let a = start(
        1,
        ServiceOptions {
            block_source: Some(source),
            ..ServiceOptions::default()
        },
    );
    let b = start(
        2,
        ServiceOptions {
            topics: vec![Topic::Headers],
            metrics: Some(metrics.clone()),
            ..ServiceOptions::default()
        },
    );
    link(&a, &b);
    eventually("a and b connected", || async {
        a.status().await.unwrap().peers == 1 && b.status().await.unwrap().peers == 1
    })
    .await;

    // The relay speaks the protocol by hand.
    let (io_r, io_b) = tokio::io::duplex(256 * 1024);
    b.attach(io_b, None, false);
    let relay_id = identity(3);
    let cfg = HandshakeConfig::default();
    let head = LocalHead {
        height: 0,
        hash: genesis().hash(),
    };
    let mut relay = Framed::new(io_r, FrameCodec::new());
    let outcome = initiate(&mut relay, &cfg, relay_id.clone(), head).await.unwrap();
    let mut session = Session::new(&outcome, SessionConfig::default()).unwrap();
    let hello = Identify {
        version: cfg.version,
        agent: "relay".into(),
        chain_id: cfg.chain_id,
        head_height: 0,
        head_hash: genesis().hash(),
        topics: vec![],
        listen_addr: None,
        features: 0,
    };
    exchange_identify(&mut relay, &mut session, hello, &cfg, Duration::from_secs(5))
        .await
        .unwrap();
    eventually("relay connected", || async { b.status().await.unwrap().peers == 2 }).await;

    // 100 headers, then 5 of them again.
    let b_id = b.local_peer_id();
    for h in &headers {
        a.send(b_id, Message::Gossip(envelope(h))).await.unwrap();
    }
    for h in headers.iter().take(5) {
        a.send(b_id, Message::Gossip(envelope(h))).await.unwrap();
    }

    // Three ping frames one byte over the ping cap.
    let ping_header = FrameHeader {
        msg_id: ids::PING,
        seq: 0,
        flags: 0,
        digest8: 0,
        payload_len: 0,
    };
    let len = ping_header.max_wire_len() + 1;
    for seq in 0..3u32 {
        let frame = Frame {
            header: FrameHeader {
                seq: 1_000 + seq,
                payload_len: len as u32,
                ..ping_header
            },
            payload: Bytes::from(vec![0u8; len]),
        };
        relay.send(frame).await.unwrap();
    }

    let relay_peer = relay_id.peer_id();
    let a_peer = a.local_peer_id();
    eventually("b at height 100", || async { b.status().await.unwrap().head_height == 100 }).await;
    eventually("relay penalized", || async { b.peer_score(&relay_peer) < 0.0 }).await;

    assert_eq!(b.status().await.unwrap().head_hash, headers[99].hash().to_hex());
    assert!(b.peer_score(&a_peer) >= 0.0, "a was penalized: {}", b.peer_score(&a_peer));

    let short = |p: &PeerId| p.short();
    assert_eq!(
        metrics.peer_drops.with_label_values(&[&short(&a_peer), "duplicate"]).get(),
        5
    );
    assert_eq!(
        metrics.peer_drops.with_label_values(&[&short(&relay_peer), "oversize"]).get(),
        3
    );
    assert_eq!(
        metrics.peer_drops.with_label_values(&[&short(&a_peer), "oversize"]).get(),
        0
    );

    // Bodies come from a's block source.
    eventually("bodies imported", || async {
        metrics.bodies_imported.get() == 100
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_catches_up_through_header_sync() {
    let headers = chain(&genesis(), 40);
    let a = start(
        4,
        ServiceOptions {
            topics: vec![Topic::Headers],
            ..ServiceOptions::default()
        },
    );
    let b = start(5, ServiceOptions::default());
    link(&a, &b);
    eventually("a and b connected", || async { b.status().await.unwrap().peers == 1 }).await;

    let a_id = a.local_peer_id();
    for h in &headers {
        b.send(a_id, Message::Gossip(envelope(h))).await.unwrap();
    }
    eventually("a at height 40", || async { a.status().await.unwrap().head_height == 40 }).await;

    // c connects to a only after a has the chain; identify reveals the gap.
    let c = start(6, ServiceOptions::default());
    link(&c, &a);
    eventually("c at height 40", || async { c.status().await.unwrap().head_height == 40 }).await;
    assert_eq!(
        c.status().await.unwrap().head_hash,
        headers[39].hash().to_hex()
    );
}
