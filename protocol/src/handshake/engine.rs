//! # Handshake State Machine
//!
//! Four messages, sans-IO. Each state is its own type and each transition
//! consumes it, so an out-of-order message cannot even be expressed:
//!
//! ```text
//! Initiator                                   Responder
//! ---------                                   ---------
//! start()        -- Init  {pk_i, aeads} -->   on_init()
//! on_reply()     <-- Reply {pk_r, ct_r, aead, hello_r} --
//!                -- Finish {ct_i, hello_i, auth_i} -->  on_finish()
//! on_accept()    <-- Accept {auth_r} --------
//! ```
//!
//! The responder proves its identity last, after the initiator has
//! committed to its own. Both auths sign the same transcript hash under
//! different role labels and carry a confirmation tag keyed by the
//! chaining key, which catches a tampered KEM ciphertext even though Kyber
//! decapsulation itself never fails.

use std::sync::Arc;

use tracing::debug;

use super::error::HandshakeError;
use super::key_schedule::{chaining_key, KeySchedule, Role};
use super::transcript::Transcript;
use super::HandshakeConfig;
use crate::config::AUTH_SIGN_DOMAIN;
use crate::crypto::hash::{identity_digest, keyed_tag};
use crate::crypto::kem::{encapsulate, EphemeralKem, SharedSecret};
use crate::crypto::keys::IdentityKeypair;
use crate::crypto::signatures::{verify, SignatureAlg};
use crate::crypto::AeadAlg;
use crate::types::{Hash32, PeerId};
use crate::wire::messages::{
    ids, Auth, HandshakeAccept, HandshakeFinish, HandshakeInit, HandshakeReply, Hello,
};

/// Local chain head advertised in our hello.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalHead {
    pub height: u64,
    pub hash: Hash32,
}

/// A completed handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub role: Role,
    pub peer_id: PeerId,
    pub peer_alg: SignatureAlg,
    pub remote_hello: Hello,
    /// Feature bits both sides advertised.
    pub features: u64,
    pub aead: AeadAlg,
    pub keys: KeySchedule,
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn local_hello(cfg: &HandshakeConfig, identity: &IdentityKeypair, head: LocalHead) -> Hello {
    Hello {
        version: cfg.version,
        peer_id: identity.peer_id(),
        chain_id: cfg.chain_id,
        policy_root: Hash32(cfg.policy.root()),
        features: cfg.features,
        agent: cfg.agent.clone(),
        head_height: head.height,
        head_hash: head.hash,
    }
}

fn check_hello(cfg: &HandshakeConfig, me: PeerId, hello: &Hello) -> Result<(), HandshakeError> {
    if hello.version != cfg.version {
        return Err(HandshakeError::VersionMismatch {
            ours: cfg.version,
            theirs: hello.version,
        });
    }
    if hello.chain_id != cfg.chain_id {
        return Err(HandshakeError::ChainMismatch {
            ours: cfg.chain_id,
            theirs: hello.chain_id,
        });
    }
    if hello.policy_root.0 != cfg.policy.root() {
        return Err(HandshakeError::PolicyMismatch);
    }
    if hello.peer_id == me {
        return Err(HandshakeError::SelfConnection);
    }
    Ok(())
}

fn sign_message(role: Role, th: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(AUTH_SIGN_DOMAIN.len() + 1 + 32);
    msg.extend_from_slice(AUTH_SIGN_DOMAIN);
    msg.push(role.label());
    msg.extend_from_slice(th);
    msg
}

fn confirm_tag(ck: &[u8; 32], role: Role, th: &[u8; 32]) -> Hash32 {
    Hash32(keyed_tag(ck, &[&[role.label()], th]))
}

fn make_auth(identity: &IdentityKeypair, role: Role, ck: &[u8; 32], th: &[u8; 32]) -> Auth {
    Auth {
        alg: identity.alg().as_byte(),
        public_key: identity.public_key(),
        signature: identity.sign(&sign_message(role, th)),
        confirm: confirm_tag(ck, role, th),
    }
}

/// Check the peer's auth: algorithm policy, identity binding, key
/// confirmation, then the signature.
fn verify_auth(
    cfg: &HandshakeConfig,
    auth: &Auth,
    role: Role,
    expected: PeerId,
    ck: &[u8; 32],
    th: &[u8; 32],
) -> Result<SignatureAlg, HandshakeError> {
    let alg = SignatureAlg::from_byte(auth.alg)?;
    cfg.policy.check(alg)?;
    if identity_digest(&auth.public_key, alg) != expected {
        return Err(HandshakeError::IdentityMismatch);
    }
    if confirm_tag(ck, role, th) != auth.confirm {
        return Err(HandshakeError::KeyConfirmationFailed);
    }
    verify(alg, &auth.public_key, &sign_message(role, th), &auth.signature)?;
    Ok(alg)
}

/// The part of `Finish` covered by the transcript.
#[derive(serde::Serialize)]
struct FinishPrefix<'a> {
    #[serde(with = "serde_bytes")]
    kem_ciphertext: &'a [u8],
    hello: &'a Hello,
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

pub struct Initiator;

pub struct InitiatorAwaitReply {
    cfg: HandshakeConfig,
    identity: Arc<IdentityKeypair>,
    head: LocalHead,
    kem: EphemeralKem,
    transcript: Transcript,
}

pub struct InitiatorAwaitAccept {
    cfg: HandshakeConfig,
    remote_hello: Hello,
    aead: AeadAlg,
    ck: zeroize::Zeroizing<[u8; 32]>,
    th: [u8; 32],
}

impl Initiator {
    /// Generate our ephemeral KEM key and produce `HandshakeInit`.
    pub fn start(
        cfg: &HandshakeConfig,
        identity: Arc<IdentityKeypair>,
        head: LocalHead,
    ) -> Result<(InitiatorAwaitReply, HandshakeInit), HandshakeError> {
        if cfg.aead.is_empty() {
            return Err(HandshakeError::NoCommonAead);
        }
        let kem = EphemeralKem::generate();
        let init = HandshakeInit {
            version: cfg.version,
            kem_public: kem.public_key().to_vec(),
            aead: cfg.aead.iter().map(|a| *a as u8).collect(),
        };
        let mut transcript = Transcript::new();
        transcript.absorb(ids::HANDSHAKE_INIT, &init)?;

        Ok((
            InitiatorAwaitReply {
                cfg: cfg.clone(),
                identity,
                head,
                kem,
                transcript,
            },
            init,
        ))
    }
}

impl InitiatorAwaitReply {
    /// Check the responder's hello, complete both encapsulations and sign.
    pub fn on_reply(
        mut self,
        reply: HandshakeReply,
    ) -> Result<(InitiatorAwaitAccept, HandshakeFinish), HandshakeError> {
        let aead = AeadAlg::from_byte(reply.aead)
            .ok()
            .filter(|a| self.cfg.aead.contains(a))
            .ok_or(HandshakeError::UnofferedAead(reply.aead))?;
        check_hello(&self.cfg, self.identity.peer_id(), &reply.hello)?;

        let ss_r = self.kem.decapsulate(&reply.kem_ciphertext)?;
        let (ss_i, ct_i) = encapsulate(&reply.kem_public)?;
        let ck = chaining_key(&ss_i, &ss_r, &ct_i, &reply.kem_ciphertext);

        let hello = local_hello(&self.cfg, &self.identity, self.head);
        self.transcript.absorb(ids::HANDSHAKE_REPLY, &reply)?;
        self.transcript.absorb(
            ids::HANDSHAKE_FINISH,
            &FinishPrefix {
                kem_ciphertext: &ct_i,
                hello: &hello,
            },
        )?;
        let th = self.transcript.hash();
        let auth = make_auth(&self.identity, Role::Initiator, &ck, &th);

        debug!(peer = %reply.hello.peer_id, aead = aead.name(), "handshake reply accepted");
        Ok((
            InitiatorAwaitAccept {
                cfg: self.cfg,
                remote_hello: reply.hello,
                aead,
                ck,
                th,
            },
            HandshakeFinish {
                kem_ciphertext: ct_i,
                hello,
                auth,
            },
        ))
    }
}

impl InitiatorAwaitAccept {
    /// Verify the responder's auth and derive traffic keys.
    pub fn on_accept(self, accept: HandshakeAccept) -> Result<HandshakeOutcome, HandshakeError> {
        let peer_alg = verify_auth(
            &self.cfg,
            &accept.auth,
            Role::Responder,
            self.remote_hello.peer_id,
            &self.ck,
            &self.th,
        )?;
        Ok(HandshakeOutcome {
            role: Role::Initiator,
            peer_id: self.remote_hello.peer_id,
            peer_alg,
            features: self.cfg.features & self.remote_hello.features,
            remote_hello: self.remote_hello,
            aead: self.aead,
            keys: KeySchedule::from_handshake(self.ck, self.th),
        })
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

pub struct Responder {
    cfg: HandshakeConfig,
    identity: Arc<IdentityKeypair>,
    head: LocalHead,
}

pub struct ResponderAwaitFinish {
    cfg: HandshakeConfig,
    identity: Arc<IdentityKeypair>,
    kem: EphemeralKem,
    ss_r: SharedSecret,
    ct_r: Vec<u8>,
    aead: AeadAlg,
    transcript: Transcript,
}

impl Responder {
    pub fn new(cfg: &HandshakeConfig, identity: Arc<IdentityKeypair>, head: LocalHead) -> Self {
        Self {
            cfg: cfg.clone(),
            identity,
            head,
        }
    }

    /// Pick an AEAD, encapsulate to the initiator and send our hello.
    pub fn on_init(
        self,
        init: HandshakeInit,
    ) -> Result<(ResponderAwaitFinish, HandshakeReply), HandshakeError> {
        if init.version != self.cfg.version {
            return Err(HandshakeError::VersionMismatch {
                ours: self.cfg.version,
                theirs: init.version,
            });
        }
        // The initiator's preference order wins among ids we also support.
        let aead = init
            .aead
            .iter()
            .filter_map(|b| AeadAlg::from_byte(*b).ok())
            .find(|a| self.cfg.aead.contains(a))
            .ok_or(HandshakeError::NoCommonAead)?;

        let kem = EphemeralKem::generate();
        let (ss_r, ct_r) = encapsulate(&init.kem_public)?;
        let reply = HandshakeReply {
            kem_public: kem.public_key().to_vec(),
            kem_ciphertext: ct_r.clone(),
            aead: aead as u8,
            hello: local_hello(&self.cfg, &self.identity, self.head),
        };

        let mut transcript = Transcript::new();
        transcript.absorb(ids::HANDSHAKE_INIT, &init)?;
        transcript.absorb(ids::HANDSHAKE_REPLY, &reply)?;

        Ok((
            ResponderAwaitFinish {
                cfg: self.cfg,
                identity: self.identity,
                kem,
                ct_r,
                aead,
                transcript,
                ss_r,
            },
            reply,
        ))
    }
}

impl ResponderAwaitFinish {
    /// Verify the initiator, then answer with our own auth.
    pub fn on_finish(
        mut self,
        finish: HandshakeFinish,
    ) -> Result<(HandshakeOutcome, HandshakeAccept), HandshakeError> {
        check_hello(&self.cfg, self.identity.peer_id(), &finish.hello)?;

        let ss_i = self.kem.decapsulate(&finish.kem_ciphertext)?;
        let ck = chaining_key(&ss_i, &self.ss_r, &finish.kem_ciphertext, &self.ct_r);

        self.transcript.absorb(
            ids::HANDSHAKE_FINISH,
            &FinishPrefix {
                kem_ciphertext: &finish.kem_ciphertext,
                hello: &finish.hello,
            },
        )?;
        let th = self.transcript.hash();

        let peer_alg = verify_auth(
            &self.cfg,
            &finish.auth,
            Role::Initiator,
            finish.hello.peer_id,
            &ck,
            &th,
        )?;
        let auth = make_auth(&self.identity, Role::Responder, &ck, &th);

        debug!(peer = %finish.hello.peer_id, alg = %peer_alg, "handshake finish verified");
        Ok((
            HandshakeOutcome {
                role: Role::Responder,
                peer_id: finish.hello.peer_id,
                peer_alg,
                features: self.cfg.features & finish.hello.features,
                remote_hello: finish.hello,
                aead: self.aead,
                keys: KeySchedule::from_handshake(ck, th),
            },
            HandshakeAccept { auth },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signatures::AlgorithmPolicy;
    use crate::handshake::key_schedule::TrafficKeys;

    fn identity(seed: u8) -> Arc<IdentityKeypair> {
        Arc::new(IdentityKeypair::ed25519_from_seed(&[seed; 32]))
    }

    fn cfg() -> HandshakeConfig {
        HandshakeConfig::default()
    }

    fn run(
        cfg_i: &HandshakeConfig,
        cfg_r: &HandshakeConfig,
    ) -> Result<(HandshakeOutcome, HandshakeOutcome), HandshakeError> {
        let (await_reply, init) = Initiator::start(cfg_i, identity(1), LocalHead::default())?;
        let (await_finish, reply) =
            Responder::new(cfg_r, identity(2), LocalHead::default()).on_init(init)?;
        let (await_accept, finish) = await_reply.on_reply(reply)?;
        let (out_r, accept) = await_finish.on_finish(finish)?;
        let out_i = await_accept.on_accept(accept)?;
        Ok((out_i, out_r))
    }

    fn same_keys(a: &TrafficKeys, b: &TrafficKeys) -> bool {
        a.key_i2r == b.key_i2r
            && a.key_r2i == b.key_r2i
            && a.nonce_i2r == b.nonce_i2r
            && a.nonce_r2i == b.nonce_r2i
    }

    #[test]
    fn both_sides_derive_identical_keys() {
        let (i, r) = run(&cfg(), &cfg()).unwrap();
        assert!(same_keys(&i.keys.traffic_keys(), &r.keys.traffic_keys()));
        assert_eq!(i.peer_id, identity(2).peer_id());
        assert_eq!(r.peer_id, identity(1).peer_id());
        assert_eq!(i.aead, AeadAlg::Aes256Gcm);
        assert_eq!(i.role, Role::Initiator);
        assert_eq!(r.role, Role::Responder);
    }

    #[test]
    fn fresh_handshakes_derive_fresh_keys() {
        let (a, _) = run(&cfg(), &cfg()).unwrap();
        let (b, _) = run(&cfg(), &cfg()).unwrap();
        assert!(!same_keys(&a.keys.traffic_keys(), &b.keys.traffic_keys()));
    }

    #[test]
    fn initiator_preference_picks_the_aead() {
        let mut ci = cfg();
        ci.aead = vec![AeadAlg::ChaCha20Poly1305, AeadAlg::Aes256Gcm];
        let (i, r) = run(&ci, &cfg()).unwrap();
        assert_eq!(i.aead, AeadAlg::ChaCha20Poly1305);
        assert_eq!(r.aead, AeadAlg::ChaCha20Poly1305);
    }

    #[test]
    fn disjoint_aead_sets_fail() {
        let mut ci = cfg();
        ci.aead = vec![AeadAlg::ChaCha20Poly1305];
        let mut cr = cfg();
        cr.aead = vec![AeadAlg::Aes256Gcm];
        assert!(matches!(run(&ci, &cr), Err(HandshakeError::NoCommonAead)));
    }

    #[test]
    fn chain_mismatch_is_fatal() {
        let mut cr = cfg();
        cr.chain_id ^= 1;
        let err = run(&cfg(), &cr).unwrap_err();
        assert!(matches!(err, HandshakeError::ChainMismatch { .. }));
        assert!(err.severity().is_fatal());
    }

    #[test]
    fn policy_mismatch_is_detected() {
        let mut cr = cfg();
        cr.policy = AlgorithmPolicy {
            accepted: vec![SignatureAlg::Ed25519],
            deprecated: vec![SignatureAlg::MlDsa44],
        };
        assert!(matches!(
            run(&cfg(), &cr),
            Err(HandshakeError::PolicyMismatch)
        ));
    }

    #[test]
    fn corrupted_signature_aborts() {
        let (await_reply, init) = Initiator::start(&cfg(), identity(1), LocalHead::default()).unwrap();
        let (await_finish, reply) = Responder::new(&cfg(), identity(2), LocalHead::default())
            .on_init(init)
            .unwrap();
        let (_, mut finish) = await_reply.on_reply(reply).unwrap();
        finish.auth.signature[0] ^= 0x01;
        assert!(matches!(
            await_finish.on_finish(finish),
            Err(HandshakeError::Signature(_))
        ));
    }

    #[test]
    fn corrupted_kem_ciphertext_fails_key_confirmation() {
        let (await_reply, init) = Initiator::start(&cfg(), identity(1), LocalHead::default()).unwrap();
        let (await_finish, reply) = Responder::new(&cfg(), identity(2), LocalHead::default())
            .on_init(init)
            .unwrap();
        let (_, mut finish) = await_reply.on_reply(reply).unwrap();
        finish.kem_ciphertext[10] ^= 0xFF;
        // The responder's transcript and chaining key now both differ from
        // the initiator's; confirmation catches it before the signature.
        assert!(matches!(
            await_finish.on_finish(finish),
            Err(HandshakeError::KeyConfirmationFailed)
        ));
    }

    #[test]
    fn tampered_reply_ciphertext_is_caught_by_responder() {
        let (await_reply, init) = Initiator::start(&cfg(), identity(1), LocalHead::default()).unwrap();
        let (await_finish, mut reply) = Responder::new(&cfg(), identity(2), LocalHead::default())
            .on_init(init)
            .unwrap();
        reply.kem_ciphertext[0] ^= 0xFF;
        let (_, finish) = await_reply.on_reply(reply).unwrap();
        assert!(matches!(
            await_finish.on_finish(finish),
            Err(HandshakeError::KeyConfirmationFailed)
        ));
    }

    #[test]
    fn swapped_identity_is_rejected() {
        let (await_reply, init) = Initiator::start(&cfg(), identity(1), LocalHead::default()).unwrap();
        let (await_finish, reply) = Responder::new(&cfg(), identity(2), LocalHead::default())
            .on_init(init)
            .unwrap();
        let (_, mut finish) = await_reply.on_reply(reply).unwrap();
        finish.auth.public_key = identity(3).public_key();
        assert!(matches!(
            await_finish.on_finish(finish),
            Err(HandshakeError::IdentityMismatch)
        ));
    }

    #[test]
    fn self_connection_is_refused() {
        let (await_reply, init) = Initiator::start(&cfg(), identity(1), LocalHead::default()).unwrap();
        let (_, reply) = Responder::new(&cfg(), identity(1), LocalHead::default())
            .on_init(init)
            .unwrap();
        assert!(matches!(
            await_reply.on_reply(reply),
            Err(HandshakeError::SelfConnection)
        ));
    }

    #[test]
    fn version_mismatch_on_init() {
        let mut ci = cfg();
        ci.version += 1;
        let (_, init) = Initiator::start(&ci, identity(1), LocalHead::default()).unwrap();
        assert!(matches!(
            Responder::new(&cfg(), identity(2), LocalHead::default()).on_init(init),
            Err(HandshakeError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn mldsa_identities_complete() {
        let (await_reply, init) = Initiator::start(
            &cfg(),
            Arc::new(IdentityKeypair::generate(SignatureAlg::MlDsa44)),
            LocalHead::default(),
        )
        .unwrap();
        let (await_finish, reply) = Responder::new(&cfg(), identity(2), LocalHead::default())
            .on_init(init)
            .unwrap();
        let (await_accept, finish) = await_reply.on_reply(reply).unwrap();
        let (out_r, accept) = await_finish.on_finish(finish).unwrap();
        let out_i = await_accept.on_accept(accept).unwrap();
        assert_eq!(out_r.peer_alg, SignatureAlg::MlDsa44);
        assert_eq!(out_i.peer_alg, SignatureAlg::Ed25519);
    }
}
