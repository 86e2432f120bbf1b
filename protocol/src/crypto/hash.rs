//! # Hashing Utilities
//!
//! BLAKE3 is the only hash in the transport layer. Every use is domain
//! separated, either with a `derive_key` context string or a keyed hash, so
//! outputs from different purposes can never collide.

use crate::crypto::signatures::SignatureAlg;
use crate::types::{Hash32, PeerId};

/// Context for peer identity digests.
const IDENTITY_CONTEXT: &str = "tessera p2p v1 identity digest";

/// Plain BLAKE3 of `data`.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// The 8-byte integrity pre-check carried in every frame header.
///
/// Big-endian interpretation of the first 8 bytes of BLAKE3(payload). Not a
/// MAC: it catches corruption and lazy tampering cheaply, the AEAD tag does
/// the real work.
pub fn digest8(payload: &[u8]) -> u64 {
    let hash = blake3::hash(payload);
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(first)
}

/// Peer identity = H(public_key ‖ alg_id).
///
/// Binding the algorithm id means the same key bytes under a different
/// scheme produce a different identity.
pub fn identity_digest(public_key: &[u8], alg: SignatureAlg) -> PeerId {
    let mut hasher = blake3::Hasher::new_derive_key(IDENTITY_CONTEXT);
    hasher.update(public_key);
    hasher.update(&[alg.as_byte()]);
    PeerId(*hasher.finalize().as_bytes())
}

/// Content identifier under a topic-specific domain.
pub fn content_id(domain: &str, data: &[u8]) -> Hash32 {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    Hash32(*hasher.finalize().as_bytes())
}

/// Keyed tag over a sequence of length-prefixed parts.
pub fn keyed_tag(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    for part in parts {
        hasher.update(&(part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest8_is_stable_and_sensitive() {
        let a = digest8(b"header payload");
        assert_eq!(a, digest8(b"header payload"));
        assert_ne!(a, digest8(b"header payloae"));
    }

    #[test]
    fn identity_binds_algorithm() {
        let pk = [7u8; 32];
        assert_ne!(
            identity_digest(&pk, SignatureAlg::Ed25519),
            identity_digest(&pk, SignatureAlg::MlDsa44)
        );
    }

    #[test]
    fn content_id_is_domain_separated() {
        let data = b"same bytes";
        assert_ne!(
            content_id("tessera tx id", data),
            content_id("tessera header id", data)
        );
    }

    #[test]
    fn keyed_tag_length_prefixes_parts() {
        let key = [1u8; 32];
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(
            keyed_tag(&key, &[b"ab", b"c"]),
            keyed_tag(&key, &[b"a", b"bc"])
        );
    }
}
