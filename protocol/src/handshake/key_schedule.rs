//! # Key Schedule
//!
//! Everything the session needs is derived from two values fixed at the end
//! of the handshake: the chaining key `ck` and the transcript hash `th`.
//!
//! ```text
//! ck_0      = derive_key(CK_CONTEXT, salt ‖ ss_i ‖ ss_r ‖ lp(ct_i) ‖ lp(ct_r))
//! keys_g    = keyed_xof(ck_g, TRAFFIC_CONTEXT ‖ th)[0..88]
//!           = k_i2r ‖ k_r2i ‖ n_i2r ‖ n_r2i
//! ck_{g+1}  = derive_key(REKEY_CONTEXT, ck_g ‖ "rekey" ‖ be32(g+1))
//! ```
//!
//! `lp` is a big-endian u32 length prefix. Both KEM shared secrets feed the
//! chaining key, so a break of either encapsulation alone reveals nothing.
//! The raw KEM outputs never touch a cipher directly.

use zeroize::{Zeroize, Zeroizing};

use crate::config::{
    AEAD_KEY_LENGTH, AEAD_NONCE_LENGTH, CHAINING_KEY_CONTEXT, HANDSHAKE_SALT, REKEY_CONTEXT,
    TRAFFIC_KEY_CONTEXT,
};

/// Which end of the handshake we were.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// One-byte tag mixed into role-bound signatures and confirmation tags.
    pub fn label(self) -> u8 {
        match self {
            Self::Initiator => 0x49, // 'I'
            Self::Responder => 0x52, // 'R'
        }
    }

    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Combine both shared secrets and both ciphertexts into the chaining key.
pub fn chaining_key(
    ss_i: &[u8],
    ss_r: &[u8],
    ct_i: &[u8],
    ct_r: &[u8],
) -> Zeroizing<[u8; 32]> {
    let mut hasher = blake3::Hasher::new_derive_key(CHAINING_KEY_CONTEXT);
    hasher.update(HANDSHAKE_SALT);
    hasher.update(ss_i);
    hasher.update(ss_r);
    hasher.update(&(ct_i.len() as u32).to_be_bytes());
    hasher.update(ct_i);
    hasher.update(&(ct_r.len() as u32).to_be_bytes());
    hasher.update(ct_r);
    Zeroizing::new(*hasher.finalize().as_bytes())
}

/// Keys and base nonces for both directions at one generation.
pub struct TrafficKeys {
    pub key_i2r: [u8; AEAD_KEY_LENGTH],
    pub key_r2i: [u8; AEAD_KEY_LENGTH],
    pub nonce_i2r: [u8; AEAD_NONCE_LENGTH],
    pub nonce_r2i: [u8; AEAD_NONCE_LENGTH],
}

impl TrafficKeys {
    /// `(key, base nonce)` for frames sent by `role`.
    pub fn sending(&self, role: Role) -> (&[u8; AEAD_KEY_LENGTH], &[u8; AEAD_NONCE_LENGTH]) {
        match role {
            Role::Initiator => (&self.key_i2r, &self.nonce_i2r),
            Role::Responder => (&self.key_r2i, &self.nonce_r2i),
        }
    }

    /// `(key, base nonce)` for frames received by `role`.
    pub fn receiving(&self, role: Role) -> (&[u8; AEAD_KEY_LENGTH], &[u8; AEAD_NONCE_LENGTH]) {
        self.sending(role.peer())
    }
}

impl Drop for TrafficKeys {
    fn drop(&mut self) {
        self.key_i2r.zeroize();
        self.key_r2i.zeroize();
        self.nonce_i2r.zeroize();
        self.nonce_r2i.zeroize();
    }
}

/// Chaining key plus transcript hash, positioned at a key generation.
///
/// Each traffic direction keeps its own copy and advances it independently.
#[derive(Clone)]
pub struct KeySchedule {
    ck: Zeroizing<[u8; 32]>,
    th: [u8; 32],
    generation: u32,
}

impl KeySchedule {
    pub fn from_handshake(ck: Zeroizing<[u8; 32]>, th: [u8; 32]) -> Self {
        Self {
            ck,
            th,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn transcript_hash(&self) -> &[u8; 32] {
        &self.th
    }

    /// Derive the four traffic values for the current generation.
    pub fn traffic_keys(&self) -> TrafficKeys {
        let mut hasher = blake3::Hasher::new_keyed(&self.ck);
        hasher.update(TRAFFIC_KEY_CONTEXT.as_bytes());
        hasher.update(&self.th);
        let mut okm = Zeroizing::new([0u8; 2 * AEAD_KEY_LENGTH + 2 * AEAD_NONCE_LENGTH]);
        hasher.finalize_xof().fill(&mut okm[..]);

        let mut keys = TrafficKeys {
            key_i2r: [0u8; AEAD_KEY_LENGTH],
            key_r2i: [0u8; AEAD_KEY_LENGTH],
            nonce_i2r: [0u8; AEAD_NONCE_LENGTH],
            nonce_r2i: [0u8; AEAD_NONCE_LENGTH],
        };
        let (k1, rest) = okm.split_at(AEAD_KEY_LENGTH);
        let (k2, rest) = rest.split_at(AEAD_KEY_LENGTH);
        let (n1, n2) = rest.split_at(AEAD_NONCE_LENGTH);
        keys.key_i2r.copy_from_slice(k1);
        keys.key_r2i.copy_from_slice(k2);
        keys.nonce_i2r.copy_from_slice(n1);
        keys.nonce_r2i.copy_from_slice(n2);
        keys
    }

    /// Step to the next generation. The previous chaining key is wiped.
    pub fn advance(&mut self) {
        let next = self.generation.wrapping_add(1);
        let mut hasher = blake3::Hasher::new_derive_key(REKEY_CONTEXT);
        hasher.update(&self.ck[..]);
        hasher.update(b"rekey");
        hasher.update(&next.to_be_bytes());
        self.ck = Zeroizing::new(*hasher.finalize().as_bytes());
        self.generation = next;
    }

    /// A copy advanced to `generation`. `None` if that lies in the past.
    pub fn at_generation(&self, generation: u32) -> Option<Self> {
        if generation < self.generation {
            return None;
        }
        let mut ks = self.clone();
        while ks.generation < generation {
            ks.advance();
        }
        Some(ks)
    }
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySchedule")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> KeySchedule {
        let ck = chaining_key(&[1; 32], &[2; 32], b"ct_i", b"ct_r");
        KeySchedule::from_handshake(ck, [9; 32])
    }

    #[test]
    fn chaining_key_depends_on_ciphertext_order() {
        let a = chaining_key(&[1; 32], &[2; 32], b"aa", b"b");
        let b = chaining_key(&[1; 32], &[2; 32], b"a", b"ab");
        assert_ne!(*a, *b);
    }

    #[test]
    fn directions_get_distinct_material() {
        let keys = schedule().traffic_keys();
        assert_ne!(keys.key_i2r, keys.key_r2i);
        assert_ne!(keys.nonce_i2r, keys.nonce_r2i);
        assert_eq!(keys.sending(Role::Initiator), keys.receiving(Role::Responder));
    }

    #[test]
    fn advance_changes_keys_deterministically() {
        let mut a = schedule();
        let mut b = schedule();
        let g0 = a.traffic_keys().key_i2r;
        a.advance();
        b.advance();
        assert_eq!(a.generation(), 1);
        assert_ne!(a.traffic_keys().key_i2r, g0);
        assert_eq!(a.traffic_keys().key_i2r, b.traffic_keys().key_i2r);
    }

    #[test]
    fn at_generation_only_moves_forward() {
        let mut s = schedule();
        let jumped = s.at_generation(3).unwrap();
        s.advance();
        s.advance();
        s.advance();
        assert_eq!(jumped.traffic_keys().key_r2i, s.traffic_keys().key_r2i);
        assert!(s.at_generation(1).is_none());
    }
}
