//! Connection lifecycle.
//!
//! ```text
//! Opening ──> Authenticated ──> Identifying ──> Ready
//!    │              │                │            │
//!    └──────────────┴────────────────┴────────────┴──> Closed
//! ```
//!
//! Any state may close; nothing leaves `Closed`. Handshake or identify
//! timeouts and mismatches force `Closed`.

use std::fmt;

use crate::sync::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Transport open, handshake running.
    Opening,
    /// Handshake done, session keys live.
    Authenticated,
    /// `identify` sent, waiting for the peer's.
    Identifying,
    /// Both sides identified; gossip and sync may run.
    Ready,
    Closed,
}

impl ConnState {
    pub fn can_advance_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Opening, Authenticated)
                | (Authenticated, Identifying)
                | (Identifying, Ready)
                | (Opening | Authenticated | Identifying | Ready, Closed)
        )
    }

    pub fn advance(self, next: ConnState) -> Result<ConnState, SyncError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(SyncError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Authenticated => "authenticated",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let s = ConnState::Opening
            .advance(ConnState::Authenticated)
            .and_then(|s| s.advance(ConnState::Identifying))
            .and_then(|s| s.advance(ConnState::Ready))
            .unwrap();
        assert!(s.is_ready());
        assert!(s.advance(ConnState::Closed).unwrap().is_closed());
    }

    #[test]
    fn no_skipping_and_no_reopening() {
        assert!(ConnState::Opening.advance(ConnState::Ready).is_err());
        assert!(ConnState::Authenticated.advance(ConnState::Ready).is_err());
        assert!(ConnState::Closed.advance(ConnState::Opening).is_err());
        assert!(ConnState::Closed.advance(ConnState::Closed).is_err());
    }
}
