//! # Credit-Based Flow Control
//!
//! Each direction of a connection has a window of bytes and messages the
//! receiver is prepared to buffer. The sender spends credit per frame and
//! waits when it runs out; the receiver hands credit back in `credits`
//! messages as it processes frames.
//!
//! ```text
//! receiver window  |██████████████████████░░░░░░░░|
//!                                 ^ 25% left: grant 50% of the window
//! ```
//!
//! Control messages (ping, credits, graft, ...) are never charged, otherwise
//! a starved window could not be refilled. A data frame is charged at most
//! the low watermark, so once outstanding grants arrive the sender always
//! holds enough credit for the next frame.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::{FLOW_WINDOW_BYTES, FLOW_WINDOW_MSGS};
use crate::error::Severity;
use crate::wire::messages::{Ack, Credits};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub window_bytes: u64,
    pub window_msgs: u64,
    /// Remaining credit, in percent of the window, below which a grant is sent.
    pub low_watermark_pct: u8,
    /// Size of each grant in percent of the window.
    pub grant_pct: u8,
    pub soft_pressure_pct: u8,
    pub hard_pressure_pct: u8,
    /// Longest a sender waits for credit before giving up on the peer.
    pub stall_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window_bytes: FLOW_WINDOW_BYTES,
            window_msgs: FLOW_WINDOW_MSGS,
            low_watermark_pct: 25,
            grant_pct: 50,
            soft_pressure_pct: 15,
            hard_pressure_pct: 5,
            stall_timeout_ms: 30_000,
        }
    }
}

impl FlowConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Credit a frame of `len` wire bytes costs.
    pub fn charge(&self, len: u64) -> u64 {
        len.min(pct(self.window_bytes, self.low_watermark_pct).max(1))
    }
}

fn pct(total: u64, pct: u8) -> u64 {
    (total as u128 * pct as u128 / 100) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("peer sent {len} bytes with {remaining} bytes of credit left")]
    ByteOverrun { len: u64, remaining: u64 },

    #[error("peer sent a message with no message credit left")]
    MessageOverrun,

    #[error("frame of {len} bytes can never fit a window of {window}")]
    LargerThanWindow { len: u64, window: u64 },

    #[error("peer granted credit beyond its window")]
    ExcessGrant,
}

impl FlowError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::LargerThanWindow { .. } => Severity::Soft,
            _ => Severity::Fatal,
        }
    }
}

/// How close a window is to empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backpressure {
    Ok,
    Soft,
    Hard,
}

// ---------------------------------------------------------------------------
// Sending side
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SendState {
    bytes: u64,
    msgs: u64,
    paused: bool,
}

/// Credit we may spend towards the peer. Shared between the reader (which
/// applies grants) and the writer (which spends).
#[derive(Debug)]
pub struct SendWindow {
    cfg: FlowConfig,
    state: Mutex<SendState>,
    notify: Notify,
}

impl SendWindow {
    pub fn new(cfg: &FlowConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            state: Mutex::new(SendState {
                bytes: cfg.window_bytes,
                msgs: cfg.window_msgs,
                paused: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Spend credit for a frame of `len` bytes if there is enough.
    pub fn try_consume(&self, len: u64) -> Result<bool, FlowError> {
        if len > self.cfg.window_bytes {
            return Err(FlowError::LargerThanWindow {
                len,
                window: self.cfg.window_bytes,
            });
        }
        let mut s = self.state.lock();
        if s.paused || s.bytes < len || s.msgs == 0 {
            return Ok(false);
        }
        s.bytes -= len;
        s.msgs -= 1;
        Ok(true)
    }

    /// Wait until a frame of `len` bytes may be sent, then spend the credit.
    pub async fn consume(&self, len: u64) -> Result<(), FlowError> {
        loop {
            let notified = self.notify.notified();
            if self.try_consume(len)? {
                return Ok(());
            }
            notified.await;
        }
    }

    pub fn on_credits(&self, grant: &Credits) -> Result<(), FlowError> {
        {
            let mut s = self.state.lock();
            let bytes = s.bytes.saturating_add(grant.bytes);
            let msgs = s.msgs.saturating_add(grant.msgs);
            if bytes > self.cfg.window_bytes || msgs > self.cfg.window_msgs {
                return Err(FlowError::ExcessGrant);
            }
            s.bytes = bytes;
            s.msgs = msgs;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn available(&self) -> (u64, u64) {
        let s = self.state.lock();
        (s.bytes, s.msgs)
    }

    pub fn pressure(&self) -> Backpressure {
        let s = self.state.lock();
        if s.paused {
            return Backpressure::Hard;
        }
        classify(&self.cfg, s.bytes, s.msgs)
    }
}

fn classify(cfg: &FlowConfig, bytes: u64, msgs: u64) -> Backpressure {
    let hard = bytes < pct(cfg.window_bytes, cfg.hard_pressure_pct)
        || msgs < pct(cfg.window_msgs, cfg.hard_pressure_pct);
    let soft = bytes < pct(cfg.window_bytes, cfg.soft_pressure_pct)
        || msgs < pct(cfg.window_msgs, cfg.soft_pressure_pct);
    if hard {
        Backpressure::Hard
    } else if soft {
        Backpressure::Soft
    } else {
        Backpressure::Ok
    }
}

// ---------------------------------------------------------------------------
// Receiving side
// ---------------------------------------------------------------------------

/// Credit the peer holds towards us. Owned by the reader task.
#[derive(Debug)]
pub struct RecvWindow {
    cfg: FlowConfig,
    bytes: u64,
    msgs: u64,
    highest_seq: u32,
}

impl RecvWindow {
    pub fn new(cfg: &FlowConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            bytes: cfg.window_bytes,
            msgs: cfg.window_msgs,
            highest_seq: 0,
        }
    }

    /// Charge an inbound frame. Returns a grant to send back once the
    /// window runs low.
    pub fn on_frame(&mut self, len: u64, seq: u32) -> Result<Option<Credits>, FlowError> {
        if len > self.bytes {
            return Err(FlowError::ByteOverrun {
                len,
                remaining: self.bytes,
            });
        }
        if self.msgs == 0 {
            return Err(FlowError::MessageOverrun);
        }
        self.bytes -= len;
        self.msgs -= 1;
        self.highest_seq = self.highest_seq.max(seq);

        let low_bytes = self.bytes < pct(self.cfg.window_bytes, self.cfg.low_watermark_pct);
        let low_msgs = self.msgs < pct(self.cfg.window_msgs, self.cfg.low_watermark_pct);
        if !(low_bytes || low_msgs) {
            return Ok(None);
        }
        let grant = Credits {
            bytes: pct(self.cfg.window_bytes, self.cfg.grant_pct)
                .min(self.cfg.window_bytes - self.bytes),
            msgs: pct(self.cfg.window_msgs, self.cfg.grant_pct)
                .min(self.cfg.window_msgs - self.msgs),
        };
        self.bytes += grant.bytes;
        self.msgs += grant.msgs;
        Ok(Some(grant))
    }

    /// Highest sequence number processed so far.
    pub fn ack(&self) -> Ack {
        Ack {
            seq: self.highest_seq,
        }
    }

    pub fn remaining(&self) -> (u64, u64) {
        (self.bytes, self.msgs)
    }

    pub fn pressure(&self) -> Backpressure {
        classify(&self.cfg, self.bytes, self.msgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> FlowConfig {
        FlowConfig {
            window_bytes: 1_000,
            window_msgs: 100,
            ..FlowConfig::default()
        }
    }

    #[test]
    fn receiver_grants_below_watermark() {
        let mut rx = RecvWindow::new(&small());
        assert_eq!(rx.on_frame(700, 1).unwrap(), None);
        // 300 left, still above 250.
        assert_eq!(rx.on_frame(40, 2).unwrap(), None);
        let grant = rx.on_frame(20, 3).unwrap().unwrap();
        assert_eq!(grant.bytes, 500);
        assert_eq!(rx.remaining().0, 740);
        assert_eq!(rx.ack().seq, 3);
    }

    #[test]
    fn receiver_rejects_overrun() {
        let mut rx = RecvWindow::new(&small());
        assert!(matches!(rx.on_frame(1_001, 1), Err(FlowError::ByteOverrun { .. })));
        assert!(rx.on_frame(1_001, 1).unwrap_err().severity().is_fatal());
    }

    #[test]
    fn sender_spends_and_refills() {
        let tx = SendWindow::new(&small());
        assert!(tx.try_consume(900).unwrap());
        assert!(!tx.try_consume(200).unwrap());
        assert_eq!(tx.pressure(), Backpressure::Soft);
        assert!(tx.try_consume(60).unwrap());
        assert_eq!(tx.pressure(), Backpressure::Hard);
        tx.on_credits(&Credits { bytes: 500, msgs: 2 }).unwrap();
        assert!(tx.try_consume(200).unwrap());
        assert_eq!(
            tx.on_credits(&Credits { bytes: 10_000, msgs: 0 }),
            Err(FlowError::ExcessGrant)
        );
        assert!(matches!(tx.try_consume(5_000), Err(FlowError::LargerThanWindow { .. })));
    }

    #[test]
    fn large_frames_are_charged_at_the_watermark() {
        let cfg = small();
        assert_eq!(cfg.charge(40), 40);
        assert_eq!(cfg.charge(1_000_000), 250);

        let tx = SendWindow::new(&cfg);
        let mut rx = RecvWindow::new(&cfg);
        for seq in 1..=20 {
            let charge = cfg.charge(1_000_000);
            assert!(tx.try_consume(charge).unwrap(), "frame {seq} stalled");
            if let Some(grant) = rx.on_frame(charge, seq).unwrap() {
                tx.on_credits(&grant).unwrap();
            }
        }
    }

    #[test]
    fn pause_blocks_everything() {
        let tx = SendWindow::new(&small());
        tx.pause();
        assert!(!tx.try_consume(1).unwrap());
        assert_eq!(tx.pressure(), Backpressure::Hard);
        tx.resume();
        assert!(tx.try_consume(1).unwrap());
    }

    #[tokio::test]
    async fn blocked_sender_wakes_on_grant() {
        let tx = std::sync::Arc::new(SendWindow::new(&small()));
        assert!(tx.try_consume(1_000).unwrap());
        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.consume(100).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        tx.on_credits(&Credits { bytes: 500, msgs: 1 }).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
