//! # Sampled Heavy Checks
//!
//! Full verification (proof checking, signature verification against state)
//! is too expensive to run on every gossip message, so a random subset is
//! handed to a [`HeavyVerifier`] on a bounded pool. The message has already
//! been forwarded by then; the verdict only moves the sender's score.
//!
//! Peers with a negative score are sampled four times as often as the base
//! rate, peers well above zero four times less.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tracing::trace;

use crate::gossip::Topic;
use crate::types::{Hash32, PeerId};

/// Scores above this count as trusted for sampling purposes.
const TRUSTED_SCORE: f64 = 20.0;

/// External verification of a gossip payload. Only pass/fail is consumed.
#[async_trait]
pub trait HeavyVerifier: Send + Sync + 'static {
    async fn verify(&self, topic: Topic, data: &[u8]) -> bool;
}

/// Outcome of one heavy check, delivered back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleResult {
    pub peer: PeerId,
    pub topic: Topic,
    pub id: Hash32,
    pub passed: bool,
}

pub struct SamplingPool {
    verifier: Arc<dyn HeavyVerifier>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    results: mpsc::Sender<SampleResult>,
    base_rate: u32,
    dispatched: AtomicU64,
    skipped: AtomicU64,
}

impl SamplingPool {
    /// Build a pool and the receiver its results arrive on.
    pub fn new(
        verifier: Arc<dyn HeavyVerifier>,
        concurrency: usize,
        queue: usize,
        base_rate: u32,
    ) -> (Self, mpsc::Receiver<SampleResult>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let concurrency = concurrency.max(1);
        let pool = Self {
            verifier,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            results: tx,
            base_rate: base_rate.max(1),
            dispatched: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        };
        (pool, rx)
    }

    /// One-in-N sampling rate for a peer with `score`.
    pub fn rate_for(&self, score: f64) -> u32 {
        if score < 0.0 {
            (self.base_rate / 4).max(1)
        } else if score > TRUSTED_SCORE {
            self.base_rate.saturating_mul(4)
        } else {
            self.base_rate
        }
    }

    pub fn should_sample(&self, score: f64) -> bool {
        let rate = self.rate_for(score);
        rate <= 1 || rand::thread_rng().gen_range(0..rate) == 0
    }

    /// Start a heavy check if a permit is free. Returns `false` when the
    /// pool is saturated; the message then simply goes unsampled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, peer: PeerId, topic: Topic, id: Hash32, data: Vec<u8>) -> bool {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let verifier = Arc::clone(&self.verifier);
        let results = self.results.clone();
        tokio::spawn(async move {
            let passed = verifier.verify(topic, &data).await;
            drop(permit);
            trace!(peer = %peer.short(), topic = %topic, passed, "heavy check done");
            let _ = results
                .send(SampleResult {
                    peer,
                    topic,
                    id,
                    passed,
                })
                .await;
        });
        true
    }

    /// Heavy checks currently running.
    pub fn in_flight(&self) -> usize {
        self.concurrency
            .saturating_sub(self.permits.available_permits())
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RejectOdd;

    #[async_trait]
    impl HeavyVerifier for RejectOdd {
        async fn verify(&self, _topic: Topic, data: &[u8]) -> bool {
            data.first().is_some_and(|b| b % 2 == 0)
        }
    }

    struct Stall(tokio::sync::Notify);

    #[async_trait]
    impl HeavyVerifier for Stall {
        async fn verify(&self, _topic: Topic, _data: &[u8]) -> bool {
            self.0.notified().await;
            true
        }
    }

    fn pool(
        verifier: Arc<dyn HeavyVerifier>,
        concurrency: usize,
    ) -> (SamplingPool, mpsc::Receiver<SampleResult>) {
        SamplingPool::new(verifier, concurrency, 16, 16)
    }

    #[test]
    fn rate_tracks_score() {
        let (p, _rx) = pool(Arc::new(RejectOdd), 1);
        assert_eq!(p.rate_for(0.0), 16);
        assert_eq!(p.rate_for(-1.0), 4);
        assert_eq!(p.rate_for(50.0), 64);
    }

    #[tokio::test]
    async fn results_flow_back_through_the_channel() {
        let (p, mut rx) = pool(Arc::new(RejectOdd), 2);
        let peer = PeerId([1; 32]);
        assert!(p.dispatch(peer, Topic::Tx, Hash32([2; 32]), vec![2]));
        assert!(p.dispatch(peer, Topic::Tx, Hash32([3; 32]), vec![3]));
        let mut got = vec![
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
        ];
        got.sort_by_key(|r| r.id);
        assert!(got[0].passed);
        assert!(!got[1].passed);
        assert_eq!(p.dispatched(), 2);
    }

    #[tokio::test]
    async fn saturated_pool_skips() {
        let stall = Arc::new(Stall(tokio::sync::Notify::new()));
        let (p, mut rx) = pool(stall.clone(), 1);
        let peer = PeerId([1; 32]);
        assert!(p.dispatch(peer, Topic::Shares, Hash32([1; 32]), vec![]));
        assert_eq!(p.in_flight(), 1);
        assert!(!p.dispatch(peer, Topic::Shares, Hash32([2; 32]), vec![]));
        assert_eq!(p.skipped(), 1);
        stall.0.notify_one();
        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(result.passed);
        assert_eq!(p.in_flight(), 0);
    }
}
