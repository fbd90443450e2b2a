//! Token bucket admission control for inbound pub-sub messages.
//!
//! Every message is charged against the bucket of the peer that forwarded it and
//! against a global bucket shared by all peers. Both buckets must hold enough
//! tokens for the message to be admitted, otherwise neither is debited.
//!
//! Peer buckets are created full the first time a peer is seen, and removed by a
//! background sweep once they have been idle for longer than it takes to refill
//! them completely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libp2p::PeerId;
use pricefeed_config::RateLimitConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Error;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            rate,
            capacity,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn has(&self, amount: f64) -> bool {
        self.tokens >= amount
    }

    fn take(&mut self, amount: f64) {
        self.tokens -= amount;
    }
}

#[derive(Debug)]
struct PeerBucket {
    bucket: TokenBucket,
    last_seen: Instant,
}

#[derive(Debug)]
struct State {
    global: TokenBucket,
    peers: HashMap<PeerId, PeerBucket>,
}

/// Per-peer and global token bucket rate limiter, measured in bytes.
#[derive(Debug)]
pub struct RateLimiter {
    peer_rate: f64,
    peer_burst: f64,
    state: Mutex<State>,
}

impl RateLimiter {
    /// Create a limiter, all rates are in bytes per second and bursts in bytes.
    pub fn new(
        peer_rate: u64,
        peer_burst: u64,
        global_rate: u64,
        global_burst: u64,
    ) -> Result<Self, Error> {
        if peer_rate == 0 || peer_burst == 0 || global_rate == 0 || global_burst == 0 {
            return Err(Error::InvalidConfig(
                "rate limits must be positive".to_string(),
            ));
        }

        let now = Instant::now();

        Ok(Self {
            peer_rate: peer_rate as f64,
            peer_burst: peer_burst as f64,
            state: Mutex::new(State {
                global: TokenBucket::new(global_rate as f64, global_burst as f64, now),
                peers: HashMap::new(),
            }),
        })
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self, Error> {
        Self::new(
            config.peer_rate.as_u64(),
            config.peer_burst.as_u64(),
            config.global_rate.as_u64(),
            config.global_burst.as_u64(),
        )
    }

    /// How long a peer bucket may stay untouched before it is dropped.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.peer_burst / self.peer_rate)
    }

    /// Admit a message of `size` bytes from `peer`, debiting both buckets.
    pub fn allow(&self, peer: &PeerId, size: usize) -> bool {
        self.allow_at(peer, size, Instant::now())
    }

    pub(crate) fn allow_at(&self, peer: &PeerId, size: usize, now: Instant) -> bool {
        let amount = size as f64;
        let mut state = self.state.lock().expect("poisoned lock");
        let State { global, peers } = &mut *state;

        let peer_bucket = peers.entry(*peer).or_insert_with(|| PeerBucket {
            bucket: TokenBucket::new(self.peer_rate, self.peer_burst, now),
            last_seen: now,
        });

        peer_bucket.last_seen = now;
        peer_bucket.bucket.refill(now);
        global.refill(now);

        if !peer_bucket.bucket.has(amount) {
            trace!(%peer, size, "Peer rate limit exceeded");
            return false;
        }

        if !global.has(amount) {
            trace!(%peer, size, "Global rate limit exceeded");
            return false;
        }

        peer_bucket.bucket.take(amount);
        global.take(amount);

        true
    }

    /// Remove peer buckets that have been idle for longer than [`ttl`](Self::ttl).
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.ttl();
        let mut state = self.state.lock().expect("poisoned lock");

        let before = state.peers.len();
        state
            .peers
            .retain(|_, peer| now.saturating_duration_since(peer.last_seen) <= ttl);

        before - state.peers.len()
    }

    pub fn tracked_peers(&self) -> usize {
        self.state.lock().expect("poisoned lock").peers.len()
    }

    /// Spawn the background sweep, running every [`ttl`](Self::ttl) until `token` is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let period = self.ttl().max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, "Removed idle peer rate limit buckets");
                        }
                    }
                }
            }
        })
    }
}
