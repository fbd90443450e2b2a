//! Admission rules for price messages.
//!
//! Messages of other types are accepted untouched by both validators.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pricefeed_network::{Message, PeerId, ValidationResult, Validator};
use tracing::{debug, trace, warn};

use crate::price::PriceMessage;
use crate::signer::{recover, Address};

/// Prices younger than this are forwarded.
pub const FRESH_FOR: Duration = Duration::from_secs(5 * 60);

/// Prices older than this are considered misbehaviour.
pub const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Only lets through prices signed by an allowed feeder, and published by that same feeder.
#[derive(Clone, Debug, Default)]
pub struct Authorization {
    feeders: HashSet<Address>,
}

impl Authorization {
    pub fn new(feeders: impl IntoIterator<Item = Address>) -> Self {
        Self {
            feeders: feeders.into_iter().collect(),
        }
    }

    pub fn is_feeder(&self, address: &Address) -> bool {
        self.feeders.contains(address)
    }
}

impl Validator for Authorization {
    fn validate(&self, topic: &str, peer: &PeerId, message: &dyn Message) -> ValidationResult {
        let Some(message) = message.downcast_ref::<PriceMessage>() else {
            return ValidationResult::Accept;
        };

        let Some(price) = &message.price else {
            warn!(%topic, %peer, "Price message without a price");
            return ValidationResult::Reject;
        };

        let signer = match recover(price) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(%topic, %peer, pair = %price.wat, "Cannot recover price signer: {e}");
                return ValidationResult::Reject;
            }
        };

        let author = match Address::from_peer_id(peer) {
            Ok(author) => author,
            Err(e) => {
                warn!(%topic, %peer, %signer, pair = %price.wat, "Unusable author key: {e}");
                return ValidationResult::Reject;
            }
        };

        if signer != author {
            warn!(
                %topic, %peer, %signer, %author, pair = %price.wat,
                "Price signed by another key than its author's"
            );
            return ValidationResult::Reject;
        }

        if !self.is_feeder(&signer) {
            debug!(%topic, %peer, %signer, pair = %price.wat, "Price from unknown feeder");
            return ValidationResult::Ignore;
        }

        trace!(%topic, %peer, %signer, pair = %price.wat, "Price authorized");
        ValidationResult::Accept
    }
}

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Accepts recent prices, ignores slightly stale ones and rejects old ones.
#[derive(Clone)]
pub struct Freshness {
    clock: Clock,
}

impl Freshness {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemTime::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }

    /// Verdict for a price observed `age` ago.
    pub fn verdict(age: Duration) -> ValidationResult {
        if age <= FRESH_FOR {
            ValidationResult::Accept
        } else if age <= STALE_AFTER {
            ValidationResult::Ignore
        } else {
            ValidationResult::Reject
        }
    }
}

impl Default for Freshness {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for Freshness {
    fn validate(&self, topic: &str, peer: &PeerId, message: &dyn Message) -> ValidationResult {
        let Some(message) = message.downcast_ref::<PriceMessage>() else {
            return ValidationResult::Accept;
        };

        let Some(price) = &message.price else {
            warn!(%topic, %peer, "Price message without a price");
            return ValidationResult::Reject;
        };

        let Some(observed) = price.time() else {
            warn!(%topic, %peer, pair = %price.wat, age = price.age, "Negative price timestamp");
            return ValidationResult::Reject;
        };

        // Prices from the future count as brand new
        let age = (self.clock)()
            .duration_since(observed)
            .unwrap_or(Duration::ZERO);

        let result = Self::verdict(age);
        let value = price.value();

        match result {
            ValidationResult::Accept => {
                trace!(%topic, %peer, pair = %price.wat, ?age, ?value, "Fresh price")
            }
            ValidationResult::Ignore => {
                debug!(%topic, %peer, pair = %price.wat, ?age, ?value, "Stale price")
            }
            ValidationResult::Reject => {
                warn!(%topic, %peer, pair = %price.wat, ?age, ?value, "Expired price")
            }
        }

        result
    }
}

impl std::fmt::Debug for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Freshness").finish_non_exhaustive()
    }
}
