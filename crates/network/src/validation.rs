use std::fmt;
use std::sync::Arc;

use libp2p::gossipsub::MessageAcceptance;
use libp2p::PeerId;

use crate::message::Message;

/// Outcome of validating an inbound message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValidationResult {
    /// Deliver and propagate the message
    Accept,
    /// Drop the message and penalize the peer that sent it
    Reject,
    /// Drop the message without penalizing anyone
    Ignore,
}

impl ValidationResult {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ValidationResult> for MessageAcceptance {
    fn from(result: ValidationResult) -> Self {
        match result {
            ValidationResult::Accept => MessageAcceptance::Accept,
            ValidationResult::Reject => MessageAcceptance::Reject,
            ValidationResult::Ignore => MessageAcceptance::Ignore,
        }
    }
}

/// A predicate run against every decoded inbound message.
///
/// `peer` is the author of the message.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, topic: &str, peer: &PeerId, message: &dyn Message) -> ValidationResult;
}

impl<F> Validator for F
where
    F: Fn(&str, &PeerId, &dyn Message) -> ValidationResult + Send + Sync + 'static,
{
    fn validate(&self, topic: &str, peer: &PeerId, message: &dyn Message) -> ValidationResult {
        self(topic, peer, message)
    }
}

/// Ordered list of validators.
///
/// The first validator that does not accept decides the outcome, the ones after it are not run.
/// An empty chain accepts everything.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorChain {
    pub fn new(validators: Vec<Arc<dyn Validator>>) -> Self {
        Self { validators }
    }

    pub fn push(&mut self, validator: Arc<dyn Validator>) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validate(&self, topic: &str, peer: &PeerId, message: &dyn Message) -> ValidationResult {
        for validator in &self.validators {
            let result = validator.validate(topic, peer, message);
            if !result.is_accept() {
                return result;
            }
        }

        ValidationResult::Accept
    }
}

impl fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorChain")
            .field("len", &self.validators.len())
            .finish()
    }
}
