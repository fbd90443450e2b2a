//! Signed price attestations on top of the gossip transport.
//!
//! Feeders sign prices with a secp256k1 key which also serves as their network
//! identity. Every node checks that a price was signed by its author, that the
//! author is an allowed feeder, and that the price is recent enough.

mod error;
pub use error::Error;

pub mod node;
pub mod price;
pub mod signer;
pub mod validators;

pub use node::{Keys, OracleNode, PRICE_TOPIC};
pub use price::{Price, PriceMessage};
pub use signer::{Address, Signer};
pub use validators::{Authorization, Freshness};
