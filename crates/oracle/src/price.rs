//! Price attestations as exchanged between feeders and relays.
//!
//! The attestation hash is the one checked by on-chain medianizers:
//! `keccak256(val ‖ age ‖ wat)`, each field occupying a 32-byte word.
//! `val` and `age` are big-endian and left-padded, `wat` is right-padded.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message as _;
use sha3::{Digest, Keccak256};

use pricefeed_network::{BoxError, Message};

use crate::error::Error;

pub const PRICE_MESSAGE_VERSION: &str = "1";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Price {
    /// Asset pair, eg. `ETHUSD`
    #[prost(string, tag = "1")]
    pub wat: String,
    /// Price scaled by 10^18, big-endian
    #[prost(bytes = "vec", tag = "2")]
    pub val: Vec<u8>,
    /// Unix timestamp of the observation, in seconds
    #[prost(int64, tag = "3")]
    pub age: i64,
    #[prost(uint32, tag = "4")]
    pub v: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub r: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub s: Vec<u8>,
}

impl Price {
    /// An unsigned price.
    pub fn new(wat: impl Into<String>, value: u128, age: SystemTime) -> Self {
        let bytes = value.to_be_bytes();
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());

        Self {
            wat: wat.into(),
            val: bytes[start..].to_vec(),
            age: age
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs() as i64),
            v: 0,
            r: Vec::new(),
            s: Vec::new(),
        }
    }

    /// The value, if it fits in 128 bits.
    pub fn value(&self) -> Option<u128> {
        let significant = self
            .val
            .iter()
            .position(|b| *b != 0)
            .map_or(&[][..], |start| &self.val[start..]);

        if significant.len() > 16 {
            return None;
        }

        let mut bytes = [0; 16];
        bytes[16 - significant.len()..].copy_from_slice(significant);
        Some(u128::from_be_bytes(bytes))
    }

    /// Observation time, `None` for negative timestamps.
    pub fn time(&self) -> Option<SystemTime> {
        u64::try_from(self.age)
            .ok()
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn is_signed(&self) -> bool {
        !self.r.is_empty() || !self.s.is_empty()
    }

    /// The attestation hash signed by the feeder.
    pub fn hash(&self) -> Result<[u8; 32], Error> {
        if self.val.len() > 32 {
            return Err(Error::ValueTooLarge(self.val.len()));
        }

        if self.wat.len() > 32 {
            return Err(Error::PairTooLong(self.wat.clone()));
        }

        let age = u64::try_from(self.age).map_err(|_| Error::NegativeAge(self.age))?;

        let mut val = [0u8; 32];
        val[32 - self.val.len()..].copy_from_slice(&self.val);

        let mut age_word = [0u8; 32];
        age_word[24..].copy_from_slice(&age.to_be_bytes());

        let mut wat = [0u8; 32];
        wat[..self.wat.len()].copy_from_slice(self.wat.as_bytes());

        let mut hasher = Keccak256::new();
        hasher.update(val);
        hasher.update(age_word);
        hasher.update(wat);

        Ok(hasher.finalize().into())
    }
}

/// Envelope published on the price topic.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PriceMessage {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(message, optional, tag = "2")]
    pub price: Option<Price>,
    /// Source prices the attested value was computed from
    #[prost(btree_map = "string, string", tag = "3")]
    pub trace: BTreeMap<String, String>,
}

impl PriceMessage {
    pub fn new(price: Price) -> Self {
        Self {
            version: PRICE_MESSAGE_VERSION.to_string(),
            price: Some(price),
            trace: BTreeMap::new(),
        }
    }

    pub fn with_trace(mut self, trace: BTreeMap<String, String>) -> Self {
        self.trace = trace;
        self
    }
}

impl Message for PriceMessage {
    fn marshal_binary(&self) -> Result<Vec<u8>, BoxError> {
        Ok(self.encode_to_vec())
    }

    fn unmarshal_binary(bytes: &[u8]) -> Result<Self, BoxError> {
        Ok(Self::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn value_is_minimal_big_endian() {
        let price = Price::new("ETHUSD", 0x0102, UNIX_EPOCH);
        assert_eq!(price.val, vec![0x01, 0x02]);
        assert_eq!(price.value(), Some(0x0102));

        let zero = Price::new("ETHUSD", 0, UNIX_EPOCH);
        assert!(zero.val.is_empty());
        assert_eq!(zero.value(), Some(0));
    }

    #[test]
    fn oversized_value_does_not_fit_u128() {
        let mut price = Price::new("ETHUSD", 1, UNIX_EPOCH);
        price.val = vec![1; 17];
        assert_eq!(price.value(), None);

        price.val = [vec![0; 8], vec![1; 16]].concat();
        assert_eq!(price.value(), Some(u128::from_be_bytes([1; 16])));
    }

    #[test]
    fn hash_packs_three_words() {
        let age = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let price = Price::new("BTCUSD", 42, age);

        let mut packed = [0u8; 96];
        packed[31] = 42;
        packed[56..64].copy_from_slice(&1_700_000_000u64.to_be_bytes());
        packed[64..70].copy_from_slice(b"BTCUSD");

        let expected: [u8; 32] = Keccak256::digest(packed).into();
        assert_eq!(price.hash().unwrap(), expected);
    }

    #[test]
    fn hash_rejects_malformed_fields() {
        let mut price = Price::new("ETHUSD", 1, UNIX_EPOCH);
        price.wat = "X".repeat(33);
        assert!(matches!(price.hash(), Err(Error::PairTooLong(_))));

        let mut price = Price::new("ETHUSD", 1, UNIX_EPOCH);
        price.val = vec![1; 33];
        assert!(matches!(price.hash(), Err(Error::ValueTooLarge(33))));

        let mut price = Price::new("ETHUSD", 1, UNIX_EPOCH);
        price.age = -1;
        assert!(matches!(price.hash(), Err(Error::NegativeAge(-1))));
    }

    #[test]
    fn message_survives_the_wire() {
        let trace = BTreeMap::from([("binance".to_string(), "3000.1".to_string())]);
        let message = PriceMessage::new(Price::new("ETHUSD", 3_000, SystemTime::now()))
            .with_trace(trace);

        let bytes = message.marshal_binary().unwrap();
        let decoded = PriceMessage::unmarshal_binary(&bytes).unwrap();

        assert_eq!(decoded, message);
        assert!(PriceMessage::unmarshal_binary(&[0xff, 0xff, 0xff]).is_err());
    }
}
