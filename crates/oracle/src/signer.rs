use core::fmt;
use std::path::Path;
use std::str::FromStr;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use libp2p::identity::{self, Keypair};
use libp2p::PeerId;
use sha3::{Digest, Keccak256};

use crate::error::Error;
use crate::price::Price;

const ETHEREUM_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Multihash code of peer ids that inline their public key.
const IDENTITY_MULTIHASH: u8 = 0x00;

/// An Ethereum-style account address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Last 20 bytes of the keccak256 of the uncompressed public key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let hash = Keccak256::digest(&point.as_bytes()[1..]);

        let mut bytes = [0; 20];
        bytes.copy_from_slice(&hash[12..]);
        Self(bytes)
    }

    /// Address of the secp256k1 key identifying `peer`.
    pub fn from_peer_id(peer: &PeerId) -> Result<Self, Error> {
        // Small keys are inlined: <code> <length> <protobuf encoded key>
        let bytes = peer.to_bytes();
        let encoded = match bytes.as_slice() {
            [IDENTITY_MULTIHASH, len, key @ ..] if usize::from(*len) == key.len() => key,
            _ => return Err(Error::NotSecp256k1(*peer)),
        };

        let public = identity::PublicKey::try_decode_protobuf(encoded)
            .map_err(|_| Error::NotSecp256k1(*peer))?
            .try_into_secp256k1()
            .map_err(|_| Error::NotSecp256k1(*peer))?;

        let key = VerifyingKey::from_sec1_bytes(&public.to_bytes())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        Ok(Self::from_verifying_key(&key))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);

        let mut bytes = [0; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;

        Ok(Self(bytes))
    }
}

/// Digest actually signed: the attestation hash under the Ethereum signed-message prefix.
fn signing_digest(price: &Price) -> Result<[u8; 32], Error> {
    let mut hasher = Keccak256::new();
    hasher.update(ETHEREUM_MESSAGE_PREFIX);
    hasher.update(price.hash()?);

    Ok(hasher.finalize().into())
}

/// Recover the address that signed `price`.
pub fn recover(price: &Price) -> Result<Address, Error> {
    if price.r.len() != 32 || price.s.len() != 32 {
        return Err(Error::MalformedSignature);
    }

    // Both the legacy 27/28 and the raw 0/1 encodings are in use
    let v = match price.v {
        27 | 28 => price.v - 27,
        0 | 1 => price.v,
        _ => return Err(Error::MalformedSignature),
    };

    let recovery_id = RecoveryId::from_byte(v as u8).ok_or(Error::MalformedSignature)?;

    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(&price.r);
    rs[32..].copy_from_slice(&price.s);
    let signature = Signature::from_slice(&rs).map_err(|_| Error::MalformedSignature)?;

    let digest = signing_digest(price)?;
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|e| Error::Recovery(e.to_string()))?;

    Ok(Address::from_verifying_key(&key))
}

/// Signs prices with a secp256k1 key, the same key giving the node its network identity.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
    address: Address,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        let address = Address::from_verifying_key(key.verifying_key());
        Self { key, address }
    }

    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut rand::rngs::OsRng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        SigningKey::from_slice(bytes)
            .map(Self::new)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// Load a hex-encoded secret key.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadKeyFile {
            path: path.to_path_buf(),
            source,
        })?;

        let bytes = hex::decode(contents.trim().trim_start_matches("0x"))
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        Self::from_bytes(&bytes)
    }

    /// Store the secret key hex-encoded, as read by [`Signer::from_file`].
    pub fn write_file(&self, path: &Path) -> Result<(), Error> {
        std::fs::write(path, hex::encode(self.key.to_bytes())).map_err(|source| {
            Error::WriteKeyFile {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Network identity derived from the signing key.
    pub fn keypair(&self) -> Result<Keypair, Error> {
        let secret = identity::secp256k1::SecretKey::try_from_bytes(self.key.to_bytes())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        Ok(identity::secp256k1::Keypair::from(secret).into())
    }

    pub fn peer_id(&self) -> Result<PeerId, Error> {
        Ok(self.keypair()?.public().to_peer_id())
    }

    /// Fill in the signature fields of `price`.
    pub fn sign(&self, price: &mut Price) -> Result<(), Error> {
        let digest = signing_digest(price)?;

        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| Error::Signing(e.to_string()))?;

        let rs = signature.to_bytes();
        price.r = rs[..32].to_vec();
        price.s = rs[32..].to_vec();
        price.v = 27 + u32::from(recovery_id.to_byte());

        Ok(())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn address_parses_with_or_without_prefix() {
        let addr: Address = "0x2d800d93b065ce011af83f316cef9f0d005b0aa4".parse().unwrap();
        let bare: Address = "2d800d93b065ce011af83f316cef9f0d005b0aa4".parse().unwrap();

        assert_eq!(addr, bare);
        assert_eq!(addr.to_string(), "0x2d800d93b065ce011af83f316cef9f0d005b0aa4");
        assert!("0x2d80".parse::<Address>().is_err());
        assert!("not an address".parse::<Address>().is_err());
    }

    #[test]
    fn known_key_has_known_address() {
        // Private key 1 is the generator point
        let mut secret = [0u8; 32];
        secret[31] = 1;

        let signer = Signer::from_bytes(&secret).unwrap();
        assert_eq!(
            signer.address().to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn signature_recovers_signer() {
        let signer = Signer::random();
        let mut price = Price::new("ETHUSD", 3_000, SystemTime::now());

        signer.sign(&mut price).unwrap();
        assert!(price.is_signed());
        assert!(price.v == 27 || price.v == 28);
        assert_eq!(recover(&price).unwrap(), signer.address());

        // Raw recovery ids are accepted too
        price.v -= 27;
        assert_eq!(recover(&price).unwrap(), signer.address());
    }

    #[test]
    fn tampered_price_recovers_someone_else() {
        let signer = Signer::random();
        let mut price = Price::new("ETHUSD", 3_000, SystemTime::now());
        signer.sign(&mut price).unwrap();

        price.wat = "BTCUSD".to_string();

        match recover(&price) {
            Ok(address) => assert_ne!(address, signer.address()),
            Err(Error::Recovery(_)) => (),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn malformed_signature_is_refused() {
        let mut price = Price::new("ETHUSD", 3_000, SystemTime::now());
        assert!(matches!(recover(&price), Err(Error::MalformedSignature)));

        Signer::random().sign(&mut price).unwrap();
        price.v = 35;
        assert!(matches!(recover(&price), Err(Error::MalformedSignature)));
    }

    #[test]
    fn network_identity_matches_signing_address() {
        let signer = Signer::random();
        let peer_id = signer.peer_id().unwrap();

        assert_eq!(Address::from_peer_id(&peer_id).unwrap(), signer.address());
    }

    #[test]
    fn ed25519_peer_has_no_address() {
        let peer_id = Keypair::generate_ed25519().public().to_peer_id();

        assert!(matches!(
            Address::from_peer_id(&peer_id),
            Err(Error::NotSecp256k1(_))
        ));
    }

    #[test]
    fn key_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeder.key");

        let signer = Signer::random();
        signer.write_file(&path).unwrap();

        assert_eq!(Signer::from_file(&path).unwrap().address(), signer.address());
        assert!(matches!(
            Signer::from_file(&dir.path().join("missing.key")),
            Err(Error::ReadKeyFile { .. })
        ));
    }
}
