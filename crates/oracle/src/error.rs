use std::path::PathBuf;

use libp2p::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid secp256k1 key: {0}")]
    InvalidKey(String),

    #[error("invalid feeder address {0:?}")]
    InvalidAddress(String),

    #[error("asset pair {0:?} does not fit in 32 bytes")]
    PairTooLong(String),

    #[error("price value is {0} bytes long, at most 32 are allowed")]
    ValueTooLarge(usize),

    #[error("price timestamp {0} is negative")]
    NegativeAge(i64),

    #[error("malformed price signature")]
    MalformedSignature,

    #[error("cannot recover signer: {0}")]
    Recovery(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("peer {0} is not identified by a secp256k1 key")]
    NotSecp256k1(PeerId),

    #[error("a signing key is required to publish prices")]
    MissingSigner,

    #[error("cannot read key file {path}: {source}")]
    ReadKeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write key file {path}: {source}")]
    WriteKeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Network(#[from] pricefeed_network::Error),
}
