//! Crate-level error type aggregating every layer's failure modes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] crate::header::FormatError),
    #[error(transparent)]
    PartitionTable(#[from] crate::disk::PartitionTableError),
    #[error(transparent)]
    Compression(#[from] crate::compress::CompressionError),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error(transparent)]
    Block(#[from] crate::block::BlockError),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
    #[error(transparent)]
    Chain(#[from] crate::set::ChainIntegrityError),
    #[error(transparent)]
    Set(#[from] crate::set::SetError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Consolidation(#[from] crate::consolidate::ConsolidationError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
