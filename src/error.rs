use thiserror::Error;

use crate::art::node::NodeKind;

#[derive(Error, Debug)]
pub enum ArtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory: {kind:?} allocator cannot grow beyond {buffers} buffers")]
    OutOfMemory { kind: NodeKind, buffers: usize },

    #[error("Block not found: block_id={0}")]
    BlockNotFound(u64),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Key conflict: {0}")]
    KeyConflict(String),

    #[error("Incompatible merge: {0}")]
    IncompatibleMerge(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ArtError>;
