//! artpath: disk-backed adaptive radix tree index
//!
//! An index from byte-string keys to sets of row ids with:
//! - Prefix compression through chains of fixed-capacity prefix nodes
//! - Branch nodes that grow and shrink between 4/16/48/256-way fanout
//! - Slab allocators per node kind, with merge and vacuum support
//! - Checkpoint/load through a block store with CRC-checked blocks
//! - Multiple readers / single writer access through [`concurrency::SharedArt`]

pub mod error;
pub mod config;
pub mod storage;
pub mod art;
pub mod concurrency;

pub use crate::art::key::ArtKey;
pub use crate::art::leaf::RowId;
pub use crate::art::node::{NodeHandle, NodeKind};
pub use crate::art::prefix::{Prefix, PrefixSplit, PREFIX_CAPACITY};
pub use crate::art::{Art, ArtStats};
pub use crate::concurrency::SharedArt;
pub use crate::config::{ArtConfig, StoreConfig};
pub use crate::error::{ArtError, Result};
