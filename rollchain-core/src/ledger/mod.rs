//! Append-only, hash-linked ledger
//!
//! Blocks are numbered from 1 without gaps and each block's `previous_hash`
//! is the hash of the block before it. The only writer entry point is
//! [`LedgerEngine::append`], an optimistic insert-if-absent loop that stays
//! correct when many claims race for the next block number.

pub mod audit;
pub mod engine;
pub mod hasher;

pub use audit::{orphaned_blocks, verify_chain, ChainBreak, ChainReport};
pub use engine::LedgerEngine;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Every attempt found its block number already taken
    #[error("Ledger contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Ledger payload could not be serialized")]
    Payload {
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
