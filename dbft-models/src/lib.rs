//! Shared data structures of the consensus node: amounts, addresses,
//! transactions, blocks and signed payload envelopes.
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

/// account addresses
pub mod address;
/// coin amounts with safe arithmetic
pub mod amount;
/// finalized blocks and witnesses
pub mod block;
/// block headers
pub mod block_header;
/// block identifiers
pub mod block_id;
/// models error
pub mod error;
/// merkle root computation
pub mod merkle;
/// signed consensus payload envelopes
pub mod payload;
/// fee-paying transactions
pub mod transaction;

pub use error::{ModelsError, ModelsResult};

#[cfg(test)]
use serde_json as _;
