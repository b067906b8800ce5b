//! blake3 hashing wrapper used across the workspace
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

mod error;
mod hash;
mod settings;

pub use error::DbftHashError;
pub use hash::{Hash, HashDeserializer};
pub use settings::HASH_SIZE_BYTES;

#[cfg(test)]
use serde_json as _;
