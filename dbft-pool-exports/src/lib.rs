//! Exports of the transaction pool interface consumed by consensus.
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

mod controller_traits;

pub use controller_traits::PoolController;
