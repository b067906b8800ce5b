//! Exports of the ledger interface consumed by consensus.
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

mod controller_traits;
mod error;

pub use controller_traits::LedgerController;
pub use error::LedgerError;
