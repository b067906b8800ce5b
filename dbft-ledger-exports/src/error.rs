use displaydoc::Display;
use thiserror::Error;

/// ledger error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum LedgerError {
    /// container inconsistency: {0}
    ContainerInconsistency(String),
    /// models error: {0}
    ModelsError(#[from] dbft_models::ModelsError),
    /// block at index {0} does not extend the current chain
    InvalidBlockIndex(u64),
}
