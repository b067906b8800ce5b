use dbft_models::address::Address;
use displaydoc::Display;
use thiserror::Error;

/// wallet error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum WalletError {
    /// IO error: {0}
    IOError(#[from] std::io::Error),
    /// JSON error: {0}
    JSONError(#[from] serde_json::Error),
    /// Models error: {0}
    ModelsError(#[from] dbft_models::ModelsError),
    /// signature error: {0}
    SignatureError(#[from] dbft_signature::DbftSignatureError),
    /// Missing key error: {0}
    MissingKeyError(Address),
}
