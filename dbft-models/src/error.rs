use displaydoc::Display;
use thiserror::Error;

/// models result
pub type ModelsResult<T, E = ModelsError> = core::result::Result<T, E>;

/// models error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum ModelsError {
    /// hashing error
    HashError,
    /// Serialization error: {0}
    SerializeError(String),
    /// Deserialization error: {0}
    DeserializeError(String),
    /// dbft_hash error: {0}
    DbftHashError(#[from] dbft_hash::DbftHashError),
    /// signature error: {0}
    SignatureError(#[from] dbft_signature::DbftSignatureError),
    /// amount parse error: {0}
    AmountParseError(String),
    /// checked operation error: {0}
    CheckedOperationError(String),
    /// Time error {0}
    TimeError(#[from] dbft_time::TimeError),
    /// Wrong prefix for hash: expected {0}, got {1}
    WrongPrefix(String, String),
    /// invalid witness: {0}
    InvalidWitness(String),
}

impl From<dbft_serialization::SerializeError> for ModelsError {
    fn from(err: dbft_serialization::SerializeError) -> Self {
        ModelsError::SerializeError(err.to_string())
    }
}
