use displaydoc::Display;
use thiserror::Error;

/// Signature error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone)]
pub enum DbftSignatureError {
    /// parsing error: {0}
    ParsingError(String),
    /// signature error: {0}
    SignatureError(String),
}
