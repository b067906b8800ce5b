use displaydoc::Display;
use thiserror::Error;

/// Time error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    /// time overflow error
    TimeOverflowError,
    /// time conversion error
    ConversionError,
    /// checked operation error: {0}
    CheckedOperationError(String),
}
