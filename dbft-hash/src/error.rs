use displaydoc::Display;
use thiserror::Error;

/// Hash error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone)]
pub enum DbftHashError {
    /// parsing error: {0}
    ParsingError(String),
}
