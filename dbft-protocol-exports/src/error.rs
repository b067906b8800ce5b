use displaydoc::Display;
use thiserror::Error;

/// protocol error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum ProtocolError {
    /// channel error: {0}
    ChannelError(String),
    /// models error: {0}
    ModelsError(#[from] dbft_models::ModelsError),
}
