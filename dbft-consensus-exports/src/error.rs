use displaydoc::Display;
use dbft_ledger_exports::LedgerError;
use dbft_models::error::ModelsError;
use dbft_protocol_exports::ProtocolError;
use dbft_serialization::SerializeError;
use dbft_signature::DbftSignatureError;
use dbft_time::TimeError;
use thiserror::Error;

/// Consensus result
pub type ConsensusResult<T, E = ConsensusError> = core::result::Result<T, E>;

/// Consensus error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum ConsensusError {
    /// models error: {0}
    ModelsError(#[from] ModelsError),
    /// ledger error: {0}
    LedgerError(#[from] LedgerError),
    /// protocol error: {0}
    ProtocolError(#[from] ProtocolError),
    /// time error: {0}
    TimeError(#[from] TimeError),
    /// wallet error: {0}
    WalletError(#[from] dbft_wallet::WalletError),
    /// signature error: {0}
    SignatureError(#[from] DbftSignatureError),
    /// serialization error: {0}
    SerializeError(#[from] SerializeError),
    /// io error: {0}
    IOError(#[from] std::io::Error),
    /// serde error: {0}
    SerdeError(#[from] serde_json::Error),
    /// channel error: {0}
    ChannelError(String),
    /// invalid message: {0}
    InvalidMessage(String),
    /// there was an inconsistency between containers: {0}
    ContainerInconsistency(String),
    /// this node is not a validator for the current height
    NotAValidator,
}
