use crate::error::ProtocolError;
use dbft_models::payload::ConsensusPayload;
use dbft_models::transaction::{Transaction, TransactionId};

/// Trait defining a protocol (network) controller
pub trait ProtocolController: Send + Sync {
    /// broadcast a signed consensus payload to the other validators
    fn send_payload(&self, payload: ConsensusPayload) -> Result<(), ProtocolError>;

    /// ask peers for transactions missing from the local pool
    fn request_transactions(&self, ids: &[TransactionId]) -> Result<(), ProtocolError>;

    /// announce transactions to peers, e.g. after a view change reinjects them
    fn announce_transactions(&self, transactions: &[Transaction]) -> Result<(), ProtocolError>;

    /// Returns a boxed clone of self.
    /// Useful to allow cloning `Box<dyn ProtocolController>`.
    fn clone_box(&self) -> Box<dyn ProtocolController>;
}

/// Allow cloning `Box<dyn ProtocolController>`
/// Uses `ProtocolController::clone_box` internally
impl Clone for Box<dyn ProtocolController> {
    fn clone(&self) -> Box<dyn ProtocolController> {
        self.clone_box()
    }
}
