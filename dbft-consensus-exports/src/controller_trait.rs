use crate::error::ConsensusError;
use dbft_models::payload::ConsensusPayload;
use dbft_models::transaction::Transaction;

/// Trait defining the interface of the consensus controller
pub trait ConsensusController: Send + Sync {
    /// feed a signed consensus payload received from the network
    fn register_payload(&self, payload: ConsensusPayload) -> Result<(), ConsensusError>;

    /// feed a transaction received from the network, e.g. one that was
    /// previously requested to complete a proposal
    fn register_transaction(&self, transaction: Transaction) -> Result<(), ConsensusError>;

    /// notify consensus that the ledger advanced outside of its own commits
    fn notify_block_persisted(&self, index: u64) -> Result<(), ConsensusError>;

    /// Returns a boxed clone of self.
    /// Useful to allow cloning `Box<dyn ConsensusController>`.
    fn clone_box(&self) -> Box<dyn ConsensusController>;
}

/// Allow cloning `Box<dyn ConsensusController>`
/// Uses `ConsensusController::clone_box` internally
impl Clone for Box<dyn ConsensusController> {
    fn clone(&self) -> Box<dyn ConsensusController> {
        self.clone_box()
    }
}

/// Trait defining the interface of the consensus manager
pub trait ConsensusManager {
    /// stop the consensus worker and join its thread
    fn stop(&mut self);
}
