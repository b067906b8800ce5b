use dbft_models::payload::ConsensusPayload;
use dbft_models::transaction::Transaction;

/// Commands the controller sends to the consensus worker thread.
#[allow(clippy::large_enum_variant)]
#[derive(Clone)]
pub enum ConsensusCommand {
    /// a signed consensus payload arrived from the network
    RegisterPayload(ConsensusPayload),
    /// a transaction arrived, possibly one we requested to complete a proposal
    RegisterTransaction(Transaction),
    /// the ledger advanced outside of our own commits
    BlockPersisted(u64),
    /// stop the worker
    Stop,
}
