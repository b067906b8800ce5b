use dbft_models::block_id::BlockId;

/// Events that are emitted by consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// probable desync detected, the ledger lags behind the rest of the committee
    NeedSync {
        /// index of the next block this node expects to build
        current_index: u64,
        /// higher block index observed in a message from another validator
        observed_index: u64,
    },
    /// a block reached commit quorum and was persisted
    BlockFinalized {
        /// height of the finalized block
        index: u64,
        /// id of the finalized block
        block_id: BlockId,
    },
}
