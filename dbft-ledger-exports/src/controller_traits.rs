use crate::error::LedgerError;
use dbft_models::address::Address;
use dbft_models::amount::Amount;
use dbft_models::block::Block;
use dbft_models::block_header::BlockHeader;
use dbft_models::block_id::BlockId;
use dbft_models::transaction::TransactionId;
use dbft_signature::PublicKey;

/// Trait defining a ledger controller
pub trait LedgerController: Send + Sync {
    /// index of the last persisted block
    fn current_index(&self) -> u64;

    /// id of the last persisted block
    fn current_hash(&self) -> BlockId;

    /// header of a persisted block, if known
    fn get_header(&self, index: u64) -> Option<BlockHeader>;

    /// validator set in charge of producing the next block, in committee order
    fn next_block_validators(&self) -> Vec<PublicKey>;

    /// true if the validator set changes with the next block
    fn validators_changed(&self) -> bool;

    /// true if the transaction is already persisted on chain
    fn contains_transaction(&self, id: &TransactionId) -> bool;

    /// spendable balance of an account
    fn get_balance(&self, address: &Address) -> Amount;

    /// append a finalized block to the chain
    fn persist_block(&mut self, block: Block) -> Result<(), LedgerError>;

    /// Returns a boxed clone of self.
    /// Useful to allow cloning `Box<dyn LedgerController>`.
    fn clone_box(&self) -> Box<dyn LedgerController>;
}

/// Allow cloning `Box<dyn LedgerController>`
/// Uses `LedgerController::clone_box` internally
impl Clone for Box<dyn LedgerController> {
    fn clone(&self) -> Box<dyn LedgerController> {
        self.clone_box()
    }
}
