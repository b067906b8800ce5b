use dbft_models::transaction::{Transaction, TransactionId};

/// Trait defining a transaction pool controller
pub trait PoolController: Send + Sync {
    /// verified transactions sorted by decreasing fee priority
    fn get_sorted_verified_transactions(&self) -> Vec<Transaction>;

    /// verified transactions in arbitrary order
    fn get_verified_transactions(&self) -> Vec<Transaction>;

    /// look up a verified transaction by id
    fn try_get(&self, id: &TransactionId) -> Option<Transaction>;

    /// add transactions back to the pool, e.g. after a failed proposal
    fn add_transactions(&mut self, transactions: Vec<Transaction>);

    /// Returns a boxed clone of self.
    /// Useful to allow cloning `Box<dyn PoolController>`.
    fn clone_box(&self) -> Box<dyn PoolController>;
}

/// Allow cloning `Box<dyn PoolController>`
/// Uses `PoolController::clone_box` internally
impl Clone for Box<dyn PoolController> {
    fn clone(&self) -> Box<dyn PoolController> {
        self.clone_box()
    }
}
