use dbft_models::amount::Amount;
use dbft_time::DbftTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Consensus configuration.
///
/// The committee size fixes the fault tolerance: with `n` validators the
/// protocol tolerates `f = (n - 1) / 3` faulty ones and requires a quorum of
/// `n - f` matching messages.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsensusConfig {
    /// network identifier mixed into every signed hash
    pub chain_id: u64,
    /// number of validators in the committee
    pub validators_count: u8,
    /// target interval between blocks
    pub block_interval: DbftTime,
    /// maximum total size of transactions in a block, in bytes
    pub max_block_size: u32,
    /// maximum cumulated system fee of transactions in a block
    pub max_block_system_fee: Amount,
    /// maximum number of transactions in a block
    pub max_transactions_per_block: u32,
    /// maximum size of a single transaction payload, in bytes
    pub max_transaction_payload_size: u32,
    /// directory where consensus state is persisted before committing
    pub recovery_log_path: PathBuf,
    /// skip loading recovery logs on startup
    pub ignore_recovery_logs: bool,
}

impl ConsensusConfig {
    /// number of faulty validators the committee tolerates
    pub fn max_faulty(&self) -> u8 {
        (self.validators_count - 1) / 3
    }

    /// number of matching messages needed to make progress
    pub fn quorum(&self) -> u8 {
        self.validators_count - self.max_faulty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_validators(validators_count: u8) -> ConsensusConfig {
        ConsensusConfig {
            chain_id: 0,
            validators_count,
            block_interval: DbftTime::from_millis(1000),
            max_block_size: 1 << 20,
            max_block_system_fee: Amount::from_raw(u64::MAX),
            max_transactions_per_block: 512,
            max_transaction_payload_size: 1 << 16,
            recovery_log_path: PathBuf::new(),
            ignore_recovery_logs: false,
        }
    }

    #[test]
    fn test_fault_tolerance_thresholds() {
        let config = config_with_validators(7);
        assert_eq!(config.max_faulty(), 2);
        assert_eq!(config.quorum(), 5);

        let config = config_with_validators(4);
        assert_eq!(config.max_faulty(), 1);
        assert_eq!(config.quorum(), 3);

        let config = config_with_validators(1);
        assert_eq!(config.max_faulty(), 0);
        assert_eq!(config.quorum(), 1);
    }
}
