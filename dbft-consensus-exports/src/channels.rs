use std::sync::Arc;

use dbft_channel::DbftSender;
use dbft_ledger_exports::LedgerController;
use dbft_pool_exports::PoolController;
use dbft_protocol_exports::ProtocolController;
use dbft_time::Clock;
use dbft_wallet::Wallet;

use crate::events::ConsensusEvent;

/// Contains the controllers the consensus worker depends on and a channel
/// to emit consensus events.
#[derive(Clone)]
pub struct ConsensusChannels {
    /// ledger the decided blocks are appended to
    pub ledger_controller: Box<dyn LedgerController>,
    /// transaction pool proposals are drawn from
    pub pool_controller: Box<dyn PoolController>,
    /// network access used to broadcast payloads
    pub protocol_controller: Box<dyn ProtocolController>,
    /// wallet holding this node's validator key, if any
    pub wallet: Arc<Wallet>,
    /// time source, swappable in tests
    pub clock: Arc<dyn Clock>,
    /// channel used to emit consensus events
    pub controller_event_tx: DbftSender<ConsensusEvent>,
}
