use dbft_channel::DbftSender;
use dbft_consensus_exports::{ConsensusController, ConsensusError};
use dbft_models::payload::ConsensusPayload;
use dbft_models::transaction::Transaction;

use crate::commands::ConsensusCommand;

/// Sends commands to the consensus worker through a channel.
///
/// Commands are processed asynchronously by the worker thread so callers
/// never block on consensus logic.
#[derive(Clone)]
pub struct ConsensusControllerImpl {
    command_sender: DbftSender<ConsensusCommand>,
}

impl ConsensusControllerImpl {
    pub fn new(command_sender: DbftSender<ConsensusCommand>) -> Self {
        Self { command_sender }
    }
}

impl ConsensusController for ConsensusControllerImpl {
    fn register_payload(&self, payload: ConsensusPayload) -> Result<(), ConsensusError> {
        self.command_sender
            .send(ConsensusCommand::RegisterPayload(payload))
            .map_err(|err| ConsensusError::ChannelError(err.to_string()))
    }

    fn register_transaction(&self, transaction: Transaction) -> Result<(), ConsensusError> {
        self.command_sender
            .send(ConsensusCommand::RegisterTransaction(transaction))
            .map_err(|err| ConsensusError::ChannelError(err.to_string()))
    }

    fn notify_block_persisted(&self, index: u64) -> Result<(), ConsensusError> {
        self.command_sender
            .send(ConsensusCommand::BlockPersisted(index))
            .map_err(|err| ConsensusError::ChannelError(err.to_string()))
    }

    fn clone_box(&self) -> Box<dyn ConsensusController> {
        Box::new(self.clone())
    }
}
