use dbft_channel::DbftSender;
use dbft_consensus_exports::ConsensusManager;
use std::thread::JoinHandle;
use tracing::log::info;

use crate::commands::ConsensusCommand;

pub struct ConsensusManagerImpl {
    pub consensus_thread: Option<(DbftSender<ConsensusCommand>, JoinHandle<()>)>,
}

impl ConsensusManager for ConsensusManagerImpl {
    fn stop(&mut self) {
        info!("stopping consensus worker...");
        if let Some((tx, join_handle)) = self.consensus_thread.take() {
            let _ = tx.send(ConsensusCommand::Stop);
            drop(tx);
            join_handle
                .join()
                .expect("consensus thread panicked on try to join");
        }
        info!("consensus worker stopped");
    }
}
