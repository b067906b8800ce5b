//! Worker construction and startup.

use super::ConsensusWorker;
use crate::commands::ConsensusCommand;
use crate::context::ConsensusContext;
use dbft_channel::DbftReceiver;
use dbft_consensus_exports::error::ConsensusError;
use dbft_consensus_exports::{ConsensusChannels, ConsensusConfig};
use dbft_models::transaction::Transaction;
use dbft_pool_exports::PoolController;
use dbft_time::Clock;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::log::info;

impl ConsensusWorker {
    pub(crate) fn new(
        config: ConsensusConfig,
        channels: ConsensusChannels,
        command_receiver: DbftReceiver<ConsensusCommand>,
    ) -> Self {
        let context = ConsensusContext::new(
            config.clone(),
            channels.ledger_controller.clone(),
            channels.wallet.clone(),
        );
        Self {
            config,
            channels,
            command_receiver,
            context,
            timer_deadline: Instant::now() + Duration::from_secs(u32::MAX as u64),
            timer_height: 0,
            timer_view: 0,
            known_payloads: HashSet::new(),
            is_recovering: false,
        }
    }

    /// Prepares the context for the next block and, when a recovery log shows
    /// this node already committed at this height, resumes that commitment.
    pub(crate) fn on_start(&mut self) -> Result<(), ConsensusError> {
        self.context.reset(0);
        let mut restored = false;
        if !self.config.ignore_recovery_logs {
            if let Some(snapshot) = self.context.load() {
                if snapshot.block_index == self.context.block_index {
                    info!(
                        "resuming consensus for block {} from recovery log",
                        snapshot.block_index
                    );
                    self.context.restore(snapshot)?;
                    restored = true;
                    // a restart emptied the pool, the recovered proposal
                    // transactions refill it
                    let recovered: Vec<Transaction> =
                        self.context.transactions.values().cloned().collect();
                    if !recovered.is_empty() {
                        self.channels.pool_controller.add_transactions(recovered);
                    }
                }
            }
        }
        info!(
            "starting consensus for block {} as {}",
            self.context.block_index,
            match self.context.my_index {
                Some(index) => format!("validator {}", index),
                None => "an observer".to_string(),
            }
        );
        if restored && self.context.commit_sent() {
            // a commitment survives restarts, replay it to the committee
            let stored = self.context.make_recovery_message()?;
            self.send_payload(&stored)?;
            self.check_preparations()?;
        } else if !self.context.watch_only() {
            let stored = self.context.make_recovery_request(self.channels.clock.now())?;
            self.send_payload(&stored)?;
        }
        self.arm_timer();
        Ok(())
    }
}
