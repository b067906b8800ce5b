//! Main loop of the consensus worker: commands and view timer.

use super::ConsensusWorker;
use crate::commands::ConsensusCommand;
use crate::context::StoredPayload;
use dbft_consensus_exports::error::ConsensusError;
use dbft_consensus_exports::messages::ChangeViewReason;
use dbft_ledger_exports::LedgerController;
use dbft_models::transaction::Transaction;
use dbft_pool_exports::PoolController;
use dbft_protocol_exports::ProtocolController;
use dbft_time::Clock;
use std::time::{Duration, Instant};
use tracing::log::{info, warn};

/// Tells what happened when the worker waited on its mailbox.
pub(crate) enum WaitingStatus {
    /// the stop command arrived
    Ended,
    /// a command or a timer expiry was processed, wait again
    Interrupted,
    /// the controller went away without a stop command
    Disconnected,
}

impl ConsensusWorker {
    /// Waits for the next command or for the view timer to expire.
    fn wait_command_or_timer(&mut self) -> WaitingStatus {
        match self.command_receiver.recv_deadline(self.timer_deadline) {
            Ok(ConsensusCommand::Stop) => WaitingStatus::Ended,
            Ok(command) => {
                if let Err(err) = self.manage_command(command) {
                    warn!("error processing consensus command: {}", err);
                }
                WaitingStatus::Interrupted
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                let height = self.timer_height;
                let view = self.timer_view;
                // one shot, re-armed explicitly by the state machine
                self.timer_deadline = Instant::now() + Duration::from_secs(u32::MAX as u64);
                if let Err(err) = self.on_timer(height, view) {
                    warn!("error processing view timer expiry: {}", err);
                }
                WaitingStatus::Interrupted
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => WaitingStatus::Disconnected,
        }
    }

    /// Runs until the stop command arrives.
    pub(crate) fn run(&mut self) {
        loop {
            match self.wait_command_or_timer() {
                WaitingStatus::Ended => {
                    info!("consensus worker loop ended");
                    break;
                }
                WaitingStatus::Disconnected => {
                    warn!("consensus controller disconnected, shutting down worker");
                    break;
                }
                WaitingStatus::Interrupted => continue,
            }
        }
    }

    fn manage_command(&mut self, command: ConsensusCommand) -> Result<(), ConsensusError> {
        match command {
            ConsensusCommand::RegisterPayload(payload) => self.on_consensus_payload(payload),
            ConsensusCommand::RegisterTransaction(transaction) => self.on_transaction(transaction),
            ConsensusCommand::BlockPersisted(index) => self.on_block_persisted(index),
            ConsensusCommand::Stop => Ok(()),
        }
    }

    /// Hands a payload envelope to the rest of the committee.
    pub(crate) fn send_payload(&self, stored: &StoredPayload) -> Result<(), ConsensusError> {
        self.channels
            .protocol_controller
            .send_payload(stored.payload.clone())?;
        Ok(())
    }

    /// Timeout of a whole view: doubles with every failed view so that a
    /// partitioned committee eventually overlaps in some view long enough to
    /// decide.
    pub(crate) fn view_timeout(&self, view_number: u8) -> Duration {
        let shift = (view_number as u32).saturating_add(1).min(20);
        Duration::from_millis(
            self.config
                .block_interval
                .to_millis()
                .saturating_mul(1u64 << shift),
        )
    }

    /// Arms the view timer for the current height and view.
    pub(crate) fn arm_timer(&mut self) {
        let view = self.context.view_number;
        let mut timeout = self.view_timeout(view);
        if view == 0 && self.context.is_primary() && !self.is_recovering {
            // the primary aims for one block interval after the previous
            // block rather than one interval from now; a primary that had to
            // recover lost that race already and waits like a backup
            let interval = self.config.block_interval;
            let elapsed = match self
                .context
                .block_index
                .checked_sub(1)
                .and_then(|index| self.context.ledger.get_header(index))
            {
                Some(prev) => self.channels.clock.now().abs_diff(prev.timestamp),
                None => interval,
            };
            timeout = interval
                .to_duration()
                .saturating_sub(elapsed.to_duration().min(interval.to_duration()));
        }
        self.set_timer(timeout);
    }

    pub(crate) fn set_timer(&mut self, timeout: Duration) {
        self.timer_deadline = Instant::now() + timeout;
        self.timer_height = self.context.block_index;
        self.timer_view = self.context.view_number;
    }

    /// Pushes the timer deadline back, never forward.
    ///
    /// The extension is proportional to the block interval and inversely
    /// proportional to the quorum size: the closer the committee is to
    /// deciding, the shorter the grace periods. Watch-only, view-changing
    /// and committed nodes keep their deadline untouched.
    pub(crate) fn extend_timer_by_factor(&mut self, factor: u32) {
        if self.context.watch_only() || self.context.view_changing() || self.context.commit_sent() {
            return;
        }
        let extension = self
            .config
            .block_interval
            .to_millis()
            .saturating_mul(factor as u64)
            / (self.context.m() as u64).max(1);
        let candidate = Instant::now() + Duration::from_millis(extension);
        if candidate > self.timer_deadline {
            self.timer_deadline = candidate;
            self.timer_height = self.context.block_index;
            self.timer_view = self.context.view_number;
        }
    }

    /// The view timer expired.
    pub(crate) fn on_timer(&mut self, height: u64, view_number: u8) -> Result<(), ConsensusError> {
        if height != self.context.block_index || view_number != self.context.view_number {
            return Ok(());
        }
        if self.context.watch_only() || self.context.block_sent {
            return Ok(());
        }
        if self.context.is_primary() && !self.context.request_sent_or_received() {
            self.send_prepare_request()?;
        } else if self.context.commit_sent() {
            // committed nodes never change view, they nag the others instead
            let stored = self.context.make_recovery_message()?;
            self.send_payload(&stored)?;
            self.set_timer(self.config.block_interval.saturating_mul(2).to_duration());
        } else {
            let reason = match &self.context.transaction_hashes {
                Some(hashes) if hashes.len() > self.context.transactions.len() => {
                    ChangeViewReason::TxNotFound
                }
                _ => ChangeViewReason::Timeout,
            };
            self.request_change_view(reason)?;
        }
        Ok(())
    }

    /// Builds this node's proposal and opens the preparation phase.
    pub(crate) fn send_prepare_request(&mut self) -> Result<(), ConsensusError> {
        let candidates = self
            .channels
            .pool_controller
            .get_sorted_verified_transactions();
        let now = self.channels.clock.now();
        let stored = self.context.make_prepare_request(now, candidates)?;
        info!(
            "proposing block {} with {} transactions",
            self.context.block_index,
            self.context.transaction_hashes.as_ref().map_or(0, Vec::len)
        );
        self.send_payload(&stored)?;
        // what is left of the view once the proposal is out
        let timeout = self
            .view_timeout(self.context.view_number)
            .saturating_sub(if self.context.view_number == 0 {
                self.config.block_interval.to_duration()
            } else {
                Duration::ZERO
            });
        self.set_timer(timeout);
        // a committee of one decides immediately
        self.check_preparations()?;
        Ok(())
    }

    /// Votes to leave the current view, or asks for recovery when a view
    /// change can no longer gather a quorum.
    pub(crate) fn request_change_view(
        &mut self,
        reason: ChangeViewReason,
    ) -> Result<(), ConsensusError> {
        if self.context.watch_only() {
            return Ok(());
        }
        let now = self.channels.clock.now();
        if self.context.more_than_f_nodes_committed_or_lost() {
            let stored = self.context.make_recovery_request(now)?;
            self.send_payload(&stored)?;
            self.set_timer(self.view_timeout(self.context.view_number));
            return Ok(());
        }
        let expected_view = self.context.view_number.saturating_add(1);
        info!(
            "requesting change to view {} of block {}: {:?}",
            expected_view, self.context.block_index, reason
        );
        let stored = self.context.make_change_view(reason, now)?;
        self.set_timer(self.view_timeout(expected_view));
        self.send_payload(&stored)?;
        self.check_expected_view(expected_view)
    }

    /// A transaction arrived, possibly one a proposal is waiting for.
    pub(crate) fn on_transaction(&mut self, transaction: Transaction) -> Result<(), ConsensusError> {
        self.channels
            .pool_controller
            .add_transactions(vec![transaction.clone()]);
        if !self.context.request_sent_or_received() || self.context.block_sent {
            return Ok(());
        }
        let id = transaction.compute_id(&self.context.transaction_serializer)?;
        let awaited = match &self.context.transaction_hashes {
            Some(hashes) => {
                hashes.contains(&id) && !self.context.transactions.contains_key(&id)
            }
            None => false,
        };
        if awaited {
            self.add_proposal_transaction(id, transaction)?;
        }
        Ok(())
    }

    /// The ledger advanced outside of our own commits.
    fn on_block_persisted(&mut self, index: u64) -> Result<(), ConsensusError> {
        if index < self.context.block_index {
            return Ok(());
        }
        info!("block {} persisted externally, moving on", index);
        self.initialize_consensus(0)
    }
}
