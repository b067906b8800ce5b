//! Phase transitions of the consensus state machine.
//!
//! Every handler funnels into one of these checks: they look at the slots
//! accumulated in the context and decide whether the protocol can move to the
//! next phase.

use super::ConsensusWorker;
use dbft_consensus_exports::error::ConsensusError;
use dbft_consensus_exports::messages::ChangeViewReason;
use dbft_consensus_exports::ConsensusEvent;
use dbft_ledger_exports::LedgerController;
use dbft_models::amount::Amount;
use dbft_models::transaction::{Transaction, TransactionId};
use dbft_pool_exports::PoolController;
use dbft_protocol_exports::ProtocolController;
use dbft_time::Clock;
use tracing::log::{info, warn};

impl ConsensusWorker {
    /// Verifies and records one transaction of the current proposal.
    ///
    /// A transaction that fails verification condemns the whole proposal:
    /// this node votes to change view so a new primary can propose.
    pub(crate) fn add_proposal_transaction(
        &mut self,
        id: TransactionId,
        transaction: Transaction,
    ) -> Result<(), ConsensusError> {
        if self.context.ledger.contains_transaction(&id) {
            warn!("proposal includes transaction {} already on chain", id);
            return self.request_change_view(ChangeViewReason::TxInvalid);
        }
        if transaction.payload.len() > self.config.max_transaction_payload_size as usize {
            warn!("proposal transaction {} exceeds the payload size limit", id);
            return self.request_change_view(ChangeViewReason::TxInvalid);
        }
        let already_spent = self
            .context
            .verification_fees
            .get(&transaction.sender)
            .copied()
            .unwrap_or_else(Amount::zero);
        let needed = match already_spent.checked_add(transaction.total_fee()) {
            Some(needed) => needed,
            None => {
                warn!("proposal transaction {} overflows its sender's fees", id);
                return self.request_change_view(ChangeViewReason::TxRejectedByPolicy);
            }
        };
        if self.context.ledger.get_balance(&transaction.sender) < needed {
            warn!(
                "proposal transaction {} is not covered by its sender's balance",
                id
            );
            return self.request_change_view(ChangeViewReason::TxRejectedByPolicy);
        }
        let entry = self
            .context
            .verification_fees
            .entry(transaction.sender)
            .or_default();
        *entry = needed;
        self.context.transactions.insert(id, transaction);
        if self.proposal_complete() {
            self.check_prepare_response()?;
        }
        Ok(())
    }

    /// true once every transaction of the proposal has been retrieved
    pub(crate) fn proposal_complete(&self) -> bool {
        match &self.context.transaction_hashes {
            Some(hashes) => hashes.len() == self.context.transactions.len(),
            None => false,
        }
    }

    /// The proposal is fully known: verify it as a whole and, as a backup,
    /// acknowledge it.
    pub(crate) fn check_prepare_response(&mut self) -> Result<(), ConsensusError> {
        if !self.proposal_complete() {
            return Ok(());
        }
        if self.context.expected_block_size()? > self.config.max_block_size as u64
            || self.context.expected_block_system_fee() > self.config.max_block_system_fee
        {
            warn!(
                "proposal for block {} exceeds the block limits",
                self.context.block_index
            );
            return self.request_change_view(ChangeViewReason::BlockRejectedByPolicy);
        }
        if self.context.is_backup()
            && !self.context.response_sent()
            && !self.context.commit_sent()
            && self.context.request_sent_or_received()
        {
            let primary = self.context.primary_index(self.context.view_number) as usize;
            let preparation_hash = match &self.context.preparation_payloads[primary] {
                Some(stored) => stored.payload.compute_id(),
                None => return Ok(()),
            };
            // progress was made, give the view a little more room
            self.extend_timer_by_factor(2);
            let stored = self.context.make_prepare_response(preparation_hash)?;
            self.send_payload(&stored)?;
        }
        self.check_preparations()
    }

    /// Commits once a quorum of preparations is reached.
    ///
    /// The commit is recorded in the context and saved to the recovery log
    /// before it leaves this node: a crash between the two must not let the
    /// node forget a commitment the committee may already count on.
    pub(crate) fn check_preparations(&mut self) -> Result<(), ConsensusError> {
        if !self.context.watch_only()
            && !self.context.commit_sent()
            && self.context.request_sent_or_received()
            && self.proposal_complete()
            && self.context.count_preparations() >= self.context.m()
        {
            let stored = self.context.make_commit()?;
            self.context.save()?;
            info!(
                "committing to block {} in view {}",
                self.context.block_index, self.context.view_number
            );
            self.set_timer(self.view_timeout(self.context.view_number));
            self.send_payload(&stored)?;
        }
        self.check_commits()
    }

    /// Assembles and persists the block once a quorum of commits is reached.
    pub(crate) fn check_commits(&mut self) -> Result<(), ConsensusError> {
        if self.context.block_sent
            || self.context.count_committed() < self.context.m()
            || !self.context.request_sent_or_received()
            || !self.proposal_complete()
        {
            return Ok(());
        }
        let block = self.context.create_block()?;
        let index = block.header.index;
        let block_id = block.header.compute_id(&self.context.header_serializer)?;
        self.context.ledger.persist_block(block)?;
        self.context.block_sent = true;
        info!("block {} decided: {}", index, block_id);
        if let Err(err) = self
            .channels
            .controller_event_tx
            .send(ConsensusEvent::BlockFinalized { index, block_id })
        {
            warn!("failed to notify of a finalized block: {}", err);
        }
        self.initialize_consensus(0)
    }

    /// Moves to the expected view once a quorum of matching change view
    /// votes is reached.
    pub(crate) fn check_expected_view(&mut self, expected_view: u8) -> Result<(), ConsensusError> {
        if expected_view <= self.context.view_number {
            return Ok(());
        }
        let votes = self
            .context
            .change_view_payloads
            .iter()
            .flatten()
            .filter(|stored| stored.message.new_view_number() >= expected_view)
            .count();
        if votes >= self.context.m() {
            // join the quorum before moving: peers still waiting need this
            // node's vote in their own count
            if !self.context.watch_only() {
                let own_vote = self
                    .context
                    .my_index
                    .and_then(|index| self.context.change_view_payloads[index as usize].as_ref())
                    .map(|stored| stored.message.new_view_number());
                if own_vote.map_or(true, |vote| vote < expected_view) {
                    let now = self.channels.clock.now();
                    let stored = self
                        .context
                        .make_change_view(ChangeViewReason::ChangeAgreement, now)?;
                    self.send_payload(&stored)?;
                }
            }
            self.initialize_consensus(expected_view)?;
        }
        Ok(())
    }

    /// Resets the context for a view, view zero meaning a new block.
    pub(crate) fn initialize_consensus(&mut self, view_number: u8) -> Result<(), ConsensusError> {
        // transactions of an abandoned proposal go back to the pool, the next
        // primary may want them
        let leftover: Vec<Transaction> = self.context.transactions.values().cloned().collect();
        self.context.reset(view_number);
        if view_number > 0 {
            info!(
                "changed to view {} of block {}",
                view_number, self.context.block_index
            );
            if !leftover.is_empty() {
                self.channels
                    .protocol_controller
                    .announce_transactions(&leftover)?;
                self.channels.pool_controller.add_transactions(leftover);
            }
        } else {
            // answered recovery requests belong to the finished round
            self.known_payloads.clear();
            if self.context.ledger.validators_changed() {
                info!(
                    "validator set changes with block {}",
                    self.context.block_index
                );
            }
        }
        self.arm_timer();
        Ok(())
    }
}
