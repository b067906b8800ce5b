//! Handling of consensus payloads received from the network.

use super::ConsensusWorker;
use crate::context::StoredPayload;
use dbft_consensus_exports::error::ConsensusError;
use dbft_consensus_exports::messages::recovery::{
    ChangeViewPayloadCompact, CommitPayloadCompact, PreparationPayloadCompact, RecoveryMessage,
};
use dbft_consensus_exports::messages::{
    ChangeView, Commit, ConsensusMessage, MessageBody, MessageHeader, PrepareRequest,
    PrepareResponse,
};
use dbft_consensus_exports::ConsensusEvent;
use dbft_ledger_exports::LedgerController;
use dbft_models::payload::{ConsensusPayload, PayloadId};
use dbft_pool_exports::PoolController;
use dbft_protocol_exports::ProtocolController;
use dbft_serialization::Serializer;
use dbft_signature::Signature;
use dbft_time::Clock;
use tracing::log::{debug, info, warn};

impl ConsensusWorker {
    /// Entry point for every payload, whether received from the network or
    /// rebuilt out of a recovery message.
    pub(crate) fn on_consensus_payload(
        &mut self,
        payload: ConsensusPayload,
    ) -> Result<(), ConsensusError> {
        let message = self.context.decode_payload(&payload)?;
        let header = message.header;
        if header.block_index != self.context.block_index {
            if header.block_index > self.context.block_index {
                let current_index = self.context.block_index.saturating_sub(1);
                info!(
                    "validator {} is deciding block {} while our chain is at {}",
                    header.validator_index, header.block_index, current_index
                );
                if let Err(err) = self.channels.controller_event_tx.send(ConsensusEvent::NeedSync {
                    current_index,
                    observed_index: header.block_index,
                }) {
                    warn!("failed to notify that the chain is behind: {}", err);
                }
            }
            return Ok(());
        }
        if header.validator_index as usize >= self.context.validators.len() {
            return Err(ConsensusError::InvalidMessage(
                "validator index out of range".to_string(),
            ));
        }
        self.context
            .verify_payload_signature(&payload, header.validator_index)?;
        self.context
            .record_last_seen(header.validator_index, header.block_index);
        if self.context.block_sent {
            return Ok(());
        }
        // messages from another view are only meaningful if they can change
        // the view or survive it
        if header.view_number != self.context.view_number
            && matches!(
                message.body,
                MessageBody::PrepareRequest(_) | MessageBody::PrepareResponse(_)
            )
        {
            return Ok(());
        }
        let stored = StoredPayload { payload, message };
        match stored.message.body.clone() {
            MessageBody::ChangeView(change_view) => {
                self.on_change_view_received(stored, change_view)
            }
            MessageBody::PrepareRequest(request) => {
                self.on_prepare_request_received(stored, request)
            }
            MessageBody::PrepareResponse(response) => {
                self.on_prepare_response_received(stored, response)
            }
            MessageBody::Commit(commit) => self.on_commit_received(stored, commit),
            MessageBody::RecoveryRequest(_) => {
                let header = stored.message.header;
                self.on_recovery_request_received(stored.payload.compute_id(), &header)
            }
            MessageBody::RecoveryMessage(recovery) => {
                self.on_recovery_message_received(stored, recovery)
            }
        }
    }

    fn on_change_view_received(
        &mut self,
        stored: StoredPayload,
        _change_view: ChangeView,
    ) -> Result<(), ConsensusError> {
        let header = stored.message.header;
        let expected_view = stored.message.new_view_number();
        if expected_view <= self.context.view_number {
            // a stale vote doubles as a plea for recovery
            return self.on_recovery_request_received(stored.payload.compute_id(), &header);
        }
        if self.context.commit_sent() {
            return Ok(());
        }
        let index = header.validator_index as usize;
        if let Some(existing) = &self.context.change_view_payloads[index] {
            if existing.message.new_view_number() >= expected_view {
                return Ok(());
            }
        }
        debug!(
            "validator {} wants view {} of block {}",
            header.validator_index, expected_view, header.block_index
        );
        self.context.change_view_payloads[index] = Some(stored);
        self.check_expected_view(expected_view)
    }

    fn on_prepare_request_received(
        &mut self,
        stored: StoredPayload,
        request: PrepareRequest,
    ) -> Result<(), ConsensusError> {
        let header = stored.message.header;
        if self.context.request_sent_or_received()
            || self.context.not_accepting_payloads_due_to_view_changing()
        {
            return Ok(());
        }
        if header.validator_index != self.context.primary_index(self.context.view_number) {
            return Ok(());
        }
        if request.prev_hash != self.context.prev_hash {
            warn!(
                "proposal for block {} extends the wrong block",
                header.block_index
            );
            return Ok(());
        }
        let now = self.channels.clock.now();
        let floor = match self
            .context
            .block_index
            .checked_sub(1)
            .and_then(|index| self.context.ledger.get_header(index))
        {
            Some(prev) => prev.timestamp,
            None => dbft_time::DbftTime::from_millis(0),
        };
        let ceiling = now.saturating_add(self.config.block_interval.saturating_mul(8));
        if request.timestamp <= floor || request.timestamp > ceiling {
            warn!(
                "proposal for block {} carries timestamp {} outside of the accepted window",
                header.block_index, request.timestamp
            );
            return Ok(());
        }
        if request
            .transaction_hashes
            .iter()
            .any(|id| self.context.ledger.contains_transaction(id))
        {
            warn!(
                "proposal for block {} includes a transaction already on chain",
                header.block_index
            );
            return Ok(());
        }
        info!(
            "received proposal for block {} with {} transactions",
            header.block_index,
            request.transaction_hashes.len()
        );
        self.context.apply_prepare_request(
            request.version,
            request.timestamp,
            request.nonce,
            request.transaction_hashes.clone(),
        );
        let preparation_hash = stored.payload.compute_id();
        self.context.preparation_payloads[header.validator_index as usize] = Some(stored);
        // acknowledgements received early are only kept if they acknowledge
        // this very proposal
        for slot in self.context.preparation_payloads.iter_mut() {
            if let Some(existing) = slot {
                if let MessageBody::PrepareResponse(response) = &existing.message.body {
                    if response.preparation_hash != preparation_hash {
                        *slot = None;
                    }
                }
            }
        }
        // commits accepted before the proposal was known can be verified now
        if let Some(sign_data) = self.context.block_sign_data()? {
            for index in 0..self.context.validators.len() {
                let valid = match &self.context.commit_payloads[index] {
                    Some(existing)
                        if existing.message.header.view_number == self.context.view_number =>
                    {
                        match &existing.message.body {
                            MessageBody::Commit(commit) => self.context.validators[index]
                                .verify_signature(&sign_data, &commit.signature)
                                .is_ok(),
                            _ => false,
                        }
                    }
                    _ => true,
                };
                if !valid {
                    warn!(
                        "dropping the commit of validator {} for block {}: it does not match the proposal",
                        index, header.block_index
                    );
                    self.context.commit_payloads[index] = None;
                }
            }
        }
        self.extend_timer_by_factor(2);

        let mut missing = Vec::new();
        for id in request.transaction_hashes {
            if let Some(transaction) = self.channels.pool_controller.try_get(&id) {
                self.add_proposal_transaction(id, transaction)?;
                // verification may have condemned the proposal
                if self.context.view_changing() || self.context.transaction_hashes.is_none() {
                    return Ok(());
                }
            } else {
                missing.push(id);
            }
        }
        if !missing.is_empty() {
            self.channels
                .protocol_controller
                .request_transactions(&missing)?;
        }
        if self.proposal_complete() {
            self.check_prepare_response()?;
        }
        Ok(())
    }

    fn on_prepare_response_received(
        &mut self,
        stored: StoredPayload,
        response: PrepareResponse,
    ) -> Result<(), ConsensusError> {
        let header = stored.message.header;
        let index = header.validator_index as usize;
        if self.context.preparation_payloads[index].is_some()
            || self.context.not_accepting_payloads_due_to_view_changing()
        {
            return Ok(());
        }
        if self.context.request_sent_or_received() {
            let primary = self.context.primary_index(self.context.view_number) as usize;
            let expected = match &self.context.preparation_payloads[primary] {
                Some(request) => request.payload.compute_id(),
                None => return Ok(()),
            };
            if response.preparation_hash != expected {
                return Ok(());
            }
        }
        debug!(
            "validator {} acknowledged the proposal for block {}",
            header.validator_index, header.block_index
        );
        self.extend_timer_by_factor(1);
        self.context.preparation_payloads[index] = Some(stored);
        if self.context.watch_only() || self.context.commit_sent() {
            return Ok(());
        }
        if self.context.request_sent_or_received() {
            self.check_preparations()?;
        }
        Ok(())
    }

    fn on_commit_received(
        &mut self,
        stored: StoredPayload,
        commit: Commit,
    ) -> Result<(), ConsensusError> {
        let header = stored.message.header;
        let index = header.validator_index as usize;
        if let Some(existing) = &self.context.commit_payloads[index] {
            if existing.payload.compute_id() != stored.payload.compute_id() {
                warn!(
                    "validator {} sent a conflicting commit for block {}",
                    header.validator_index, header.block_index
                );
            }
            return Ok(());
        }
        if header.view_number == self.context.view_number {
            // a commit means a block is in the pipeline, be patient
            self.extend_timer_by_factor(4);
            match self.context.block_sign_data()? {
                Some(sign_data) => {
                    if self.context.validators[index]
                        .verify_signature(&sign_data, &commit.signature)
                        .is_err()
                    {
                        warn!(
                            "validator {} committed to block {} with an invalid signature",
                            header.validator_index, header.block_index
                        );
                        return Ok(());
                    }
                    debug!(
                        "validator {} committed to block {}",
                        header.validator_index, header.block_index
                    );
                    self.context.commit_payloads[index] = Some(stored);
                    self.check_commits()?;
                }
                // the proposal is not known yet, verified when it is
                None => self.context.commit_payloads[index] = Some(stored),
            }
        } else {
            // commits are irrevocable, keep them for recovery across views
            self.context.commit_payloads[index] = Some(stored);
        }
        Ok(())
    }

    /// Answers a recovery request when designated for it.
    ///
    /// Only `f + 1` nodes answer, chosen by their distance to the requester,
    /// so that one honest answer is guaranteed without flooding the network.
    /// Committed nodes always answer: their commitment is otherwise lost to
    /// the committee.
    pub(crate) fn on_recovery_request_received(
        &mut self,
        payload_id: PayloadId,
        header: &MessageHeader,
    ) -> Result<(), ConsensusError> {
        // a restarted requester signs a fresh payload and gets a fresh
        // answer, a replayed one does not
        if !self.known_payloads.insert(payload_id) {
            return Ok(());
        }
        let my_index = match self.context.my_index {
            Some(index) => index as usize,
            None => return Ok(()),
        };
        if !self.context.commit_sent() {
            let n = self.context.validators.len();
            let designated = (1..=self.context.f() + 1)
                .any(|i| (header.validator_index as usize + i) % n == my_index);
            if !designated {
                return Ok(());
            }
        }
        debug!(
            "answering the recovery request of validator {}",
            header.validator_index
        );
        let stored = self.context.make_recovery_message()?;
        self.send_payload(&stored)
    }

    /// Replays the messages carried by a recovery message.
    ///
    /// Every compact is rebuilt into the exact original envelope and fed back
    /// through `on_consensus_payload`, so replayed messages get the same
    /// verification as live ones.
    fn on_recovery_message_received(
        &mut self,
        stored: StoredPayload,
        recovery: RecoveryMessage,
    ) -> Result<(), ConsensusError> {
        let header = stored.message.header;
        info!(
            "processing recovery message from validator {} for view {} of block {}",
            header.validator_index, header.view_number, header.block_index
        );
        self.is_recovering = true;
        let result = self.replay_recovery(&header, &recovery);
        self.is_recovering = false;
        result
    }

    fn replay_recovery(
        &mut self,
        header: &MessageHeader,
        recovery: &RecoveryMessage,
    ) -> Result<(), ConsensusError> {
        if header.view_number > self.context.view_number && !self.context.commit_sent() {
            for compact in recovery.change_view_messages.values() {
                let payload = self.rebuild_change_view(header.block_index, compact)?;
                if let Err(err) = self.on_consensus_payload(payload) {
                    debug!("dropped replayed change view: {}", err);
                }
            }
        }
        if header.view_number == self.context.view_number
            && !self.context.not_accepting_payloads_due_to_view_changing()
            && !self.context.commit_sent()
        {
            let primary = self.context.primary_index(header.view_number);
            let mut preparation_hash = recovery.preparation_hash;
            if !self.context.request_sent_or_received() {
                match (
                    &recovery.prepare_request,
                    recovery.preparation_messages.get(&primary),
                ) {
                    (Some(request), Some(compact)) => {
                        let payload = self.rebuild_prepare_request(
                            header.block_index,
                            header.view_number,
                            primary,
                            request,
                            compact.payload_signature,
                        )?;
                        if let Err(err) = self.on_consensus_payload(payload) {
                            debug!("dropped replayed proposal: {}", err);
                        }
                    }
                    // nobody can hand the primary its own proposal back, it
                    // re-proposes instead
                    _ if self.context.is_primary() => self.send_prepare_request()?,
                    _ => {}
                }
            }
            if let Some(request) = &self.context.preparation_payloads[primary as usize] {
                preparation_hash = Some(request.payload.compute_id());
            }
            if let Some(preparation_hash) = preparation_hash {
                for compact in recovery.preparation_messages.values() {
                    if compact.validator_index == primary {
                        continue;
                    }
                    let payload = self.rebuild_prepare_response(
                        header.block_index,
                        header.view_number,
                        preparation_hash,
                        compact,
                    )?;
                    if let Err(err) = self.on_consensus_payload(payload) {
                        debug!("dropped replayed acknowledgement: {}", err);
                    }
                }
            }
        }
        if header.view_number <= self.context.view_number {
            for compact in recovery.commit_messages.values() {
                let payload = self.rebuild_commit(header.block_index, compact)?;
                if let Err(err) = self.on_consensus_payload(payload) {
                    debug!("dropped replayed commit: {}", err);
                }
            }
        }
        Ok(())
    }

    fn rebuild_payload(
        &self,
        message: ConsensusMessage,
        signature: Signature,
    ) -> Result<ConsensusPayload, ConsensusError> {
        let mut data = Vec::new();
        self.context
            .message_serializer
            .serialize(&message, &mut data)?;
        Ok(ConsensusPayload { data, signature })
    }

    fn rebuild_change_view(
        &self,
        block_index: u64,
        compact: &ChangeViewPayloadCompact,
    ) -> Result<ConsensusPayload, ConsensusError> {
        self.rebuild_payload(
            ConsensusMessage {
                header: MessageHeader {
                    block_index,
                    validator_index: compact.validator_index,
                    view_number: compact.original_view_number,
                },
                body: MessageBody::ChangeView(ChangeView {
                    timestamp: compact.timestamp,
                    reason: compact.reason,
                }),
            },
            compact.payload_signature,
        )
    }

    fn rebuild_prepare_request(
        &self,
        block_index: u64,
        view_number: u8,
        primary_index: u8,
        request: &PrepareRequest,
        payload_signature: Signature,
    ) -> Result<ConsensusPayload, ConsensusError> {
        self.rebuild_payload(
            ConsensusMessage {
                header: MessageHeader {
                    block_index,
                    validator_index: primary_index,
                    view_number,
                },
                body: MessageBody::PrepareRequest(request.clone()),
            },
            payload_signature,
        )
    }

    fn rebuild_prepare_response(
        &self,
        block_index: u64,
        view_number: u8,
        preparation_hash: PayloadId,
        compact: &PreparationPayloadCompact,
    ) -> Result<ConsensusPayload, ConsensusError> {
        self.rebuild_payload(
            ConsensusMessage {
                header: MessageHeader {
                    block_index,
                    validator_index: compact.validator_index,
                    view_number,
                },
                body: MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
            },
            compact.payload_signature,
        )
    }

    fn rebuild_commit(
        &self,
        block_index: u64,
        compact: &CommitPayloadCompact,
    ) -> Result<ConsensusPayload, ConsensusError> {
        self.rebuild_payload(
            ConsensusMessage {
                header: MessageHeader {
                    block_index,
                    validator_index: compact.validator_index,
                    view_number: compact.view_number,
                },
                body: MessageBody::Commit(Commit {
                    signature: compact.signature,
                }),
            },
            compact.payload_signature,
        )
    }
}
