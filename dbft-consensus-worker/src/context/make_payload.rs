//! Construction of this node's own signed consensus payloads.

use super::{committee_bytes, ConsensusContext, StoredPayload};
use dbft_consensus_exports::error::ConsensusError;
use dbft_consensus_exports::messages::recovery::{
    ChangeViewPayloadCompact, CommitPayloadCompact, PreparationPayloadCompact, RecoveryMessage,
};
use dbft_consensus_exports::messages::{
    ChangeView, ChangeViewReason, Commit, ConsensusMessage, MessageBody, MessageHeader,
    PrepareRequest, PrepareResponse, RecoveryRequest,
};
use dbft_hash::Hash;
use dbft_ledger_exports::LedgerController;
use dbft_models::address::Address;
use dbft_models::payload::{ConsensusPayload, PayloadId};
use dbft_models::transaction::Transaction;
use dbft_serialization::Serializer;
use dbft_time::DbftTime;
use rand::Rng;
use std::collections::BTreeMap;

impl ConsensusContext {
    /// Wraps a message body into a signed payload envelope from this node.
    pub fn sign_message(&mut self, body: MessageBody) -> Result<StoredPayload, ConsensusError> {
        let validator_index = self.my_index.ok_or(ConsensusError::NotAValidator)?;
        let keypair = self.keypair.as_ref().ok_or(ConsensusError::NotAValidator)?;
        let message = ConsensusMessage {
            header: MessageHeader {
                block_index: self.block_index,
                validator_index,
                view_number: self.view_number,
            },
            body,
        };
        let mut data = Vec::new();
        self.message_serializer.serialize(&message, &mut data)?;
        let signable = ConsensusPayload::compute_signable_hash(self.config.chain_id, &data)?;
        let signature = keypair.sign(&signable)?;
        let payload = ConsensusPayload { data, signature };
        self.cached_messages.insert(payload.compute_id(), message.clone());
        Ok(StoredPayload { payload, message })
    }

    /// Builds this node's block proposal out of the pool candidates and
    /// stores it in its own preparation slot.
    pub fn make_prepare_request(
        &mut self,
        now: DbftTime,
        candidates: Vec<Transaction>,
    ) -> Result<StoredPayload, ConsensusError> {
        let my_index = self.my_index.ok_or(ConsensusError::NotAValidator)?;
        self.ensure_max_block_limitation(candidates)?;
        // a block timestamp must be strictly greater than its parent's
        let floor = match self.block_index.checked_sub(1).and_then(|i| self.ledger.get_header(i)) {
            Some(prev) => prev.timestamp.saturating_add(DbftTime::EPSILON),
            None => DbftTime::from_millis(0),
        };
        self.version = 0;
        self.timestamp = now.max(floor);
        self.nonce = rand::thread_rng().gen();
        self.next_consensus = Address(Hash::compute_from(&committee_bytes(&self.validators)));
        self.header_cache = None;
        let body = MessageBody::PrepareRequest(PrepareRequest {
            version: self.version,
            prev_hash: self.prev_hash,
            timestamp: self.timestamp,
            nonce: self.nonce,
            transaction_hashes: self.transaction_hashes.clone().unwrap_or_default(),
        });
        let stored = self.sign_message(body)?;
        self.preparation_payloads[my_index as usize] = Some(stored.clone());
        Ok(stored)
    }

    /// Acknowledges the primary's proposal and stores the acknowledgement in
    /// this node's preparation slot.
    pub fn make_prepare_response(
        &mut self,
        preparation_hash: PayloadId,
    ) -> Result<StoredPayload, ConsensusError> {
        let my_index = self.my_index.ok_or(ConsensusError::NotAValidator)?;
        let stored =
            self.sign_message(MessageBody::PrepareResponse(PrepareResponse { preparation_hash }))?;
        self.preparation_payloads[my_index as usize] = Some(stored.clone());
        Ok(stored)
    }

    /// Commits this node to the current proposal.
    ///
    /// Idempotent: once a commit exists for this block it is returned as is,
    /// a commitment is never re-signed or altered.
    pub fn make_commit(&mut self) -> Result<StoredPayload, ConsensusError> {
        let my_index = self.my_index.ok_or(ConsensusError::NotAValidator)?;
        if let Some(stored) = &self.commit_payloads[my_index as usize] {
            return Ok(stored.clone());
        }
        let sign_data = self.block_sign_data()?.ok_or_else(|| {
            ConsensusError::ContainerInconsistency("committing without a proposal".to_string())
        })?;
        let keypair = self.keypair.as_ref().ok_or(ConsensusError::NotAValidator)?;
        let signature = keypair.sign(&sign_data)?;
        let stored = self.sign_message(MessageBody::Commit(Commit { signature }))?;
        self.commit_payloads[my_index as usize] = Some(stored.clone());
        Ok(stored)
    }

    /// Votes to leave the current view and stores the vote in this node's
    /// change view slot.
    pub fn make_change_view(
        &mut self,
        reason: ChangeViewReason,
        now: DbftTime,
    ) -> Result<StoredPayload, ConsensusError> {
        let my_index = self.my_index.ok_or(ConsensusError::NotAValidator)?;
        let stored =
            self.sign_message(MessageBody::ChangeView(ChangeView { timestamp: now, reason }))?;
        self.change_view_payloads[my_index as usize] = Some(stored.clone());
        Ok(stored)
    }

    /// Asks peers for their consensus state.
    pub fn make_recovery_request(&mut self, now: DbftTime) -> Result<StoredPayload, ConsensusError> {
        self.sign_message(MessageBody::RecoveryRequest(RecoveryRequest { timestamp: now }))
    }

    /// Replays everything collected for the current block so a lagging peer
    /// can catch up.
    pub fn make_recovery_message(&mut self) -> Result<StoredPayload, ConsensusError> {
        let mut recovery = RecoveryMessage::default();

        for stored in self.last_change_view_payloads.iter().flatten() {
            if let MessageBody::ChangeView(change_view) = &stored.message.body {
                recovery.change_view_messages.insert(
                    stored.message.header.validator_index,
                    ChangeViewPayloadCompact {
                        validator_index: stored.message.header.validator_index,
                        original_view_number: stored.message.header.view_number,
                        timestamp: change_view.timestamp,
                        reason: change_view.reason,
                        payload_signature: stored.payload.signature,
                    },
                );
            }
        }

        if self.transaction_hashes.is_some() {
            recovery.prepare_request = Some(PrepareRequest {
                version: self.version,
                prev_hash: self.prev_hash,
                timestamp: self.timestamp,
                nonce: self.nonce,
                transaction_hashes: self.transaction_hashes.clone().unwrap_or_default(),
            });
        } else {
            recovery.preparation_hash = self.most_acknowledged_preparation_hash();
        }

        for stored in self.preparation_payloads.iter().flatten() {
            recovery.preparation_messages.insert(
                stored.message.header.validator_index,
                PreparationPayloadCompact {
                    validator_index: stored.message.header.validator_index,
                    payload_signature: stored.payload.signature,
                },
            );
        }

        if self.commit_sent() {
            for stored in self.commit_payloads.iter().flatten() {
                if let MessageBody::Commit(commit) = &stored.message.body {
                    recovery.commit_messages.insert(
                        stored.message.header.validator_index,
                        CommitPayloadCompact {
                            validator_index: stored.message.header.validator_index,
                            view_number: stored.message.header.view_number,
                            signature: commit.signature,
                            payload_signature: stored.payload.signature,
                        },
                    );
                }
            }
        }

        self.sign_message(MessageBody::RecoveryMessage(recovery))
    }

    /// Preparation hash acknowledged by the most validators, when this node
    /// never saw the request itself.
    fn most_acknowledged_preparation_hash(&self) -> Option<PayloadId> {
        let mut counts: BTreeMap<PayloadId, usize> = BTreeMap::new();
        for stored in self.preparation_payloads.iter().flatten() {
            if let MessageBody::PrepareResponse(response) = &stored.message.body {
                *counts.entry(response.preparation_hash).or_insert(0) += 1;
            }
        }
        counts.into_iter().max_by_key(|(_, count)| *count).map(|(hash, _)| hash)
    }
}
