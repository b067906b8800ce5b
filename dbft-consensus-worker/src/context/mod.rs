//! State of the consensus process for one block height.
//!
//! The context accumulates the signed payloads received from the other
//! validators, slot per validator index, and answers the derived questions
//! the service logic is written in terms of (am I primary, is a quorum of
//! preparations reached, are enough nodes committed or lost, ...).

pub mod make_payload;
pub mod serialization;

use dbft_consensus_exports::error::ConsensusError;
use dbft_consensus_exports::messages::{
    ConsensusMessage, ConsensusMessageDeserializer, ConsensusMessageSerializer, MessageBody,
};
use dbft_consensus_exports::ConsensusConfig;
use dbft_hash::Hash;
use dbft_ledger_exports::LedgerController;
use dbft_models::address::Address;
use dbft_models::amount::Amount;
use dbft_models::block::{Block, BlockWitness};
use dbft_models::block_header::{BlockHeader, BlockHeaderSerializer};
use dbft_models::block_id::BlockId;
use dbft_models::merkle::compute_merkle_root;
use dbft_models::payload::{ConsensusPayload, PayloadId};
use dbft_models::transaction::{Transaction, TransactionId, TransactionSerializer};
use dbft_serialization::{DeserializeError, Deserializer};
use dbft_signature::{KeyPair, PublicKey};
use dbft_time::DbftTime;
use dbft_wallet::Wallet;
use std::collections::HashMap;
use std::sync::Arc;

/// A consensus payload together with its decoded message.
#[derive(Clone)]
pub struct StoredPayload {
    /// the signed envelope as received or built
    pub payload: ConsensusPayload,
    /// the decoded message the envelope carries
    pub message: ConsensusMessage,
}

/// Consensus state for the block currently being decided.
pub struct ConsensusContext {
    /// consensus configuration
    pub config: ConsensusConfig,
    /// ledger the decided blocks are appended to
    pub ledger: Box<dyn LedgerController>,
    /// wallet holding this node's validator key, if any
    pub wallet: Arc<Wallet>,
    /// committee in charge of the current block
    pub validators: Vec<PublicKey>,
    /// our index in the committee, `None` when watch-only
    pub my_index: Option<u8>,
    /// our validator keypair, `None` when watch-only
    pub keypair: Option<KeyPair>,
    /// height being decided
    pub block_index: u64,
    /// current view
    pub view_number: u8,
    /// id of the last persisted block
    pub prev_hash: BlockId,
    /// protocol version of the current proposal
    pub version: u32,
    /// timestamp of the current proposal
    pub timestamp: DbftTime,
    /// entropy of the current proposal
    pub nonce: u64,
    /// account designated to validate the next block
    pub next_consensus: Address,
    /// transaction ids of the current proposal, `None` before a proposal exists
    pub transaction_hashes: Option<Vec<TransactionId>>,
    /// proposed transactions retrieved so far, by id
    pub transactions: HashMap<TransactionId, Transaction>,
    /// cumulated fees per sender across the retrieved proposal transactions
    pub verification_fees: HashMap<Address, Amount>,
    /// change view votes for the current block, slot per validator
    pub change_view_payloads: Vec<Option<StoredPayload>>,
    /// change view votes carried over from abandoned views
    pub last_change_view_payloads: Vec<Option<StoredPayload>>,
    /// prepare request and responses of the current view, slot per validator
    pub preparation_payloads: Vec<Option<StoredPayload>>,
    /// commits for the current block, slot per validator, any view
    pub commit_payloads: Vec<Option<StoredPayload>>,
    /// last block height each validator was seen talking about
    pub last_seen_message: Vec<u64>,
    /// true once the decided block was handed to the ledger
    pub block_sent: bool,
    /// decoded messages by payload id, cleared at every new height
    cached_messages: HashMap<PayloadId, ConsensusMessage>,
    header_cache: Option<BlockHeader>,
    /// message codec
    pub message_serializer: ConsensusMessageSerializer,
    /// message codec
    pub message_deserializer: ConsensusMessageDeserializer,
    /// header codec, used for block ids and sign data
    pub header_serializer: BlockHeaderSerializer,
    /// transaction codec, used for sizes and ids
    pub transaction_serializer: TransactionSerializer,
}

impl ConsensusContext {
    /// Creates a context. Call `reset(0)` before use.
    pub fn new(
        config: ConsensusConfig,
        ledger: Box<dyn LedgerController>,
        wallet: Arc<Wallet>,
    ) -> Self {
        let message_deserializer = ConsensusMessageDeserializer::new(
            config.validators_count,
            config.max_transactions_per_block,
        );
        Self {
            config,
            ledger,
            wallet,
            validators: Vec::new(),
            my_index: None,
            keypair: None,
            block_index: 0,
            view_number: 0,
            prev_hash: BlockId::zero(),
            version: 0,
            timestamp: DbftTime::from_millis(0),
            nonce: 0,
            next_consensus: Address(Hash::compute_from(&[])),
            transaction_hashes: None,
            transactions: HashMap::new(),
            verification_fees: HashMap::new(),
            change_view_payloads: Vec::new(),
            last_change_view_payloads: Vec::new(),
            preparation_payloads: Vec::new(),
            commit_payloads: Vec::new(),
            last_seen_message: Vec::new(),
            block_sent: false,
            cached_messages: HashMap::new(),
            header_cache: None,
            message_serializer: ConsensusMessageSerializer::new(),
            message_deserializer,
            header_serializer: BlockHeaderSerializer::new(),
            transaction_serializer: TransactionSerializer::new(),
        }
    }

    /// number of faulty validators the committee tolerates
    pub fn f(&self) -> usize {
        (self.validators.len() - 1) / 3
    }

    /// number of matching messages needed to make progress
    pub fn m(&self) -> usize {
        self.validators.len() - self.f()
    }

    /// Committee index of the primary for the given view.
    ///
    /// Decreasing by the view number rotates the role away from a primary
    /// that failed its view.
    pub fn primary_index(&self, view_number: u8) -> u8 {
        let n = self.validators.len() as i128;
        ((self.block_index as i128 - view_number as i128).rem_euclid(n)) as u8
    }

    /// true if this node cannot vote for the current block
    pub fn watch_only(&self) -> bool {
        self.my_index.is_none()
    }

    /// true if this node is the primary of the current view
    pub fn is_primary(&self) -> bool {
        self.my_index == Some(self.primary_index(self.view_number))
    }

    /// true if this node is a backup in the current view
    pub fn is_backup(&self) -> bool {
        matches!(self.my_index, Some(_)) && !self.is_primary()
    }

    /// true once the primary's proposal of the current view is known
    pub fn request_sent_or_received(&self) -> bool {
        self.preparation_payloads[self.primary_index(self.view_number) as usize].is_some()
    }

    /// true once this node sent its preparation for the current view
    pub fn response_sent(&self) -> bool {
        match self.my_index {
            Some(index) => self.preparation_payloads[index as usize].is_some(),
            None => false,
        }
    }

    /// true once this node committed to the current block
    pub fn commit_sent(&self) -> bool {
        match self.my_index {
            Some(index) => self.commit_payloads[index as usize].is_some(),
            None => false,
        }
    }

    /// true if this node voted to leave the current view
    pub fn view_changing(&self) -> bool {
        match self.my_index {
            Some(index) => match &self.change_view_payloads[index as usize] {
                Some(stored) => stored.message.new_view_number() > self.view_number,
                None => false,
            },
            None => false,
        }
    }

    /// number of validators committed to the current block in the current view
    pub fn count_committed(&self) -> usize {
        self.commit_payloads
            .iter()
            .flatten()
            .filter(|stored| stored.message.header.view_number == self.view_number)
            .count()
    }

    /// number of validators that look lost: nothing received from them for
    /// this block and no sign of life at this height
    pub fn count_failed(&self) -> usize {
        self.validators
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                self.change_view_payloads[*i].is_none()
                    && self.preparation_payloads[*i].is_none()
                    && self.commit_payloads[*i].is_none()
                    && self.last_seen_message[*i] < self.block_index.saturating_sub(1)
            })
            .count()
    }

    /// Safety valve for view changes: once more than `f` nodes are committed
    /// or unreachable, a view change could never gather a quorum anyway, so
    /// the remaining nodes must recover commits instead of changing view.
    pub fn more_than_f_nodes_committed_or_lost(&self) -> bool {
        self.count_committed() + self.count_failed() > self.f()
    }

    /// true if this node refuses new proposals because it is view changing
    pub fn not_accepting_payloads_due_to_view_changing(&self) -> bool {
        self.view_changing() && !self.more_than_f_nodes_committed_or_lost()
    }

    /// number of preparation messages collected for the current view,
    /// counting the proposal itself
    pub fn count_preparations(&self) -> usize {
        self.preparation_payloads.iter().flatten().count()
    }

    /// Decodes the message carried by a payload envelope.
    ///
    /// A payload resent over the network or replayed out of a recovery
    /// message is only parsed once per height.
    pub fn decode_payload(
        &mut self,
        payload: &ConsensusPayload,
    ) -> Result<ConsensusMessage, ConsensusError> {
        let id = payload.compute_id();
        if let Some(message) = self.cached_messages.get(&id) {
            return Ok(message.clone());
        }
        let (rest, message) = self
            .message_deserializer
            .deserialize::<DeserializeError>(&payload.data)
            .map_err(|err| ConsensusError::InvalidMessage(format!("{}", err)))?;
        if !rest.is_empty() {
            return Err(ConsensusError::InvalidMessage(
                "trailing bytes after consensus message".to_string(),
            ));
        }
        self.cached_messages.insert(id, message.clone());
        Ok(message)
    }

    /// Checks the envelope signature of a payload against its sender's key.
    pub fn verify_payload_signature(
        &self,
        payload: &ConsensusPayload,
        validator_index: u8,
    ) -> Result<(), ConsensusError> {
        let public_key = self
            .validators
            .get(validator_index as usize)
            .ok_or_else(|| {
                ConsensusError::InvalidMessage(format!(
                    "validator index {} out of range",
                    validator_index
                ))
            })?;
        let signable =
            ConsensusPayload::compute_signable_hash(self.config.chain_id, &payload.data)?;
        public_key
            .verify_signature(&signable, &payload.signature)
            .map_err(|err| ConsensusError::InvalidMessage(format!("bad payload signature: {}", err)))
    }

    /// Resets the context for a new view, or for a new block when `view_number`
    /// is zero.
    pub fn reset(&mut self, view_number: u8) {
        if view_number == 0 {
            self.prev_hash = self.ledger.current_hash();
            self.block_index = self.ledger.current_index().saturating_add(1);
            self.validators = self.ledger.next_block_validators();
            let n = self.validators.len();
            match self.wallet.find_validator_key(&self.validators) {
                Some((index, keypair)) => {
                    self.my_index = Some(index);
                    self.keypair = Some(keypair);
                }
                None => {
                    self.my_index = None;
                    self.keypair = None;
                }
            }
            self.change_view_payloads = vec![None; n];
            self.last_change_view_payloads = vec![None; n];
            self.preparation_payloads = vec![None; n];
            self.commit_payloads = vec![None; n];
            // everyone is assumed alive as of the previous block; a silent
            // round then shows up as a stale entry
            if self.last_seen_message.len() != n {
                self.last_seen_message = vec![self.block_index.saturating_sub(1); n];
            }
            self.cached_messages.clear();
            self.block_sent = false;
        } else {
            // votes for at least the new view stay relevant across the change
            for i in 0..self.validators.len() {
                self.last_change_view_payloads[i] = match &self.change_view_payloads[i] {
                    Some(stored) if stored.message.new_view_number() >= view_number => {
                        Some(stored.clone())
                    }
                    _ => None,
                };
            }
            self.preparation_payloads = vec![None; self.validators.len()];
        }
        self.view_number = view_number;
        self.version = 0;
        self.timestamp = DbftTime::from_millis(0);
        self.nonce = 0;
        self.transaction_hashes = None;
        self.transactions.clear();
        self.verification_fees.clear();
        self.header_cache = None;
        if let Some(index) = self.my_index {
            self.last_seen_message[index as usize] = self.block_index;
        }
    }

    /// Selects the proposal prefix that fits the block limits: transaction
    /// count, cumulated size and cumulated system fee.
    pub fn ensure_max_block_limitation(
        &mut self,
        candidates: Vec<Transaction>,
    ) -> Result<(), ConsensusError> {
        let mut hashes = Vec::new();
        let mut transactions = HashMap::new();
        let mut fees: HashMap<Address, Amount> = HashMap::new();
        let mut total_size: u64 = 0;
        let mut total_system_fee = Amount::zero();

        for transaction in candidates {
            if hashes.len() >= self.config.max_transactions_per_block as usize {
                break;
            }
            let size = transaction.serialized_size(&self.transaction_serializer)? as u64;
            if total_size.saturating_add(size) > self.config.max_block_size as u64 {
                break;
            }
            let system_fee = match total_system_fee.checked_add(transaction.system_fee) {
                Some(fee) if fee <= self.config.max_block_system_fee => fee,
                _ => break,
            };
            total_size = total_size.saturating_add(size);
            total_system_fee = system_fee;
            let id = transaction.compute_id(&self.transaction_serializer)?;
            let entry = fees.entry(transaction.sender).or_insert_with(Amount::zero);
            *entry = entry.saturating_add(transaction.total_fee());
            hashes.push(id);
            transactions.insert(id, transaction);
        }

        self.transaction_hashes = Some(hashes);
        self.transactions = transactions;
        self.verification_fees = fees;
        self.header_cache = None;
        Ok(())
    }

    /// Serialized size of the transactions retrieved for the current proposal.
    pub fn expected_block_size(&self) -> Result<u64, ConsensusError> {
        let mut total: u64 = 0;
        for transaction in self.transactions.values() {
            total = total
                .saturating_add(transaction.serialized_size(&self.transaction_serializer)? as u64);
        }
        Ok(total)
    }

    /// Cumulated system fee of the transactions retrieved for the current
    /// proposal.
    pub fn expected_block_system_fee(&self) -> Amount {
        self.transactions
            .values()
            .fold(Amount::zero(), |total, transaction| {
                total.saturating_add(transaction.system_fee)
            })
    }

    /// Builds the header of the current proposal, if a proposal exists.
    pub fn ensure_header(&mut self) -> Result<Option<&BlockHeader>, ConsensusError> {
        let hashes = match &self.transaction_hashes {
            Some(hashes) => hashes,
            None => return Ok(None),
        };
        if self.header_cache.is_none() {
            let leaf_hashes: Vec<Hash> = hashes.iter().map(|id| id.0).collect();
            self.header_cache = Some(BlockHeader {
                prev_hash: self.prev_hash,
                index: self.block_index,
                timestamp: self.timestamp,
                primary_index: self.primary_index(self.view_number),
                merkle_root: compute_merkle_root(&leaf_hashes),
                next_consensus: self.next_consensus,
            });
        }
        Ok(self.header_cache.as_ref())
    }

    /// Hash validators sign when committing to the current proposal.
    pub fn block_sign_data(&mut self) -> Result<Option<Hash>, ConsensusError> {
        let chain_id = self.config.chain_id;
        let header_serializer = self.header_serializer.clone();
        match self.ensure_header()? {
            Some(header) => Ok(Some(
                header.compute_signable_hash(chain_id, &header_serializer)?,
            )),
            None => Ok(None),
        }
    }

    /// Assembles the decided block from the proposal and a quorum of commits.
    pub fn create_block(&mut self) -> Result<Block, ConsensusError> {
        let quorum = self.m();
        let view_number = self.view_number;
        let header = match self.ensure_header()? {
            Some(header) => header.clone(),
            None => {
                return Err(ConsensusError::ContainerInconsistency(
                    "creating a block without a proposal".to_string(),
                ))
            }
        };
        let mut signatures = Vec::with_capacity(quorum);
        for (index, slot) in self.commit_payloads.iter().enumerate() {
            if signatures.len() >= quorum {
                break;
            }
            if let Some(stored) = slot {
                if stored.message.header.view_number != view_number {
                    continue;
                }
                if let MessageBody::Commit(commit) = &stored.message.body {
                    signatures.push((index as u8, commit.signature));
                }
            }
        }
        if signatures.len() < quorum {
            return Err(ConsensusError::ContainerInconsistency(format!(
                "only {} commits for a quorum of {}",
                signatures.len(),
                quorum
            )));
        }
        let hashes = self.transaction_hashes.clone().unwrap_or_default();
        let transactions = hashes
            .iter()
            .map(|id| {
                self.transactions.get(id).cloned().ok_or_else(|| {
                    ConsensusError::ContainerInconsistency(format!(
                        "proposal transaction {} not retrieved",
                        id
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block {
            header,
            transactions,
            witness: BlockWitness { signatures },
        })
    }

    /// Applies a decoded prepare request to the proposal fields.
    ///
    /// Used both when the primary's request arrives and when the context is
    /// restored from a recovery log.
    pub fn apply_prepare_request(
        &mut self,
        version: u32,
        timestamp: DbftTime,
        nonce: u64,
        transaction_hashes: Vec<TransactionId>,
    ) {
        self.version = version;
        self.timestamp = timestamp;
        self.nonce = nonce;
        self.transaction_hashes = Some(transaction_hashes);
        self.transactions.clear();
        self.verification_fees.clear();
        self.header_cache = None;
        self.next_consensus = Address(Hash::compute_from(&committee_bytes(&self.validators)));
    }

    /// Records that a validator was seen talking about a block height.
    pub fn record_last_seen(&mut self, validator_index: u8, block_index: u64) {
        if let Some(slot) = self.last_seen_message.get_mut(validator_index as usize) {
            if *slot < block_index {
                *slot = block_index;
            }
        }
    }
}

/// Concatenated committee keys, hashed into the `next_consensus` account.
pub fn committee_bytes(validators: &[PublicKey]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(validators.len() * 32);
    for public_key in validators {
        bytes.extend_from_slice(public_key.to_bytes());
    }
    bytes
}
