//! Mocks and helpers shared by the consensus scenarios.

use crate::worker::ConsensusWorker;
use dbft_channel::{DbftChannel, DbftReceiver};
use dbft_consensus_exports::messages::{
    ConsensusMessage, ConsensusMessageDeserializer, ConsensusMessageSerializer, MessageBody,
    MessageHeader,
};
use dbft_consensus_exports::{ConsensusChannels, ConsensusConfig, ConsensusEvent};
use dbft_hash::Hash;
use dbft_ledger_exports::{LedgerController, LedgerError};
use dbft_models::address::Address;
use dbft_models::amount::Amount;
use dbft_models::block::Block;
use dbft_models::block_header::{BlockHeader, BlockHeaderSerializer};
use dbft_models::block_id::BlockId;
use dbft_models::payload::ConsensusPayload;
use dbft_models::transaction::{Transaction, TransactionId, TransactionSerializer};
use dbft_pool_exports::PoolController;
use dbft_protocol_exports::{ProtocolController, ProtocolError};
use dbft_serialization::{DeserializeError, Deserializer, Serializer};
use dbft_signature::{KeyPair, PublicKey};
use dbft_time::{Clock, DbftTime};
use dbft_wallet::Wallet;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const CHAIN_ID: u64 = 77;
pub const BLOCK_INTERVAL_MILLIS: u64 = 1_000;

pub struct LedgerState {
    pub current_index: u64,
    pub current_hash: BlockId,
    pub headers: HashMap<u64, BlockHeader>,
    pub validators: Vec<PublicKey>,
    pub balances: HashMap<Address, Amount>,
    pub chain_transactions: HashSet<TransactionId>,
    pub persisted: Vec<Block>,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            current_index: 0,
            current_hash: BlockId::zero(),
            headers: HashMap::new(),
            validators: Vec::new(),
            balances: HashMap::new(),
            chain_transactions: HashSet::new(),
            persisted: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct MockLedger(pub Arc<Mutex<LedgerState>>);

impl LedgerController for MockLedger {
    fn current_index(&self) -> u64 {
        self.0.lock().unwrap().current_index
    }

    fn current_hash(&self) -> BlockId {
        self.0.lock().unwrap().current_hash
    }

    fn get_header(&self, index: u64) -> Option<BlockHeader> {
        self.0.lock().unwrap().headers.get(&index).cloned()
    }

    fn next_block_validators(&self) -> Vec<PublicKey> {
        self.0.lock().unwrap().validators.clone()
    }

    fn validators_changed(&self) -> bool {
        false
    }

    fn contains_transaction(&self, id: &TransactionId) -> bool {
        self.0.lock().unwrap().chain_transactions.contains(id)
    }

    fn get_balance(&self, address: &Address) -> Amount {
        self.0
            .lock()
            .unwrap()
            .balances
            .get(address)
            .copied()
            .unwrap_or_else(|| Amount::from_raw(u64::MAX))
    }

    fn persist_block(&mut self, block: Block) -> Result<(), LedgerError> {
        let mut state = self.0.lock().unwrap();
        let id = block
            .header
            .compute_id(&BlockHeaderSerializer::new())
            .map_err(LedgerError::ModelsError)?;
        state.current_index = block.header.index;
        state.current_hash = id;
        state.headers.insert(block.header.index, block.header.clone());
        for transaction in block.transactions.iter() {
            if let Ok(tx_id) = transaction.compute_id(&TransactionSerializer::new()) {
                state.chain_transactions.insert(tx_id);
            }
        }
        state.persisted.push(block);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn LedgerController> {
        Box::new(self.clone())
    }
}

#[derive(Clone, Default)]
pub struct MockPool(pub Arc<Mutex<Vec<Transaction>>>);

impl PoolController for MockPool {
    fn get_sorted_verified_transactions(&self) -> Vec<Transaction> {
        self.0.lock().unwrap().clone()
    }

    fn get_verified_transactions(&self) -> Vec<Transaction> {
        self.0.lock().unwrap().clone()
    }

    fn try_get(&self, id: &TransactionId) -> Option<Transaction> {
        let serializer = TransactionSerializer::new();
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|transaction| transaction.compute_id(&serializer).ok().as_ref() == Some(id))
            .cloned()
    }

    fn add_transactions(&mut self, transactions: Vec<Transaction>) {
        self.0.lock().unwrap().extend(transactions);
    }

    fn clone_box(&self) -> Box<dyn PoolController> {
        Box::new(self.clone())
    }
}

#[derive(Default)]
pub struct ProtocolState {
    pub sent_payloads: Vec<ConsensusPayload>,
    pub requested_transactions: Vec<TransactionId>,
    pub announced_transactions: Vec<Transaction>,
}

#[derive(Clone, Default)]
pub struct MockProtocol(pub Arc<Mutex<ProtocolState>>);

impl ProtocolController for MockProtocol {
    fn send_payload(&self, payload: ConsensusPayload) -> Result<(), ProtocolError> {
        self.0.lock().unwrap().sent_payloads.push(payload);
        Ok(())
    }

    fn request_transactions(&self, ids: &[TransactionId]) -> Result<(), ProtocolError> {
        self.0
            .lock()
            .unwrap()
            .requested_transactions
            .extend_from_slice(ids);
        Ok(())
    }

    fn announce_transactions(&self, transactions: &[Transaction]) -> Result<(), ProtocolError> {
        self.0
            .lock()
            .unwrap()
            .announced_transactions
            .extend_from_slice(transactions);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ProtocolController> {
        Box::new(self.clone())
    }
}

pub struct TestClock(pub Arc<Mutex<DbftTime>>);

impl Clock for TestClock {
    fn now(&self) -> DbftTime {
        *self.0.lock().unwrap()
    }
}

/// A worker wired to mocks, with handles on everything the tests inspect.
pub struct Fixture {
    pub worker: ConsensusWorker,
    pub keypairs: Vec<KeyPair>,
    pub ledger: Arc<Mutex<LedgerState>>,
    pub pool: Arc<Mutex<Vec<Transaction>>>,
    pub protocol: Arc<Mutex<ProtocolState>>,
    pub clock: Arc<Mutex<DbftTime>>,
    pub wallet: Arc<Wallet>,
    pub event_receiver: DbftReceiver<ConsensusEvent>,
    pub config: ConsensusConfig,
    _temp_dir: TempDir,
}

/// Builds a worker that is validator `my_index` of a fresh committee of
/// `validators_count`, with an empty chain at index 0.
pub fn setup(validators_count: u8, my_index: usize) -> Fixture {
    let keypairs: Vec<KeyPair> = (0..validators_count).map(|_| KeyPair::generate()).collect();
    setup_as(my_index, keypairs)
}

/// Builds a worker for a known committee, so several fixtures can talk to
/// each other.
pub fn setup_as(my_index: usize, keypairs: Vec<KeyPair>) -> Fixture {
    let validators_count = keypairs.len() as u8;
    let temp_dir = TempDir::new().unwrap();
    let validators: Vec<PublicKey> = keypairs.iter().map(KeyPair::get_public_key).collect();

    let mut wallet = Wallet::new(temp_dir.path().join("wallet.json")).unwrap();
    wallet.add_keypair(keypairs[my_index].clone()).unwrap();

    let genesis_id = BlockId(Hash::compute_from(b"genesis"));
    let ledger_state = Arc::new(Mutex::new(LedgerState {
        current_index: 0,
        current_hash: genesis_id,
        validators,
        ..Default::default()
    }));
    let pool_state = Arc::new(Mutex::new(Vec::new()));
    let protocol_state = Arc::new(Mutex::new(ProtocolState::default()));
    let clock_state = Arc::new(Mutex::new(DbftTime::from_millis(100_000)));

    let config = ConsensusConfig {
        chain_id: CHAIN_ID,
        validators_count,
        block_interval: DbftTime::from_millis(BLOCK_INTERVAL_MILLIS),
        max_block_size: 1 << 20,
        max_block_system_fee: Amount::from_raw(1_000_000),
        max_transactions_per_block: 128,
        max_transaction_payload_size: 1 << 16,
        recovery_log_path: temp_dir.path().join("consensus.log"),
        ignore_recovery_logs: false,
    };

    let (event_sender, event_receiver) = DbftChannel::new("consensus_event".to_string(), None);
    let (_command_sender, command_receiver) =
        DbftChannel::new("consensus_command".to_string(), Some(16));

    let wallet = Arc::new(wallet);
    let channels = ConsensusChannels {
        ledger_controller: Box::new(MockLedger(ledger_state.clone())),
        pool_controller: Box::new(MockPool(pool_state.clone())),
        protocol_controller: Box::new(MockProtocol(protocol_state.clone())),
        wallet: wallet.clone(),
        clock: Arc::new(TestClock(clock_state.clone())),
        controller_event_tx: event_sender,
    };

    let mut worker = ConsensusWorker::new(config.clone(), channels, command_receiver);
    worker.context.reset(0);
    Fixture {
        worker,
        keypairs,
        ledger: ledger_state,
        pool: pool_state,
        protocol: protocol_state,
        clock: clock_state,
        wallet,
        event_receiver,
        config,
        _temp_dir: temp_dir,
    }
}

impl Fixture {
    /// Replaces the worker by a fresh one wired to the same mocks, as if the
    /// node had restarted, and runs its startup sequence.
    pub fn restart_worker(&mut self) {
        let (event_sender, event_receiver) = DbftChannel::new("consensus_event".to_string(), None);
        let (_command_sender, command_receiver) =
            DbftChannel::new("consensus_command".to_string(), Some(16));
        let channels = ConsensusChannels {
            ledger_controller: Box::new(MockLedger(self.ledger.clone())),
            pool_controller: Box::new(MockPool(self.pool.clone())),
            protocol_controller: Box::new(MockProtocol(self.protocol.clone())),
            wallet: self.wallet.clone(),
            clock: Arc::new(TestClock(self.clock.clone())),
            controller_event_tx: event_sender,
        };
        self.worker = ConsensusWorker::new(self.config.clone(), channels, command_receiver);
        self.event_receiver = event_receiver;
        self.worker.on_start().unwrap();
    }

    /// Signs a message as the committee member at `validator_index`, for the
    /// block currently being decided.
    pub fn peer_payload(
        &self,
        validator_index: u8,
        view_number: u8,
        body: MessageBody,
    ) -> ConsensusPayload {
        self.peer_payload_at(
            self.worker.context.block_index,
            validator_index,
            view_number,
            body,
        )
    }

    /// Signs a message as the committee member at `validator_index`.
    pub fn peer_payload_at(
        &self,
        block_index: u64,
        validator_index: u8,
        view_number: u8,
        body: MessageBody,
    ) -> ConsensusPayload {
        let message = ConsensusMessage {
            header: MessageHeader {
                block_index,
                validator_index,
                view_number,
            },
            body,
        };
        let mut data = Vec::new();
        ConsensusMessageSerializer::new()
            .serialize(&message, &mut data)
            .unwrap();
        let signable = ConsensusPayload::compute_signable_hash(CHAIN_ID, &data).unwrap();
        let signature = self.keypairs[validator_index as usize].sign(&signable).unwrap();
        ConsensusPayload { data, signature }
    }

    /// Messages broadcast by the worker so far, decoded.
    pub fn sent_messages(&self) -> Vec<ConsensusMessage> {
        let deserializer = ConsensusMessageDeserializer::new(
            self.config.validators_count,
            self.config.max_transactions_per_block,
        );
        self.protocol
            .lock()
            .unwrap()
            .sent_payloads
            .iter()
            .map(|payload| {
                let (_, message) = deserializer
                    .deserialize::<DeserializeError>(&payload.data)
                    .unwrap();
                message
            })
            .collect()
    }

    pub fn drain_sent(&self) {
        self.protocol.lock().unwrap().sent_payloads.clear();
    }
}

/// A transaction with an arbitrary sender and the given fee and payload.
pub fn make_transaction(nonce: u64, system_fee: u64, payload: Vec<u8>) -> Transaction {
    Transaction {
        sender: Address(Hash::compute_from(b"sender")),
        nonce,
        system_fee: Amount::from_raw(system_fee),
        network_fee: Amount::from_raw(1),
        payload,
    }
}
