//! On-disk snapshot of the consensus context.
//!
//! The snapshot is written just before a commit is broadcast and read back on
//! startup, so a restarting node honors the commitments it already made. It
//! stores the raw signed envelopes: reloading goes through the same decoding
//! and verification as messages received from the network.

use super::{ConsensusContext, StoredPayload};
use dbft_consensus_exports::error::ConsensusError;
use dbft_consensus_exports::messages::MessageBody;
use dbft_models::payload::{
    ConsensusPayload, ConsensusPayloadDeserializer, ConsensusPayloadSerializer,
};
use dbft_models::transaction::{Transaction, TransactionDeserializer, TransactionSerializer};
use dbft_serialization::{
    DeserializeError, Deserializer, SerializeError, Serializer, U32VarIntDeserializer,
    U32VarIntSerializer, U64VarIntDeserializer, U64VarIntSerializer,
};
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::multi::length_count;
use nom::sequence::tuple;
use nom::{IResult, Parser};
use std::ops::Bound::Included;
use tracing::log::warn;

/// Everything needed to resume a consensus round after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextSnapshot {
    /// height that was being decided
    pub block_index: u64,
    /// view that was current
    pub view_number: u8,
    /// change view votes, by validator index
    pub change_view_payloads: Vec<(u8, ConsensusPayload)>,
    /// carried change view votes from abandoned views, by validator index
    pub last_change_view_payloads: Vec<(u8, ConsensusPayload)>,
    /// preparation messages of the current view, by validator index
    pub preparation_payloads: Vec<(u8, ConsensusPayload)>,
    /// commits, by validator index
    pub commit_payloads: Vec<(u8, ConsensusPayload)>,
    /// proposal transactions retrieved before the snapshot
    pub transactions: Vec<Transaction>,
}

/// Serializer for `ContextSnapshot`
#[derive(Clone)]
pub struct ContextSnapshotSerializer {
    u32_serializer: U32VarIntSerializer,
    u64_serializer: U64VarIntSerializer,
    payload_serializer: ConsensusPayloadSerializer,
    transaction_serializer: TransactionSerializer,
}

impl ContextSnapshotSerializer {
    /// Creates a `ContextSnapshotSerializer`
    pub fn new() -> Self {
        Self {
            u32_serializer: U32VarIntSerializer::new(),
            u64_serializer: U64VarIntSerializer::new(),
            payload_serializer: ConsensusPayloadSerializer::new(),
            transaction_serializer: TransactionSerializer::new(),
        }
    }

    fn serialize_slots(
        &self,
        slots: &[(u8, ConsensusPayload)],
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.u32_serializer.serialize(
            &slots.len().try_into().map_err(|err| {
                SerializeError::GeneralError(format!("too many payload slots: {}", err))
            })?,
            buffer,
        )?;
        for (index, payload) in slots.iter() {
            buffer.push(*index);
            self.payload_serializer.serialize(payload, buffer)?;
        }
        Ok(())
    }
}

impl Default for ContextSnapshotSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<ContextSnapshot> for ContextSnapshotSerializer {
    fn serialize(&self, value: &ContextSnapshot, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.u64_serializer.serialize(&value.block_index, buffer)?;
        buffer.push(value.view_number);
        self.serialize_slots(&value.change_view_payloads, buffer)?;
        self.serialize_slots(&value.last_change_view_payloads, buffer)?;
        self.serialize_slots(&value.preparation_payloads, buffer)?;
        self.serialize_slots(&value.commit_payloads, buffer)?;
        self.u32_serializer.serialize(
            &value.transactions.len().try_into().map_err(|err| {
                SerializeError::GeneralError(format!("too many transactions: {}", err))
            })?,
            buffer,
        )?;
        for transaction in value.transactions.iter() {
            self.transaction_serializer.serialize(transaction, buffer)?;
        }
        Ok(())
    }
}

/// Deserializer for `ContextSnapshot`
#[derive(Clone)]
pub struct ContextSnapshotDeserializer {
    u64_deserializer: U64VarIntDeserializer,
    slot_count_deserializer: U32VarIntDeserializer,
    transaction_count_deserializer: U32VarIntDeserializer,
    payload_deserializer: ConsensusPayloadDeserializer,
    transaction_deserializer: TransactionDeserializer,
}

impl ContextSnapshotDeserializer {
    /// Creates a `ContextSnapshotDeserializer`
    ///
    /// Arguments:
    /// * `validators_count`: bounds the number of payload slots
    /// * `max_transactions_per_block`: bounds the stored transaction count
    /// * `max_transaction_payload_size`: bound used when decoding transactions
    /// * `max_message_size`: bound on the size of one stored envelope
    pub fn new(
        validators_count: u8,
        max_transactions_per_block: u32,
        max_transaction_payload_size: u32,
        max_message_size: u32,
    ) -> Self {
        Self {
            u64_deserializer: U64VarIntDeserializer::new(Included(0), Included(u64::MAX)),
            slot_count_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(validators_count as u32),
            ),
            transaction_count_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(max_transactions_per_block),
            ),
            payload_deserializer: ConsensusPayloadDeserializer::new(max_message_size),
            transaction_deserializer: TransactionDeserializer::new(max_transaction_payload_size),
        }
    }

    fn deserialize_slots<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Vec<(u8, ConsensusPayload)>, E> {
        context(
            "Failed payload slots deserialization",
            length_count(
                context("Failed count deserialization", |input| {
                    self.slot_count_deserializer.deserialize(input)
                }),
                |input: &'a [u8]| {
                    let (rest, raw) = take(1usize)(input)?;
                    let (rest, payload) = self.payload_deserializer.deserialize(rest)?;
                    Ok((rest, (raw[0], payload)))
                },
            ),
        )(buffer)
    }
}

impl Deserializer<ContextSnapshot> for ContextSnapshotDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], ContextSnapshot, E> {
        context(
            "Failed ContextSnapshot deserialization",
            tuple((
                context("Failed block_index deserialization", |input| {
                    self.u64_deserializer.deserialize(input)
                }),
                |input: &'a [u8]| {
                    let (rest, raw) = take(1usize)(input)?;
                    Ok((rest, raw[0]))
                },
                |input| self.deserialize_slots(input),
                |input| self.deserialize_slots(input),
                |input| self.deserialize_slots(input),
                |input| self.deserialize_slots(input),
                context(
                    "Failed transactions deserialization",
                    length_count(
                        context("Failed count deserialization", |input| {
                            self.transaction_count_deserializer.deserialize(input)
                        }),
                        context("Failed transaction deserialization", |input| {
                            self.transaction_deserializer.deserialize(input)
                        }),
                    ),
                ),
            )),
        )
        .map(
            |(
                block_index,
                view_number,
                change_view_payloads,
                last_change_view_payloads,
                preparation_payloads,
                commit_payloads,
                transactions,
            )| ContextSnapshot {
                block_index,
                view_number,
                change_view_payloads,
                last_change_view_payloads,
                preparation_payloads,
                commit_payloads,
                transactions,
            },
        )
        .parse(buffer)
    }
}

impl ConsensusContext {
    fn snapshot_slots(slots: &[Option<StoredPayload>]) -> Vec<(u8, ConsensusPayload)> {
        slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref()
                    .map(|stored| (index as u8, stored.payload.clone()))
            })
            .collect()
    }

    /// Bound on the size of one stored envelope, dominated by the proposed
    /// transaction id list of a recovery message.
    fn max_message_size(&self) -> u32 {
        self.config
            .max_transactions_per_block
            .saturating_mul(33)
            .saturating_add(16_384)
    }

    /// Writes the current consensus state to the recovery log.
    pub fn save(&self) -> Result<(), ConsensusError> {
        let snapshot = ContextSnapshot {
            block_index: self.block_index,
            view_number: self.view_number,
            change_view_payloads: Self::snapshot_slots(&self.change_view_payloads),
            last_change_view_payloads: Self::snapshot_slots(&self.last_change_view_payloads),
            preparation_payloads: Self::snapshot_slots(&self.preparation_payloads),
            commit_payloads: Self::snapshot_slots(&self.commit_payloads),
            transactions: self.transactions.values().cloned().collect(),
        };
        let mut buffer = Vec::new();
        ContextSnapshotSerializer::new().serialize(&snapshot, &mut buffer)?;
        std::fs::write(&self.config.recovery_log_path, buffer)?;
        Ok(())
    }

    /// Reads the recovery log back, `None` when absent or unreadable.
    pub fn load(&self) -> Option<ContextSnapshot> {
        let buffer = std::fs::read(&self.config.recovery_log_path).ok()?;
        let deserializer = ContextSnapshotDeserializer::new(
            self.config.validators_count,
            self.config.max_transactions_per_block,
            self.config.max_transaction_payload_size,
            self.max_message_size(),
        );
        match deserializer.deserialize::<DeserializeError>(&buffer) {
            Ok((rest, snapshot)) if rest.is_empty() => Some(snapshot),
            _ => {
                warn!("ignoring corrupted consensus recovery log");
                None
            }
        }
    }

    /// Restores the context from a snapshot taken at the same height.
    ///
    /// Every stored envelope goes through decoding and signature verification
    /// again; envelopes that no longer decode or verify are dropped.
    pub fn restore(&mut self, snapshot: ContextSnapshot) -> Result<(), ConsensusError> {
        if snapshot.block_index != self.block_index {
            return Err(ConsensusError::ContainerInconsistency(format!(
                "recovery log is for block {} but block {} is being decided",
                snapshot.block_index, self.block_index
            )));
        }
        self.view_number = snapshot.view_number;
        let n = self.validators.len();
        let deserializer = self.message_deserializer.clone();
        let decode = |payload: &ConsensusPayload| match deserializer
            .deserialize::<DeserializeError>(&payload.data)
        {
            Ok((rest, message)) if rest.is_empty() => Some(message),
            _ => None,
        };
        let restore_slots =
            |context: &ConsensusContext, entries: Vec<(u8, ConsensusPayload)>| {
                entries
                    .into_iter()
                    .filter_map(|(index, payload)| {
                        if (index as usize) >= n {
                            return None;
                        }
                        let message = decode(&payload)?;
                        if message.header.validator_index != index
                            || context.verify_payload_signature(&payload, index).is_err()
                        {
                            warn!(
                                "dropping a recovery log entry not signed by validator {}",
                                index
                            );
                            return None;
                        }
                        Some((index as usize, StoredPayload { payload, message }))
                    })
                    .collect::<Vec<_>>()
            };
        for (index, stored) in restore_slots(self, snapshot.change_view_payloads) {
            self.change_view_payloads[index] = Some(stored);
        }
        for (index, stored) in restore_slots(self, snapshot.last_change_view_payloads) {
            self.last_change_view_payloads[index] = Some(stored);
        }
        for (index, stored) in restore_slots(self, snapshot.preparation_payloads) {
            self.preparation_payloads[index] = Some(stored);
        }
        for (index, stored) in restore_slots(self, snapshot.commit_payloads) {
            self.commit_payloads[index] = Some(stored);
        }

        self.restore_proposal()?;
        for transaction in snapshot.transactions {
            let id = transaction.compute_id(&self.transaction_serializer)?;
            let entry = self
                .verification_fees
                .entry(transaction.sender)
                .or_default();
            *entry = entry.saturating_add(transaction.total_fee());
            self.transactions.insert(id, transaction);
        }
        Ok(())
    }

    /// Re-applies the proposal fields from the stored prepare request of the
    /// restored view, if any.
    pub fn restore_proposal(&mut self) -> Result<(), ConsensusError> {
        let primary = self.primary_index(self.view_number) as usize;
        let request = match &self.preparation_payloads[primary] {
            Some(stored) => match &stored.message.body {
                MessageBody::PrepareRequest(request) => request.clone(),
                _ => return Ok(()),
            },
            None => return Ok(()),
        };
        self.apply_prepare_request(
            request.version,
            request.timestamp,
            request.nonce,
            request.transaction_hashes,
        );
        Ok(())
    }
}
