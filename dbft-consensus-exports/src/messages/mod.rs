//! Wire format of the consensus messages exchanged between validators.
//!
//! Every message starts with a one byte tag, followed by a common header
//! (block index, validator index, view number) and a tag-specific body.

pub mod recovery;

use dbft_models::block_id::{BlockId, BlockIdDeserializer, BlockIdSerializer};
use dbft_models::payload::{PayloadId, PayloadIdDeserializer};
use dbft_models::transaction::{TransactionId, TransactionIdDeserializer};
use dbft_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
    U64VarIntDeserializer, U64VarIntSerializer,
};
use dbft_signature::{Signature, SignatureDeserializer};
use dbft_time::{DbftTime, DbftTimeDeserializer, DbftTimeSerializer};
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::multi::length_count;
use nom::sequence::tuple;
use nom::{IResult, Parser};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use recovery::{RecoveryMessage, RecoveryMessageDeserializer, RecoveryMessageSerializer};
use std::collections::HashSet;
use std::ops::Bound::Included;

/// One byte tag identifying the kind of a consensus message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageTag {
    /// vote to abandon the current view
    ChangeView = 0x00,
    /// block proposal from the primary
    PrepareRequest = 0x20,
    /// acknowledgement of the proposal by a backup
    PrepareResponse = 0x21,
    /// irrevocable commitment to the proposed block
    Commit = 0x30,
    /// ask peers for their consensus state
    RecoveryRequest = 0x40,
    /// replay of collected consensus messages
    RecoveryMessage = 0x41,
}

/// Why a validator asked to leave its current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChangeViewReason {
    /// the view timer expired without progress
    Timeout = 0x00,
    /// enough other validators already asked for the next view
    ChangeAgreement = 0x01,
    /// proposed transactions could not be retrieved
    TxNotFound = 0x02,
    /// a proposed transaction violates local policy
    TxRejectedByPolicy = 0x03,
    /// a proposed transaction failed verification
    TxInvalid = 0x04,
    /// the proposal as a whole violates local policy
    BlockRejectedByPolicy = 0x05,
}

/// Header common to every consensus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// index of the block being decided
    pub block_index: u64,
    /// committee index of the sending validator
    pub validator_index: u8,
    /// view the message was sent in
    pub view_number: u8,
}

/// Body of a `ChangeView` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeView {
    /// local time at which the sender gave up on the view
    pub timestamp: DbftTime,
    /// why the sender wants to leave the view
    pub reason: ChangeViewReason,
}

/// Body of a `PrepareRequest` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    /// protocol version of the proposal
    pub version: u32,
    /// id of the block this proposal extends
    pub prev_hash: BlockId,
    /// proposal timestamp
    pub timestamp: DbftTime,
    /// entropy contributed by the primary
    pub nonce: u64,
    /// ids of the proposed transactions, in block order
    pub transaction_hashes: Vec<TransactionId>,
}

/// Body of a `PrepareResponse` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareResponse {
    /// id of the prepare request envelope being acknowledged
    pub preparation_hash: PayloadId,
}

/// Body of a `Commit` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    /// block signature of the sending validator
    pub signature: Signature,
}

/// Body of a `RecoveryRequest` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRequest {
    /// local time at which recovery was requested
    pub timestamp: DbftTime,
}

/// Tag-specific content of a consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// vote to abandon the current view
    ChangeView(ChangeView),
    /// block proposal from the primary
    PrepareRequest(PrepareRequest),
    /// acknowledgement of the proposal
    PrepareResponse(PrepareResponse),
    /// irrevocable commitment
    Commit(Commit),
    /// ask peers for their consensus state
    RecoveryRequest(RecoveryRequest),
    /// replay of collected consensus messages
    RecoveryMessage(RecoveryMessage),
}

/// A consensus message: common header and tag-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMessage {
    /// common header
    pub header: MessageHeader,
    /// tag-specific body
    pub body: MessageBody,
}

impl ConsensusMessage {
    /// Wire tag of this message.
    pub fn tag(&self) -> MessageTag {
        match &self.body {
            MessageBody::ChangeView(_) => MessageTag::ChangeView,
            MessageBody::PrepareRequest(_) => MessageTag::PrepareRequest,
            MessageBody::PrepareResponse(_) => MessageTag::PrepareResponse,
            MessageBody::Commit(_) => MessageTag::Commit,
            MessageBody::RecoveryRequest(_) => MessageTag::RecoveryRequest,
            MessageBody::RecoveryMessage(_) => MessageTag::RecoveryMessage,
        }
    }

    /// View a `ChangeView` message is voting to move to.
    pub fn new_view_number(&self) -> u8 {
        self.header.view_number.saturating_add(1)
    }
}

/// Serializer for `MessageHeader`
#[derive(Clone)]
pub struct MessageHeaderSerializer {
    u64_serializer: U64VarIntSerializer,
}

impl MessageHeaderSerializer {
    /// Creates a `MessageHeaderSerializer`
    pub fn new() -> Self {
        Self {
            u64_serializer: U64VarIntSerializer::new(),
        }
    }
}

impl Default for MessageHeaderSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<MessageHeader> for MessageHeaderSerializer {
    fn serialize(&self, value: &MessageHeader, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.u64_serializer.serialize(&value.block_index, buffer)?;
        buffer.push(value.validator_index);
        buffer.push(value.view_number);
        Ok(())
    }
}

/// Deserializer for `MessageHeader`
#[derive(Clone)]
pub struct MessageHeaderDeserializer {
    u64_deserializer: U64VarIntDeserializer,
    validators_count: u8,
}

impl MessageHeaderDeserializer {
    /// Creates a `MessageHeaderDeserializer`
    ///
    /// Arguments:
    /// * `validators_count`: number of validators, bounds the validator index
    pub fn new(validators_count: u8) -> Self {
        Self {
            u64_deserializer: U64VarIntDeserializer::new(Included(0), Included(u64::MAX)),
            validators_count,
        }
    }
}

impl Deserializer<MessageHeader> for MessageHeaderDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], MessageHeader, E> {
        context("Failed MessageHeader deserialization", |input: &'a [u8]| {
            let (rest, block_index) = context("Failed block_index deserialization", |input| {
                self.u64_deserializer.deserialize(input)
            })(input)?;
            let (rest, raw) = take(2usize)(rest)?;
            if raw[0] >= self.validators_count {
                return Err(nom::Err::Failure(ContextError::add_context(
                    rest,
                    "validator index out of range",
                    ParseError::from_error_kind(rest, nom::error::ErrorKind::Fail),
                )));
            }
            Ok((
                rest,
                MessageHeader {
                    block_index,
                    validator_index: raw[0],
                    view_number: raw[1],
                },
            ))
        })(buffer)
    }
}

/// Serializer for `PrepareRequest`
#[derive(Clone)]
pub struct PrepareRequestSerializer {
    u32_serializer: U32VarIntSerializer,
    u64_serializer: U64VarIntSerializer,
    block_id_serializer: BlockIdSerializer,
    time_serializer: DbftTimeSerializer,
}

impl PrepareRequestSerializer {
    /// Creates a `PrepareRequestSerializer`
    pub fn new() -> Self {
        Self {
            u32_serializer: U32VarIntSerializer::new(),
            u64_serializer: U64VarIntSerializer::new(),
            block_id_serializer: BlockIdSerializer::new(),
            time_serializer: DbftTimeSerializer::new(),
        }
    }
}

impl Default for PrepareRequestSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<PrepareRequest> for PrepareRequestSerializer {
    fn serialize(
        &self,
        value: &PrepareRequest,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.u32_serializer.serialize(&value.version, buffer)?;
        self.block_id_serializer
            .serialize(&value.prev_hash, buffer)?;
        self.time_serializer.serialize(&value.timestamp, buffer)?;
        self.u64_serializer.serialize(&value.nonce, buffer)?;
        self.u32_serializer.serialize(
            &value.transaction_hashes.len().try_into().map_err(|err| {
                SerializeError::GeneralError(format!("too many transaction hashes: {}", err))
            })?,
            buffer,
        )?;
        for id in value.transaction_hashes.iter() {
            buffer.extend_from_slice(id.to_bytes());
        }
        Ok(())
    }
}

/// Deserializer for `PrepareRequest`
#[derive(Clone)]
pub struct PrepareRequestDeserializer {
    u32_deserializer: U32VarIntDeserializer,
    u64_deserializer: U64VarIntDeserializer,
    block_id_deserializer: BlockIdDeserializer,
    time_deserializer: DbftTimeDeserializer,
    length_hashes_deserializer: U32VarIntDeserializer,
    transaction_id_deserializer: TransactionIdDeserializer,
}

impl PrepareRequestDeserializer {
    /// Creates a `PrepareRequestDeserializer`
    ///
    /// Arguments:
    /// * `max_transactions_per_block`: bound on the proposed transaction count
    pub fn new(max_transactions_per_block: u32) -> Self {
        Self {
            u32_deserializer: U32VarIntDeserializer::new(Included(0), Included(u32::MAX)),
            u64_deserializer: U64VarIntDeserializer::new(Included(0), Included(u64::MAX)),
            block_id_deserializer: BlockIdDeserializer::new(),
            time_deserializer: DbftTimeDeserializer::new((
                Included(DbftTime::from_millis(0)),
                Included(DbftTime::max()),
            )),
            length_hashes_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(max_transactions_per_block),
            ),
            transaction_id_deserializer: TransactionIdDeserializer::new(),
        }
    }
}

impl Deserializer<PrepareRequest> for PrepareRequestDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], PrepareRequest, E> {
        let (rest, prepare_request) = context(
            "Failed PrepareRequest deserialization",
            tuple((
                context("Failed version deserialization", |input| {
                    self.u32_deserializer.deserialize(input)
                }),
                context("Failed prev_hash deserialization", |input| {
                    self.block_id_deserializer.deserialize(input)
                }),
                context("Failed timestamp deserialization", |input| {
                    self.time_deserializer.deserialize(input)
                }),
                context("Failed nonce deserialization", |input| {
                    self.u64_deserializer.deserialize(input)
                }),
                context(
                    "Failed transaction_hashes deserialization",
                    length_count(
                        context("Failed length deserialization", |input| {
                            self.length_hashes_deserializer.deserialize(input)
                        }),
                        context("Failed transaction id deserialization", |input| {
                            self.transaction_id_deserializer.deserialize(input)
                        }),
                    ),
                ),
            )),
        )
        .map(
            |(version, prev_hash, timestamp, nonce, transaction_hashes)| PrepareRequest {
                version,
                prev_hash,
                timestamp,
                nonce,
                transaction_hashes,
            },
        )
        .parse(buffer)?;

        let mut seen = HashSet::new();
        for id in prepare_request.transaction_hashes.iter() {
            if !seen.insert(*id) {
                return Err(nom::Err::Failure(ContextError::add_context(
                    rest,
                    "duplicate transaction hash in proposal",
                    ParseError::from_error_kind(rest, nom::error::ErrorKind::Fail),
                )));
            }
        }
        Ok((rest, prepare_request))
    }
}

/// Serializer for `ConsensusMessage`
#[derive(Clone)]
pub struct ConsensusMessageSerializer {
    header_serializer: MessageHeaderSerializer,
    prepare_request_serializer: PrepareRequestSerializer,
    recovery_serializer: RecoveryMessageSerializer,
    time_serializer: DbftTimeSerializer,
}

impl ConsensusMessageSerializer {
    /// Creates a `ConsensusMessageSerializer`
    pub fn new() -> Self {
        Self {
            header_serializer: MessageHeaderSerializer::new(),
            prepare_request_serializer: PrepareRequestSerializer::new(),
            recovery_serializer: RecoveryMessageSerializer::new(),
            time_serializer: DbftTimeSerializer::new(),
        }
    }
}

impl Default for ConsensusMessageSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<ConsensusMessage> for ConsensusMessageSerializer {
    fn serialize(
        &self,
        value: &ConsensusMessage,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        buffer.push(value.tag().into());
        self.header_serializer.serialize(&value.header, buffer)?;
        match &value.body {
            MessageBody::ChangeView(change_view) => {
                self.time_serializer
                    .serialize(&change_view.timestamp, buffer)?;
                buffer.push(change_view.reason.into());
            }
            MessageBody::PrepareRequest(prepare_request) => {
                self.prepare_request_serializer
                    .serialize(prepare_request, buffer)?;
            }
            MessageBody::PrepareResponse(prepare_response) => {
                buffer.extend_from_slice(prepare_response.preparation_hash.0.to_bytes());
            }
            MessageBody::Commit(commit) => {
                buffer.extend_from_slice(&commit.signature.to_bytes());
            }
            MessageBody::RecoveryRequest(recovery_request) => {
                self.time_serializer
                    .serialize(&recovery_request.timestamp, buffer)?;
            }
            MessageBody::RecoveryMessage(recovery) => {
                self.recovery_serializer.serialize(recovery, buffer)?;
            }
        }
        Ok(())
    }
}

/// Deserializer for `ConsensusMessage`
#[derive(Clone)]
pub struct ConsensusMessageDeserializer {
    header_deserializer: MessageHeaderDeserializer,
    prepare_request_deserializer: PrepareRequestDeserializer,
    recovery_deserializer: RecoveryMessageDeserializer,
    time_deserializer: DbftTimeDeserializer,
    payload_id_deserializer: PayloadIdDeserializer,
    signature_deserializer: SignatureDeserializer,
}

impl ConsensusMessageDeserializer {
    /// Creates a `ConsensusMessageDeserializer`
    ///
    /// Arguments:
    /// * `validators_count`: number of validators
    /// * `max_transactions_per_block`: bound on the proposed transaction count
    pub fn new(validators_count: u8, max_transactions_per_block: u32) -> Self {
        Self {
            header_deserializer: MessageHeaderDeserializer::new(validators_count),
            prepare_request_deserializer: PrepareRequestDeserializer::new(
                max_transactions_per_block,
            ),
            recovery_deserializer: RecoveryMessageDeserializer::new(
                validators_count,
                max_transactions_per_block,
            ),
            time_deserializer: DbftTimeDeserializer::new((
                Included(DbftTime::from_millis(0)),
                Included(DbftTime::max()),
            )),
            payload_id_deserializer: PayloadIdDeserializer::new(),
            signature_deserializer: SignatureDeserializer::new(),
        }
    }
}

impl Deserializer<ConsensusMessage> for ConsensusMessageDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], ConsensusMessage, E> {
        context(
            "Failed ConsensusMessage deserialization",
            |input: &'a [u8]| {
                let (rest, raw_tag) = take(1usize)(input)?;
                let tag = MessageTag::try_from(raw_tag[0]).map_err(|_| {
                    nom::Err::Error(ParseError::from_error_kind(
                        input,
                        nom::error::ErrorKind::Verify,
                    ))
                })?;
                let (rest, header) = self.header_deserializer.deserialize(rest)?;
                let (rest, body) = match tag {
                    MessageTag::ChangeView => {
                        let (rest, timestamp) = context(
                            "Failed change view timestamp deserialization",
                            |input| self.time_deserializer.deserialize(input),
                        )(rest)?;
                        let (rest, raw_reason) = take(1usize)(rest)?;
                        let reason = ChangeViewReason::try_from(raw_reason[0]).map_err(|_| {
                            nom::Err::Error(ParseError::from_error_kind(
                                rest,
                                nom::error::ErrorKind::Verify,
                            ))
                        })?;
                        (rest, MessageBody::ChangeView(ChangeView { timestamp, reason }))
                    }
                    MessageTag::PrepareRequest => {
                        let (rest, prepare_request) =
                            self.prepare_request_deserializer.deserialize(rest)?;
                        (rest, MessageBody::PrepareRequest(prepare_request))
                    }
                    MessageTag::PrepareResponse => {
                        let (rest, preparation_hash) =
                            self.payload_id_deserializer.deserialize(rest)?;
                        (
                            rest,
                            MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
                        )
                    }
                    MessageTag::Commit => {
                        let (rest, signature) = self.signature_deserializer.deserialize(rest)?;
                        (rest, MessageBody::Commit(Commit { signature }))
                    }
                    MessageTag::RecoveryRequest => {
                        let (rest, timestamp) = context(
                            "Failed recovery request timestamp deserialization",
                            |input| self.time_deserializer.deserialize(input),
                        )(rest)?;
                        (
                            rest,
                            MessageBody::RecoveryRequest(RecoveryRequest { timestamp }),
                        )
                    }
                    MessageTag::RecoveryMessage => {
                        let (rest, recovery) = self.recovery_deserializer.deserialize(rest)?;
                        (rest, MessageBody::RecoveryMessage(recovery))
                    }
                };
                Ok((rest, ConsensusMessage { header, body }))
            },
        )(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_hash::Hash;
    use dbft_serialization::DeserializeError;
    use dbft_signature::KeyPair;

    fn header() -> MessageHeader {
        MessageHeader {
            block_index: 12,
            validator_index: 3,
            view_number: 1,
        }
    }

    fn roundtrip(message: ConsensusMessage) -> ConsensusMessage {
        let mut buffer = Vec::new();
        ConsensusMessageSerializer::new()
            .serialize(&message, &mut buffer)
            .unwrap();
        let (rest, decoded) = ConsensusMessageDeserializer::new(7, 512)
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        decoded
    }

    #[test]
    fn test_change_view_roundtrip() {
        let message = ConsensusMessage {
            header: header(),
            body: MessageBody::ChangeView(ChangeView {
                timestamp: DbftTime::from_millis(123_456),
                reason: ChangeViewReason::Timeout,
            }),
        };
        assert_eq!(roundtrip(message.clone()), message);
        assert_eq!(message.new_view_number(), 2);
    }

    #[test]
    fn test_prepare_request_roundtrip() {
        let message = ConsensusMessage {
            header: header(),
            body: MessageBody::PrepareRequest(PrepareRequest {
                version: 0,
                prev_hash: BlockId(Hash::compute_from(b"prev")),
                timestamp: DbftTime::from_millis(99),
                nonce: 0xdead_beef,
                transaction_hashes: vec![
                    TransactionId(Hash::compute_from(b"tx1")),
                    TransactionId(Hash::compute_from(b"tx2")),
                ],
            }),
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_prepare_response_and_commit_roundtrip() {
        let response = ConsensusMessage {
            header: header(),
            body: MessageBody::PrepareResponse(PrepareResponse {
                preparation_hash: PayloadId(Hash::compute_from(b"prep")),
            }),
        };
        assert_eq!(roundtrip(response.clone()), response);

        let keypair = KeyPair::generate();
        let commit = ConsensusMessage {
            header: header(),
            body: MessageBody::Commit(Commit {
                signature: keypair.sign(&Hash::compute_from(b"block")).unwrap(),
            }),
        };
        assert_eq!(roundtrip(commit.clone()), commit);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buffer = Vec::new();
        ConsensusMessageSerializer::new()
            .serialize(
                &ConsensusMessage {
                    header: header(),
                    body: MessageBody::RecoveryRequest(RecoveryRequest {
                        timestamp: DbftTime::from_millis(5),
                    }),
                },
                &mut buffer,
            )
            .unwrap();
        buffer[0] = 0x7f;
        assert!(ConsensusMessageDeserializer::new(7, 512)
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }

    #[test]
    fn test_validator_index_out_of_range_rejected() {
        let mut buffer = Vec::new();
        ConsensusMessageSerializer::new()
            .serialize(
                &ConsensusMessage {
                    header: MessageHeader {
                        block_index: 1,
                        validator_index: 6,
                        view_number: 0,
                    },
                    body: MessageBody::RecoveryRequest(RecoveryRequest {
                        timestamp: DbftTime::from_millis(5),
                    }),
                },
                &mut buffer,
            )
            .unwrap();
        // committee of 4 has validator indices 0..=3
        assert!(ConsensusMessageDeserializer::new(4, 512)
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }

    #[test]
    fn test_duplicate_transaction_hashes_rejected() {
        let id = TransactionId(Hash::compute_from(b"tx"));
        let message = ConsensusMessage {
            header: header(),
            body: MessageBody::PrepareRequest(PrepareRequest {
                version: 0,
                prev_hash: BlockId(Hash::compute_from(b"prev")),
                timestamp: DbftTime::from_millis(1),
                nonce: 0,
                transaction_hashes: vec![id, id],
            }),
        };
        let mut buffer = Vec::new();
        ConsensusMessageSerializer::new()
            .serialize(&message, &mut buffer)
            .unwrap();
        assert!(ConsensusMessageDeserializer::new(7, 512)
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }
}
