//! Compact forms of consensus messages carried inside a recovery message.
//!
//! A recovery message replays everything its sender collected for the current
//! block: change view votes, the prepare request, preparation acknowledgements
//! and commits. Each compact keeps the original envelope signature so the
//! receiver can rebuild the exact signed payload and verify it.

use super::{ChangeViewReason, PrepareRequest, PrepareRequestDeserializer, PrepareRequestSerializer};
use dbft_models::payload::{PayloadId, PayloadIdDeserializer};
use dbft_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
};
use dbft_signature::{Signature, SignatureDeserializer};
use dbft_time::{DbftTime, DbftTimeDeserializer, DbftTimeSerializer};
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::multi::length_count;
use nom::IResult;
use std::collections::BTreeMap;
use std::ops::Bound::Included;

/// Compact form of a `ChangeView` message.
///
/// Carries the reason so that the original message bytes, and therefore the
/// envelope signature, can be rebuilt exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeViewPayloadCompact {
    /// committee index of the original sender
    pub validator_index: u8,
    /// view the sender was in when it voted to change
    pub original_view_number: u8,
    /// timestamp of the original message
    pub timestamp: DbftTime,
    /// reason of the original message
    pub reason: ChangeViewReason,
    /// envelope signature of the original message
    pub payload_signature: Signature,
}

/// Compact form of a preparation message.
///
/// For the primary this stands for its `PrepareRequest`, for backups for
/// their `PrepareResponse`. Both bodies are fully determined by the recovery
/// message itself, so only the envelope signature is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparationPayloadCompact {
    /// committee index of the original sender
    pub validator_index: u8,
    /// envelope signature of the original message
    pub payload_signature: Signature,
}

/// Compact form of a `Commit` message.
///
/// Keeps its own view number: commits are irrevocable, so a commit sent in an
/// earlier view is still replayed after a view change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPayloadCompact {
    /// committee index of the original sender
    pub validator_index: u8,
    /// view the commit was sent in
    pub view_number: u8,
    /// block signature carried by the commit
    pub signature: Signature,
    /// envelope signature of the original message
    pub payload_signature: Signature,
}

/// Body of a `RecoveryMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveryMessage {
    /// change view votes collected for the current block, by validator index
    pub change_view_messages: BTreeMap<u8, ChangeViewPayloadCompact>,
    /// the prepare request of the current view, if the sender holds it
    pub prepare_request: Option<PrepareRequest>,
    /// id of the prepare request envelope, sent instead of the full request
    /// when the sender only acknowledged it
    pub preparation_hash: Option<PayloadId>,
    /// preparation messages collected for the current view, by validator index
    pub preparation_messages: BTreeMap<u8, PreparationPayloadCompact>,
    /// commits collected for the current block, by validator index
    pub commit_messages: BTreeMap<u8, CommitPayloadCompact>,
}

/// Serializer for `RecoveryMessage`
#[derive(Clone)]
pub struct RecoveryMessageSerializer {
    u32_serializer: U32VarIntSerializer,
    time_serializer: DbftTimeSerializer,
    prepare_request_serializer: PrepareRequestSerializer,
}

impl RecoveryMessageSerializer {
    /// Creates a `RecoveryMessageSerializer`
    pub fn new() -> Self {
        Self {
            u32_serializer: U32VarIntSerializer::new(),
            time_serializer: DbftTimeSerializer::new(),
            prepare_request_serializer: PrepareRequestSerializer::new(),
        }
    }

    fn serialize_count(
        &self,
        count: usize,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.u32_serializer.serialize(
            &count
                .try_into()
                .map_err(|err| SerializeError::GeneralError(format!("count overflow: {}", err)))?,
            buffer,
        )
    }
}

impl Default for RecoveryMessageSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<RecoveryMessage> for RecoveryMessageSerializer {
    fn serialize(
        &self,
        value: &RecoveryMessage,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.serialize_count(value.change_view_messages.len(), buffer)?;
        for change_view in value.change_view_messages.values() {
            buffer.push(change_view.validator_index);
            buffer.push(change_view.original_view_number);
            self.time_serializer
                .serialize(&change_view.timestamp, buffer)?;
            buffer.push(change_view.reason.into());
            buffer.extend_from_slice(&change_view.payload_signature.to_bytes());
        }

        match &value.prepare_request {
            Some(prepare_request) => {
                buffer.push(1);
                self.prepare_request_serializer
                    .serialize(prepare_request, buffer)?;
            }
            None => {
                buffer.push(0);
                match &value.preparation_hash {
                    Some(preparation_hash) => {
                        buffer.push(1);
                        buffer.extend_from_slice(preparation_hash.0.to_bytes());
                    }
                    None => buffer.push(0),
                }
            }
        }

        self.serialize_count(value.preparation_messages.len(), buffer)?;
        for preparation in value.preparation_messages.values() {
            buffer.push(preparation.validator_index);
            buffer.extend_from_slice(&preparation.payload_signature.to_bytes());
        }

        self.serialize_count(value.commit_messages.len(), buffer)?;
        for commit in value.commit_messages.values() {
            buffer.push(commit.validator_index);
            buffer.push(commit.view_number);
            buffer.extend_from_slice(&commit.signature.to_bytes());
            buffer.extend_from_slice(&commit.payload_signature.to_bytes());
        }
        Ok(())
    }
}

/// Deserializer for `RecoveryMessage`
#[derive(Clone)]
pub struct RecoveryMessageDeserializer {
    length_deserializer: U32VarIntDeserializer,
    time_deserializer: DbftTimeDeserializer,
    prepare_request_deserializer: PrepareRequestDeserializer,
    payload_id_deserializer: PayloadIdDeserializer,
    signature_deserializer: SignatureDeserializer,
    validators_count: u8,
}

impl RecoveryMessageDeserializer {
    /// Creates a `RecoveryMessageDeserializer`
    ///
    /// Arguments:
    /// * `validators_count`: number of validators, bounds all indices and counts
    /// * `max_transactions_per_block`: bound on the nested proposal size
    pub fn new(validators_count: u8, max_transactions_per_block: u32) -> Self {
        Self {
            length_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(validators_count as u32),
            ),
            time_deserializer: DbftTimeDeserializer::new((
                Included(DbftTime::from_millis(0)),
                Included(DbftTime::max()),
            )),
            prepare_request_deserializer: PrepareRequestDeserializer::new(
                max_transactions_per_block,
            ),
            payload_id_deserializer: PayloadIdDeserializer::new(),
            signature_deserializer: SignatureDeserializer::new(),
            validators_count,
        }
    }

    fn check_index<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        input: &'a [u8],
        index: u8,
    ) -> Result<(), nom::Err<E>> {
        if index >= self.validators_count {
            return Err(nom::Err::Failure(ContextError::add_context(
                input,
                "validator index out of range",
                ParseError::from_error_kind(input, nom::error::ErrorKind::Fail),
            )));
        }
        Ok(())
    }

    fn collect_map<'a, T, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        input: &'a [u8],
        entries: Vec<(u8, T)>,
    ) -> Result<BTreeMap<u8, T>, nom::Err<E>> {
        let mut map = BTreeMap::new();
        for (index, entry) in entries {
            if map.insert(index, entry).is_some() {
                return Err(nom::Err::Failure(ContextError::add_context(
                    input,
                    "duplicate validator index in recovery message",
                    ParseError::from_error_kind(input, nom::error::ErrorKind::Fail),
                )));
            }
        }
        Ok(map)
    }
}

impl Deserializer<RecoveryMessage> for RecoveryMessageDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], RecoveryMessage, E> {
        context(
            "Failed RecoveryMessage deserialization",
            |input: &'a [u8]| {
                let (rest, change_views) = context(
                    "Failed change view messages deserialization",
                    length_count(
                        |input| self.length_deserializer.deserialize(input),
                        |input: &'a [u8]| {
                            let (rest, raw) = take(2usize)(input)?;
                            self.check_index::<E>(input, raw[0])?;
                            let (rest, timestamp) = self.time_deserializer.deserialize(rest)?;
                            let (rest, raw_reason) = take(1usize)(rest)?;
                            let reason =
                                ChangeViewReason::try_from(raw_reason[0]).map_err(|_| {
                                    nom::Err::Error(ParseError::from_error_kind(
                                        rest,
                                        nom::error::ErrorKind::Verify,
                                    ))
                                })?;
                            let (rest, payload_signature) =
                                self.signature_deserializer.deserialize(rest)?;
                            Ok((
                                rest,
                                (
                                    raw[0],
                                    ChangeViewPayloadCompact {
                                        validator_index: raw[0],
                                        original_view_number: raw[1],
                                        timestamp,
                                        reason,
                                        payload_signature,
                                    },
                                ),
                            ))
                        },
                    ),
                )(input)?;
                let change_view_messages = self.collect_map(input, change_views)?;

                let (rest, flag) = take(1usize)(rest)?;
                let (rest, prepare_request, preparation_hash) = if flag[0] == 1 {
                    let (rest, prepare_request) = context(
                        "Failed nested prepare request deserialization",
                        |input| self.prepare_request_deserializer.deserialize(input),
                    )(rest)?;
                    (rest, Some(prepare_request), None)
                } else {
                    let (rest, hash_flag) = take(1usize)(rest)?;
                    if hash_flag[0] == 1 {
                        let (rest, preparation_hash) = context(
                            "Failed preparation hash deserialization",
                            |input| self.payload_id_deserializer.deserialize(input),
                        )(rest)?;
                        (rest, None, Some(preparation_hash))
                    } else {
                        (rest, None, None)
                    }
                };

                let (rest, preparations) = context(
                    "Failed preparation messages deserialization",
                    length_count(
                        |input| self.length_deserializer.deserialize(input),
                        |input: &'a [u8]| {
                            let (rest, raw) = take(1usize)(input)?;
                            self.check_index::<E>(input, raw[0])?;
                            let (rest, payload_signature) =
                                self.signature_deserializer.deserialize(rest)?;
                            Ok((
                                rest,
                                (
                                    raw[0],
                                    PreparationPayloadCompact {
                                        validator_index: raw[0],
                                        payload_signature,
                                    },
                                ),
                            ))
                        },
                    ),
                )(rest)?;
                let preparation_messages = self.collect_map(input, preparations)?;

                let (rest, commits) = context(
                    "Failed commit messages deserialization",
                    length_count(
                        |input| self.length_deserializer.deserialize(input),
                        |input: &'a [u8]| {
                            let (rest, raw) = take(2usize)(input)?;
                            self.check_index::<E>(input, raw[0])?;
                            let (rest, signature) =
                                self.signature_deserializer.deserialize(rest)?;
                            let (rest, payload_signature) =
                                self.signature_deserializer.deserialize(rest)?;
                            Ok((
                                rest,
                                (
                                    raw[0],
                                    CommitPayloadCompact {
                                        validator_index: raw[0],
                                        view_number: raw[1],
                                        signature,
                                        payload_signature,
                                    },
                                ),
                            ))
                        },
                    ),
                )(rest)?;
                let commit_messages = self.collect_map(input, commits)?;

                Ok((
                    rest,
                    RecoveryMessage {
                        change_view_messages,
                        prepare_request,
                        preparation_hash,
                        preparation_messages,
                        commit_messages,
                    },
                ))
            },
        )(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_hash::Hash;
    use dbft_models::block_id::BlockId;
    use dbft_models::transaction::TransactionId;
    use dbft_serialization::DeserializeError;
    use dbft_signature::KeyPair;

    fn signature(tag: &[u8]) -> Signature {
        KeyPair::generate()
            .sign(&Hash::compute_from(tag))
            .unwrap()
    }

    fn full_recovery() -> RecoveryMessage {
        let mut change_view_messages = BTreeMap::new();
        change_view_messages.insert(
            0,
            ChangeViewPayloadCompact {
                validator_index: 0,
                original_view_number: 0,
                timestamp: DbftTime::from_millis(10),
                reason: ChangeViewReason::Timeout,
                payload_signature: signature(b"cv0"),
            },
        );
        let mut preparation_messages = BTreeMap::new();
        preparation_messages.insert(
            2,
            PreparationPayloadCompact {
                validator_index: 2,
                payload_signature: signature(b"prep2"),
            },
        );
        let mut commit_messages = BTreeMap::new();
        commit_messages.insert(
            1,
            CommitPayloadCompact {
                validator_index: 1,
                view_number: 1,
                signature: signature(b"block"),
                payload_signature: signature(b"commit1"),
            },
        );
        RecoveryMessage {
            change_view_messages,
            prepare_request: Some(PrepareRequest {
                version: 0,
                prev_hash: BlockId(Hash::compute_from(b"prev")),
                timestamp: DbftTime::from_millis(20),
                nonce: 3,
                transaction_hashes: vec![TransactionId(Hash::compute_from(b"tx"))],
            }),
            preparation_hash: None,
            preparation_messages,
            commit_messages,
        }
    }

    fn roundtrip(recovery: RecoveryMessage) -> RecoveryMessage {
        let mut buffer = Vec::new();
        RecoveryMessageSerializer::new()
            .serialize(&recovery, &mut buffer)
            .unwrap();
        let (rest, decoded) = RecoveryMessageDeserializer::new(7, 512)
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        decoded
    }

    #[test]
    fn test_recovery_with_prepare_request_roundtrip() {
        let recovery = full_recovery();
        assert_eq!(roundtrip(recovery.clone()), recovery);
    }

    #[test]
    fn test_recovery_with_preparation_hash_roundtrip() {
        let mut recovery = full_recovery();
        recovery.prepare_request = None;
        recovery.preparation_hash = Some(PayloadId(Hash::compute_from(b"prep req")));
        assert_eq!(roundtrip(recovery.clone()), recovery);
    }

    #[test]
    fn test_recovery_without_preparations_roundtrip() {
        let mut recovery = full_recovery();
        recovery.prepare_request = None;
        recovery.preparation_hash = None;
        recovery.preparation_messages.clear();
        assert_eq!(roundtrip(recovery.clone()), recovery);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut recovery = full_recovery();
        recovery.commit_messages.insert(
            9,
            CommitPayloadCompact {
                validator_index: 9,
                view_number: 0,
                signature: signature(b"sig"),
                payload_signature: signature(b"payload"),
            },
        );
        let mut buffer = Vec::new();
        RecoveryMessageSerializer::new()
            .serialize(&recovery, &mut buffer)
            .unwrap();
        assert!(RecoveryMessageDeserializer::new(7, 512)
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }
}
