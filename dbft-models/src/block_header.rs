use crate::address::{Address, AddressDeserializer, AddressSerializer};
use crate::block_id::{BlockId, BlockIdDeserializer, BlockIdSerializer};
use crate::error::ModelsError;
use dbft_hash::{Hash, HashDeserializer};
use dbft_serialization::{
    Deserializer, SerializeError, Serializer, U64VarIntDeserializer, U64VarIntSerializer,
};
use dbft_time::{DbftTime, DbftTimeDeserializer, DbftTimeSerializer};
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::sequence::tuple;
use nom::{IResult, Parser};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;

/// The header of a block proposed through consensus.
///
/// The primary fills every field when building its proposal; backups rebuild
/// the exact same header from the consensus messages they collected, so the
/// identifier of the locally rebuilt header must match the proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// id of the previous block in the chain
    pub prev_hash: BlockId,
    /// height of this block
    pub index: u64,
    /// proposal timestamp chosen by the primary
    pub timestamp: DbftTime,
    /// index of the validator that proposed this block
    pub primary_index: u8,
    /// merkle root of the included transaction ids
    pub merkle_root: Hash,
    /// account designated to validate the next block
    pub next_consensus: Address,
}

impl BlockHeader {
    /// Computes the block id from the serialized header.
    pub fn compute_id(&self, serializer: &BlockHeaderSerializer) -> Result<BlockId, ModelsError> {
        let mut buffer = Vec::new();
        serializer.serialize(self, &mut buffer)?;
        Ok(BlockId(Hash::compute_from(&buffer)))
    }

    /// Hash signed by validators when committing to this header.
    ///
    /// Covers the chain id so that a signature is only valid on one network.
    pub fn compute_signable_hash(
        &self,
        chain_id: u64,
        serializer: &BlockHeaderSerializer,
    ) -> Result<Hash, ModelsError> {
        let mut buffer = Vec::new();
        U64VarIntSerializer::new().serialize(&chain_id, &mut buffer)?;
        serializer.serialize(self, &mut buffer)?;
        Ok(Hash::compute_from(&buffer))
    }
}

/// Serializer for `BlockHeader`
#[derive(Clone)]
pub struct BlockHeaderSerializer {
    block_id_serializer: BlockIdSerializer,
    u64_serializer: U64VarIntSerializer,
    time_serializer: DbftTimeSerializer,
    address_serializer: AddressSerializer,
}

impl BlockHeaderSerializer {
    /// Creates a `BlockHeaderSerializer`
    pub fn new() -> Self {
        Self {
            block_id_serializer: BlockIdSerializer::new(),
            u64_serializer: U64VarIntSerializer::new(),
            time_serializer: DbftTimeSerializer::new(),
            address_serializer: AddressSerializer::new(),
        }
    }
}

impl Default for BlockHeaderSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<BlockHeader> for BlockHeaderSerializer {
    fn serialize(&self, value: &BlockHeader, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.block_id_serializer
            .serialize(&value.prev_hash, buffer)?;
        self.u64_serializer.serialize(&value.index, buffer)?;
        self.time_serializer.serialize(&value.timestamp, buffer)?;
        buffer.push(value.primary_index);
        buffer.extend_from_slice(value.merkle_root.to_bytes());
        self.address_serializer
            .serialize(&value.next_consensus, buffer)?;
        Ok(())
    }
}

/// Deserializer for `BlockHeader`
#[derive(Clone)]
pub struct BlockHeaderDeserializer {
    block_id_deserializer: BlockIdDeserializer,
    u64_deserializer: U64VarIntDeserializer,
    time_deserializer: DbftTimeDeserializer,
    hash_deserializer: HashDeserializer,
    address_deserializer: AddressDeserializer,
    validators_count: u8,
}

impl BlockHeaderDeserializer {
    /// Creates a `BlockHeaderDeserializer`
    ///
    /// Arguments:
    /// * `validators_count`: number of validators, bounds the primary index
    pub fn new(validators_count: u8) -> Self {
        Self {
            block_id_deserializer: BlockIdDeserializer::new(),
            u64_deserializer: U64VarIntDeserializer::new(Included(0), Included(u64::MAX)),
            time_deserializer: DbftTimeDeserializer::new((
                Included(DbftTime::from_millis(0)),
                Included(DbftTime::max()),
            )),
            hash_deserializer: HashDeserializer::new(),
            address_deserializer: AddressDeserializer::new(),
            validators_count,
        }
    }
}

impl Deserializer<BlockHeader> for BlockHeaderDeserializer {
    /// ## Example
    /// ```rust
    /// use dbft_models::block_header::{BlockHeader, BlockHeaderSerializer, BlockHeaderDeserializer};
    /// use dbft_models::block_id::BlockId;
    /// use dbft_models::address::Address;
    /// use dbft_hash::Hash;
    /// use dbft_time::DbftTime;
    /// use dbft_serialization::{Serializer, Deserializer, DeserializeError};
    ///
    /// let header = BlockHeader {
    ///     prev_hash: BlockId(Hash::compute_from(b"prev")),
    ///     index: 42,
    ///     timestamp: DbftTime::from_millis(1_000_000),
    ///     primary_index: 2,
    ///     merkle_root: Hash::compute_from(b"txs"),
    ///     next_consensus: Address(Hash::compute_from(b"committee")),
    /// };
    /// let mut buffer = Vec::new();
    /// BlockHeaderSerializer::new().serialize(&header, &mut buffer).unwrap();
    /// let (rest, header_deser) = BlockHeaderDeserializer::new(7).deserialize::<DeserializeError>(&buffer).unwrap();
    /// assert!(rest.is_empty());
    /// assert_eq!(header, header_deser);
    /// ```
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], BlockHeader, E> {
        context(
            "Failed BlockHeader deserialization",
            tuple((
                context("Failed prev_hash deserialization", |input| {
                    self.block_id_deserializer.deserialize(input)
                }),
                context("Failed index deserialization", |input| {
                    self.u64_deserializer.deserialize(input)
                }),
                context("Failed timestamp deserialization", |input| {
                    self.time_deserializer.deserialize(input)
                }),
                context("Failed primary_index deserialization", |input: &'a [u8]| {
                    let (rest, raw) = take(1usize)(input)?;
                    if raw[0] >= self.validators_count {
                        return Err(nom::Err::Error(ParseError::from_error_kind(
                            input,
                            nom::error::ErrorKind::Verify,
                        )));
                    }
                    Ok((rest, raw[0]))
                }),
                context("Failed merkle_root deserialization", |input| {
                    self.hash_deserializer.deserialize(input)
                }),
                context("Failed next_consensus deserialization", |input| {
                    self.address_deserializer.deserialize(input)
                }),
            )),
        )
        .map(
            |(prev_hash, index, timestamp, primary_index, merkle_root, next_consensus)| {
                BlockHeader {
                    prev_hash,
                    index,
                    timestamp,
                    primary_index,
                    merkle_root,
                    next_consensus,
                }
            },
        )
        .parse(buffer)
    }
}
