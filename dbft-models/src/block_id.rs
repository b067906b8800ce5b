use crate::error::ModelsError;
use dbft_hash::{Hash, HashDeserializer};
use dbft_serialization::{Deserializer, SerializeError, Serializer};
use nom::error::{context, ContextError, ParseError};
use nom::IResult;
use serde::Deserialize;
use std::str::FromStr;

const BLOCK_ID_PREFIX: char = 'B';

/// block id
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(pub Hash);

impl BlockId {
    /// block id to bytes
    pub fn to_bytes(&self) -> &[u8; dbft_hash::HASH_SIZE_BYTES] {
        self.0.to_bytes()
    }

    /// block id of the empty chain tip, used before genesis
    pub fn zero() -> BlockId {
        BlockId(Hash::from_bytes(&[0u8; dbft_hash::HASH_SIZE_BYTES]))
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", BLOCK_ID_PREFIX, self.0.to_bs58_check())
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for BlockId {
    type Err = ModelsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match chars.next() {
            Some(prefix) if prefix == BLOCK_ID_PREFIX => {
                Ok(BlockId(Hash::from_bs58_check(chars.as_str()).map_err(
                    |_| ModelsError::DeserializeError(format!("bad block id: {}", s)),
                )?))
            }
            _ => Err(ModelsError::WrongPrefix(
                BLOCK_ID_PREFIX.to_string(),
                s.to_string(),
            )),
        }
    }
}

impl ::serde::Serialize for BlockId {
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.to_string())
    }
}

impl<'de> ::serde::Deserialize<'de> for BlockId {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<BlockId, D::Error> {
        let s = String::deserialize(d)?;
        BlockId::from_str(&s).map_err(::serde::de::Error::custom)
    }
}

/// Serializer for `BlockId`
#[derive(Default, Clone)]
pub struct BlockIdSerializer;

impl BlockIdSerializer {
    /// Creates a `BlockIdSerializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<BlockId> for BlockIdSerializer {
    fn serialize(&self, value: &BlockId, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(value.to_bytes());
        Ok(())
    }
}

/// Deserializer for `BlockId`
#[derive(Default, Clone)]
pub struct BlockIdDeserializer {
    hash_deserializer: HashDeserializer,
}

impl BlockIdDeserializer {
    /// Creates a `BlockIdDeserializer`
    pub const fn new() -> Self {
        Self {
            hash_deserializer: HashDeserializer::new(),
        }
    }
}

impl Deserializer<BlockId> for BlockIdDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], BlockId, E> {
        context("Failed BlockId deserialization", |input| {
            self.hash_deserializer
                .deserialize(input)
                .map(|(rest, hash)| (rest, BlockId(hash)))
        })(buffer)
    }
}
