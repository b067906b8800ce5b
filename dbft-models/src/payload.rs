use crate::error::ModelsError;
use dbft_hash::{Hash, HashDeserializer};
use dbft_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
    U64VarIntSerializer,
};
use dbft_signature::{Signature, SignatureDeserializer};
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::sequence::tuple;
use nom::{IResult, Parser};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;
use std::str::FromStr;

/// payload id
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PayloadId(pub Hash);

impl std::fmt::Display for PayloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_bs58_check())
    }
}

impl std::fmt::Debug for PayloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for PayloadId {
    type Err = ModelsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PayloadId(Hash::from_bs58_check(s).map_err(|_| {
            ModelsError::DeserializeError(format!("bad payload id: {}", s))
        })?))
    }
}

impl ::serde::Serialize for PayloadId {
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.to_string())
    }
}

impl<'de> ::serde::Deserialize<'de> for PayloadId {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<PayloadId, D::Error> {
        let s = String::deserialize(d)?;
        PayloadId::from_str(&s).map_err(::serde::de::Error::custom)
    }
}

/// A signed consensus message envelope as it travels on the wire.
///
/// The consensus message itself is carried as opaque bytes so that lower
/// layers can relay and persist envelopes without decoding them. The
/// signature covers the chain id and the message bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPayload {
    /// serialized consensus message
    pub data: Vec<u8>,
    /// signature of the sending validator
    pub signature: Signature,
}

impl ConsensusPayload {
    /// Hash signed by the sending validator over `data`.
    pub fn compute_signable_hash(chain_id: u64, data: &[u8]) -> Result<Hash, ModelsError> {
        let mut buffer = Vec::with_capacity(data.len().saturating_add(10));
        U64VarIntSerializer::new().serialize(&chain_id, &mut buffer)?;
        buffer.extend_from_slice(data);
        Ok(Hash::compute_from(&buffer))
    }

    /// Unique identifier of this envelope, covering data and signature.
    pub fn compute_id(&self) -> PayloadId {
        let mut buffer = Vec::with_capacity(self.data.len().saturating_add(64));
        buffer.extend_from_slice(&self.data);
        buffer.extend_from_slice(&self.signature.to_bytes());
        PayloadId(Hash::compute_from(&buffer))
    }
}

/// Serializer for `ConsensusPayload`
#[derive(Clone)]
pub struct ConsensusPayloadSerializer {
    u32_serializer: U32VarIntSerializer,
}

impl ConsensusPayloadSerializer {
    /// Creates a `ConsensusPayloadSerializer`
    pub fn new() -> Self {
        Self {
            u32_serializer: U32VarIntSerializer::new(),
        }
    }
}

impl Default for ConsensusPayloadSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<ConsensusPayload> for ConsensusPayloadSerializer {
    fn serialize(
        &self,
        value: &ConsensusPayload,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.u32_serializer.serialize(
            &value.data.len().try_into().map_err(|err| {
                SerializeError::GeneralError(format!("payload data too large: {}", err))
            })?,
            buffer,
        )?;
        buffer.extend_from_slice(&value.data);
        buffer.extend_from_slice(&value.signature.to_bytes());
        Ok(())
    }
}

/// Deserializer for `ConsensusPayload`
#[derive(Clone)]
pub struct ConsensusPayloadDeserializer {
    data_length_deserializer: U32VarIntDeserializer,
    signature_deserializer: SignatureDeserializer,
}

impl ConsensusPayloadDeserializer {
    /// Creates a `ConsensusPayloadDeserializer`
    ///
    /// Arguments:
    /// * `max_data_size`: maximum accepted message length, in bytes
    pub fn new(max_data_size: u32) -> Self {
        Self {
            data_length_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(max_data_size),
            ),
            signature_deserializer: SignatureDeserializer::new(),
        }
    }
}

impl Deserializer<ConsensusPayload> for ConsensusPayloadDeserializer {
    /// ## Example
    /// ```rust
    /// use dbft_models::payload::{ConsensusPayload, ConsensusPayloadSerializer, ConsensusPayloadDeserializer};
    /// use dbft_hash::Hash;
    /// use dbft_signature::KeyPair;
    /// use dbft_serialization::{Serializer, Deserializer, DeserializeError};
    ///
    /// let keypair = KeyPair::generate();
    /// let data = vec![1, 2, 3];
    /// let signature = keypair.sign(&ConsensusPayload::compute_signable_hash(77, &data).unwrap()).unwrap();
    /// let payload = ConsensusPayload { data, signature };
    /// let mut buffer = Vec::new();
    /// ConsensusPayloadSerializer::new().serialize(&payload, &mut buffer).unwrap();
    /// let (rest, payload_deser) = ConsensusPayloadDeserializer::new(1024).deserialize::<DeserializeError>(&buffer).unwrap();
    /// assert!(rest.is_empty());
    /// assert_eq!(payload, payload_deser);
    /// ```
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], ConsensusPayload, E> {
        context(
            "Failed ConsensusPayload deserialization",
            tuple((
                context("Failed data deserialization", |input: &'a [u8]| {
                    let (rest, len) = self.data_length_deserializer.deserialize(input)?;
                    let (rest, data) = take(len as usize)(rest)?;
                    Ok((rest, data.to_vec()))
                }),
                context("Failed signature deserialization", |input| {
                    self.signature_deserializer.deserialize(input)
                }),
            )),
        )
        .map(|(data, signature)| ConsensusPayload { data, signature })
        .parse(buffer)
    }
}

/// Deserializer for `PayloadId`
#[derive(Default, Clone)]
pub struct PayloadIdDeserializer {
    hash_deserializer: HashDeserializer,
}

impl PayloadIdDeserializer {
    /// Creates a `PayloadIdDeserializer`
    pub const fn new() -> Self {
        Self {
            hash_deserializer: HashDeserializer::new(),
        }
    }
}

impl Deserializer<PayloadId> for PayloadIdDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], PayloadId, E> {
        context("Failed PayloadId deserialization", |input| {
            self.hash_deserializer
                .deserialize(input)
                .map(|(rest, hash)| (rest, PayloadId(hash)))
        })(buffer)
    }
}
