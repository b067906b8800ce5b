use crate::address::{Address, AddressDeserializer, AddressSerializer};
use crate::amount::{Amount, AmountDeserializer, AmountSerializer};
use crate::error::ModelsError;
use dbft_hash::{Hash, HashDeserializer};
use dbft_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
    U64VarIntDeserializer, U64VarIntSerializer,
};
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::sequence::tuple;
use nom::{IResult, Parser};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;
use std::str::FromStr;

const TRANSACTION_ID_PREFIX: char = 'T';

/// transaction id
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransactionId(pub Hash);

impl TransactionId {
    /// transaction id to bytes
    pub fn to_bytes(&self) -> &[u8; dbft_hash::HASH_SIZE_BYTES] {
        self.0.to_bytes()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", TRANSACTION_ID_PREFIX, self.0.to_bs58_check())
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for TransactionId {
    type Err = ModelsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match chars.next() {
            Some(prefix) if prefix == TRANSACTION_ID_PREFIX => {
                Ok(TransactionId(Hash::from_bs58_check(chars.as_str()).map_err(
                    |_| ModelsError::DeserializeError(format!("bad transaction id: {}", s)),
                )?))
            }
            _ => Err(ModelsError::WrongPrefix(
                TRANSACTION_ID_PREFIX.to_string(),
                s.to_string(),
            )),
        }
    }
}

impl ::serde::Serialize for TransactionId {
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.to_string())
    }
}

impl<'de> ::serde::Deserialize<'de> for TransactionId {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<TransactionId, D::Error> {
        let s = String::deserialize(d)?;
        TransactionId::from_str(&s).map_err(::serde::de::Error::custom)
    }
}

/// A fee-paying transaction candidate for block inclusion.
///
/// The consensus layer treats the payload as opaque bytes. Validity beyond
/// signature and fee accounting is the concern of the transaction pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// account paying the fees
    pub sender: Address,
    /// sender-local sequence number
    pub nonce: u64,
    /// fee consumed by executing the payload
    pub system_fee: Amount,
    /// fee paid for network inclusion, by byte
    pub network_fee: Amount,
    /// opaque execution payload
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Computes the transaction id from its serialized form.
    pub fn compute_id(
        &self,
        serializer: &TransactionSerializer,
    ) -> Result<TransactionId, ModelsError> {
        let mut buffer = Vec::new();
        serializer.serialize(self, &mut buffer)?;
        Ok(TransactionId(Hash::compute_from(&buffer)))
    }

    /// Size of the serialized transaction, in bytes.
    pub fn serialized_size(&self, serializer: &TransactionSerializer) -> Result<u32, ModelsError> {
        let mut buffer = Vec::new();
        serializer.serialize(self, &mut buffer)?;
        buffer
            .len()
            .try_into()
            .map_err(|_| ModelsError::SerializeError("transaction too large".to_string()))
    }

    /// Total fee charged to the sender for this transaction.
    pub fn total_fee(&self) -> Amount {
        self.system_fee.saturating_add(self.network_fee)
    }
}

/// Serializer for `Transaction`
#[derive(Clone)]
pub struct TransactionSerializer {
    address_serializer: AddressSerializer,
    amount_serializer: AmountSerializer,
    u64_serializer: U64VarIntSerializer,
    u32_serializer: U32VarIntSerializer,
}

impl TransactionSerializer {
    /// Creates a `TransactionSerializer`
    pub fn new() -> Self {
        Self {
            address_serializer: AddressSerializer::new(),
            amount_serializer: AmountSerializer::new(),
            u64_serializer: U64VarIntSerializer::new(),
            u32_serializer: U32VarIntSerializer::new(),
        }
    }
}

impl Default for TransactionSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<Transaction> for TransactionSerializer {
    fn serialize(&self, value: &Transaction, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.address_serializer.serialize(&value.sender, buffer)?;
        self.u64_serializer.serialize(&value.nonce, buffer)?;
        self.amount_serializer.serialize(&value.system_fee, buffer)?;
        self.amount_serializer
            .serialize(&value.network_fee, buffer)?;
        self.u32_serializer.serialize(
            &value.payload.len().try_into().map_err(|err| {
                SerializeError::GeneralError(format!("payload too large: {}", err))
            })?,
            buffer,
        )?;
        buffer.extend_from_slice(&value.payload);
        Ok(())
    }
}

/// Deserializer for `Transaction`
#[derive(Clone)]
pub struct TransactionDeserializer {
    address_deserializer: AddressDeserializer,
    amount_deserializer: AmountDeserializer,
    u64_deserializer: U64VarIntDeserializer,
    payload_length_deserializer: U32VarIntDeserializer,
}

impl TransactionDeserializer {
    /// Creates a `TransactionDeserializer`
    ///
    /// Arguments:
    /// * `max_payload_size`: maximum accepted payload length, in bytes
    pub fn new(max_payload_size: u32) -> Self {
        Self {
            address_deserializer: AddressDeserializer::new(),
            amount_deserializer: AmountDeserializer::new(),
            u64_deserializer: U64VarIntDeserializer::new(Included(0), Included(u64::MAX)),
            payload_length_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(max_payload_size),
            ),
        }
    }
}

impl Deserializer<Transaction> for TransactionDeserializer {
    /// ## Example
    /// ```rust
    /// use dbft_models::transaction::{Transaction, TransactionSerializer, TransactionDeserializer};
    /// use dbft_models::address::Address;
    /// use dbft_models::amount::Amount;
    /// use dbft_hash::Hash;
    /// use dbft_serialization::{Serializer, Deserializer, DeserializeError};
    ///
    /// let tx = Transaction {
    ///     sender: Address(Hash::compute_from(b"sender")),
    ///     nonce: 7,
    ///     system_fee: Amount::from_raw(100),
    ///     network_fee: Amount::from_raw(25),
    ///     payload: vec![1, 2, 3],
    /// };
    /// let mut buffer = Vec::new();
    /// TransactionSerializer::new().serialize(&tx, &mut buffer).unwrap();
    /// let (rest, tx_deser) = TransactionDeserializer::new(1024).deserialize::<DeserializeError>(&buffer).unwrap();
    /// assert!(rest.is_empty());
    /// assert_eq!(tx, tx_deser);
    /// ```
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Transaction, E> {
        context(
            "Failed Transaction deserialization",
            tuple((
                context("Failed sender deserialization", |input| {
                    self.address_deserializer.deserialize(input)
                }),
                context("Failed nonce deserialization", |input| {
                    self.u64_deserializer.deserialize(input)
                }),
                context("Failed system_fee deserialization", |input| {
                    self.amount_deserializer.deserialize(input)
                }),
                context("Failed network_fee deserialization", |input| {
                    self.amount_deserializer.deserialize(input)
                }),
                context("Failed payload deserialization", |input: &'a [u8]| {
                    let (rest, len) = self.payload_length_deserializer.deserialize(input)?;
                    let (rest, payload) = take(len as usize)(rest)?;
                    Ok((rest, payload.to_vec()))
                }),
            )),
        )
        .map(
            |(sender, nonce, system_fee, network_fee, payload)| Transaction {
                sender,
                nonce,
                system_fee,
                network_fee,
                payload,
            },
        )
        .parse(buffer)
    }
}

/// Deserializer for `TransactionId`
#[derive(Default, Clone)]
pub struct TransactionIdDeserializer {
    hash_deserializer: HashDeserializer,
}

impl TransactionIdDeserializer {
    /// Creates a `TransactionIdDeserializer`
    pub const fn new() -> Self {
        Self {
            hash_deserializer: HashDeserializer::new(),
        }
    }
}

impl Deserializer<TransactionId> for TransactionIdDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], TransactionId, E> {
        context("Failed TransactionId deserialization", |input| {
            self.hash_deserializer
                .deserialize(input)
                .map(|(rest, hash)| (rest, TransactionId(hash)))
        })(buffer)
    }
}
