use crate::block_header::{BlockHeader, BlockHeaderDeserializer, BlockHeaderSerializer};
use crate::error::ModelsError;
use crate::transaction::{Transaction, TransactionDeserializer, TransactionSerializer};
use dbft_hash::Hash;
use dbft_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
};
use dbft_signature::{PublicKey, Signature, SignatureDeserializer};
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::multi::length_count;
use nom::sequence::tuple;
use nom::{IResult, Parser};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;

/// Commit signatures attached to a finalized block.
///
/// Entries are sorted by validator index and must hold at least a quorum of
/// valid signatures over the signable hash of the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockWitness {
    /// (validator index, commit signature) pairs, sorted by index
    pub signatures: Vec<(u8, Signature)>,
}

impl BlockWitness {
    /// Checks that the witness holds at least `quorum` valid signatures over
    /// `signable_hash` from distinct validators of the given set.
    pub fn verify(
        &self,
        validators: &[PublicKey],
        signable_hash: &Hash,
        quorum: usize,
    ) -> Result<(), ModelsError> {
        let mut last_index: Option<u8> = None;
        for (index, signature) in &self.signatures {
            if let Some(last) = last_index {
                if *index <= last {
                    return Err(ModelsError::InvalidWitness(
                        "witness indices not strictly increasing".to_string(),
                    ));
                }
            }
            last_index = Some(*index);
            let public_key = validators.get(*index as usize).ok_or_else(|| {
                ModelsError::InvalidWitness(format!("validator index {} out of range", index))
            })?;
            public_key.verify_signature(signable_hash, signature)?;
        }
        if self.signatures.len() < quorum {
            return Err(ModelsError::InvalidWitness(format!(
                "witness holds {} signatures, quorum is {}",
                self.signatures.len(),
                quorum
            )));
        }
        Ok(())
    }
}

/// A finalized block: header, transactions and quorum witness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// signed header
    pub header: BlockHeader,
    /// transactions in proposal order
    pub transactions: Vec<Transaction>,
    /// quorum of commit signatures
    pub witness: BlockWitness,
}

/// Serializer for `Block`
#[derive(Clone)]
pub struct BlockSerializer {
    header_serializer: BlockHeaderSerializer,
    transaction_serializer: TransactionSerializer,
    u32_serializer: U32VarIntSerializer,
}

impl BlockSerializer {
    /// Creates a `BlockSerializer`
    pub fn new() -> Self {
        Self {
            header_serializer: BlockHeaderSerializer::new(),
            transaction_serializer: TransactionSerializer::new(),
            u32_serializer: U32VarIntSerializer::new(),
        }
    }
}

impl Default for BlockSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<Block> for BlockSerializer {
    fn serialize(&self, value: &Block, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.header_serializer.serialize(&value.header, buffer)?;
        self.u32_serializer.serialize(
            &value.transactions.len().try_into().map_err(|err| {
                SerializeError::GeneralError(format!("too many transactions: {}", err))
            })?,
            buffer,
        )?;
        for transaction in value.transactions.iter() {
            self.transaction_serializer.serialize(transaction, buffer)?;
        }
        self.u32_serializer.serialize(
            &value.witness.signatures.len().try_into().map_err(|err| {
                SerializeError::GeneralError(format!("too many signatures: {}", err))
            })?,
            buffer,
        )?;
        for (index, signature) in value.witness.signatures.iter() {
            buffer.push(*index);
            buffer.extend_from_slice(&signature.to_bytes());
        }
        Ok(())
    }
}

/// Deserializer for `Block`
#[derive(Clone)]
pub struct BlockDeserializer {
    header_deserializer: BlockHeaderDeserializer,
    transaction_deserializer: TransactionDeserializer,
    length_transactions_deserializer: U32VarIntDeserializer,
    length_signatures_deserializer: U32VarIntDeserializer,
    signature_deserializer: SignatureDeserializer,
}

impl BlockDeserializer {
    /// Creates a `BlockDeserializer`
    ///
    /// Arguments:
    /// * `validators_count`: number of validators
    /// * `max_transactions_per_block`: bound on the transaction count
    /// * `max_payload_size`: bound on a single transaction payload, in bytes
    pub fn new(validators_count: u8, max_transactions_per_block: u32, max_payload_size: u32) -> Self {
        Self {
            header_deserializer: BlockHeaderDeserializer::new(validators_count),
            transaction_deserializer: TransactionDeserializer::new(max_payload_size),
            length_transactions_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(max_transactions_per_block),
            ),
            length_signatures_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(validators_count as u32),
            ),
            signature_deserializer: SignatureDeserializer::new(),
        }
    }
}

impl Deserializer<Block> for BlockDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Block, E> {
        context(
            "Failed Block deserialization",
            tuple((
                context("Failed header deserialization", |input| {
                    self.header_deserializer.deserialize(input)
                }),
                context(
                    "Failed transactions deserialization",
                    length_count(
                        context("Failed length deserialization", |input| {
                            self.length_transactions_deserializer.deserialize(input)
                        }),
                        context("Failed transaction deserialization", |input| {
                            self.transaction_deserializer.deserialize(input)
                        }),
                    ),
                ),
                context(
                    "Failed witness deserialization",
                    length_count(
                        context("Failed length deserialization", |input| {
                            self.length_signatures_deserializer.deserialize(input)
                        }),
                        context("Failed signature deserialization", |input: &'a [u8]| {
                            let (rest, raw) = take(1usize)(input)?;
                            let (rest, signature) =
                                self.signature_deserializer.deserialize(rest)?;
                            Ok((rest, (raw[0], signature)))
                        }),
                    ),
                ),
            )),
        )
        .map(|(header, transactions, signatures)| Block {
            header,
            transactions,
            witness: BlockWitness { signatures },
        })
        .parse(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::block_id::BlockId;
    use dbft_serialization::DeserializeError;
    use dbft_signature::KeyPair;
    use dbft_time::DbftTime;

    fn make_header() -> BlockHeader {
        BlockHeader {
            prev_hash: BlockId(Hash::compute_from(b"prev")),
            index: 5,
            timestamp: DbftTime::from_millis(1_000),
            primary_index: 1,
            merkle_root: Hash::compute_from(b"txs"),
            next_consensus: Address(Hash::compute_from(b"committee")),
        }
    }

    #[test]
    fn test_witness_verify_quorum() {
        let keypairs: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let validators: Vec<_> = keypairs.iter().map(|kp| kp.get_public_key()).collect();
        let signable = Hash::compute_from(b"block sign data");

        let signatures: Vec<(u8, dbft_signature::Signature)> = keypairs
            .iter()
            .enumerate()
            .take(3)
            .map(|(i, kp)| (i as u8, kp.sign(&signable).unwrap()))
            .collect();
        let witness = BlockWitness { signatures };
        witness.verify(&validators, &signable, 3).unwrap();

        // below quorum
        let short = BlockWitness {
            signatures: witness.signatures[..2].to_vec(),
        };
        assert!(short.verify(&validators, &signable, 3).is_err());

        // duplicated index
        let mut dup = witness.clone();
        dup.signatures[1].0 = 0;
        assert!(dup.verify(&validators, &signable, 3).is_err());
    }

    #[test]
    fn test_block_serialization_roundtrip() {
        let keypair = KeyPair::generate();
        let signable = Hash::compute_from(b"sig data");
        let block = Block {
            header: make_header(),
            transactions: vec![Transaction {
                sender: Address(Hash::compute_from(b"sender")),
                nonce: 1,
                system_fee: crate::amount::Amount::from_raw(10),
                network_fee: crate::amount::Amount::from_raw(2),
                payload: vec![9, 9, 9],
            }],
            witness: BlockWitness {
                signatures: vec![(1, keypair.sign(&signable).unwrap())],
            },
        };
        let mut buffer = Vec::new();
        BlockSerializer::new().serialize(&block, &mut buffer).unwrap();
        let (rest, deserialized) = BlockDeserializer::new(7, 512, 1024)
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(block, deserialized);
    }
}
