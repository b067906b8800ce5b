use crate::error::DbftSignatureError;
use dbft_hash::Hash;
use dbft_serialization::Deserializer;
use ed25519_dalek::{Signer, Verifier};
use nom::error::{context, ContextError, ParseError};
use nom::IResult;
use serde::Deserialize;
use std::cmp::Ordering;
use std::convert::TryInto;
use std::hash::Hasher;
use std::str::FromStr;

/// Size of a serialized public key, in bytes
pub const PUBLIC_KEY_SIZE_BYTES: usize = 32;
/// Size of a serialized secret key, in bytes
pub const SECRET_KEY_SIZE_BYTES: usize = 32;
/// Size of a serialized signature, in bytes
pub const SIGNATURE_SIZE_BYTES: usize = 64;

/// `KeyPair` is used to sign consensus payloads and block headers
#[derive(Clone)]
pub struct KeyPair(ed25519_dalek::SigningKey);

impl std::fmt::Display for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl FromStr for KeyPair {
    type Err = DbftSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyPair::from_bs58_check(s)
    }
}

impl KeyPair {
    /// Generate a new random `KeyPair`
    ///
    /// # Example
    /// ```
    /// # use dbft_signature::KeyPair;
    /// # use dbft_hash::Hash;
    /// let keypair = KeyPair::generate();
    /// let data = Hash::compute_from("Hello World!".as_bytes());
    /// let signature = keypair.sign(&data).unwrap();
    /// ```
    pub fn generate() -> KeyPair {
        let mut rng = rand::rngs::OsRng;
        KeyPair(ed25519_dalek::SigningKey::generate(&mut rng))
    }

    /// Sign a hash with the secret key.
    pub fn sign(&self, hash: &Hash) -> Result<Signature, DbftSignatureError> {
        Ok(Signature(self.0.sign(hash.to_bytes())))
    }

    /// Return the bytes of the secret key.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE_BYTES] {
        self.0.to_bytes()
    }

    /// Build a `KeyPair` from secret key bytes.
    pub fn from_bytes(data: &[u8; SECRET_KEY_SIZE_BYTES]) -> KeyPair {
        KeyPair(ed25519_dalek::SigningKey::from_bytes(data))
    }

    /// Encode the secret key as base58 with checksum.
    pub fn to_bs58_check(&self) -> String {
        bs58::encode(self.to_bytes()).with_check().into_string()
    }

    /// Decode a base58check secret key string.
    pub fn from_bs58_check(data: &str) -> Result<KeyPair, DbftSignatureError> {
        let decoded = bs58::decode(data)
            .with_check(None)
            .into_vec()
            .map_err(|err| DbftSignatureError::ParsingError(format!("{}", err)))?;
        let bytes: [u8; SECRET_KEY_SIZE_BYTES] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| DbftSignatureError::ParsingError("invalid secret key length".into()))?;
        Ok(KeyPair::from_bytes(&bytes))
    }

    /// Get the public key of the keypair
    pub fn get_public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }
}

impl ::serde::Serialize for KeyPair {
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.to_bs58_check())
    }
}

impl<'de> ::serde::Deserialize<'de> for KeyPair {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<KeyPair, D::Error> {
        let s = String::deserialize(d)?;
        KeyPair::from_bs58_check(&s).map_err(::serde::de::Error::custom)
    }
}

/// Public key used to check payload and block signatures
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl std::hash::Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &PublicKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &PublicKey) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl FromStr for PublicKey {
    type Err = DbftSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::from_bs58_check(s)
    }
}

impl PublicKey {
    /// Check a signature produced by the matching secret key over `hash`.
    pub fn verify_signature(
        &self,
        hash: &Hash,
        signature: &Signature,
    ) -> Result<(), DbftSignatureError> {
        self.0
            .verify(hash.to_bytes(), &signature.0)
            .map_err(|err| DbftSignatureError::SignatureError(format!("{}", err)))
    }

    /// Return the bytes of the public key.
    pub fn to_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE_BYTES] {
        self.0.as_bytes()
    }

    /// Build a `PublicKey` from bytes.
    pub fn from_bytes(data: &[u8; PUBLIC_KEY_SIZE_BYTES]) -> Result<PublicKey, DbftSignatureError> {
        ed25519_dalek::VerifyingKey::from_bytes(data)
            .map(Self)
            .map_err(|err| DbftSignatureError::ParsingError(format!("{}", err)))
    }

    /// Encode the public key as base58 with checksum.
    pub fn to_bs58_check(&self) -> String {
        bs58::encode(self.to_bytes()).with_check().into_string()
    }

    /// Decode a base58check public key string.
    pub fn from_bs58_check(data: &str) -> Result<PublicKey, DbftSignatureError> {
        let decoded = bs58::decode(data)
            .with_check(None)
            .into_vec()
            .map_err(|err| DbftSignatureError::ParsingError(format!("{}", err)))?;
        let bytes: [u8; PUBLIC_KEY_SIZE_BYTES] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| DbftSignatureError::ParsingError("invalid public key length".into()))?;
        PublicKey::from_bytes(&bytes)
    }
}

impl ::serde::Serialize for PublicKey {
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.to_bs58_check())
    }
}

impl<'de> ::serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<PublicKey, D::Error> {
        let s = String::deserialize(d)?;
        PublicKey::from_bs58_check(&s).map_err(::serde::de::Error::custom)
    }
}

/// Deserializer for `PublicKey`
#[derive(Default, Clone)]
pub struct PublicKeyDeserializer;

impl PublicKeyDeserializer {
    /// Creates a `PublicKeyDeserializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<PublicKey> for PublicKeyDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], PublicKey, E> {
        context("Failed public key deserialization", |input: &'a [u8]| {
            if input.len() < PUBLIC_KEY_SIZE_BYTES {
                return Err(nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Eof,
                )));
            }
            let bytes: &[u8; PUBLIC_KEY_SIZE_BYTES] =
                input[..PUBLIC_KEY_SIZE_BYTES].try_into().map_err(|_| {
                    nom::Err::Error(ParseError::from_error_kind(
                        input,
                        nom::error::ErrorKind::Eof,
                    ))
                })?;
            let key = PublicKey::from_bytes(bytes).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Verify,
                ))
            })?;
            Ok((&input[PUBLIC_KEY_SIZE_BYTES..], key))
        })(buffer)
    }
}

/// Signature of a hash
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl Signature {
    /// Return the bytes of the signature.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE_BYTES] {
        self.0.to_bytes()
    }

    /// Build a `Signature` from bytes.
    pub fn from_bytes(data: &[u8; SIGNATURE_SIZE_BYTES]) -> Signature {
        Signature(ed25519_dalek::Signature::from_bytes(data))
    }

    /// Encode the signature as base58 with checksum.
    pub fn to_bs58_check(&self) -> String {
        bs58::encode(self.to_bytes()).with_check().into_string()
    }

    /// Decode a base58check signature string.
    pub fn from_bs58_check(data: &str) -> Result<Signature, DbftSignatureError> {
        let decoded = bs58::decode(data)
            .with_check(None)
            .into_vec()
            .map_err(|err| DbftSignatureError::ParsingError(format!("{}", err)))?;
        let bytes: [u8; SIGNATURE_SIZE_BYTES] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| DbftSignatureError::ParsingError("invalid signature length".into()))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

impl ::serde::Serialize for Signature {
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.to_bs58_check())
    }
}

impl<'de> ::serde::Deserialize<'de> for Signature {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let s = String::deserialize(d)?;
        Signature::from_bs58_check(&s).map_err(::serde::de::Error::custom)
    }
}

/// Deserializer for `Signature`
#[derive(Default, Clone)]
pub struct SignatureDeserializer;

impl SignatureDeserializer {
    /// Creates a `SignatureDeserializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<Signature> for SignatureDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Signature, E> {
        context("Failed signature deserialization", |input: &'a [u8]| {
            if input.len() < SIGNATURE_SIZE_BYTES {
                return Err(nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Eof,
                )));
            }
            let bytes: &[u8; SIGNATURE_SIZE_BYTES] =
                input[..SIGNATURE_SIZE_BYTES].try_into().map_err(|_| {
                    nom::Err::Error(ParseError::from_error_kind(
                        input,
                        nom::error::ErrorKind::Eof,
                    ))
                })?;
            Ok((&input[SIGNATURE_SIZE_BYTES..], Signature::from_bytes(bytes)))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = KeyPair::generate();
        let hash = Hash::compute_from(b"some payload");
        let signature = keypair.sign(&hash).unwrap();
        keypair
            .get_public_key()
            .verify_signature(&hash, &signature)
            .unwrap();
        let other = Hash::compute_from(b"another payload");
        assert!(keypair
            .get_public_key()
            .verify_signature(&other, &signature)
            .is_err());
    }

    #[test]
    fn test_keypair_bs58_roundtrip() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_bs58_check(&keypair.to_bs58_check()).unwrap();
        assert_eq!(keypair.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn test_public_key_serde_roundtrip() {
        let public_key = KeyPair::generate().get_public_key();
        let serialized = serde_json::to_string(&public_key).unwrap();
        let deserialized: PublicKey = serde_json::from_str(&serialized).unwrap();
        assert_eq!(public_key, deserialized);
    }

    #[test]
    fn test_signature_serde_roundtrip() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(&Hash::compute_from(b"some payload")).unwrap();
        let serialized = serde_json::to_string(&signature).unwrap();
        let deserialized: Signature = serde_json::from_str(&serialized).unwrap();
        assert_eq!(signature, deserialized);
    }
}
