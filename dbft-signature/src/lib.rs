//! ed25519 signatures for consensus payloads and block headers
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

mod error;
mod signature_impl;

pub use error::DbftSignatureError;
pub use signature_impl::{
    KeyPair, PublicKey, PublicKeyDeserializer, Signature, SignatureDeserializer,
    PUBLIC_KEY_SIZE_BYTES, SECRET_KEY_SIZE_BYTES, SIGNATURE_SIZE_BYTES,
};
