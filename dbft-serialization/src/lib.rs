//! Binary serialization framework shared by every wire format in the
//! workspace: a pair of `Serializer`/`Deserializer` traits over `nom`,
//! plus bounded variable-length integer implementations.
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

use displaydoc::Display;
use nom::error::{ContextError, ErrorKind, ParseError};
use nom::IResult;
use std::ops::{Bound, RangeBounds};
use thiserror::Error;

/// Serialization error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone)]
pub enum SerializeError {
    /// Number {0} is too big to be serialized
    NumberTooBig(String),
    /// General error {0}
    GeneralError(String),
}

/// Default error type for deserialization, carrying the failing input slice.
pub type DeserializeError<'a> = nom::error::VerboseError<&'a [u8]>;

/// Trait for types able to serialize a value of type `T` into a byte buffer.
pub trait Serializer<T> {
    /// Serialize `value`, appending the bytes to `buffer`.
    fn serialize(&self, value: &T, buffer: &mut Vec<u8>) -> Result<(), SerializeError>;
}

/// Trait for types able to deserialize a value of type `T` from a byte buffer.
pub trait Deserializer<T> {
    /// Deserialize a `T` from the beginning of `buffer`, returning the rest.
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], T, E>;
}

macro_rules! gen_varint {
    ($(#[$int_doc:meta] $int:ty, #[$ser_doc:meta] $ser:ident, #[$deser_doc:meta] $deser:ident, $max_len:expr, $last_max:expr);+) => {$(
        #[$ser_doc]
        #[derive(Clone, Default)]
        pub struct $ser;

        impl $ser {
            #[doc = concat!("Creates a `", stringify!($ser), "`")]
            pub const fn new() -> Self {
                Self
            }
        }

        impl Serializer<$int> for $ser {
            /// LEB128 encoding, little-endian groups of 7 bits.
            fn serialize(&self, value: &$int, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
                let mut value = *value;
                loop {
                    let mut byte = (value & 0x7f) as u8;
                    value >>= 7;
                    if value != 0 {
                        byte |= 0x80;
                    }
                    buffer.push(byte);
                    if value == 0 {
                        return Ok(());
                    }
                }
            }
        }

        #[$deser_doc]
        #[derive(Clone)]
        pub struct $deser {
            range: (Bound<$int>, Bound<$int>),
        }

        impl $deser {
            #[doc = concat!("Creates a `", stringify!($deser), "` accepting only values inside the given bounds")]
            pub const fn new(min: Bound<$int>, max: Bound<$int>) -> Self {
                Self { range: (min, max) }
            }
        }

        impl Deserializer<$int> for $deser {
            fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
                &self,
                buffer: &'a [u8],
            ) -> IResult<&'a [u8], $int, E> {
                let mut value: $int = 0;
                for (i, byte) in buffer.iter().enumerate() {
                    // reject encodings longer than the type allows
                    if i + 1 == $max_len && *byte > $last_max {
                        return Err(nom::Err::Error(E::from_error_kind(
                            buffer,
                            ErrorKind::TooLarge,
                        )));
                    }
                    value |= ((byte & 0x7f) as $int) << (7 * i as u32);
                    if byte & 0x80 == 0 {
                        if !self.range.contains(&value) {
                            return Err(nom::Err::Error(E::from_error_kind(
                                buffer,
                                ErrorKind::Verify,
                            )));
                        }
                        return Ok((&buffer[i + 1..], value));
                    }
                }
                Err(nom::Err::Error(E::from_error_kind(buffer, ErrorKind::Eof)))
            }
        }
    )+};
}

gen_varint! {
    /// 32-bit
    u32,
    /// Serializer for `u32` using variable-length encoding
    U32VarIntSerializer,
    /// Deserializer for `u32` using variable-length encoding
    U32VarIntDeserializer, 5, 0x0f;
    /// 64-bit
    u64,
    /// Serializer for `u64` using variable-length encoding
    U64VarIntSerializer,
    /// Deserializer for `u64` using variable-length encoding
    U64VarIntDeserializer, 10, 0x01
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Bound::{Excluded, Included};

    fn roundtrip_u64(value: u64) -> u64 {
        let mut buffer = Vec::new();
        U64VarIntSerializer::new()
            .serialize(&value, &mut buffer)
            .unwrap();
        let (rest, got) = U64VarIntDeserializer::new(Included(u64::MIN), Included(u64::MAX))
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        got
    }

    #[test]
    fn test_u64_varint_roundtrip() {
        for value in [0, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            assert_eq!(roundtrip_u64(value), value);
        }
    }

    #[test]
    fn test_u64_varint_bounds() {
        let mut buffer = Vec::new();
        U64VarIntSerializer::new().serialize(&7, &mut buffer).unwrap();
        let deserializer = U64VarIntDeserializer::new(Included(0), Excluded(7));
        assert!(deserializer
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }

    #[test]
    fn test_u32_varint_overlong_rejected() {
        // 6-byte encoding of a u32 is never valid
        let buffer = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        let deserializer = U32VarIntDeserializer::new(Included(u32::MIN), Included(u32::MAX));
        assert!(deserializer
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }

    #[test]
    fn test_truncated_input() {
        let buffer = [0x80, 0x80];
        let deserializer = U64VarIntDeserializer::new(Included(u64::MIN), Included(u64::MAX));
        assert!(deserializer
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }
}
