//! Utility functions for id minting and serialization

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::AllocationError;

// construct a unique id from a uuid7 then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Encode a value to cbor, mapping failures onto the engine error type.
pub fn to_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, AllocationError> {
    minicbor::to_vec(value).map_err(|e| AllocationError::Codec(e.to_string()))
}

/// Decode a value from cbor, mapping failures onto the engine error type.
pub fn from_cbor<'b, T: minicbor::Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, AllocationError> {
    minicbor::decode(bytes).map_err(|e| AllocationError::Codec(e.to_string()))
}
