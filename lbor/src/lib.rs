pub mod decoder;
pub mod diff;
pub mod encoder;
pub mod value;
pub mod value_kind;

pub use decoder::{DecodeError, LborDecoder};
pub use diff::{DiffError, ValueDiff};
pub use encoder::{EncodeError, LborEncoder};
pub use value::Value;
pub use value_kind::ValueKind;

/// First byte of every encoded payload. Guards against feeding foreign
/// binary blobs (bytecode, hashes) to the decoder.
pub const LBOR_V1_PAYLOAD_PREFIX: u8 = 0x4C;

/// Nesting bound shared by the encoder and the decoder.
pub const LBOR_V1_MAX_DEPTH: u8 = 32;

/// Encodes a value into its canonical byte form.
pub fn lbor_encode(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    let mut encoder = LborEncoder::new(&mut buf);
    encoder.write_payload_prefix(LBOR_V1_PAYLOAD_PREFIX)?;
    encoder.encode(value)?;
    Ok(buf)
}

/// Decodes a payload, requiring full consumption of the buffer.
pub fn lbor_decode(payload: &[u8]) -> Result<Value, DecodeError> {
    let mut decoder = LborDecoder::new(payload);
    decoder.read_payload_prefix(LBOR_V1_PAYLOAD_PREFIX)?;
    let value = decoder.decode()?;
    decoder.check_end()?;
    Ok(value)
}

/// Computes the canonical delta between two values. See [`diff::diff`].
pub fn lbor_diff(before: &Value, after: &Value) -> ValueDiff {
    diff::diff(before, after)
}
