use serde::Serialize;

use crate::channel_error::ChannelError;

pub fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Derives a channel's durable id from its name.
pub fn channel_id_for_name(name: &str) -> String {
    blake3_hex(format!("channel:{name}").as_bytes())
}

pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, ChannelError> {
    let mut buf = Vec::with_capacity(256);
    let canonical_value = serde_cbor::value::to_value(value)?;
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer.self_describe()?;
    canonical_value.serialize(&mut serializer)?;
    Ok(buf)
}
