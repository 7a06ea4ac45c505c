//! Binary body encoding.
//!
//! Message bodies are written field by field in declaration order:
//!
//! - integers as fixed-width big-endian values
//! - byte strings, strings and lists prefixed with a VLQ length
//! - optional values prefixed with a presence byte
//!
//! The same VLQ helpers size the chunked responses, so the payload
//! budget of a response can be computed without encoding it.

use crate::{NetworkError, NetworkResult, MAX_PAYLOAD_LENGTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// VLQ encode an unsigned integer.
pub fn vlq_encode(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// VLQ decode an unsigned integer, consuming it from the buffer.
pub fn vlq_decode(buf: &mut Bytes) -> NetworkResult<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(NetworkError::InvalidMessage("Truncated VLQ".into()));
        }
        let byte = buf.get_u8();

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }
        shift += 7;

        if shift > 63 {
            return Err(NetworkError::InvalidMessage("VLQ overflow".into()));
        }
    }

    Ok(result)
}

/// Calculate VLQ byte length for a value.
pub fn vlq_byte_len(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let mut v = value;
    let mut len = 0;
    while v > 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Encoded size of a length-prefixed field of `len` bytes.
pub fn field_size(len: usize) -> usize {
    vlq_byte_len(len as u64) + len
}

/// A message body with a binary wire form.
pub trait Payload: Sized {
    /// Append the encoded body to `buf`.
    fn write_to(&self, buf: &mut BytesMut);

    /// Read a body from the front of `buf`.
    fn read_from(buf: &mut Bytes) -> NetworkResult<Self>;

    /// Encode into a standalone payload, rejecting oversize bodies.
    fn encode(&self) -> NetworkResult<Bytes> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        if buf.len() > MAX_PAYLOAD_LENGTH {
            return Err(NetworkError::MessageTooLarge {
                size: buf.len(),
                max: MAX_PAYLOAD_LENGTH,
            });
        }
        Ok(buf.freeze())
    }

    /// Decode a standalone payload. Trailing bytes are ignored so newer
    /// peers may append fields.
    fn decode(bytes: &Bytes) -> NetworkResult<Self> {
        let mut cursor = bytes.clone();
        Self::read_from(&mut cursor)
    }

    /// Size of the encoded body in bytes.
    fn encoded_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.len()
    }
}

fn need(buf: &Bytes, n: usize, what: &str) -> NetworkResult<()> {
    if buf.remaining() < n {
        return Err(NetworkError::InvalidMessage(format!(
            "{} truncated: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> NetworkResult<u8> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut Bytes) -> NetworkResult<u32> {
    need(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut Bytes) -> NetworkResult<u64> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

pub fn get_i64(buf: &mut Bytes) -> NetworkResult<i64> {
    need(buf, 8, "i64")?;
    Ok(buf.get_i64())
}

pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

pub fn get_bool(buf: &mut Bytes) -> NetworkResult<bool> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(NetworkError::InvalidMessage(format!("Invalid bool byte {}", b))),
    }
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    vlq_encode(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn get_bytes(buf: &mut Bytes) -> NetworkResult<Bytes> {
    let len = vlq_decode(buf)? as usize;
    need(buf, len, "bytes field")?;
    Ok(buf.split_to(len))
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn get_string(buf: &mut Bytes) -> NetworkResult<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| NetworkError::InvalidMessage(format!("Invalid UTF-8 string: {}", e)))
}

/// Write a list of payloads with a VLQ count prefix.
pub fn put_list<T: Payload>(buf: &mut BytesMut, items: &[T]) {
    vlq_encode(buf, items.len() as u64);
    for item in items {
        item.write_to(buf);
    }
}

/// Read a VLQ-counted list of payloads.
pub fn get_list<T: Payload>(buf: &mut Bytes) -> NetworkResult<Vec<T>> {
    let count = vlq_decode(buf)? as usize;
    // every element takes at least one byte
    need(buf, count, "list")?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::read_from(buf)?);
    }
    Ok(items)
}

pub fn put_option<T: Payload>(buf: &mut BytesMut, item: &Option<T>) {
    match item {
        Some(v) => {
            buf.put_u8(1);
            v.write_to(buf);
        }
        None => buf.put_u8(0),
    }
}

pub fn get_option<T: Payload>(buf: &mut Bytes) -> NetworkResult<Option<T>> {
    if get_bool(buf)? {
        Ok(Some(T::read_from(buf)?))
    } else {
        Ok(None)
    }
}

/// Raw byte strings are themselves payloads (used for opaque blobs).
impl Payload for Bytes {
    fn write_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, self);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        get_bytes(buf)
    }
}

impl Payload for String {
    fn write_to(&self, buf: &mut BytesMut) {
        put_string(buf, self);
    }

    fn read_from(buf: &mut Bytes) -> NetworkResult<Self> {
        get_string(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq_byte_len_matches_encoding() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            vlq_encode(&mut buf, v);
            assert_eq!(buf.len(), vlq_byte_len(v), "value {}", v);
            let mut bytes = buf.freeze();
            assert_eq!(vlq_decode(&mut bytes).unwrap(), v);
        }
    }

    #[test]
    fn test_truncated_bytes_field() {
        let mut buf = BytesMut::new();
        vlq_encode(&mut buf, 10);
        buf.put_slice(&[1, 2, 3]);
        let mut bytes = buf.freeze();
        assert!(get_bytes(&mut bytes).is_err());
    }

    #[test]
    fn test_list_count_larger_than_data_is_rejected() {
        let mut buf = BytesMut::new();
        vlq_encode(&mut buf, 1_000_000);
        let mut bytes = buf.freeze();
        assert!(get_list::<Bytes>(&mut bytes).is_err());
    }

    #[test]
    fn test_field_size() {
        assert_eq!(field_size(0), 1);
        assert_eq!(field_size(32), 33);
        assert_eq!(field_size(200), 202);
    }
}
