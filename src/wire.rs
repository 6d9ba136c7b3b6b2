//! On-wire probe payload codec.
//!
//! The primary form is a protobuf-compatible message (fields: signature,
//! tos, sent, rcvd, padding) encoded by hand; reflectors echo the bytes
//! verbatim, so only this codec needs to understand them. A legacy
//! fixed-width frame remains read-compatible for older senders.
//!
//! Padding pads the datagram to a representative MTU-friendly size and is
//! preserved byte-for-byte end-to-end without interpretation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::probe::{Signature, SIGNATURE_LEN};

/// Bytes of uninterpreted padding carried by every freshly encoded probe.
pub const PADDING_LEN: usize = 1000;

/// Size of the legacy fixed-width frame.
pub const LEGACY_FRAME_LEN: usize = SIGNATURE_LEN + 1 + 8 + 8 + 8 + 1;

// Protobuf field numbers for the probe message.
const FIELD_SIGNATURE: u32 = 1;
const FIELD_TOS: u32 = 2;
const FIELD_SENT: u32 = 3;
const FIELD_RCVD: u32 = 4;
const FIELD_PADDING: u32 = 5;

// Protobuf wire types.
const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated")]
    Truncated,
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    #[error("unsupported wire type {0}")]
    WireType(u32),
    #[error("signature must be {SIGNATURE_LEN} bytes, got {0}")]
    BadSignature(usize),
    #[error("missing signature field")]
    MissingSignature,
}

/// Decoded form of the probe payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireProbe {
    pub signature: Signature,
    pub tos: u8,
    /// Wall-clock nanoseconds at send.
    pub sent: u64,
    /// Unused on the wire; reserved.
    pub rcvd: u64,
    /// Opaque padding, preserved verbatim.
    pub padding: Bytes,
}

impl WireProbe {
    /// Build an outbound probe payload with the standard zero padding.
    pub fn new(signature: Signature, tos: u8, sent: u64) -> Self {
        Self {
            signature,
            tos,
            sent,
            rcvd: 0,
            padding: Bytes::from_static(&[0u8; PADDING_LEN]),
        }
    }

    /// Encode to the protobuf-compatible wire form.
    ///
    /// Zero-valued varint fields are omitted, matching proto3 emitters.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PADDING_LEN + 64);
        put_key(&mut buf, FIELD_SIGNATURE, WIRE_LEN);
        put_varint(&mut buf, SIGNATURE_LEN as u64);
        buf.put_slice(self.signature.as_bytes());
        put_key(&mut buf, FIELD_TOS, WIRE_LEN);
        put_varint(&mut buf, 1);
        buf.put_u8(self.tos);
        if self.sent != 0 {
            put_key(&mut buf, FIELD_SENT, WIRE_VARINT);
            put_varint(&mut buf, self.sent);
        }
        if self.rcvd != 0 {
            put_key(&mut buf, FIELD_RCVD, WIRE_VARINT);
            put_varint(&mut buf, self.rcvd);
        }
        if !self.padding.is_empty() {
            put_key(&mut buf, FIELD_PADDING, WIRE_LEN);
            put_varint(&mut buf, self.padding.len() as u64);
            buf.put_slice(&self.padding);
        }
        buf.freeze()
    }

    /// Decode the protobuf-compatible wire form. Unknown fields are
    /// skipped; the signature is the only required field.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = data;
        let mut signature = None;
        let mut tos = 0u8;
        let mut sent = 0u64;
        let mut rcvd = 0u64;
        let mut padding = Bytes::new();

        while buf.has_remaining() {
            let key = get_varint(&mut buf)?;
            let field = (key >> 3) as u32;
            let wire_type = (key & 0x7) as u32;
            match (field, wire_type) {
                (FIELD_SIGNATURE, WIRE_LEN) => {
                    let raw = get_len_delimited(&mut buf)?;
                    signature = Some(
                        Signature::from_slice(raw)
                            .ok_or(DecodeError::BadSignature(raw.len()))?,
                    );
                }
                (FIELD_TOS, WIRE_LEN) => {
                    let raw = get_len_delimited(&mut buf)?;
                    tos = raw.first().copied().unwrap_or(0);
                }
                (FIELD_SENT, WIRE_VARINT) => sent = get_varint(&mut buf)?,
                (FIELD_RCVD, WIRE_VARINT) => rcvd = get_varint(&mut buf)?,
                (FIELD_PADDING, WIRE_LEN) => {
                    padding = Bytes::copy_from_slice(get_len_delimited(&mut buf)?);
                }
                (_, wt) => skip_field(&mut buf, wt)?,
            }
        }

        Ok(Self {
            signature: signature.ok_or(DecodeError::MissingSignature)?,
            tos,
            sent,
            rcvd,
            padding,
        })
    }
}

/// Legacy fixed-width probe frame, little-endian throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFrame {
    pub signature: Signature,
    pub tos: u8,
    pub sent: u64,
    pub rcvd: u64,
    pub rtt: u64,
    pub lost: u8,
}

impl LegacyFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LEGACY_FRAME_LEN);
        buf.put_slice(self.signature.as_bytes());
        buf.put_u8(self.tos);
        buf.put_u64_le(self.sent);
        buf.put_u64_le(self.rcvd);
        buf.put_u64_le(self.rtt);
        buf.put_u8(self.lost);
        buf.freeze()
    }

    /// Read a legacy frame from the front of `data`; trailing bytes are
    /// ignored, matching the original fixed-struct reader.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < LEGACY_FRAME_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut buf = data;
        let mut sig = [0u8; SIGNATURE_LEN];
        buf.copy_to_slice(&mut sig);
        Ok(Self {
            signature: Signature::from(sig),
            tos: buf.get_u8(),
            sent: buf.get_u64_le(),
            rcvd: buf.get_u64_le(),
            rtt: buf.get_u64_le(),
            lost: buf.get_u8(),
        })
    }
}

impl From<LegacyFrame> for WireProbe {
    fn from(frame: LegacyFrame) -> Self {
        Self {
            signature: frame.signature,
            tos: frame.tos,
            sent: frame.sent,
            rcvd: frame.rcvd,
            padding: Bytes::new(),
        }
    }
}

/// Decode a datagram in either supported form, preferring the protobuf
/// message and falling back to the legacy frame.
pub fn decode_any(data: &[u8]) -> Result<WireProbe, DecodeError> {
    match WireProbe::decode(data) {
        Ok(probe) => Ok(probe),
        Err(primary) => LegacyFrame::decode(data)
            .map(WireProbe::from)
            .map_err(|_| primary),
    }
}

fn put_key(buf: &mut BytesMut, field: u32, wire_type: u32) {
    put_varint(buf, ((field << 3) | wire_type) as u64);
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(DecodeError::Truncated);
        }
        if shift >= 64 {
            return Err(DecodeError::VarintOverflow);
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn get_len_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn skip_field(buf: &mut &[u8], wire_type: u32) -> Result<(), DecodeError> {
    match wire_type {
        WIRE_VARINT => {
            get_varint(buf)?;
        }
        WIRE_FIXED64 => {
            if buf.remaining() < 8 {
                return Err(DecodeError::Truncated);
            }
            buf.advance(8);
        }
        WIRE_LEN => {
            get_len_delimited(buf)?;
        }
        WIRE_FIXED32 => {
            if buf.remaining() < 4 {
                return Err(DecodeError::Truncated);
            }
            buf.advance(4);
        }
        other => return Err(DecodeError::WireType(other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WireProbe {
        WireProbe::new(Signature::generate(), 0x68, 1_478_807_831_000_000_000)
    }

    #[test]
    fn roundtrip_preserves_all_fields() {
        let probe = sample();
        let encoded = probe.encode();
        let decoded = WireProbe::decode(&encoded).unwrap();
        assert_eq!(decoded, probe);
        assert_eq!(decoded.padding.len(), PADDING_LEN);
    }

    #[test]
    fn padding_content_survives_verbatim() {
        let mut probe = sample();
        probe.padding = Bytes::from((0..=255u8).cycle().take(PADDING_LEN).collect::<Vec<_>>());
        let decoded = WireProbe::decode(&probe.encode()).unwrap();
        assert_eq!(decoded.padding, probe.padding);
    }

    #[test]
    fn zero_rcvd_is_omitted_and_defaulted() {
        let probe = sample();
        let encoded = probe.encode();
        // A fresh probe never carries the rcvd field on the wire.
        assert!(encoded.len() < PADDING_LEN + 40);
        assert_eq!(WireProbe::decode(&encoded).unwrap().rcvd, 0);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let probe = sample();
        let mut buf = BytesMut::from(&probe.encode()[..]);
        // Field 9, varint wire type.
        put_varint(&mut buf, (9 << 3) as u64);
        put_varint(&mut buf, 42);
        let decoded = WireProbe::decode(&buf).unwrap();
        assert_eq!(decoded.signature, probe.signature);
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let encoded = sample().encode();
        assert_eq!(
            WireProbe::decode(&encoded[..encoded.len() - 1]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn missing_signature_is_rejected() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, (FIELD_SENT << 3) as u64);
        put_varint(&mut buf, 12345);
        assert_eq!(WireProbe::decode(&buf), Err(DecodeError::MissingSignature));
    }

    #[test]
    fn bad_signature_length_is_rejected() {
        let mut buf = BytesMut::new();
        put_key(&mut buf, FIELD_SIGNATURE, WIRE_LEN);
        put_varint(&mut buf, 4);
        buf.put_slice(&[1, 2, 3, 4]);
        assert_eq!(WireProbe::decode(&buf), Err(DecodeError::BadSignature(4)));
    }

    #[test]
    fn legacy_frame_roundtrip() {
        let frame = LegacyFrame {
            signature: Signature::generate(),
            tos: 0xb8,
            sent: 100_000,
            rcvd: 200_000,
            rtt: 100_000,
            lost: 0,
        };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), LEGACY_FRAME_LEN);
        assert_eq!(LegacyFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn legacy_decode_ignores_trailing_bytes() {
        let frame = LegacyFrame {
            signature: Signature::generate(),
            tos: 0,
            sent: 7,
            rcvd: 0,
            rtt: 0,
            lost: 1,
        };
        let mut data = frame.encode().to_vec();
        data.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(LegacyFrame::decode(&data).unwrap(), frame);
    }

    #[test]
    fn decode_any_accepts_both_forms() {
        let probe = sample();
        assert_eq!(decode_any(&probe.encode()).unwrap(), probe);

        let frame = LegacyFrame {
            signature: Signature::generate(),
            tos: 3,
            sent: 55,
            rcvd: 0,
            rtt: 0,
            lost: 0,
        };
        let via_legacy = decode_any(&frame.encode()).unwrap();
        assert_eq!(via_legacy.signature, frame.signature);
        assert_eq!(via_legacy.tos, 3);
        assert_eq!(via_legacy.sent, 55);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_any(&[0xff; 20]).is_err());
    }
}
