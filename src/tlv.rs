//! BER-TLV codec used by every file and secure messaging object on the card.
//!
//! Only single-byte tags and the length forms the card emits are supported:
//! short form (`0x00..=0x7F`), `0x81 LL` and `0x82 LL LL`.

use tracing::{error, trace};

use crate::{bytes2hex, ZairyuError};

/// A TLV record borrowed from a larger buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
    /// Offset of the tag byte in the scanned buffer.
    pub offset: usize,
}

/// An [Iterator] over consecutive TLV records of a buffer.
///
/// The scan stops at the first record whose length field is unsupported or
/// whose value runs past the end of the buffer.
#[derive(Debug, Clone)]
pub struct TlvIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> TlvIter<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.offset;
        let &tag = self.buf.get(start)?;

        let record = parse_ber_length(self.buf, start + 1)
            .ok()
            .and_then(|(len, value_start)| {
                let end = value_start.checked_add(len)?;
                self.buf.get(value_start..end).map(|value| (value, end))
            });
        let Some((value, end)) = record else {
            trace!("TLV scan stopped at offset {start}, tag {tag:02X}");
            self.offset = self.buf.len();
            return None;
        };

        self.offset = end;
        Some(Tlv {
            tag,
            value,
            offset: start,
        })
    }
}

/// Returns the value of the first record tagged `tag` in `buffer`.
///
/// # Examples
///
/// ```
/// use zairyu::tlv::parse_tlv;
///
/// let file = [0xC0, 0x01, 0x31, 0xC1, 0x02, 0x41, 0x42];
/// assert_eq!(parse_tlv(&file, 0xC1), Some(&b"AB"[..]));
/// assert_eq!(parse_tlv(&file, 0xD0), None);
/// ```
#[must_use]
pub fn parse_tlv(buffer: &[u8], tag: u8) -> Option<&[u8]> {
    TlvIter::new(buffer).find(|t| t.tag == tag).map(|t| t.value)
}

/// Parses the BER length field starting at `offset`.
///
/// # Returns
///
/// A tuple of the length value and the offset of the first value byte.
///
/// For example, for `86 82 07 D0 ...` and `offset` 1 the returned value is (2000, 4).
///
/// # Errors
///
/// * `ZairyuError::InvalidResponse` if the length field is truncated or uses an
///   unsupported form.
pub fn parse_ber_length(buffer: &[u8], offset: usize) -> Result<(usize, usize), ZairyuError> {
    let Some(&first) = buffer.get(offset) else {
        error!(
            "BER length field is missing, `buffer.len()`: `{}`, `offset`: `{offset}`",
            buffer.len()
        );
        return Err(ZairyuError::InvalidResponse("BER length field is truncated"));
    };

    match first {
        0x00..=0x7F => Ok((usize::from(first), offset + 1)),
        0x81 => buffer.get(offset + 1).map_or_else(
            || {
                error!("BER length field `81` is truncated at offset {offset}");
                Err(ZairyuError::InvalidResponse("BER length field is truncated"))
            },
            |&len| Ok((usize::from(len), offset + 2)),
        ),
        0x82 => buffer.get(offset + 1..offset + 3).map_or_else(
            || {
                error!("BER length field `82` is truncated at offset {offset}");
                Err(ZairyuError::InvalidResponse("BER length field is truncated"))
            },
            |len| Ok((usize::from(u16::from_be_bytes([len[0], len[1]])), offset + 3)),
        ),
        _ => {
            error!("Unsupported BER length form {first:02X} at offset {offset}");
            Err(ZairyuError::InvalidResponse("unsupported BER length form"))
        }
    }
}

/// Encodes `length` as a BER length field.
///
/// # Errors
///
/// * `ZairyuError::InvalidArgument` if `length` does not fit in two bytes.
///
/// # Examples
///
/// ```
/// use zairyu::tlv::encode_ber_length;
/// use hex_literal::hex;
///
/// assert_eq!(encode_ber_length(127).unwrap(), hex!("7F"));
/// assert_eq!(encode_ber_length(128).unwrap(), hex!("8180"));
/// assert_eq!(encode_ber_length(2000).unwrap(), hex!("8207D0"));
/// ```
pub fn encode_ber_length(length: usize) -> Result<Vec<u8>, ZairyuError> {
    match length {
        0x00..=0x7F => Ok(vec![length as u8]),
        0x80..=0xFF => Ok(vec![0x81, length as u8]),
        0x100..=0xFFFF => {
            let [hi, lo] = (length as u16).to_be_bytes();
            Ok(vec![0x82, hi, lo])
        }
        _ => {
            error!("BER length {length} does not fit in two bytes");
            Err(ZairyuError::InvalidArgument(
                "BER length does not fit in two bytes",
            ))
        }
    }
}

/// Encodes `value` under `tag`.
///
/// # Errors
///
/// * `ZairyuError::InvalidArgument` if `value` is longer than 65535 bytes.
pub fn encode_tlv(tag: u8, value: &[u8]) -> Result<Vec<u8>, ZairyuError> {
    let length = encode_ber_length(value.len())?;
    let mut tlv = Vec::with_capacity(1 + length.len() + value.len());
    tlv.push(tag);
    tlv.extend_from_slice(&length);
    tlv.extend_from_slice(value);
    trace!("Encoded TLV header: {}", bytes2hex(&tlv[..1 + length.len()]));
    Ok(tlv)
}
