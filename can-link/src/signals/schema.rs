//! Signal schema and bit-level codec
//!
//! A `SignalSchema` describes where one signal lives inside a CAN payload and
//! how its raw integer maps to a physical value. Bit positions follow DBC
//! numbering: little-endian (Intel) signals are addressed LSB-first, big-endian
//! (Motorola) signals by their MSB in the sawtooth numbering where bit 7 of
//! byte 0 is followed by bit 15 of byte 1.

use crate::types::{monotonic_now_ns, CanError, Result, Signal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest bit position addressable in a 64-byte CAN FD payload
pub const MAX_BIT_POSITION: u32 = 64 * 8;

/// Checksum algorithm over `(address, payload)`
pub type ChecksumFn = fn(u32, &[u8]) -> u8;

/// Big-endian bit order: `[7, 6, ..., 0, 15, 14, ..., 8, ...]`
///
/// Stepping `size - 1` entries from a big-endian start bit lands on the
/// signal's LSB.
pub const BIG_ENDIAN_BITS: [u32; MAX_BIT_POSITION as usize] = big_endian_bits();

const fn big_endian_bits() -> [u32; MAX_BIT_POSITION as usize] {
    let mut table = [0u32; MAX_BIT_POSITION as usize];
    let mut i = 0;
    while i < 64 {
        let mut j = 0;
        while j < 8 {
            table[i * 8 + j] = (7 - j as u32) + (i as u32) * 8;
            j += 1;
        }
        i += 1;
    }
    table
}

/// Subaru checksum: the address bytes plus every payload byte after the
/// first, truncated to 8 bits. Byte 0 holds the checksum itself.
pub fn subaru_checksum(address: u32, data: &[u8]) -> u8 {
    let mut sum: u32 = 0;
    let mut addr = address;
    while addr != 0 {
        sum += addr & 0xFF;
        addr >>= 8;
    }
    for byte in data.iter().skip(1) {
        sum += u32::from(*byte);
    }
    (sum & 0xFF) as u8
}

/// Role of a signal in message integrity handling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalRole {
    #[default]
    Default,
    /// Rolling counter, incremented on every transmission
    Counter,
    /// Checksum over the payload, recomputed on every transmission
    Checksum,
}

/// Multiplexing indicator from the `SG_` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Multiplexer {
    /// `M`: this signal selects the active multiplexed group
    Multiplexor,
    /// `m<n>`: present when the multiplexor equals `n`
    Multiplexed(u64),
}

/// Enumerated labels attached by a `VAL_` line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueDescription {
    /// Signal the description belongs to
    pub signal: String,
    /// Message address the description belongs to
    pub address: u32,
    /// Definitions normalised to `UPPER_CASE_WITH_UNDERSCORES`, space separated
    pub definitions: String,
    /// Raw value to label, as written in the DBC
    pub labels: BTreeMap<i64, String>,
}

/// Immutable layout and scaling of one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSchema {
    pub name: String,
    pub message_name: String,
    /// Start bit as written in the DBC
    pub start_bit: u32,
    pub msb: u32,
    pub lsb: u32,
    /// Width in bits, 1..=64
    pub size: u32,
    pub is_signed: bool,
    pub factor: f64,
    pub offset: f64,
    pub little_endian: bool,
    pub role: SignalRole,
    pub value_description: Option<ValueDescription>,
    pub min: f64,
    pub max: f64,
    pub unit: String,
    pub receivers: Vec<String>,
    pub multiplexer: Option<Multiplexer>,
}

impl Default for SignalSchema {
    fn default() -> Self {
        Self {
            name: String::new(),
            message_name: String::new(),
            start_bit: 0,
            msb: 0,
            lsb: 0,
            size: 1,
            is_signed: false,
            factor: 1.0,
            offset: 0.0,
            little_endian: true,
            role: SignalRole::Default,
            value_description: None,
            min: 0.0,
            max: 0.0,
            unit: String::new(),
            receivers: Vec::new(),
            multiplexer: None,
        }
    }
}

/// Compute `(msb, lsb)` for a DBC start bit, or `None` if the signal does not
/// fit in a 64-byte payload.
pub fn bit_span(start_bit: u32, size: u32, little_endian: bool) -> Option<(u32, u32)> {
    if size == 0 || start_bit >= MAX_BIT_POSITION {
        return None;
    }
    let (msb, lsb) = if little_endian {
        (start_bit + size - 1, start_bit)
    } else {
        let index = BIG_ENDIAN_BITS.iter().position(|&bit| bit == start_bit)?;
        let lsb = *BIG_ENDIAN_BITS.get(index + size as usize - 1)?;
        (start_bit, lsb)
    };
    if msb >= MAX_BIT_POSITION || lsb >= MAX_BIT_POSITION {
        return None;
    }
    Some((msb, lsb))
}

fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl SignalSchema {
    /// Build an unscaled, unsigned schema from a DBC-style position
    pub fn new(
        name: impl Into<String>,
        message_name: impl Into<String>,
        start_bit: u32,
        size: u32,
        little_endian: bool,
    ) -> Result<Self> {
        let name = name.into();
        if !(1..=64).contains(&size) {
            return Err(CanError::InvalidParameter(format!(
                "signal {} has size {} (expected 1..=64)",
                name, size
            )));
        }
        let (msb, lsb) = bit_span(start_bit, size, little_endian).ok_or_else(|| {
            CanError::InvalidParameter(format!(
                "signal {} at bit {} with size {} exceeds {} bits",
                name, start_bit, size, MAX_BIT_POSITION
            ))
        })?;
        Ok(Self {
            name,
            message_name: message_name.into(),
            start_bit,
            msb,
            lsb,
            size,
            little_endian,
            ..Default::default()
        })
    }

    /// Builder method: set factor and offset
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    /// Builder method: mark as signed
    pub fn with_signed(mut self, signed: bool) -> Self {
        self.is_signed = signed;
        self
    }

    /// Builder method: set the integrity role
    pub fn with_role(mut self, role: SignalRole) -> Self {
        self.role = role;
        self
    }

    /// Unsigned raw bits, walked from the MSB byte towards the LSB byte
    ///
    /// Bytes outside `data` end the walk, so a short payload yields a
    /// partially assembled value.
    pub fn extract_raw(&self, data: &[u8]) -> u64 {
        let mut ret: u64 = 0;
        let mut index = (self.msb / 8) as isize;
        let mut bits = self.size;

        while index >= 0 && (index as usize) < data.len() && bits > 0 {
            let byte = index as u32;
            let lsb = if self.lsb / 8 == byte { self.lsb } else { byte * 8 };
            let msb = if self.msb / 8 == byte { self.msb } else { byte * 8 + 7 };
            if msb < lsb {
                break;
            }
            let width = (msb - lsb + 1).min(bits);

            let chunk = (u64::from(data[index as usize]) >> (lsb - byte * 8)) & low_mask(width);
            ret |= chunk << (bits - width);

            bits -= width;
            index += if self.little_endian { -1 } else { 1 };
        }
        ret
    }

    /// Raw value, sign-extended when the signal is signed
    pub fn parse_value(&self, data: &[u8]) -> i64 {
        let raw = self.extract_raw(data);
        if self.is_signed && self.size < 64 && (raw >> (self.size - 1)) & 1 == 1 {
            (raw | !low_mask(self.size)) as i64
        } else {
            raw as i64
        }
    }

    /// Write `raw` into `buf`, walking from the LSB byte
    ///
    /// Only the bits covered by the signal are modified. Negative values are
    /// stored as their two's complement truncated to `size` bits.
    pub fn pack_value(&self, buf: &mut [u8], raw: i64) {
        let mut value = (raw as u64) & low_mask(self.size);
        let mut index = (self.lsb / 8) as isize;
        let mut bits = self.size;

        while index >= 0 && (index as usize) < buf.len() && bits > 0 {
            let byte = index as u32;
            let shift = if self.lsb / 8 == byte { self.lsb % 8 } else { 0 };
            let width = bits.min(8 - shift);

            let mask = (low_mask(width) << shift) as u8;
            let slot = &mut buf[index as usize];
            *slot = (*slot & !mask) | (((value << shift) as u8) & mask);

            bits -= width;
            value >>= width;
            index += if self.little_endian { 1 } else { -1 };
        }
    }

    /// `raw * factor + offset`
    pub fn to_physical(&self, raw: i64) -> f64 {
        raw as f64 * self.factor + self.offset
    }

    /// Inverse scaling, rounded, with negatives wrapped into `2^size`
    pub fn to_raw(&self, physical: f64) -> i64 {
        let mut raw = ((physical - self.offset) / self.factor).round() as i64;
        if raw < 0 && self.size < 64 {
            raw += 1i64 << self.size;
        }
        raw
    }

    /// Physical value of this signal in `data`
    pub fn decode(&self, data: &[u8]) -> f64 {
        self.to_physical(self.parse_value(data))
    }

    /// Number of distinct raw values, saturating for 64-bit signals
    pub fn modulus(&self) -> u64 {
        if self.size >= 64 {
            u64::MAX
        } else {
            1u64 << self.size
        }
    }

    /// Stamp a physical value with the current monotonic time
    pub fn create_signal(&self, value: f64) -> Signal {
        Signal::new(self.name.clone(), value, monotonic_now_ns(), self.little_endian)
    }

    /// Label for `raw` from the attached value description
    pub fn describe(&self, raw: i64) -> Option<&str> {
        self.value_description
            .as_ref()
            .and_then(|vd| vd.labels.get(&raw))
            .map(String::as_str)
    }

    pub fn is_counter(&self) -> bool {
        self.role == SignalRole::Counter
    }

    pub fn is_checksum(&self) -> bool {
        self.role == SignalRole::Checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(start: u32, size: u32, little_endian: bool) -> SignalSchema {
        SignalSchema::new("SIG", "MSG", start, size, little_endian).unwrap()
    }

    #[test]
    fn test_big_endian_table() {
        assert_eq!(&BIG_ENDIAN_BITS[..9], &[7, 6, 5, 4, 3, 2, 1, 0, 15]);
        assert_eq!(BIG_ENDIAN_BITS[511], 504);
    }

    #[test]
    fn test_bit_span() {
        assert_eq!(bit_span(3, 8, true), Some((10, 3)));
        assert_eq!(bit_span(7, 16, false), Some((7, 8)));
        assert_eq!(bit_span(3, 12, false), Some((3, 8)));
        assert_eq!(bit_span(510, 4, true), None);
        assert_eq!(bit_span(512, 1, true), None);
        assert_eq!(bit_span(504, 16, false), None);
    }

    #[test]
    fn test_pack_at_unaligned_start() {
        let sig = schema(3, 8, true);
        let mut buf = vec![0u8; 8];
        sig.pack_value(&mut buf, 1);
        assert_eq!(buf[0], 8);
        assert_eq!(buf[1], 0);
    }

    #[test]
    fn test_pack_little_endian_16bit() {
        let sig = schema(0, 16, true);
        assert_eq!((sig.msb, sig.lsb), (15, 0));
        let mut buf = vec![0u8; 8];
        sig.pack_value(&mut buf, 0xABCD);
        assert_eq!(buf[0], 0xCD);
        assert_eq!(buf[1], 0xAB);
        assert_eq!(sig.parse_value(&buf), 0xABCD);
    }

    #[test]
    fn test_pack_with_big_endian_flag_walks_down() {
        let mut sig = schema(0, 16, true);
        sig.little_endian = false;
        let mut buf = vec![0u8; 8];
        sig.pack_value(&mut buf, 0xABCD);
        assert_eq!(buf[0], 0xCD);
        assert_eq!(buf[1], 0x00);
    }

    #[test]
    fn test_big_endian_round_trip() {
        let sig = schema(7, 16, false);
        let mut buf = vec![0u8; 8];
        sig.pack_value(&mut buf, 0x1234);
        assert_eq!(&buf[..2], &[0x12, 0x34]);
        assert_eq!(sig.parse_value(&buf), 0x1234);

        let sig = schema(3, 12, false);
        let mut buf = vec![0xF0u8; 8];
        sig.pack_value(&mut buf, 0xABC);
        assert_eq!(buf[0], 0xFA);
        assert_eq!(buf[1], 0xBC);
        assert_eq!(sig.parse_value(&buf), 0xABC);
    }

    #[test]
    fn test_signed_parse() {
        let sig = schema(0, 8, true).with_signed(true);
        assert_eq!(sig.parse_value(&[0x01]), 1);
        assert_eq!(sig.parse_value(&[0xFF]), -1);
        assert_eq!(sig.parse_value(&[0x80]), -128);

        let sig = schema(4, 12, true).with_signed(true);
        let mut buf = vec![0u8; 2];
        sig.pack_value(&mut buf, -5);
        assert_eq!(sig.parse_value(&buf), -5);
        assert_eq!(buf[0] & 0x0F, 0);
    }

    #[test]
    fn test_pack_preserves_neighbours() {
        let sig = schema(0, 8, true);
        let mut buf = vec![0u8; 8];
        sig.pack_value(&mut buf, 255);
        assert_eq!(sig.parse_value(&buf), 255);

        let nibble = schema(4, 4, true);
        let mut buf = vec![0xFFu8; 1];
        nibble.pack_value(&mut buf, 0);
        assert_eq!(buf[0], 0x0F);
    }

    #[test]
    fn test_full_width_signal() {
        let sig = schema(0, 64, true);
        let mut buf = vec![0u8; 8];
        sig.pack_value(&mut buf, -1);
        assert_eq!(buf, vec![0xFF; 8]);
        assert_eq!(sig.extract_raw(&buf), u64::MAX);
        assert_eq!(sig.parse_value(&buf), -1);
    }

    #[test]
    fn test_short_payload() {
        let sig = schema(8, 8, true);
        assert_eq!(sig.parse_value(&[0xAA]), 0);
        let mut buf = vec![0u8; 1];
        sig.pack_value(&mut buf, 0x55);
        assert_eq!(buf, vec![0]);
    }

    #[test]
    fn test_scaling() {
        let sig = schema(0, 16, true).with_scaling(0.1, -40.0);
        assert_eq!(sig.to_raw(-40.0), 0);
        assert_eq!(sig.to_raw(0.0), 400);
        assert!((sig.to_physical(400) - 0.0).abs() < 1e-9);

        let sig = schema(0, 8, true);
        assert_eq!(sig.to_raw(-1.0), 255);
        assert_eq!(sig.to_raw(2.6), 3);
    }

    #[test]
    fn test_subaru_checksum() {
        // address 0x122 -> 0x22 + 0x01
        let data = [0x00, 0x10, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(subaru_checksum(0x122, &data), 0x53);
        // first byte ignored
        let data2 = [0xEE, 0x10, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(subaru_checksum(0x122, &data2), 0x53);
        // wraps at 8 bits
        assert_eq!(subaru_checksum(0, &[0, 0xFF, 0x02]), 0x01);
    }

    #[test]
    fn test_describe() {
        let mut sig = schema(0, 2, true);
        assert_eq!(sig.describe(1), None);
        let mut labels = BTreeMap::new();
        labels.insert(1, "On".to_string());
        sig.value_description = Some(ValueDescription {
            signal: "SIG".to_string(),
            address: 0x100,
            definitions: "1 ON".to_string(),
            labels,
        });
        assert_eq!(sig.describe(1), Some("On"));
        assert_eq!(sig.describe(0), None);
    }

    /// Bits covered by a layout, as one mask byte per payload byte
    fn coverage(start: u32, size: u32, little_endian: bool) -> [u8; 64] {
        let positions: Vec<u32> = if little_endian {
            (start..start + size).collect()
        } else {
            let index = BIG_ENDIAN_BITS.iter().position(|&b| b == start).unwrap();
            BIG_ENDIAN_BITS[index..index + size as usize].to_vec()
        };
        let mut mask = [0u8; 64];
        for bit in positions {
            mask[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        mask
    }

    fn background() -> [u8; 64] {
        let mut buf = [0u8; 64];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37) ^ 0xA5;
        }
        buf
    }

    #[test]
    fn test_pack_parse_every_layout() {
        let original = background();
        let mut layouts = 0;

        for little_endian in [true, false] {
            for start in 0..MAX_BIT_POSITION {
                for size in 1..=64u32 {
                    if bit_span(start, size, little_endian).is_none() {
                        continue;
                    }
                    layouts += 1;
                    let unsigned = schema(start, size, little_endian);
                    let signed = unsigned.clone().with_signed(true);
                    let mask = coverage(start, size, little_endian);

                    let max = low_mask(size);
                    for value in [0, 1, max >> 1, max - 1, max] {
                        let mut buf = original;
                        unsigned.pack_value(&mut buf, value as i64);
                        assert_eq!(
                            unsigned.extract_raw(&buf),
                            value,
                            "unsigned {}|{}@{}",
                            start,
                            size,
                            little_endian
                        );
                        for i in 0..64 {
                            assert_eq!(buf[i] & !mask[i], original[i] & !mask[i]);
                        }
                    }

                    let high = (max >> 1) as i64;
                    let low = -high - 1;
                    for value in [low, low + 1, -1, 0, 1, high - 1, high] {
                        if value < low || value > high {
                            continue;
                        }
                        let mut buf = original;
                        signed.pack_value(&mut buf, value);
                        assert_eq!(
                            signed.parse_value(&buf),
                            value,
                            "signed {}|{}@{}",
                            start,
                            size,
                            little_endian
                        );
                        for i in 0..64 {
                            assert_eq!(buf[i] & !mask[i], original[i] & !mask[i]);
                        }
                    }
                }
            }
        }
        assert!(layouts > 40_000);
    }

    #[test]
    fn test_checksum_covers_every_byte_but_the_first() {
        let base = [0x00, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];
        let expected = subaru_checksum(0x122, &base);

        for index in 0..base.len() {
            for delta in 1..=255u8 {
                let mut data = base;
                data[index] = data[index].wrapping_add(delta);
                let checksum = subaru_checksum(0x122, &data);
                if index == 0 {
                    assert_eq!(checksum, expected);
                } else {
                    assert_ne!(checksum, expected, "byte {} delta {}", index, delta);
                }
            }
        }
    }

    #[test]
    fn test_invalid_size() {
        assert!(SignalSchema::new("X", "M", 0, 0, true).is_err());
        assert!(SignalSchema::new("X", "M", 0, 65, true).is_err());
    }
}
