//! Information element values and quality descriptors
//!
//! Values are carried as a tagged variant so that every encode/decode path
//! pattern-matches exhaustively against the type identification instead of
//! peeking at runtime types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::time::Cp56Time2a;

/// Quality descriptor flags (QDS)
///
/// A value is considered good iff `invalid` and `not_topical` are both clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QualityDescriptor {
    /// Overflow: the value exceeds the representable range
    pub overflow: bool,
    /// Blocked: the value is blocked for transmission by a local lock
    pub blocked: bool,
    /// Substituted: the value was provided by an operator
    pub substituted: bool,
    /// Not topical: the value is outdated
    pub not_topical: bool,
    /// Invalid: the value is invalid
    pub invalid: bool,
}

impl QualityDescriptor {
    pub const OVERFLOW: u8 = 0x01;
    pub const BLOCKED: u8 = 0x10;
    pub const SUBSTITUTED: u8 = 0x20;
    pub const NOT_TOPICAL: u8 = 0x40;
    pub const INVALID: u8 = 0x80;

    /// Decode from a full QDS octet.
    pub fn from_byte(value: u8) -> Self {
        Self {
            overflow: (value & Self::OVERFLOW) != 0,
            blocked: (value & Self::BLOCKED) != 0,
            substituted: (value & Self::SUBSTITUTED) != 0,
            not_topical: (value & Self::NOT_TOPICAL) != 0,
            invalid: (value & Self::INVALID) != 0,
        }
    }

    /// Decode the quality nibble shared with a value octet (SIQ/DIQ),
    /// where bits 0..=3 belong to the value.
    pub fn from_siq_diq(value: u8) -> Self {
        Self::from_byte(value & 0xF0)
    }

    pub fn to_byte(self) -> u8 {
        let mut value = 0u8;
        if self.overflow {
            value |= Self::OVERFLOW;
        }
        if self.blocked {
            value |= Self::BLOCKED;
        }
        if self.substituted {
            value |= Self::SUBSTITUTED;
        }
        if self.not_topical {
            value |= Self::NOT_TOPICAL;
        }
        if self.invalid {
            value |= Self::INVALID;
        }
        value
    }

    /// Good means usable for control decisions.
    pub fn is_good(self) -> bool {
        !self.invalid && !self.not_topical
    }

    /// Quality marked invalid, for objects synthesized on error paths.
    pub fn invalid_quality() -> Self {
        Self {
            invalid: true,
            ..Self::default()
        }
    }
}

/// Double-point information state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DoublePointState {
    /// 00: indeterminate or intermediate
    IndeterminateA = 0,
    /// 01: determined OFF
    Off = 1,
    /// 10: determined ON
    On = 2,
    /// 11: indeterminate
    IndeterminateB = 3,
}

impl DoublePointState {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::IndeterminateA,
            1 => Self::Off,
            2 => Self::On,
            _ => Self::IndeterminateB,
        }
    }

    pub fn to_bits(self) -> u8 {
        self as u8
    }

    /// Determined states only; indeterminate maps to `None`.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Off => Some(false),
            Self::On => Some(true),
            _ => None,
        }
    }
}

impl fmt::Display for DoublePointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndeterminateA => write!(f, "indeterminate(00)"),
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
            Self::IndeterminateB => write!(f, "indeterminate(11)"),
        }
    }
}

/// Information element value
///
/// One variant per wire layout the client can carry. The ASDU codec matches
/// the variant against the type identification on encode and rejects
/// mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Single-point state (types 1/30, command 45)
    Bool(bool),
    /// Double-point state (types 3/31, command 46)
    DoublePoint(DoublePointState),
    /// Step position, 7-bit signed (types 5/32, command 47)
    Step(i8),
    /// Bitstring of 32 bits (types 7/33, command 51)
    Bits32(u32),
    /// Normalized value in [-1.0, 1.0) (types 9/34, command 48)
    Normalized(f32),
    /// Scaled value (types 11/35, command 49)
    Scaled(i16),
    /// Short floating point (types 13/36, command 50)
    Float(f32),
    /// Binary counter reading (types 15/37)
    Counter(i32),
    /// CP56Time2a payload (clock synchronization, type 103)
    Time(Cp56Time2a),
    /// Bare qualifier octet (interrogation QOI, counter QCC, reset QRP)
    Qualifier(u8),
}

impl Value {
    /// Numeric rendering for the driver's read surface; discrete states map
    /// onto their wire encoding.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::DoublePoint(dp) => Some(dp.to_bits() as f64),
            Value::Step(s) => Some(*s as f64),
            Value::Bits32(b) => Some(*b as f64),
            Value::Normalized(n) => Some(*n as f64),
            Value::Scaled(s) => Some(*s as f64),
            Value::Float(x) => Some(*x as f64),
            Value::Counter(c) => Some(*c as f64),
            Value::Qualifier(q) => Some(*q as f64),
            Value::Time(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::DoublePoint(dp) => write!(f, "{dp}"),
            Value::Step(s) => write!(f, "{s}"),
            Value::Bits32(b) => write!(f, "{b:#010x}"),
            Value::Normalized(n) => write!(f, "{n}"),
            Value::Scaled(s) => write!(f, "{s}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Counter(c) => write!(f, "{c}"),
            Value::Time(t) => write!(f, "{t}"),
            Value::Qualifier(q) => write!(f, "{q}"),
        }
    }
}

/// Normalized-value conversion: signed 16-bit raw to [-1.0, 1.0).
pub(crate) fn normalized_from_raw(raw: i16) -> f32 {
    raw as f32 / 32768.0
}

/// Inverse conversion, clamped to the representable raw range after rounding.
pub(crate) fn normalized_to_raw(value: f32) -> i16 {
    let scaled = (value * 32768.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_round_trip() {
        for byte in [0x00u8, 0x01, 0x10, 0x20, 0x40, 0x80, 0xF1] {
            assert_eq!(QualityDescriptor::from_byte(byte).to_byte(), byte);
        }
    }

    #[test]
    fn quality_good_requires_topical_and_valid() {
        assert!(QualityDescriptor::default().is_good());
        assert!(!QualityDescriptor::from_byte(QualityDescriptor::INVALID).is_good());
        assert!(!QualityDescriptor::from_byte(QualityDescriptor::NOT_TOPICAL).is_good());
        // blocked/substituted/overflow alone do not spoil goodness
        assert!(QualityDescriptor::from_byte(0x31).is_good());
    }

    #[test]
    fn double_point_states() {
        assert_eq!(DoublePointState::from_bits(0), DoublePointState::IndeterminateA);
        assert_eq!(DoublePointState::from_bits(1), DoublePointState::Off);
        assert_eq!(DoublePointState::from_bits(2), DoublePointState::On);
        assert_eq!(DoublePointState::from_bits(3), DoublePointState::IndeterminateB);
        assert_eq!(DoublePointState::On.as_bool(), Some(true));
        assert_eq!(DoublePointState::IndeterminateB.as_bool(), None);
        // upper bits of a DIQ octet must not leak into the state
        assert_eq!(DoublePointState::from_bits(0xF2), DoublePointState::On);
    }

    #[test]
    fn normalized_conversion_clamps() {
        assert_eq!(normalized_to_raw(0.0), 0);
        assert_eq!(normalized_to_raw(-1.0), i16::MIN);
        // +1.0 is just outside the representable range and clamps to max
        assert_eq!(normalized_to_raw(1.0), i16::MAX);
        assert_eq!(normalized_to_raw(2.5), i16::MAX);

        let half = normalized_from_raw(16384);
        assert!((half - 0.5).abs() < 1e-6);
        assert_eq!(normalized_to_raw(normalized_from_raw(-20000)), -20000);
    }
}
