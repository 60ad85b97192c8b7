//! APCI framing (APDU encode/decode)
//!
//! Every APDU starts with 0x68, a one-octet length (4..=253, counting the
//! control field and ASDU but not the first two octets) and a four-octet
//! control field. The two low bits of the first control octet select the
//! format: I (`..0`), S (`01`) or U (`11`). Sequence numbers are 15 bits,
//! stored shifted left one bit.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Iec104Error, Result};

/// APDU start octet.
pub const START_BYTE: u8 = 0x68;

/// Smallest legal APDU length octet (control field only).
pub const APDU_LEN_MIN: u8 = 4;

/// Largest legal APDU length octet.
pub const APDU_LEN_MAX: u8 = 253;

/// Sequence numbers live modulo 2^15.
pub const SEQ_MODULO: u16 = 32_768;

/// U-frame function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UFunction {
    /// Start data transfer activation
    StartDtAct = 0x07,
    /// Start data transfer confirmation
    StartDtCon = 0x0B,
    /// Stop data transfer activation
    StopDtAct = 0x13,
    /// Stop data transfer confirmation
    StopDtCon = 0x23,
    /// Test frame activation
    TestFrAct = 0x43,
    /// Test frame confirmation
    TestFrCon = 0x83,
}

impl UFunction {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(Self::StartDtAct),
            0x0B => Some(Self::StartDtCon),
            0x13 => Some(Self::StopDtAct),
            0x23 => Some(Self::StopDtCon),
            0x43 => Some(Self::TestFrAct),
            0x83 => Some(Self::TestFrCon),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// The confirmation matching this activation, if this is an activation.
    pub fn confirmation(self) -> Option<Self> {
        match self {
            Self::StartDtAct => Some(Self::StartDtCon),
            Self::StopDtAct => Some(Self::StopDtCon),
            Self::TestFrAct => Some(Self::TestFrCon),
            _ => None,
        }
    }
}

/// Control-field classification of an APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApciType {
    /// I-format: numbered information transfer, carries one ASDU
    IFrame { send_seq: u16, recv_seq: u16 },
    /// S-format: supervisory acknowledgment
    SFrame { recv_seq: u16 },
    /// U-format: unnumbered control function
    UFrame(UFunction),
}

/// A decoded APDU: classification plus the raw ASDU body (I-frames only)
#[derive(Debug, Clone, PartialEq)]
pub struct Apdu {
    pub apci: ApciType,
    /// Raw ASDU octets; empty for S- and U-frames.
    pub body: Bytes,
}

impl Apdu {
    /// I-format APDU wrapping an already-encoded ASDU.
    pub fn new_i_frame(send_seq: u16, recv_seq: u16, asdu: Bytes) -> Self {
        Self {
            apci: ApciType::IFrame {
                send_seq: send_seq % SEQ_MODULO,
                recv_seq: recv_seq % SEQ_MODULO,
            },
            body: asdu,
        }
    }

    /// S-format acknowledgment carrying the receive sequence.
    pub fn new_s_frame(recv_seq: u16) -> Self {
        Self {
            apci: ApciType::SFrame {
                recv_seq: recv_seq % SEQ_MODULO,
            },
            body: Bytes::new(),
        }
    }

    /// U-format control frame.
    pub fn new_u_frame(function: UFunction) -> Self {
        Self {
            apci: ApciType::UFrame(function),
            body: Bytes::new(),
        }
    }

    /// Encode to wire bytes. Emits exactly `length + 2` octets.
    pub fn encode(&self) -> Result<Bytes> {
        let length = 4 + self.body.len();
        if length > APDU_LEN_MAX as usize {
            return Err(Iec104Error::BadLength(length.min(255) as u8));
        }

        let mut buf = BytesMut::with_capacity(length + 2);
        buf.put_u8(START_BYTE);
        buf.put_u8(length as u8);

        match self.apci {
            ApciType::IFrame { send_seq, recv_seq } => {
                buf.put_u16_le(send_seq << 1);
                buf.put_u16_le(recv_seq << 1);
                buf.extend_from_slice(&self.body);
            }
            ApciType::SFrame { recv_seq } => {
                buf.put_u8(0x01);
                buf.put_u8(0x00);
                buf.put_u16_le(recv_seq << 1);
            }
            ApciType::UFrame(function) => {
                buf.put_u8(function.to_byte());
                buf.put_u8(0x00);
                buf.put_u8(0x00);
                buf.put_u8(0x00);
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a complete APDU from wire bytes.
    ///
    /// The slice must hold the whole frame: start octet, length octet and
    /// `length` further octets.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Iec104Error::Truncated {
                expected: 2,
                actual: data.len(),
            });
        }
        if data[0] != START_BYTE {
            return Err(Iec104Error::BadStartByte(data[0]));
        }

        let length = data[1];
        if !(APDU_LEN_MIN..=APDU_LEN_MAX).contains(&length) {
            return Err(Iec104Error::BadLength(length));
        }
        let total = length as usize + 2;
        if data.len() != total {
            return Err(Iec104Error::Truncated {
                expected: total,
                actual: data.len(),
            });
        }

        let ctrl = &data[2..6];
        if ctrl[0] & 0x01 == 0 {
            // I-format: 15-bit sequences stored shifted left one bit
            let send_seq = u16::from_le_bytes([ctrl[0], ctrl[1]]) >> 1;
            let recv_seq = u16::from_le_bytes([ctrl[2], ctrl[3]]) >> 1;
            Ok(Self {
                apci: ApciType::IFrame { send_seq, recv_seq },
                body: Bytes::copy_from_slice(&data[6..]),
            })
        } else if ctrl[0] & 0x03 == 0x01 {
            if ctrl[0] != 0x01 || ctrl[1] != 0x00 {
                return Err(Iec104Error::MalformedSFrame);
            }
            let recv_seq = u16::from_le_bytes([ctrl[2], ctrl[3]]) >> 1;
            Ok(Self {
                apci: ApciType::SFrame { recv_seq },
                body: Bytes::new(),
            })
        } else if ctrl[0] & 0x03 == 0x03 {
            if ctrl[1] != 0 || ctrl[2] != 0 || ctrl[3] != 0 {
                return Err(Iec104Error::UnknownUFunction(ctrl[0]));
            }
            let function =
                UFunction::from_byte(ctrl[0]).ok_or(Iec104Error::UnknownUFunction(ctrl[0]))?;
            Ok(Self {
                apci: ApciType::UFrame(function),
                body: Bytes::new(),
            })
        } else {
            Err(Iec104Error::UnknownFormat(ctrl[0]))
        }
    }
}
