//! ASDU codec: type identifications, cause of transmission, information
//! objects and the six-octet data unit identifier
//!
//! ```text
//!       | data unit identification              | information object <1..n>  |
//!       | typeID | VSQ | COT | OA | common addr | IOA | element [| CP56 time] |
//! bytes |    1   |  1  |  1  |  1 |      2      |  3  |  per-type             |
//! ```
//!
//! With the sequence (SQ) bit set only the first object carries an IOA;
//! the rest address `first IOA + index`. All multi-octet fields are
//! little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::time::{Cp56Time2a, CP56_SIZE};
use crate::codec::value::{
    normalized_from_raw, normalized_to_raw, DoublePointState, QualityDescriptor, Value,
};
use crate::error::{Iec104Error, Result};

/// Fixed test-command pattern (C_TS_NA_1), little-endian on the wire.
pub const TEST_PATTERN: u16 = 0x55AA;

/// Largest information object count a VSQ can carry.
pub const MAX_OBJECTS: usize = 127;

/// Largest valid common address; 65535 is the broadcast address and is not
/// accepted from the monitoring direction.
pub const COMMON_ADDR_MAX: u16 = 65_534;

/// Largest information object address (24-bit field).
pub const IOA_MAX: u32 = 16_777_215;

/// Type identification of an ASDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    /// Single-point information (M_SP_NA_1)
    SinglePoint = 1,
    /// Double-point information (M_DP_NA_1)
    DoublePoint = 3,
    /// Step position information (M_ST_NA_1)
    StepPosition = 5,
    /// Bitstring of 32 bits (M_BO_NA_1)
    Bitstring32 = 7,
    /// Measured value, normalized (M_ME_NA_1)
    MeasuredNormalized = 9,
    /// Measured value, scaled (M_ME_NB_1)
    MeasuredScaled = 11,
    /// Measured value, short floating point (M_ME_NC_1)
    MeasuredFloat = 13,
    /// Integrated totals (M_IT_NA_1)
    IntegratedTotals = 15,
    /// Single-point information with CP56Time2a (M_SP_TB_1)
    SinglePointWithTime = 30,
    /// Double-point information with CP56Time2a (M_DP_TB_1)
    DoublePointWithTime = 31,
    /// Step position information with CP56Time2a (M_ST_TB_1)
    StepPositionWithTime = 32,
    /// Bitstring of 32 bits with CP56Time2a (M_BO_TB_1)
    Bitstring32WithTime = 33,
    /// Measured value, normalized with CP56Time2a (M_ME_TD_1)
    MeasuredNormalizedWithTime = 34,
    /// Measured value, scaled with CP56Time2a (M_ME_TE_1)
    MeasuredScaledWithTime = 35,
    /// Measured value, short floating point with CP56Time2a (M_ME_TF_1)
    MeasuredFloatWithTime = 36,
    /// Integrated totals with CP56Time2a (M_IT_TB_1)
    IntegratedTotalsWithTime = 37,
    /// Single command (C_SC_NA_1)
    SingleCommand = 45,
    /// Double command (C_DC_NA_1)
    DoubleCommand = 46,
    /// Regulating step command (C_RC_NA_1)
    RegulatingStepCommand = 47,
    /// Set-point command, normalized (C_SE_NA_1)
    SetpointNormalized = 48,
    /// Set-point command, scaled (C_SE_NB_1)
    SetpointScaled = 49,
    /// Set-point command, short floating point (C_SE_NC_1)
    SetpointFloat = 50,
    /// Bitstring of 32 bits command (C_BO_NA_1)
    BitstringCommand = 51,
    /// Interrogation command (C_IC_NA_1)
    InterrogationCommand = 100,
    /// Counter interrogation command (C_CI_NA_1)
    CounterInterrogationCommand = 101,
    /// Read command (C_RD_NA_1)
    ReadCommand = 102,
    /// Clock synchronization command (C_CS_NA_1)
    ClockSyncCommand = 103,
    /// Test command (C_TS_NA_1)
    TestCommand = 104,
    /// Reset process command (C_RP_NA_1)
    ResetProcessCommand = 105,
    /// Delay acquisition command (C_CD_NA_1)
    DelayAcquisitionCommand = 106,
}

impl TypeId {
    /// Map a wire octet to a supported type identification.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::SinglePoint),
            3 => Some(Self::DoublePoint),
            5 => Some(Self::StepPosition),
            7 => Some(Self::Bitstring32),
            9 => Some(Self::MeasuredNormalized),
            11 => Some(Self::MeasuredScaled),
            13 => Some(Self::MeasuredFloat),
            15 => Some(Self::IntegratedTotals),
            30 => Some(Self::SinglePointWithTime),
            31 => Some(Self::DoublePointWithTime),
            32 => Some(Self::StepPositionWithTime),
            33 => Some(Self::Bitstring32WithTime),
            34 => Some(Self::MeasuredNormalizedWithTime),
            35 => Some(Self::MeasuredScaledWithTime),
            36 => Some(Self::MeasuredFloatWithTime),
            37 => Some(Self::IntegratedTotalsWithTime),
            45 => Some(Self::SingleCommand),
            46 => Some(Self::DoubleCommand),
            47 => Some(Self::RegulatingStepCommand),
            48 => Some(Self::SetpointNormalized),
            49 => Some(Self::SetpointScaled),
            50 => Some(Self::SetpointFloat),
            51 => Some(Self::BitstringCommand),
            100 => Some(Self::InterrogationCommand),
            101 => Some(Self::CounterInterrogationCommand),
            102 => Some(Self::ReadCommand),
            103 => Some(Self::ClockSyncCommand),
            104 => Some(Self::TestCommand),
            105 => Some(Self::ResetProcessCommand),
            106 => Some(Self::DelayAcquisitionCommand),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Monitoring direction: process information sent by the outstation.
    pub fn is_monitoring(self) -> bool {
        (self as u8) < 45
    }

    /// Control direction: commands issued by this client.
    pub fn is_command(self) -> bool {
        matches!(self as u8, 45..=51)
    }

    /// System information: interrogations, clock sync, test, reset, delay.
    pub fn is_system(self) -> bool {
        (self as u8) >= 100
    }

    /// True for the 30..=37 series carrying a CP56Time2a tag.
    pub fn has_time_tag(self) -> bool {
        matches!(self as u8, 30..=37)
    }

    /// Element octets per information object, excluding the IOA but
    /// including a CP56Time2a tag where the type carries one.
    pub fn element_size(self) -> usize {
        let base = match self {
            Self::SinglePoint | Self::SinglePointWithTime => 1,
            Self::DoublePoint | Self::DoublePointWithTime => 1,
            Self::StepPosition | Self::StepPositionWithTime => 2,
            Self::Bitstring32 | Self::Bitstring32WithTime => 5,
            Self::MeasuredNormalized | Self::MeasuredNormalizedWithTime => 3,
            Self::MeasuredScaled | Self::MeasuredScaledWithTime => 3,
            Self::MeasuredFloat | Self::MeasuredFloatWithTime => 5,
            Self::IntegratedTotals | Self::IntegratedTotalsWithTime => 5,
            Self::SingleCommand | Self::DoubleCommand | Self::RegulatingStepCommand => 1,
            Self::SetpointNormalized | Self::SetpointScaled => 3,
            Self::SetpointFloat => 5,
            Self::BitstringCommand => 4,
            Self::InterrogationCommand
            | Self::CounterInterrogationCommand
            | Self::ResetProcessCommand => 1,
            Self::ReadCommand => 0,
            Self::ClockSyncCommand => CP56_SIZE,
            Self::TestCommand | Self::DelayAcquisitionCommand => 2,
        };
        if self.has_time_tag() {
            base + CP56_SIZE
        } else {
            base
        }
    }
}

/// Cause of transmission code (low six bits of the COT octet)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Cause {
    /// Periodic, cyclic
    Periodic = 1,
    /// Background scan
    Background = 2,
    /// Spontaneous
    Spontaneous = 3,
    /// Initialized
    Initialized = 4,
    /// Request or requested
    Request = 5,
    /// Activation
    Activation = 6,
    /// Activation confirmation
    ActivationCon = 7,
    /// Deactivation
    Deactivation = 8,
    /// Deactivation confirmation
    DeactivationCon = 9,
    /// Activation termination
    ActivationTerm = 10,
    /// Return information caused by a remote command
    ReturnInfoRemote = 11,
    /// Return information caused by a local command
    ReturnInfoLocal = 12,
    /// File transfer
    FileTransfer = 13,
    /// Authentication
    Authentication = 14,
    /// Maintenance of authentication session key
    SessionKey = 15,
    /// Maintenance of user role and authentication key
    UserRoleAndAuthKey = 16,
    /// Reserved cause codes 17..19
    Reserved17 = 17,
    Reserved18 = 18,
    Reserved19 = 19,
    /// Interrogated by station interrogation
    InterrogatedByStation = 20,
    InterrogatedByGroup1 = 21,
    InterrogatedByGroup2 = 22,
    InterrogatedByGroup3 = 23,
    InterrogatedByGroup4 = 24,
    InterrogatedByGroup5 = 25,
    InterrogatedByGroup6 = 26,
    InterrogatedByGroup7 = 27,
    InterrogatedByGroup8 = 28,
    InterrogatedByGroup9 = 29,
    InterrogatedByGroup10 = 30,
    InterrogatedByGroup11 = 31,
    InterrogatedByGroup12 = 32,
    InterrogatedByGroup13 = 33,
    InterrogatedByGroup14 = 34,
    InterrogatedByGroup15 = 35,
    InterrogatedByGroup16 = 36,
    /// Requested by general counter request
    RequestByGeneralCounter = 37,
    RequestByGroup1Counter = 38,
    RequestByGroup2Counter = 39,
    RequestByGroup3Counter = 40,
    RequestByGroup4Counter = 41,
    /// Reserved cause codes 42..43
    Reserved42 = 42,
    Reserved43 = 43,
    /// Unknown type identification
    UnknownTypeId = 44,
    /// Unknown cause of transmission
    UnknownCot = 45,
    /// Unknown common address of ASDU
    UnknownCommonAddress = 46,
    /// Unknown information object address
    UnknownIoa = 47,
}

impl Cause {
    /// Map a six-bit cause code; codes 0 and 48..=63 are outside the
    /// defined range.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Periodic),
            2 => Some(Self::Background),
            3 => Some(Self::Spontaneous),
            4 => Some(Self::Initialized),
            5 => Some(Self::Request),
            6 => Some(Self::Activation),
            7 => Some(Self::ActivationCon),
            8 => Some(Self::Deactivation),
            9 => Some(Self::DeactivationCon),
            10 => Some(Self::ActivationTerm),
            11 => Some(Self::ReturnInfoRemote),
            12 => Some(Self::ReturnInfoLocal),
            13 => Some(Self::FileTransfer),
            14 => Some(Self::Authentication),
            15 => Some(Self::SessionKey),
            16 => Some(Self::UserRoleAndAuthKey),
            17 => Some(Self::Reserved17),
            18 => Some(Self::Reserved18),
            19 => Some(Self::Reserved19),
            20 => Some(Self::InterrogatedByStation),
            21 => Some(Self::InterrogatedByGroup1),
            22 => Some(Self::InterrogatedByGroup2),
            23 => Some(Self::InterrogatedByGroup3),
            24 => Some(Self::InterrogatedByGroup4),
            25 => Some(Self::InterrogatedByGroup5),
            26 => Some(Self::InterrogatedByGroup6),
            27 => Some(Self::InterrogatedByGroup7),
            28 => Some(Self::InterrogatedByGroup8),
            29 => Some(Self::InterrogatedByGroup9),
            30 => Some(Self::InterrogatedByGroup10),
            31 => Some(Self::InterrogatedByGroup11),
            32 => Some(Self::InterrogatedByGroup12),
            33 => Some(Self::InterrogatedByGroup13),
            34 => Some(Self::InterrogatedByGroup14),
            35 => Some(Self::InterrogatedByGroup15),
            36 => Some(Self::InterrogatedByGroup16),
            37 => Some(Self::RequestByGeneralCounter),
            38 => Some(Self::RequestByGroup1Counter),
            39 => Some(Self::RequestByGroup2Counter),
            40 => Some(Self::RequestByGroup3Counter),
            41 => Some(Self::RequestByGroup4Counter),
            42 => Some(Self::Reserved42),
            43 => Some(Self::Reserved43),
            44 => Some(Self::UnknownTypeId),
            45 => Some(Self::UnknownCot),
            46 => Some(Self::UnknownCommonAddress),
            47 => Some(Self::UnknownIoa),
            _ => None,
        }
    }

    pub fn to_code(self) -> u8 {
        self as u8
    }
}

/// Full cause-of-transmission octet: cause code plus test and negative bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseOfTransmission {
    pub cause: Cause,
    /// Bit 7: frame generated under test conditions
    pub test: bool,
    /// Bit 6: negative confirmation
    pub negative: bool,
}

impl CauseOfTransmission {
    pub fn new(cause: Cause) -> Self {
        Self {
            cause,
            test: false,
            negative: false,
        }
    }

    pub fn from_byte(value: u8) -> Result<Self> {
        let cause = Cause::from_code(value & 0x3F).ok_or(Iec104Error::BadCot(value & 0x3F))?;
        Ok(Self {
            cause,
            test: (value & 0x80) != 0,
            negative: (value & 0x40) != 0,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut value = self.cause.to_code();
        if self.negative {
            value |= 0x40;
        }
        if self.test {
            value |= 0x80;
        }
        value
    }
}

impl From<Cause> for CauseOfTransmission {
    fn from(cause: Cause) -> Self {
        Self::new(cause)
    }
}

/// One information object: address, value, quality, optional time tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationObject {
    /// 24-bit information object address. Zero only for system types.
    pub ioa: u32,
    pub value: Value,
    pub quality: QualityDescriptor,
    /// CP56Time2a tag for the 30..=37 series
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time: Option<Cp56Time2a>,
    /// S/E bit for control-direction objects; always false when decoded
    /// from the monitoring direction.
    #[serde(default)]
    pub select: bool,
}

impl InformationObject {
    pub fn new(ioa: u32, value: Value) -> Self {
        Self {
            ioa,
            value,
            quality: QualityDescriptor::default(),
            time: None,
            select: false,
        }
    }

    pub fn with_quality(mut self, quality: QualityDescriptor) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_time(mut self, time: Cp56Time2a) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_select(mut self, select: bool) -> Self {
        self.select = select;
        self
    }
}

/// Application service data unit
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    pub type_id: TypeId,
    /// SQ bit: elements packed as an implicit address sequence
    pub is_sequence: bool,
    pub cot: CauseOfTransmission,
    /// Originator address
    pub originator: u8,
    /// Common address of ASDU (1..=65534)
    pub common_addr: u16,
    pub objects: Vec<InformationObject>,
    /// Set when object parsing stopped short of the declared count or left
    /// trailing octets; such an ASDU must not enter the receive queue.
    pub partial: bool,
}

impl Asdu {
    /// Build an ASDU in individual-address form (SQ = 0).
    pub fn new(
        type_id: TypeId,
        cot: impl Into<CauseOfTransmission>,
        common_addr: u16,
        objects: Vec<InformationObject>,
    ) -> Self {
        Self {
            type_id,
            is_sequence: false,
            cot: cot.into(),
            originator: 0,
            common_addr,
            objects,
            partial: false,
        }
    }

    /// Build an ASDU in sequence form (SQ = 1); object addresses are taken
    /// from the first object onward.
    pub fn new_sequence(
        type_id: TypeId,
        cot: impl Into<CauseOfTransmission>,
        common_addr: u16,
        objects: Vec<InformationObject>,
    ) -> Self {
        Self {
            is_sequence: true,
            ..Self::new(type_id, cot, common_addr, objects)
        }
    }

    /// Decode an ASDU from the payload of an I-frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(Iec104Error::Truncated {
                expected: 6,
                actual: data.len(),
            });
        }

        let type_id =
            TypeId::from_byte(data[0]).ok_or(Iec104Error::UnsupportedType(data[0]))?;
        let vsq = data[1];
        let is_sequence = (vsq & 0x80) != 0;
        let count = vsq & 0x7F;
        if count == 0 {
            return Err(Iec104Error::BadElementCount(count));
        }
        let cot = CauseOfTransmission::from_byte(data[2])?;
        let originator = data[3];
        let common_addr = u16::from_le_bytes([data[4], data[5]]);
        if common_addr == 0 || common_addr > COMMON_ADDR_MAX {
            return Err(Iec104Error::BadCommonAddress(common_addr));
        }

        let element_size = type_id.element_size();
        let mut objects = Vec::with_capacity(count as usize);
        let mut partial = false;
        let mut offset = 6usize;
        let mut first_ioa = 0u32;

        for index in 0..count as usize {
            let carries_ioa = index == 0 || !is_sequence;
            let need = if carries_ioa { 3 } else { 0 } + element_size;
            if offset + need > data.len() {
                partial = true;
                break;
            }

            let ioa = if carries_ioa {
                let ioa = u32::from_le_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    0,
                ]);
                offset += 3;
                if index == 0 {
                    first_ioa = ioa;
                }
                ioa
            } else {
                first_ioa + index as u32
            };
            if ioa == 0 && !type_id.is_system() {
                return Err(Iec104Error::BadIoa(ioa));
            }
            if ioa > IOA_MAX {
                return Err(Iec104Error::BadIoa(ioa));
            }

            objects.push(decode_element(type_id, ioa, &data[offset..offset + element_size]));
            offset += element_size;
        }

        // Declared sizes must account for every octet (I5); surplus bytes
        // invalidate the ASDU just like a short read does.
        if !partial && offset != data.len() {
            partial = true;
        }

        Ok(Self {
            type_id,
            is_sequence,
            cot,
            originator,
            common_addr,
            objects,
            partial,
        })
    }

    /// Encode to wire bytes. The element count is truncated to 127.
    pub fn encode(&self) -> Result<Bytes> {
        let count = self.objects.len().min(MAX_OBJECTS);
        if count == 0 {
            return Err(Iec104Error::BadElementCount(0));
        }

        let mut buf = BytesMut::with_capacity(6 + count * (3 + self.type_id.element_size()));
        buf.put_u8(self.type_id.to_byte());
        buf.put_u8((count as u8) | if self.is_sequence { 0x80 } else { 0 });
        buf.put_u8(self.cot.to_byte());
        buf.put_u8(self.originator);
        buf.put_u16_le(self.common_addr);

        for (index, object) in self.objects[..count].iter().enumerate() {
            if index == 0 || !self.is_sequence {
                let ioa = object.ioa.to_le_bytes();
                buf.put_slice(&ioa[..3]);
            }
            encode_element(self.type_id, object, &mut buf)?;
        }

        Ok(buf.freeze())
    }
}

/// Decode one information element at its computed offset. The slice is
/// exactly `element_size` long; bounds were checked by the caller.
fn decode_element(type_id: TypeId, ioa: u32, data: &[u8]) -> InformationObject {
    let (value, mut quality, consumed) = match type_id {
        TypeId::SinglePoint | TypeId::SinglePointWithTime => (
            Value::Bool(data[0] & 0x01 != 0),
            QualityDescriptor::from_siq_diq(data[0]),
            1,
        ),
        TypeId::DoublePoint | TypeId::DoublePointWithTime => (
            Value::DoublePoint(DoublePointState::from_bits(data[0])),
            QualityDescriptor::from_siq_diq(data[0]),
            1,
        ),
        TypeId::StepPosition | TypeId::StepPositionWithTime => (
            // VTI: 7-bit two's complement, transient bit masked off
            Value::Step(((data[0] << 1) as i8) >> 1),
            QualityDescriptor::from_byte(data[1]),
            2,
        ),
        TypeId::Bitstring32 | TypeId::Bitstring32WithTime => (
            Value::Bits32(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            QualityDescriptor::from_byte(data[4]),
            5,
        ),
        TypeId::MeasuredNormalized | TypeId::MeasuredNormalizedWithTime => (
            Value::Normalized(normalized_from_raw(i16::from_le_bytes([data[0], data[1]]))),
            QualityDescriptor::from_byte(data[2]),
            3,
        ),
        TypeId::MeasuredScaled | TypeId::MeasuredScaledWithTime => (
            Value::Scaled(i16::from_le_bytes([data[0], data[1]])),
            QualityDescriptor::from_byte(data[2]),
            3,
        ),
        TypeId::MeasuredFloat | TypeId::MeasuredFloatWithTime => (
            Value::Float(f32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            QualityDescriptor::from_byte(data[4]),
            5,
        ),
        TypeId::IntegratedTotals | TypeId::IntegratedTotalsWithTime => {
            // BCR: 32-bit count plus a sequence/quality octet
            // (bits 0..4 sequence, 0x20 carry, 0x40 adjusted, 0x80 invalid)
            let flags = data[4];
            let quality = QualityDescriptor {
                overflow: flags & 0x20 != 0,
                substituted: flags & 0x40 != 0,
                invalid: flags & 0x80 != 0,
                ..QualityDescriptor::default()
            };
            (
                Value::Counter(i32::from_le_bytes([data[0], data[1], data[2], data[3]])),
                quality,
                5,
            )
        }
        TypeId::SingleCommand => {
            return command_object(ioa, Value::Bool(data[0] & 0x01 != 0), data[0]);
        }
        TypeId::DoubleCommand => {
            return command_object(
                ioa,
                Value::DoublePoint(DoublePointState::from_bits(data[0])),
                data[0],
            );
        }
        TypeId::RegulatingStepCommand => {
            // RCO: 1 = step lower, 2 = step higher
            let step = match data[0] & 0x03 {
                1 => -1,
                2 => 1,
                _ => 0,
            };
            return command_object(ioa, Value::Step(step), data[0]);
        }
        TypeId::SetpointNormalized => {
            return command_object(
                ioa,
                Value::Normalized(normalized_from_raw(i16::from_le_bytes([data[0], data[1]]))),
                data[2],
            );
        }
        TypeId::SetpointScaled => {
            return command_object(
                ioa,
                Value::Scaled(i16::from_le_bytes([data[0], data[1]])),
                data[2],
            );
        }
        TypeId::SetpointFloat => {
            return command_object(
                ioa,
                Value::Float(f32::from_le_bytes([data[0], data[1], data[2], data[3]])),
                data[4],
            );
        }
        TypeId::BitstringCommand => (
            Value::Bits32(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            QualityDescriptor::default(),
            4,
        ),
        TypeId::InterrogationCommand
        | TypeId::CounterInterrogationCommand
        | TypeId::ResetProcessCommand => {
            (Value::Qualifier(data[0]), QualityDescriptor::default(), 1)
        }
        TypeId::ReadCommand => (Value::Qualifier(0), QualityDescriptor::default(), 0),
        TypeId::ClockSyncCommand => {
            let mut bytes = [0u8; CP56_SIZE];
            bytes.copy_from_slice(&data[..CP56_SIZE]);
            (
                Value::Time(Cp56Time2a::from_bytes(&bytes)),
                QualityDescriptor::default(),
                CP56_SIZE,
            )
        }
        TypeId::TestCommand | TypeId::DelayAcquisitionCommand => (
            Value::Bits32(u16::from_le_bytes([data[0], data[1]]) as u32),
            QualityDescriptor::default(),
            2,
        ),
    };

    let time = if type_id.has_time_tag() {
        let mut bytes = [0u8; CP56_SIZE];
        bytes.copy_from_slice(&data[consumed..consumed + CP56_SIZE]);
        let time = Cp56Time2a::from_bytes(&bytes);
        // a flagged-invalid timestamp spoils the object's quality too
        quality.invalid |= time.invalid;
        Some(time)
    } else {
        None
    };

    InformationObject {
        ioa,
        value,
        quality,
        time,
        select: false,
    }
}

/// Command objects carry the S/E bit in the high bit of their qualifier.
fn command_object(ioa: u32, value: Value, qualifier: u8) -> InformationObject {
    InformationObject {
        ioa,
        value,
        quality: QualityDescriptor::default(),
        time: None,
        select: qualifier & 0x80 != 0,
    }
}

/// Encode one information element, rejecting values whose variant does not
/// fit the type identification.
fn encode_element(type_id: TypeId, object: &InformationObject, buf: &mut BytesMut) -> Result<()> {
    let mismatch = || Iec104Error::ValueTypeMismatch(type_id.to_byte());

    match type_id {
        TypeId::SinglePoint | TypeId::SinglePointWithTime => match object.value {
            Value::Bool(b) => {
                buf.put_u8((b as u8) | (object.quality.to_byte() & 0xF0));
            }
            _ => return Err(mismatch()),
        },
        TypeId::DoublePoint | TypeId::DoublePointWithTime => match object.value {
            Value::DoublePoint(dp) => {
                buf.put_u8(dp.to_bits() | (object.quality.to_byte() & 0xF0));
            }
            _ => return Err(mismatch()),
        },
        TypeId::StepPosition | TypeId::StepPositionWithTime => match object.value {
            Value::Step(s) => {
                buf.put_u8((s as u8) & 0x7F);
                buf.put_u8(object.quality.to_byte());
            }
            _ => return Err(mismatch()),
        },
        TypeId::Bitstring32 | TypeId::Bitstring32WithTime => match object.value {
            Value::Bits32(b) => {
                buf.put_u32_le(b);
                buf.put_u8(object.quality.to_byte());
            }
            _ => return Err(mismatch()),
        },
        TypeId::MeasuredNormalized | TypeId::MeasuredNormalizedWithTime => match object.value {
            Value::Normalized(n) => {
                buf.put_i16_le(normalized_to_raw(n));
                buf.put_u8(object.quality.to_byte());
            }
            _ => return Err(mismatch()),
        },
        TypeId::MeasuredScaled | TypeId::MeasuredScaledWithTime => match object.value {
            Value::Scaled(s) => {
                buf.put_i16_le(s);
                buf.put_u8(object.quality.to_byte());
            }
            _ => return Err(mismatch()),
        },
        TypeId::MeasuredFloat | TypeId::MeasuredFloatWithTime => match object.value {
            Value::Float(x) => {
                buf.put_f32_le(x);
                buf.put_u8(object.quality.to_byte());
            }
            _ => return Err(mismatch()),
        },
        TypeId::IntegratedTotals | TypeId::IntegratedTotalsWithTime => match object.value {
            Value::Counter(c) => {
                buf.put_i32_le(c);
                let mut flags = 0u8;
                if object.quality.overflow {
                    flags |= 0x20;
                }
                if object.quality.substituted {
                    flags |= 0x40;
                }
                if object.quality.invalid {
                    flags |= 0x80;
                }
                buf.put_u8(flags);
            }
            _ => return Err(mismatch()),
        },
        TypeId::SingleCommand => match object.value {
            Value::Bool(b) => buf.put_u8((b as u8) | select_bit(object)),
            _ => return Err(mismatch()),
        },
        TypeId::DoubleCommand => match object.value {
            Value::DoublePoint(dp) => buf.put_u8(dp.to_bits() | select_bit(object)),
            _ => return Err(mismatch()),
        },
        TypeId::RegulatingStepCommand => match object.value {
            Value::Step(s) => {
                let rco = if s < 0 { 1 } else { 2 };
                buf.put_u8(rco | select_bit(object));
            }
            _ => return Err(mismatch()),
        },
        TypeId::SetpointNormalized => match object.value {
            Value::Normalized(n) => {
                buf.put_i16_le(normalized_to_raw(n));
                buf.put_u8(select_bit(object));
            }
            _ => return Err(mismatch()),
        },
        TypeId::SetpointScaled => match object.value {
            Value::Scaled(s) => {
                buf.put_i16_le(s);
                buf.put_u8(select_bit(object));
            }
            _ => return Err(mismatch()),
        },
        TypeId::SetpointFloat => match object.value {
            Value::Float(x) => {
                buf.put_f32_le(x);
                buf.put_u8(select_bit(object));
            }
            _ => return Err(mismatch()),
        },
        TypeId::BitstringCommand => match object.value {
            Value::Bits32(b) => buf.put_u32_le(b),
            _ => return Err(mismatch()),
        },
        TypeId::InterrogationCommand
        | TypeId::CounterInterrogationCommand
        | TypeId::ResetProcessCommand => match object.value {
            Value::Qualifier(q) => buf.put_u8(q),
            _ => return Err(mismatch()),
        },
        TypeId::ReadCommand => match object.value {
            Value::Qualifier(_) => {}
            _ => return Err(mismatch()),
        },
        TypeId::ClockSyncCommand => match object.value {
            Value::Time(t) => buf.put_slice(&t.to_bytes()),
            _ => return Err(mismatch()),
        },
        TypeId::TestCommand | TypeId::DelayAcquisitionCommand => match object.value {
            Value::Bits32(b) => buf.put_u16_le(b as u16),
            _ => return Err(mismatch()),
        },
    }

    if type_id.has_time_tag() {
        match object.time {
            Some(time) => buf.put_slice(&time.to_bytes()),
            None => return Err(mismatch()),
        }
    }

    Ok(())
}

fn select_bit(object: &InformationObject) -> u8 {
    if object.select {
        0x80
    } else {
        0
    }
}
