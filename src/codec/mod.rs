//! Pure encode/decode layer: APCI frames, ASDUs, information elements and
//! CP56Time2a time tags. No I/O and no hidden state lives here.

pub mod asdu;
pub mod frame;
pub mod time;
pub mod value;

pub use asdu::{
    Asdu, Cause, CauseOfTransmission, InformationObject, TypeId, COMMON_ADDR_MAX, IOA_MAX,
    MAX_OBJECTS, TEST_PATTERN,
};
pub use frame::{Apdu, ApciType, UFunction, APDU_LEN_MAX, APDU_LEN_MIN, SEQ_MODULO, START_BYTE};
pub use time::{Cp56Time2a, CP56_SIZE};
pub use value::{DoublePointState, QualityDescriptor, Value};
