//! Tag address grammar: `CA.IOA.TypeID[.ElementIndex]`
//!
//! A parsed address keys one tag: common address times information object
//! address times type identification, with an optional element index for
//! sequence-format ASDUs. Ranges are enforced here so the driver core only
//! ever sees valid triples.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::asdu::{TypeId, COMMON_ADDR_MAX, IOA_MAX};
use crate::error::{Iec104Error, Result};

/// Parsed tag address triple plus optional element index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagAddress {
    /// Common address (1..=65534)
    pub common_addr: u16,
    /// Information object address (1..=16777215)
    pub ioa: u32,
    /// Type identification of the tag's values
    pub type_id: TypeId,
    /// Element index (0..=255) into a sequence-format ASDU; selects the
    /// object addressed `ioa + element`
    pub element: Option<u8>,
}

impl TagAddress {
    pub fn new(common_addr: u16, ioa: u32, type_id: TypeId) -> Self {
        Self {
            common_addr,
            ioa,
            type_id,
            element: None,
        }
    }

    /// Parse from the `CA.IOA.TypeID[.ElementIndex]` form, e.g. `"1.100.13"`
    /// or `"1.100.9.2"`.
    pub fn parse(input: &str) -> Result<Self> {
        let bad = |detail: &str| {
            Iec104Error::InvalidAddress(format!("{input:?}: {detail}"))
        };

        let parts: Vec<&str> = input.trim().split('.').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(bad("expected CA.IOA.TypeID[.ElementIndex]"));
        }

        let common_addr: u16 = parts[0]
            .parse()
            .map_err(|_| bad("common address is not a number"))?;
        if common_addr == 0 || common_addr > COMMON_ADDR_MAX {
            return Err(bad("common address outside 1..=65534"));
        }

        let ioa: u32 = parts[1]
            .parse()
            .map_err(|_| bad("information object address is not a number"))?;
        if ioa == 0 || ioa > IOA_MAX {
            return Err(bad("information object address outside 1..=16777215"));
        }

        let type_byte: u8 = parts[2]
            .parse()
            .map_err(|_| bad("type identification is not a number"))?;
        let type_id = TypeId::from_byte(type_byte)
            .ok_or(Iec104Error::UnsupportedType(type_byte))?;

        let element = match parts.get(3) {
            Some(raw) => Some(raw.parse::<u8>().map_err(|_| bad("element index outside 0..=255"))?),
            None => None,
        };

        Ok(Self {
            common_addr,
            ioa,
            type_id,
            element,
        })
    }

    /// The IOA actually read from the cache: base address plus element
    /// index for sequence tags.
    pub fn effective_ioa(&self) -> u32 {
        self.ioa + self.element.unwrap_or(0) as u32
    }

    /// Commands live at TypeID 45..=51; everything below is monitoring and
    /// therefore read-only.
    pub fn is_writable(&self) -> bool {
        self.type_id.is_command()
    }
}

impl fmt::Display for TagAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element {
            Some(element) => write!(
                f,
                "{}.{}.{}.{}",
                self.common_addr,
                self.ioa,
                self.type_id.to_byte(),
                element
            ),
            None => write!(
                f,
                "{}.{}.{}",
                self.common_addr,
                self.ioa,
                self.type_id.to_byte()
            ),
        }
    }
}

impl FromStr for TagAddress {
    type Err = Iec104Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
