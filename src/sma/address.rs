use crate::error::{Error, Result};

use serde::{Serialize, Serializer};

pub const ADDRESS_LEN: usize = 6;
const WILDCARD: u8 = 0xFF;

// DeviceAddress {{{
/// A Bluetooth device address, stored in wire (least significant byte first) order.
///
/// Equality is wildcard aware: a `0xFF` byte on either side matches anything, so
/// `BROADCAST` equals every address. Because of that this type is deliberately
/// neither `Eq` nor `Hash`; use [`DeviceAddress::as_bytes`] for exact keys.
#[derive(Clone, Copy, Default)]
pub struct DeviceAddress([u8; ADDRESS_LEN]);

impl DeviceAddress {
    pub const BROADCAST: Self = Self([WILDCARD; ADDRESS_LEN]);

    // 01:00:00:00:00:00 as displayed; used by the net ID query
    pub const NET_ID_QUERY: Self = Self([0x01, 0, 0, 0, 0, 0]);

    pub const fn from_wire(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let wire: [u8; ADDRESS_LEN] = bytes
            .get(..ADDRESS_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::AddressFormat(crate::utils::Utils::hex(bytes)))?;
        Ok(Self(wire))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [WILDCARD; ADDRESS_LEN]
    }

    /// `btspp://` connector string used to open an RFCOMM channel, MSB first.
    pub fn connector_string(&self, port: u8) -> String {
        let hex: String = self.0.iter().rev().map(|b| format!("{:02X}", b)).collect();
        format!("btspp://{}:{}", hex, port)
    }
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a == b || *a == WILDCARD || *b == WILDCARD)
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != ' ').collect();
        if digits.len() != ADDRESS_LEN * 2 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::AddressFormat(s.to_string()));
        }

        let mut wire = [0u8; ADDRESS_LEN];
        for (i, byte) in wire.iter_mut().rev().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::AddressFormat(s.to_string()))?;
        }

        Ok(Self(wire))
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().rev().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl std::fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
} // }}}

// SmaSerial {{{
/// Device identity: system (SUSy) id plus serial number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SmaSerial {
    pub susy_id: u16,
    pub serial: u32,
}

impl SmaSerial {
    pub const ANY: Self = Self {
        susy_id: 0xFFFF,
        serial: 0xFFFF_FFFF,
    };

    pub const fn new(susy_id: u16, serial: u32) -> Self {
        Self { susy_id, serial }
    }
}

impl std::fmt::Display for SmaSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.susy_id, self.serial)
    }
}

impl Serialize for SmaSerial {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
} // }}}
