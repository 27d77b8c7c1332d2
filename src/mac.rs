//! MAC address values: random generation and syntax validation.

use rand::Rng;
use std::fmt;
use std::str::FromStr;

use crate::errors::{ShiftError, ShiftResult};

/// First octets used for generated addresses.
///
/// Each has the locally administered bit (0x02) set and the multicast bit
/// (0x01) clear.
pub const LOCAL_PREFIXES: [u8; 4] = [0x02, 0x06, 0x0A, 0x0E];

/// A 6-octet link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Generate a random locally administered unicast address
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 6];
        bytes[0] = LOCAL_PREFIXES[rng.gen_range(0..LOCAL_PREFIXES.len())];
        rng.fill(&mut bytes[1..]);
        Self(bytes)
    }

    /// Bit 1 of the first octet
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ShiftError;

    fn from_str(s: &str) -> ShiftResult<Self> {
        if !is_valid_mac(s) {
            return Err(ShiftError::Validation(format!(
                "invalid MAC address '{}', expected XX:XX:XX:XX:XX:XX",
                s
            )));
        }

        let mut bytes = [0u8; 6];
        for (slot, group) in bytes.iter_mut().zip(s.split([':', '-'])) {
            *slot = u8::from_str_radix(group, 16)
                .map_err(|e| ShiftError::Validation(format!("bad octet '{}': {}", group, e)))?;
        }
        Ok(Self(bytes))
    }
}

/// Six two-digit hex groups joined by ':' or '-', case-insensitive
pub fn is_valid_mac(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 17 {
        return false;
    }

    bytes.iter().enumerate().all(|(i, &c)| {
        if i % 3 == 2 {
            c == b':' || c == b'-'
        } else {
            c.is_ascii_hexdigit()
        }
    })
}

/// Interface names: 1 to 15 bytes of ASCII alphanumerics or `:-._`
pub fn validate_interface_name(name: &str) -> ShiftResult<()> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(ShiftError::Validation(format!(
            "interface name '{}' must be 1-{} characters",
            name,
            libc::IFNAMSIZ - 1
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '.' | '_')))
    {
        return Err(ShiftError::Validation(format!(
            "interface name '{}' contains invalid character '{}'",
            name, c
        )));
    }
    Ok(())
}
