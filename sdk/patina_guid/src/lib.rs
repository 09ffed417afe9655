//! GUID codec for firmware image structures.
//!
//! Firmware regions, volumes, files and sections identify themselves with 16-byte GUIDs stored in the
//! mixed-endian layout defined by the UEFI specification: the first three fields are little-endian
//! integers, the trailing eight bytes are stored in string order. This crate converts between that byte
//! layout and the canonical string form, and provides the one-key JSON object form used by extraction
//! manifests.
//!
//! ## Type Overview
//!
//! - [`Guid`] - A binary-compatible GUID value wrapping `r_efi::efi::Guid`
//! - [`GuidError`] - Error type for string and JSON parsing
//!
//! ## String forms
//!
//! [`Guid::parse`] accepts the dashed form `01234567-89AB-CDEF-0123-456789ABCDEF` and the dashless form
//! `0123456789ABCDEF0123456789ABCDEF`, case-insensitively. [`Display`](core::fmt::Display) always
//! produces the dashed uppercase form.
//!
//! ## Examples
//!
//! ```rust
//! use patina_guid::{Guid, GuidError};
//!
//! let guid = Guid::parse("01234567-89ab-cdef-0123-456789abcdef")?;
//! assert_eq!(guid.as_bytes()[..4], [0x67, 0x45, 0x23, 0x01]);
//! assert_eq!(guid.to_string(), "01234567-89AB-CDEF-0123-456789ABCDEF");
//! assert_eq!(guid.to_json(), r#"{"UUID" : "01234567-89AB-CDEF-0123-456789ABCDEF"}"#);
//! # Ok::<(), GuidError>(())
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::{fmt, str::FromStr};

use r_efi::efi;
use serde::{
    de::{self, Deserializer},
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};

/// Canonical example quoted by every parsing error message.
pub const EXAMPLE: &str = "01234567-89AB-CDEF-0123-456789ABCDEF";

/// Key of the single entry in the JSON object form.
pub const JSON_KEY: &str = "UUID";

/// Length of the dashed string form.
const DASHED_LEN: usize = 36;

/// Number of hexadecimal digits in a GUID, which is also the length of the dashless form.
const HEX_DIGITS: usize = 32;

/// Dash positions in the dashed string form.
const DASH_POSITIONS: [usize; 4] = [8, 13, 18, 23];

/// Error type for GUID parsing operations.
///
/// The message text of `Length` and `Hex` is matched by existing manifest consumers and must not change.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GuidError {
    /// The string is neither 36 (dashed) nor 32 (dashless) characters long. Carries the offending input.
    Length(String),
    /// The string contains a character that is not a hex digit where one is expected. Carries the
    /// offending input.
    Hex(String),
    /// The JSON document could not be decoded at all.
    Json(String),
}

impl fmt::Display for GuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuidError::Length(actual) => {
                write!(f, "uuid string has incorrect length, need string of the format \n{EXAMPLE}\n, got \n{actual}")
            }
            GuidError::Hex(actual) => {
                write!(f, "uuid string not correct, need string of the format \n{EXAMPLE}\n, got \n{actual}")
            }
            GuidError::Json(reason) => write!(f, "uuid json not correct: {reason}"),
        }
    }
}

impl std::error::Error for GuidError {}

/// A GUID in its on-disk byte layout.
///
/// This is a transparent wrapper around `r_efi::efi::Guid`, so it can be copied straight out of firmware
/// headers. Equality and ordering are byte-wise.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Guid(efi::Guid);

impl Guid {
    /// A constant representing the zero GUID (00000000-0000-0000-0000-000000000000).
    pub const ZERO: Guid = Self::from_fields(0, 0, 0, 0, 0, &[0; 6]);

    /// Create a GUID from its individual fields, in the order they appear in the string form.
    pub const fn from_fields(
        time_low: u32,
        time_mid: u16,
        time_hi_and_version: u16,
        clk_seq_hi_res: u8,
        clk_seq_low: u8,
        node: &[u8; 6],
    ) -> Self {
        Self(efi::Guid::from_fields(time_low, time_mid, time_hi_and_version, clk_seq_hi_res, clk_seq_low, node))
    }

    /// Create a GUID from 16 bytes in the on-disk (mixed-endian) layout.
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self(efi::Guid::from_bytes(bytes))
    }

    /// The 16 bytes of the GUID in the on-disk layout.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The GUID fields as `(time_low, time_mid, time_hi_and_version, clk_seq_hi_res, clk_seq_low, node)`.
    pub fn as_fields(&self) -> (u32, u16, u16, u8, u8, &[u8; 6]) {
        self.0.as_fields()
    }

    /// The underlying `r_efi::efi::Guid` value.
    pub const fn to_efi_guid(&self) -> efi::Guid {
        self.0
    }

    /// Parse the dashed or dashless string form.
    ///
    /// Characters are checked before length, so `"GHGH"` is a [`GuidError::Hex`] while `"01234567"` is a
    /// [`GuidError::Length`].
    pub fn parse(s: &str) -> Result<Self, GuidError> {
        if !s.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(GuidError::Hex(s.to_string()));
        }

        let dashed = match s.len() {
            DASHED_LEN => true,
            HEX_DIGITS => false,
            _ => return Err(GuidError::Length(s.to_string())),
        };

        // Every character is ASCII at this point, so byte positions are character positions.
        let mut nibbles = [0u8; HEX_DIGITS];
        let mut count = 0;
        for (position, c) in s.bytes().enumerate() {
            let dash_expected = dashed && DASH_POSITIONS.contains(&position);
            if (c == b'-') != dash_expected {
                return Err(GuidError::Hex(s.to_string()));
            }
            if c != b'-' {
                nibbles[count] = hex_value(c);
                count += 1;
            }
        }
        debug_assert_eq!(count, HEX_DIGITS);

        let field = |start: usize, end: usize| nibbles[start..end].iter().fold(0u32, |acc, &n| (acc << 4) | n as u32);

        let mut node = [0u8; 6];
        for (index, byte) in node.iter_mut().enumerate() {
            *byte = field(20 + index * 2, 22 + index * 2) as u8;
        }

        Ok(Self::from_fields(
            field(0, 8),
            field(8, 12) as u16,
            field(12, 16) as u16,
            field(16, 18) as u8,
            field(18, 20) as u8,
            &node,
        ))
    }

    /// The JSON object form, `{"UUID" : "<canonical string>"}`.
    pub fn to_json(&self) -> String {
        format!("{{\"{JSON_KEY}\" : \"{self}\"}}")
    }

    /// Decode the JSON object form.
    ///
    /// A missing `UUID` key reports [`GuidError::Length`] with an empty input, which is what manifest
    /// consumers have always received for that case.
    pub fn from_json(json: &str) -> Result<Self, GuidError> {
        let object: UuidObject = serde_json::from_str(json).map_err(|err| GuidError::Json(err.to_string()))?;
        object.try_into()
    }
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'A'..=b'F' => c - b'A' + 10,
        b'a'..=b'f' => c - b'a' + 10,
        _ => 0, // Should never happen with validated input
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (time_low, time_mid, time_hi_and_version, clk_seq_hi_res, clk_seq_low, node) = self.as_fields();
        write!(f, "{time_low:08X}-{time_mid:04X}-{time_hi_and_version:04X}-{clk_seq_hi_res:02X}{clk_seq_low:02X}-")?;
        for byte in node {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Use the Display format for Debug as well, since this is more useful for GUIDs
        write!(f, "{self}")
    }
}

impl PartialOrd for Guid {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Guid {
    /// Byte order. Only meaningful for sorted collections.
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl From<efi::Guid> for Guid {
    fn from(guid: efi::Guid) -> Self {
        Self(guid)
    }
}

impl From<Guid> for efi::Guid {
    fn from(guid: Guid) -> Self {
        guid.0
    }
}

impl FromStr for Guid {
    type Err = GuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Guid {
    type Error = GuidError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

/// Wire shape of the JSON object form.
#[derive(Deserialize)]
struct UuidObject {
    #[serde(rename = "UUID", default)]
    uuid: Option<String>,
}

impl TryFrom<UuidObject> for Guid {
    type Error = GuidError;

    fn try_from(object: UuidObject) -> Result<Self, Self::Error> {
        match object.uuid {
            Some(s) => Guid::parse(&s),
            None => Err(GuidError::Length(String::new())),
        }
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(JSON_KEY, &self.to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        UuidObject::deserialize(deserializer)?.try_into().map_err(de::Error::custom)
    }
}
