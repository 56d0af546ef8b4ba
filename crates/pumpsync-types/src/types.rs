//! Identity records for the bridge device and the pumps paired with it.

use core::fmt;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Session link key negotiated between the bridge and a pump.
///
/// Persisted as a lowercase hex string on the bridge record so a later
/// session can skip the key exchange.
///
/// # Examples
///
/// ```
/// use pumpsync_types::LinkKey;
///
/// let key = LinkKey::from_hex("00a1FF").unwrap();
/// assert_eq!(key.as_bytes(), &[0x00, 0xA1, 0xFF]);
/// assert_eq!(key.to_hex(), "00a1ff");
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct LinkKey(Bytes);

impl LinkKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Parse a key from its hex form (case-insensitive).
    pub fn from_hex(hex: &str) -> ParseResult<Self> {
        if hex.is_empty() {
            return Err(ParseError::EmptyKey);
        }
        if hex.len() % 2 != 0 {
            return Err(ParseError::OddHexLength(hex.len()));
        }

        let mut out = Vec::with_capacity(hex.len() / 2);
        let chars: Vec<char> = hex.chars().collect();
        for (i, pair) in chars.chunks(2).enumerate() {
            let hi = hex_value(pair[0], i * 2)?;
            let lo = hex_value(pair[1], i * 2 + 1)?;
            out.push((hi << 4) | lo);
        }

        Ok(Self(Bytes::from(out)))
    }

    /// Lowercase hex form of the key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn hex_value(digit: char, position: usize) -> ParseResult<u8> {
    digit
        .to_digit(16)
        .map(|v| v as u8)
        .ok_or(ParseError::InvalidHexDigit { digit, position })
}

// Keys never show up in logs in clear text.
impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkKey(<{} bytes>)", self.0.len())
    }
}

impl TryFrom<String> for LinkKey {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<LinkKey> for String {
    fn from(key: LinkKey) -> Self {
        key.to_hex()
    }
}

/// The USB bridge ("stick") that relays radio traffic to the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BridgeInfo {
    /// Serial number reported by the bridge.
    pub serial: String,
    /// Link key from the last successful session, if any.
    pub link_key: Option<LinkKey>,
}

impl BridgeInfo {
    /// Create a bridge record with no cached key.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            link_key: None,
        }
    }

    /// Device name used for snapshots read through this bridge.
    #[must_use]
    pub fn device_name(&self) -> String {
        format!("medtronic-600://{}", self.serial)
    }
}

/// A physical pump, identified by its radio MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PumpInfo {
    /// Radio MAC address of the pump.
    pub mac: u64,
    /// Device name of the bridge last used to read this pump.
    pub device_name: Option<String>,
    /// Radio channel of the last successful connection (0 = unknown).
    pub last_radio_channel: u8,
    /// When the pump was last queried.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub last_query_at: Option<OffsetDateTime>,
}

impl PumpInfo {
    /// Create a pump record that has never been queried.
    pub fn new(mac: u64) -> Self {
        Self {
            mac,
            device_name: None,
            last_radio_channel: 0,
            last_query_at: None,
        }
    }

    /// The low 24 bits of the MAC, as printed on the pump.
    #[must_use]
    pub fn short_mac(&self) -> u32 {
        (self.mac & 0xFF_FFFF) as u32
    }
}

/// Radio channel negotiation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelStatus {
    /// Negotiated channel, 0 when the pump did not answer.
    pub channel: u8,
    /// Received signal strength as a percentage (0-100).
    pub rssi_percent: u8,
}

impl ChannelStatus {
    /// Whether a channel was found.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel != 0
    }
}
