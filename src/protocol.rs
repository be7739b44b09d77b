//! Modbus-TCP framing and SunSpec signature matching used by the scanner.
//!
//! This module is free of I/O. It defines the strongly-typed device identifiers,
//! the transaction counter, the fixed read-holding-registers request frame and
//! the byte-exact classifier that decides whether a reply came from an inverter.
//!
//! ```
//! use sunspec_scan_lib::protocol::{classify, DeviceId, DeviceKind, ExpectedSignature, RequestFrame};
//!
//! let request = RequestFrame::new(DeviceId::try_from(5u8).unwrap(), 1);
//! let reply = ExpectedSignature::for_request(request.as_bytes());
//! assert_eq!(classify(request.as_bytes(), reply.as_bytes()), DeviceKind::Inverter);
//! ```

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Errors raised while validating device identifiers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The numeric value is outside of the Modbus unit id range 1 to 247.
    #[error("'{0}' must be a device ID between 1 and 247")]
    DeviceIdOutOfRange(u16),

    /// The value is not a number.
    #[error("'{0}' is not a valid device ID")]
    InvalidDeviceId(String),

    /// A part of a device id list contains more than one `-`.
    #[error("'{0}' looks like a range but has multiple '-'s")]
    InvalidRange(String),

    /// A range whose end is lower than its start.
    #[error("'{start}' must be less than or equal to {end}")]
    ReversedRange { start: DeviceId, end: DeviceId },

    /// The device id list did not contain a single id.
    #[error("no device IDs given")]
    EmptyDeviceIds,
}

/// A Modbus unit identifier, always within `1..=247`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u16", into = "u8"))]
pub struct DeviceId(u8);

impl DeviceId {
    /// The lowest assignable unit id.
    pub const MIN: u8 = 1;
    /// The highest assignable unit id.
    pub const MAX: u8 = 247;
}

impl Deref for DeviceId {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u16> for DeviceId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if (Self::MIN as u16..=Self::MAX as u16).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(Error::DeviceIdOutOfRange(value))
        }
    }
}

impl TryFrom<u8> for DeviceId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from(value as u16)
    }
}

impl From<DeviceId> for u8 {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    /// Parses a decimal or `0x` prefixed hexadecimal device id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => s.parse::<u16>(),
        }
        .map_err(|_| Error::InvalidDeviceId(s.to_string()))?;
        Self::try_from(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sorted, deduplicated and non-empty set of device ids to scan.
///
/// Parsed from a comma separated list of ids and inclusive ranges, e.g.
/// `"1,2,4-7,10"`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String"))]
pub struct DeviceIds(Vec<DeviceId>);

impl DeviceIds {
    /// Every assignable unit id, `1-247`.
    pub fn all() -> Self {
        Self((DeviceId::MIN..=DeviceId::MAX).map(DeviceId).collect())
    }

    /// Builds the set from arbitrary ids, sorting and removing duplicates.
    pub fn from_ids(ids: impl IntoIterator<Item = DeviceId>) -> Result<Self, Error> {
        let mut ids: Vec<DeviceId> = ids.into_iter().collect();
        if ids.is_empty() {
            return Err(Error::EmptyDeviceIds);
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(Self(ids))
    }

    pub fn as_slice(&self) -> &[DeviceId] {
        &self.0
    }
}

impl Default for DeviceIds {
    fn default() -> Self {
        Self::all()
    }
}

impl Deref for DeviceIds {
    type Target = [DeviceId];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for DeviceIds {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut ids = Vec::new();
        for part in value.split(',').map(str::trim) {
            let bounds: Vec<&str> = part.split('-').map(str::trim).collect();
            match bounds.as_slice() {
                [single] => ids.push(single.parse()?),
                [start, end] => {
                    let start: DeviceId = start.parse()?;
                    let end: DeviceId = end.parse()?;
                    if end < start {
                        return Err(Error::ReversedRange { start, end });
                    }
                    ids.extend((*start..=*end).map(DeviceId));
                }
                _ => return Err(Error::InvalidRange(part.to_string())),
            }
        }
        Self::from_ids(ids)
    }
}

impl TryFrom<String> for DeviceIds {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for DeviceIds {
    /// Writes the set back in range syntax, collapsing consecutive ids.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.0.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(next) = iter.next_if(|next| next.0 == end.0 + 1) {
                end = next;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

/// Source of Modbus-TCP transaction ids for one scan session.
///
/// Starts at 0; every call to [`TransactionCounter::next`] advances the
/// counter first, so the first frame of a session carries id 1. The value
/// wraps modulo 65536.
#[derive(Debug, Default, Clone)]
pub struct TransactionCounter(u16);

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id handed out by the most recent call to `next`.
    pub fn current(&self) -> u16 {
        self.0
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u16 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }
}

/// Function code "read holding registers".
pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Register address of the SunSpec common model header.
pub const SUNSPEC_BASE_ADDRESS: u16 = 0x9C40;
/// Registers requested per probe: the `SunS` marker, the model header and
/// the start of the manufacturer string. Asking for the whole common model
/// sometimes produces split replies.
pub const PROBE_REGISTER_COUNT: u16 = 9;
/// Byte count of the MBAP length field for a read request (unit id + PDU).
const REQUEST_LENGTH: u16 = 6;

/// Offsets inside an MBAP header.
pub const TRANSACTION_HI: usize = 0;
pub const TRANSACTION_LO: usize = 1;
pub const UNIT_ID: usize = 6;
/// Size of the MBAP header including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// A 12 byte Modbus-TCP "read holding registers" request for the SunSpec
/// identification block of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame([u8; RequestFrame::LEN]);

impl RequestFrame {
    pub const LEN: usize = 12;

    pub fn new(device_id: DeviceId, transaction_id: u16) -> Self {
        let [tid_hi, tid_lo] = transaction_id.to_be_bytes();
        let [len_hi, len_lo] = REQUEST_LENGTH.to_be_bytes();
        let [addr_hi, addr_lo] = SUNSPEC_BASE_ADDRESS.to_be_bytes();
        let [qty_hi, qty_lo] = PROBE_REGISTER_COUNT.to_be_bytes();
        Self([
            tid_hi,
            tid_lo,
            0x00,
            0x00,
            len_hi,
            len_lo,
            *device_id,
            FUNCTION_READ_HOLDING_REGISTERS,
            addr_hi,
            addr_lo,
            qty_hi,
            qty_lo,
        ])
    }

    /// Builds the frame for `device_id` with the next id from `counter`.
    pub fn next(device_id: DeviceId, counter: &mut TransactionCounter) -> Self {
        Self::new(device_id, counter.next())
    }

    pub fn transaction_id(&self) -> u16 {
        u16::from_be_bytes([self.0[TRANSACTION_HI], self.0[TRANSACTION_LO]])
    }

    pub fn device_id(&self) -> u8 {
        self.0[UNIT_ID]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for RequestFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The reply a SunSpec inverter gives to [`RequestFrame`]: MBAP header with
/// length 21, function 3, 18 data bytes holding `SunS`, common model id 1,
/// model length 65 and the first ten characters of the manufacturer name.
const SIGNATURE_TEMPLATE: [u8; ExpectedSignature::LEN] = [
    0x00, 0x00, // transaction id, substituted
    0x00, 0x00, // protocol id
    0x00, 0x15, // length
    0x00, // unit id, substituted
    FUNCTION_READ_HOLDING_REGISTERS,
    0x12, // byte count
    b'S', b'u', b'n', b'S', // SunSpec marker
    0x00, 0x01, // common model id
    0x00, 0x41, // common model length
    b'S', b'o', b'l', b'a', b'r', b'E', b'd', b'g', b'e', b' ',
];

/// The signature expected in reply to one specific request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedSignature([u8; ExpectedSignature::LEN]);

impl ExpectedSignature {
    pub const LEN: usize = 27;

    /// Copies the template and echoes the transaction id and unit id of
    /// `request`. The request must hold at least a full MBAP header.
    pub fn for_request(request: &[u8]) -> Self {
        let mut bytes = SIGNATURE_TEMPLATE;
        bytes[TRANSACTION_HI] = request[TRANSACTION_HI];
        bytes[TRANSACTION_LO] = request[TRANSACTION_LO];
        bytes[UNIT_ID] = request[UNIT_ID];
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// What a reply says about the device behind a unit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// Reply does not match the signature, or is too short to tell.
    Unknown,
    /// Valid header echo and full signature, followed by further bytes.
    NonInverter,
    /// Reply is the signature, or a prefix of it.
    Inverter,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Unknown => write!(f, "Unknown device"),
            DeviceKind::NonInverter => write!(f, "Non-inverter device"),
            DeviceKind::Inverter => write!(f, "INVERTER"),
        }
    }
}

/// Classifies `response` as the reply to `request`.
///
/// Prefix match against [`ExpectedSignature`]: a reply that is the signature
/// or a truncated copy of it is an inverter, one that runs past the end of
/// the signature is some other Modbus device, anything that differs is
/// unknown.
///
/// A truncated reply of at least 7 matching bytes is reported as an
/// inverter even though only part of the signature was seen.
pub fn classify(request: &[u8], response: &[u8]) -> DeviceKind {
    if response.len() < MBAP_HEADER_LEN || request.len() < MBAP_HEADER_LEN {
        return DeviceKind::Unknown;
    }
    let expected = ExpectedSignature::for_request(request);
    let expected = expected.as_bytes();
    for (index, byte) in response.iter().enumerate() {
        if index >= expected.len() {
            return if index >= MBAP_HEADER_LEN {
                DeviceKind::NonInverter
            } else {
                DeviceKind::Unknown
            };
        }
        if *byte != expected[index] {
            return DeviceKind::Unknown;
        }
    }
    DeviceKind::Inverter
}
