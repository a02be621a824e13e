//! Reference-counted Bluetooth Low Energy discovery.
//!
//! Any number of callers can ask an [`Adapter`] to discover devices. They all
//! share a single physical scan that is started when the first discovery
//! session is added and stopped when the last one is removed. If the platform
//! reports that the scan failed, every outstanding session is invalidated at
//! once and observers are told via [`Event::ScanFailed`].

use arrayvec::ArrayVec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub mod adapter;
pub use adapter::{Adapter, AdapterConfig, Backend, DiscoveryOptions, DiscoverySession};

pub mod device;
pub use device::Device;

pub mod discovery;
pub use discovery::{DiscoverySessionController, Filter, ScanCapability, ScanHandle, ScanMode,
                    Transition};

pub mod fake;

mod unsupported;

/// A canonical 48-bit Bluetooth device address
///
/// Parsing accepts octets separated by ':' or '-', or no separators at all,
/// in either case. An address always displays as upper-case octets separated
/// by ':' (e.g. "1A:2B:3C:4D:5E:6F").
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 6]);

impl Address {
    pub const fn new(octets: [u8; 6]) -> Self {
        Address(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Returns the canonical form of `s`, or `None` if `s` isn't a valid
    /// address in any of the accepted formats.
    pub fn canonicalize(s: &str) -> Option<String> {
        parse_address_octets(s).map(|octets| Address(octets).to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

// Avoids allocating while parsing since most callers only want to know if
// an address is valid.
fn parse_address_octets(s: &str) -> Option<[u8; 6]> {
    let parts: ArrayVec<&str, 6> = match s.len() {
        17 => {
            let separator = s.as_bytes()[2];
            if separator != b':' && separator != b'-' {
                return None;
            }
            let mut parts = ArrayVec::new();
            for part in s.split(separator as char) {
                if parts.try_push(part).is_err() {
                    return None;
                }
            }
            parts
        }
        12 => {
            if !s.is_ascii() {
                return None;
            }
            (0..6).map(|i| &s[i * 2..i * 2 + 2]).collect()
        }
        _ => return None,
    };
    if parts.len() != 6 {
        return None;
    }

    let mut octets = [0u8; 6];
    for (octet, part) in octets.iter_mut().zip(parts.iter()) {
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    Some(octets)
}

impl FromStr for Address {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_address_octets(s).map(Address)
                               .ok_or_else(|| Error::InvalidAddress(s.to_string()))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[test]
fn address_accepts_all_valid_formats() {
    let valid = ["1A:2B:3C:4D:5E:6F",
                 "1a:2B:3c:4D:5e:6F",
                 "1a:2b:3c:4d:5e:6f",
                 "1A-2B-3C-4D-5E-6F",
                 "1a-2B-3c-4D-5e-6F",
                 "1a-2b-3c-4d-5e-6f",
                 "1A2B3C4D5E6F",
                 "1a2B3c4D5e6F",
                 "1a2b3c4d5e6f"];
    for s in valid.iter() {
        assert_eq!(Address::canonicalize(s).as_deref(), Some("1A:2B:3C:4D:5E:6F"), "input {:?}", s);
    }
    let addr: Address = "a1:b2:c3:d4:e5:f6".parse().unwrap();
    assert_eq!(addr.octets(), [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);
}

#[test]
fn address_rejects_invalid_formats() {
    let invalid = ["",
                   "1A:2B:3C:4D:5E",
                   "1A:2B:3C:4D:5E:6F:70",
                   "1A:2B:3C:4D:5E6F",
                   "1A:2B-3C:4D-5E:6F",
                   "1A:2B-3C:4D-5E:6X",
                   "1:A2:B3:C4:D5:E6F",
                   "1A2B3C4D5E6G",
                   "1A2B3C4D5É"];
    for s in invalid.iter() {
        assert_eq!(Address::canonicalize(s), None, "input {:?}", s);
        assert!(matches!(s.parse::<Address>(), Err(Error::InvalidAddress(_))));
    }
}

#[test]
fn address_serializes_as_canonical_string() {
    let addr: Address = "1a-2b-3c-4d-5e-6f".parse().unwrap();
    let json = serde_json::to_string(&addr).unwrap();
    assert_eq!(json, "\"1A:2B:3C:4D:5E:6F\"");
    let back: Address = serde_json::from_str(&json).unwrap();
    assert_eq!(back, addr);
    assert!(serde_json::from_str::<Address>("\"not an address\"").is_err());
}

/// Why the platform gave up on a running scan
///
/// The numeric codes are the ones reported by Android's `ScanCallback`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScanFailure {
    #[error("A scan with the same settings is already started")]
    AlreadyStarted,

    #[error("The application could not be registered for scanning")]
    ApplicationRegistrationFailed,

    #[error("Internal scan error")]
    InternalError,

    #[error("The requested scan feature is not supported")]
    FeatureUnsupported,

    #[error("Unknown scan failure (code {0})")]
    Unknown(i32),
}

impl ScanFailure {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ScanFailure::AlreadyStarted,
            2 => ScanFailure::ApplicationRegistrationFailed,
            3 => ScanFailure::InternalError,
            4 => ScanFailure::FeatureUnsupported,
            _ => ScanFailure::Unknown(code),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ScanFailure::AlreadyStarted => 1,
            ScanFailure::ApplicationRegistrationFailed => 2,
            ScanFailure::InternalError => 3,
            ScanFailure::FeatureUnsupported => 4,
            ScanFailure::Unknown(code) => *code,
        }
    }
}

#[test]
fn scan_failure_codes() {
    for code in -1..6 {
        assert_eq!(ScanFailure::from_code(code).code(), code);
    }
    assert_eq!(ScanFailure::from_code(4), ScanFailure::FeatureUnsupported);
    assert_eq!(ScanFailure::from_code(42), ScanFailure::Unknown(42));
}

// Events that backends feed into the adapter's backend bus. Backends may
// send these from any thread; they are only applied to adapter state by the
// adapter's own task. Scan reports carry the handle of the scan they came
// from so that late reports for an old scan can be told apart.
#[derive(Clone, Debug)]
pub(crate) enum BackendEvent {
    DeviceDiscovered {
        scan: ScanHandle,
        device: Device,
    },
    ScanFailed {
        scan: ScanHandle,
        error_code: i32,
    },
    Flush(u32),
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    /// The adapter started or stopped discovering.
    ///
    /// Sent whenever the number of discovery sessions moves between zero and
    /// non-zero, including when a scan failure drops all sessions.
    DiscoveringChanged {
        discovering: bool,
    },

    /// The platform reported that the running scan failed.
    ///
    /// All discovery sessions have been released by the time this is
    /// delivered and any `DiscoverySession` handles are no longer active.
    /// Applications that still want to discover devices need to start new
    /// sessions.
    ScanFailed {
        failure: ScanFailure,
    },

    DeviceAdded {
        device: Device,
    },

    DeviceChanged {
        device: Device,
    },

    Flush(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The Bluetooth adapter is not present or not powered")]
    NotPowered,

    #[error("The platform rejected the request to start scanning: {0}")]
    ScanStartRejected(String),

    #[error("Discovery session released without a matching request")]
    UnbalancedRelease,

    #[error("No scan was running when the last discovery session was released")]
    ScanNotRunning,

    #[error("This discovery session is no longer active")]
    SessionInactive,

    #[error("The adapter has been shut down")]
    AdapterShutdown,

    #[error("Invalid Bluetooth address {0:?}")]
    InvalidAddress(String),

    #[error("The system doesn't support this request / operation")]
    Unsupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
