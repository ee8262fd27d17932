//! Beacon codec (C5): wire-format build/parse and truncated
//! AES-128-CMAC authentication.

pub mod cmac;

use std::convert::TryFrom;

use num_enum::TryFromPrimitive;
use thiserror::Error;

pub use self::cmac::{KEY_LEN, MAC_LEN};

pub const MAX_ADDRS: usize = 8;
pub const TIME_RANGE_MAX_MS: u64 = 4_102_444_800_000;
pub const FLAG_NOAUTH: u8 = 0x01;

const FIXED_HEADER_LEN: usize = 16; // version .. master_unix_ms, inclusive

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrMode {
    None = 0,
    All = 1,
    List = 2,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum BeaconParseError {
    #[error("packet length does not match the declared fields")]
    Len,
    #[error("unsupported version")]
    Version,
    #[error("unrecognized address mode")]
    AddrMode,
    #[error("address count inconsistent with mode or exceeds MAX_ADDRS")]
    AddrCount,
    #[error("reserved field must be zero")]
    Reserved,
    #[error("master_unix_ms is out of range")]
    TimeRange,
    #[error("MAC required but absent")]
    Mac,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum BeaconBuildError {
    #[error("no key provisioned for an authenticated build")]
    MissingKey,
    #[error("address list exceeds MAX_ADDRS")]
    TooManyAddrs,
}

/// An unparsed-from-wire beacon payload ready for [`BeaconFields::build`].
#[derive(Debug, Clone)]
pub struct BeaconFields {
    pub addr_mode: AddrMode,
    pub addr_list: Vec<u32>,
    pub window_len: u8,
    pub mode: u8,
    pub flags: u8,
    pub master_unix_ms: u64,
}

impl BeaconFields {
    const VERSION: u8 = 1;

    /// Builds the wire payload. Authenticated unless `flags` has
    /// `FLAG_NOAUTH` set, in which case `key` is never consulted — an
    /// unkeyed NOAUTH build is the parser's own contract (§4.4).
    pub fn build(&self, key: Option<&[u8; KEY_LEN]>) -> Result<Vec<u8>, BeaconBuildError> {
        if self.addr_list.len() > MAX_ADDRS {
            return Err(BeaconBuildError::TooManyAddrs);
        }

        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + self.addr_list.len() * 4 + MAC_LEN);
        buf.push(Self::VERSION);
        buf.push(self.addr_mode as u8);
        buf.push(self.addr_list.len() as u8);
        buf.push(self.window_len);
        buf.push(self.mode);
        buf.push(self.flags);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.master_unix_ms.to_le_bytes());
        for addr in &self.addr_list {
            buf.extend_from_slice(&addr.to_le_bytes());
        }

        if self.flags & FLAG_NOAUTH != 0 {
            return Ok(buf);
        }

        let key = key.ok_or(BeaconBuildError::MissingKey)?;
        buf.extend_from_slice(&cmac::compute(key, &buf));
        Ok(buf)
    }
}

/// A successfully parsed beacon.
#[derive(Debug, Clone)]
pub struct ParsedBeacon {
    pub addr_mode: AddrMode,
    pub addr_list: Vec<u32>,
    pub window_len: u8,
    pub mode: u8,
    pub flags: u8,
    pub master_unix_ms: u64,
    /// `Some(true/false)` if a MAC was present and a key was supplied to
    /// check it against; `None` if no MAC was present (NOAUTH) or no key
    /// was supplied to verify an authenticated packet.
    pub mac_verified: Option<bool>,
}

/// Parses a beacon payload (post company-id), validating every field in
/// the order `LEN, VERSION, ADDR_MODE, ADDR_COUNT, RESERVED, TIME_RANGE,
/// MAC` (§4.4).
pub fn parse(bytes: &[u8], key: Option<&[u8; KEY_LEN]>) -> Result<ParsedBeacon, BeaconParseError> {
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(BeaconParseError::Len);
    }

    if bytes[0] != BeaconFields::VERSION {
        return Err(BeaconParseError::Version);
    }

    let addr_mode =
        AddrMode::try_from(bytes[1]).map_err(|_| BeaconParseError::AddrMode)?;

    let addr_count = bytes[2] as usize;
    if addr_count > MAX_ADDRS {
        return Err(BeaconParseError::AddrCount);
    }
    match addr_mode {
        AddrMode::List if addr_count == 0 => return Err(BeaconParseError::AddrCount),
        AddrMode::None | AddrMode::All if addr_count != 0 => {
            return Err(BeaconParseError::AddrCount)
        }
        _ => {}
    }

    let window_len = bytes[3];
    let mode = bytes[4];
    let flags = bytes[5];

    let reserved = u16::from_le_bytes([bytes[6], bytes[7]]);
    if reserved != 0 {
        return Err(BeaconParseError::Reserved);
    }

    let master_unix_ms = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    if master_unix_ms > TIME_RANGE_MAX_MS {
        return Err(BeaconParseError::TimeRange);
    }

    let noauth = flags & FLAG_NOAUTH != 0;
    let header_and_addrs = FIXED_HEADER_LEN + addr_count * 4;

    let mac_present = match bytes.len() {
        len if len == header_and_addrs => false,
        len if len == header_and_addrs + MAC_LEN => true,
        _ => return Err(BeaconParseError::Len),
    };

    if !mac_present && !noauth {
        return Err(BeaconParseError::Mac);
    }

    let mut addr_list = Vec::with_capacity(addr_count);
    for i in 0..addr_count {
        let off = FIXED_HEADER_LEN + i * 4;
        addr_list.push(u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()));
    }

    let mac_verified = if mac_present {
        let tag = &bytes[header_and_addrs..header_and_addrs + MAC_LEN];
        key.map(|key| cmac::verify(key, &bytes[0..header_and_addrs], tag))
    } else {
        None
    };

    Ok(ParsedBeacon {
        addr_mode,
        addr_list,
        window_len,
        mode,
        flags,
        master_unix_ms,
        mac_verified,
    })
}
