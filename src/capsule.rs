// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Capsule framing on upgraded request streams (RFC 9297 §3).
//!
//! A capsule is a length-delimited frame: `<type: varint><length: varint>
//! <value: length bytes>`. The CONNECT-UDP core never acts on capsules; it
//! drains and discards them with [`skip_capsules`], treating the drain loop's
//! clean EOF as the signal that the peer finished the stream.
//!
//! The typed capsules in this module (ADDRESS_ASSIGN, ADDRESS_REQUEST,
//! ROUTE_ADVERTISEMENT) belong to CONNECT-IP. They are parsed and validated
//! here for the sibling module; no flow forwarding is attached to them.

use std::io;
use std::net::IpAddr;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::coding::{self, get_varint, put_varint};
use crate::h3::RequestStream;

/// ADDRESS_ASSIGN capsule type (CONNECT-IP)
pub const CAPSULE_ADDRESS_ASSIGN: u64 = 1;
/// ADDRESS_REQUEST capsule type (CONNECT-IP)
pub const CAPSULE_ADDRESS_REQUEST: u64 = 2;
/// ROUTE_ADVERTISEMENT capsule type (CONNECT-IP)
pub const CAPSULE_ROUTE_ADVERTISEMENT: u64 = 3;

/// Errors raised while parsing capsules
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// The stream ended in the middle of a frame
    #[error("capsule stream ended mid-frame")]
    Truncated,

    /// A bounded capsule payload was shorter than its contents require
    #[error(transparent)]
    UnexpectedEnd(#[from] coding::UnexpectedEnd),

    /// IP version byte was neither 4 nor 6
    #[error("invalid IP version: {0}")]
    InvalidIpVersion(u8),

    /// Prefix length exceeds the address width
    #[error("prefix length {prefix_len} exceeds IP address length ({bits})")]
    PrefixTooLong {
        /// The declared prefix length
        prefix_len: u8,
        /// The address width in bits
        bits: u8,
    },

    /// Address bits below the prefix are not all zero
    #[error("lower bits not covered by prefix length are not all zero")]
    PrefixBitsSet,

    /// Range start compares greater than its end
    #[error("start IP is greater than end IP")]
    InvalidRange,

    /// Reading from the stream failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read a single byte; `None` on clean EOF.
async fn read_byte<S: RequestStream + ?Sized>(stream: &S) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    match stream.read(&mut b).await? {
        0 => Ok(None),
        _ => Ok(Some(b[0])),
    }
}

/// Read the remainder of a varint whose first byte is already known.
async fn read_varint_tail<S: RequestStream + ?Sized>(
    stream: &S,
    first: u8,
) -> Result<u64, CapsuleError> {
    let len = 1usize << (first >> 6);
    let mut bytes = [0u8; 8];
    bytes[0] = first & 0b0011_1111;
    let mut filled = 1;
    while filled < len {
        let n = stream.read(&mut bytes[filled..len]).await?;
        if n == 0 {
            return Err(CapsuleError::Truncated);
        }
        filled += n;
    }
    let mut x = 0u64;
    for b in &bytes[..len] {
        x = (x << 8) | u64::from(*b);
    }
    Ok(x)
}

/// Drain and discard capsules from the request stream.
///
/// Returns `Ok(())` when the stream ends cleanly at a frame boundary. Any
/// other condition, a frame truncated by EOF or a read failure, is surfaced.
pub async fn skip_capsules<S: RequestStream + ?Sized>(stream: &S) -> Result<(), CapsuleError> {
    let mut scratch = [0u8; 4096];
    loop {
        // Clean EOF is only valid before a frame starts.
        let first = match read_byte(stream).await? {
            Some(b) => b,
            None => return Ok(()),
        };
        let capsule_type = read_varint_tail(stream, first).await?;
        let first = read_byte(stream).await?.ok_or(CapsuleError::Truncated)?;
        let length = read_varint_tail(stream, first).await?;
        debug!(capsule_type, length, "skipping capsule");

        let mut remaining = length as usize;
        while remaining > 0 {
            let want = remaining.min(scratch.len());
            let n = stream.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Err(CapsuleError::Truncated);
            }
            remaining -= n;
        }
    }
}

/// Append a capsule frame (type, length, payload) to `buf`.
pub fn write_capsule<B: BufMut>(buf: &mut B, capsule_type: u64, payload: &[u8]) {
    put_varint(buf, capsule_type);
    put_varint(buf, payload.len() as u64);
    buf.put_slice(payload);
}

/// An IP prefix as carried in ADDRESS_ASSIGN / ADDRESS_REQUEST entries.
///
/// Invariant: the prefix length fits the address width and every bit below
/// the prefix is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Construct a prefix, validating length and masked bits.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, CapsuleError> {
        let bits = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > bits {
            return Err(CapsuleError::PrefixTooLong { prefix_len, bits });
        }
        let value = addr_to_u128(addr);
        let host_bits = u32::from(bits - prefix_len);
        let host_mask = match host_bits {
            0 => 0,
            128 => u128::MAX,
            n => (1u128 << n) - 1,
        };
        if value & host_mask != 0 {
            return Err(CapsuleError::PrefixBitsSet);
        }
        Ok(Self { addr, prefix_len })
    }

    /// The prefix address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length in bits
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from_be_bytes(v4.octets())),
        IpAddr::V6(v6) => u128::from_be_bytes(v6.octets()),
    }
}

fn read_u8<B: Buf>(buf: &mut B) -> Result<u8, CapsuleError> {
    if buf.remaining() < 1 {
        return Err(coding::UnexpectedEnd.into());
    }
    Ok(buf.get_u8())
}

/// Read one address of the given IP version off a capsule payload.
fn read_addr<B: Buf>(buf: &mut B, version: u8) -> Result<IpAddr, CapsuleError> {
    match version {
        4 => {
            if buf.remaining() < 4 {
                return Err(coding::UnexpectedEnd.into());
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::from(octets))
        }
        6 => {
            if buf.remaining() < 16 {
                return Err(coding::UnexpectedEnd.into());
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::from(octets))
        }
        other => Err(CapsuleError::InvalidIpVersion(other)),
    }
}

fn decode_ip<B: Buf>(buf: &mut B) -> Result<IpAddr, CapsuleError> {
    let version = read_u8(buf)?;
    read_addr(buf, version)
}

fn encode_ip<B: BufMut>(addr: IpAddr, buf: &mut B) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.octets());
        }
    }
}

/// One address entry within an ADDRESS_ASSIGN or ADDRESS_REQUEST capsule.
///
/// Wire format: `request_id: varint`, `version: u8`, `addr: 4|16 bytes`,
/// `prefix_len: u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsuleAddress {
    /// Request identifier correlating assignments with requests
    pub request_id: u64,
    /// The assigned or requested prefix
    pub prefix: IpPrefix,
}

impl CapsuleAddress {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CapsuleError> {
        let request_id = get_varint(buf)?;
        let addr = decode_ip(buf)?;
        let prefix_len = read_u8(buf)?;
        Ok(Self {
            request_id,
            prefix: IpPrefix::new(addr, prefix_len)?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_varint(buf, self.request_id);
        encode_ip(self.prefix.addr(), buf);
        buf.put_u8(self.prefix.prefix_len());
    }
}

/// One address range within a ROUTE_ADVERTISEMENT capsule.
///
/// Wire format: `version: u8`, `start: 4|16 bytes`, `end: same width`,
/// `ip_proto: u8`, with `start <= end` in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    /// First address of the range
    pub start: IpAddr,
    /// Last address of the range
    pub end: IpAddr,
    /// IP protocol number the route applies to (0 = all)
    pub ip_protocol: u8,
}

impl AddressRange {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CapsuleError> {
        let version = read_u8(buf)?;
        let start = read_addr(buf, version)?;
        let end = read_addr(buf, version)?;
        if addr_to_u128(start) > addr_to_u128(end) {
            return Err(CapsuleError::InvalidRange);
        }
        let ip_protocol = read_u8(buf)?;
        Ok(Self {
            start,
            end,
            ip_protocol,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        match (self.start, self.end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                buf.put_u8(4);
                buf.put_slice(&s.octets());
                buf.put_slice(&e.octets());
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                buf.put_u8(6);
                buf.put_slice(&s.octets());
                buf.put_slice(&e.octets());
            }
            _ => debug_assert!(false, "mixed address families in range"),
        }
        buf.put_u8(self.ip_protocol);
    }
}

/// A typed CONNECT-IP control capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpCapsule {
    /// ADDRESS_ASSIGN: addresses the peer assigned
    AddressAssign(Vec<CapsuleAddress>),
    /// ADDRESS_REQUEST: addresses the peer requests
    AddressRequest(Vec<CapsuleAddress>),
    /// ROUTE_ADVERTISEMENT: ranges the peer can route
    RouteAdvertisement(Vec<AddressRange>),
}

impl IpCapsule {
    /// Decode a capsule payload of the given type.
    ///
    /// Returns `Ok(None)` for unrecognised capsule types; callers drop those
    /// and continue. Entries are parsed until the bounded payload is
    /// exhausted.
    pub fn decode<B: Buf>(capsule_type: u64, payload: &mut B) -> Result<Option<Self>, CapsuleError> {
        match capsule_type {
            CAPSULE_ADDRESS_ASSIGN => {
                let mut addresses = Vec::new();
                while payload.has_remaining() {
                    addresses.push(CapsuleAddress::decode(payload)?);
                }
                Ok(Some(Self::AddressAssign(addresses)))
            }
            CAPSULE_ADDRESS_REQUEST => {
                let mut addresses = Vec::new();
                while payload.has_remaining() {
                    addresses.push(CapsuleAddress::decode(payload)?);
                }
                Ok(Some(Self::AddressRequest(addresses)))
            }
            CAPSULE_ROUTE_ADVERTISEMENT => {
                let mut ranges = Vec::new();
                while payload.has_remaining() {
                    ranges.push(AddressRange::decode(payload)?);
                }
                Ok(Some(Self::RouteAdvertisement(ranges)))
            }
            _ => Ok(None),
        }
    }

    /// The capsule type identifier
    pub fn capsule_type(&self) -> u64 {
        match self {
            Self::AddressAssign(_) => CAPSULE_ADDRESS_ASSIGN,
            Self::AddressRequest(_) => CAPSULE_ADDRESS_REQUEST,
            Self::RouteAdvertisement(_) => CAPSULE_ROUTE_ADVERTISEMENT,
        }
    }

    /// Append the full capsule frame (type, length, payload) to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut payload = BytesMut::new();
        match self {
            Self::AddressAssign(addresses) | Self::AddressRequest(addresses) => {
                for addr in addresses {
                    addr.encode(&mut payload);
                }
            }
            Self::RouteAdvertisement(ranges) => {
                for range in ranges {
                    range.encode(&mut payload);
                }
            }
        }
        write_capsule(buf, self.capsule_type(), &payload);
    }
}
