// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Variable-length integer coding (RFC 9000 §16).
//!
//! Everything CONNECT-UDP puts on the wire leans on QUIC varints: the
//! context-id prefix of each HTTP datagram and the type and length fields of
//! every capsule. [`VarInt`] carries a validated value; [`get_varint`] and
//! [`put_varint`] are the buffer-level shorthand the codecs use.

use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// The input ended before a complete value could be decoded
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Result of decoding a wire value
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Error returned when a value exceeds the 62-bit varint range
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

/// A QUIC variable-length integer (RFC 9000 §16)
///
/// Values up to 2^62-1 are encoded in 1, 2, 4, or 8 bytes; the two most
/// significant bits of the first byte carry the width. Context id zero, the
/// only context the CONNECT-UDP core ever sends, encodes as the single byte
/// `0x00`.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// The largest representable value
    pub const MAX: Self = Self((1 << 62) - 1);

    /// Construct from a `u32`, which always fits
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Construct from a `u64`, failing above 2^62-1
    pub fn from_u64(x: u64) -> ::std::result::Result<Self, VarIntBoundsExceeded> {
        if x <= Self::MAX.0 {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Extract the integer value
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// The number of bytes this value occupies on the wire
    pub const fn size(self) -> usize {
        if self.0 < 1 << 6 {
            1
        } else if self.0 < 1 << 14 {
            2
        } else if self.0 < 1 << 30 {
            4
        } else {
            8
        }
    }

    /// Decode a varint from the front of `buf`, consuming it.
    ///
    /// This is how the context id is peeled off an HTTP datagram: the buffer
    /// is left holding the payload.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        let first = buf.chunk()[0];
        let tag = first >> 6;
        let len = 1usize << tag;
        if buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0u8; 8];
        buf.copy_to_slice(&mut bytes[..len]);
        bytes[0] &= 0b0011_1111;
        let mut x = 0u64;
        for b in &bytes[..len] {
            x = (x << 8) | u64::from(*b);
        }
        Ok(Self(x))
    }

    /// Append the encoding of this value to `buf`.
    pub fn encode<B: BufMut>(self, buf: &mut B) {
        let x = self.0;
        if x < 1 << 6 {
            buf.put_u8(x as u8);
        } else if x < 1 << 14 {
            buf.put_u16(0b01 << 14 | x as u16);
        } else if x < 1 << 30 {
            buf.put_u32(0b10 << 30 | x as u32);
        } else {
            buf.put_u64(0b11 << 62 | x);
        }
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: u64) -> ::std::result::Result<Self, VarIntBoundsExceeded> {
        Self::from_u64(x)
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Read a varint off `buf` as a plain `u64`.
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u64> {
    Ok(VarInt::decode(buf)?.into_inner())
}

/// Append `value` to `buf` as a varint.
///
/// Capsule type ids and lengths never approach the 62-bit ceiling; a value
/// beyond it is a programming error, not a wire condition.
pub fn put_varint<B: BufMut>(buf: &mut B, value: u64) {
    match VarInt::from_u64(value) {
        Ok(v) => v.encode(buf),
        Err(_) => {
            debug_assert!(false, "varint overflow: {value}");
        }
    }
}
