//! Packet encoding: opcode families and actions, field reader, frame builder.
//!
//! Frame layout on the wire:
//!
//! ```text
//! [0xAA] [len: u16 BE] [family: u8] [action: u8] [body ...]
//! ```
//!
//! `len` counts everything after the 3-byte header. Body fields are
//! fixed-width big-endian integers and strings; a "break" string ends at a
//! 0xFF sentinel, an "end" string runs to the end of the body.

use bytes::{BufMut, Bytes, BytesMut};

use super::FRAME_MARKER;

/// Sentinel that terminates a break string.
pub const BREAK: u8 = 0xFF;

/// Header bytes before the family byte.
pub const HEADER_LEN: usize = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("bad frame marker 0x{0:02X}")]
    BadMarker(u8),

    #[error("frame length {declared} does not match {actual} received bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

macro_rules! opcode_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_u8(self) -> u8 {
                self as u8
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(self, f)
            }
        }
    };
}

opcode_enum! {
    /// Message family (subsystem) byte.
    Family {
        Connection = 1,
        Account = 2,
        Character = 3,
        Login = 4,
        Welcome = 5,
        Talk = 18,
        Party = 28,
        Book = 32,
        Trade = 36,
        Init = 255,
    }
}

opcode_enum! {
    /// Message action (verb) byte.
    Action {
        Request = 1,
        Accept = 2,
        Reply = 3,
        Remove = 4,
        Agree = 5,
        Create = 6,
        Add = 7,
        Take = 9,
        Use = 10,
        Open = 13,
        Close = 14,
        Msg = 15,
        Spec = 16,
        List = 18,
        Ping = 240,
        Pong = 241,
        Init = 255,
    }
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub family: u8,
    pub action: u8,
    pub body: Bytes,
}

impl Packet {
    /// Decode a complete frame, header included.
    pub fn decode(frame: &[u8]) -> Result<Self, PacketError> {
        if frame.len() < HEADER_LEN + 2 {
            return Err(PacketError::Truncated {
                needed: HEADER_LEN + 2,
                remaining: frame.len(),
            });
        }
        if frame[0] != FRAME_MARKER {
            return Err(PacketError::BadMarker(frame[0]));
        }
        let declared = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        let actual = frame.len() - HEADER_LEN;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }
        Ok(Self {
            family: frame[3],
            action: frame[4],
            body: Bytes::copy_from_slice(&frame[5..]),
        })
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.body)
    }
}

/// Cursor over a message body.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// String up to the next 0xFF (consumed) or the end of the body.
    pub fn get_break_string(&mut self) -> Result<String, PacketError> {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == BREAK) {
            Some(end) => {
                self.pos += end + 1;
                Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
            }
            None => self.get_end_string(),
        }
    }

    /// Everything left in the body.
    pub fn get_end_string(&mut self) -> Result<String, PacketError> {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        Ok(String::from_utf8_lossy(rest).into_owned())
    }

    pub fn get_fixed_string(&mut self, len: usize) -> Result<String, PacketError> {
        let b = self.take(len)?;
        Ok(String::from_utf8_lossy(b).into_owned())
    }
}

/// Builds one outbound frame.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    family: Family,
    action: Action,
    body: BytesMut,
}

impl PacketBuilder {
    pub fn new(family: Family, action: Action) -> Self {
        Self {
            family,
            action,
            body: BytesMut::with_capacity(32),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn add_u8(mut self, value: u8) -> Self {
        self.body.put_u8(value);
        self
    }

    pub fn add_u16(mut self, value: u16) -> Self {
        self.body.put_u16(value);
        self
    }

    pub fn add_u32(mut self, value: u32) -> Self {
        self.body.put_u32(value);
        self
    }

    /// Raw string with no terminator.
    pub fn add_string(mut self, value: &str) -> Self {
        self.body.put_slice(value.as_bytes());
        self
    }

    pub fn add_break_string(mut self, value: &str) -> Self {
        self.body.put_slice(value.as_bytes());
        self.body.put_u8(BREAK);
        self
    }

    pub fn add_break(mut self) -> Self {
        self.body.put_u8(BREAK);
        self
    }

    pub fn add_bytes(mut self, value: &[u8]) -> Self {
        self.body.put_slice(value);
        self
    }

    /// Frame the body. Bodies longer than a u16 length allows are cut short.
    pub fn finish(&self) -> Bytes {
        let max_body = u16::MAX as usize - 2;
        let body = &self.body[..self.body.len().min(max_body)];
        debug_assert_eq!(body.len(), self.body.len(), "packet body overflow");

        let mut out = BytesMut::with_capacity(HEADER_LEN + 2 + body.len());
        out.put_u8(FRAME_MARKER);
        out.put_u16((body.len() + 2) as u16);
        out.put_u8(self.family.as_u8());
        out.put_u8(self.action.as_u8());
        out.put_slice(body);
        out.freeze()
    }
}
