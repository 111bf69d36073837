//! WebSocket frame codec (RFC 6455 §5).

use crate::errors::{Error, Result};
use std::fmt;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Decodes the low nibble of the first frame byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value & 0x0F {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(Error::UnknownOpcode(other)),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, ping and pong.
    #[inline]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A single WebSocket frame.
///
/// Frames read from a client carry the masking key they were sent with;
/// the payload is already unmasked. Frames built for sending have no key:
/// server frames are never masked.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub mask: Option<[u8; 4]>,
}

impl Frame {
    /// A final, unmasked frame.
    #[inline]
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
            mask: None,
        }
    }

    #[inline]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    #[inline]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    #[inline]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, data)
    }

    #[inline]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, data)
    }

    /// A close frame with a status code and reason. The reason is cut at a
    /// character boundary to fit the 125-byte control frame limit.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        Self::new(Opcode::Close, payload)
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_slice()) {
            (Opcode::Close, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Reason text of a close frame.
    pub fn close_reason(&self) -> Option<&str> {
        match self.opcode {
            Opcode::Close if self.payload.len() > 2 => {
                simdutf8::basic::from_utf8(&self.payload[2..]).ok()
            }
            _ => None,
        }
    }

    /// Payload as text, when it is valid UTF-8.
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        simdutf8::basic::from_utf8(&self.payload).ok()
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while `buf` holds less than a complete frame, and
    /// the frame together with the number of bytes it used otherwise.
    /// Declared payloads above `max_payload` (or above `i64::MAX`) fail
    /// with [`Error::FrameTooLarge`] as soon as the length is known.
    ///
    /// # Format
    /// ```text
    /// byte 0   FIN | RSV1-3 | opcode(4)
    /// byte 1   MASK | len(7)
    /// len=126  + 2 bytes big-endian length
    /// len=127  + 8 bytes big-endian length
    /// MASK=1   + 4 bytes masking key
    ///          payload
    /// ```
    pub fn parse(buf: &[u8], max_payload: u64) -> Result<Option<(Frame, usize)>> {
        let [first, second, ..] = *buf else {
            return Ok(None);
        };

        if first & 0x70 != 0 {
            return Err(Error::InvalidFrame("reserved bits set"));
        }
        let fin = first & 0x80 != 0;
        let opcode = Opcode::from_u8(first)?;
        let masked = second & 0x80 != 0;

        let (len, mut pos) = match second & 0x7F {
            126 => match buf.get(2..4) {
                Some(bytes) => (u16::from_be_bytes([bytes[0], bytes[1]]) as u64, 4),
                None => return Ok(None),
            },
            127 => match buf.get(2..10) {
                Some(bytes) => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    (u64::from_be_bytes(raw), 10)
                }
                None => return Ok(None),
            },
            len => (len as u64, 2),
        };

        if len > i64::MAX as u64 || len > max_payload {
            return Err(Error::FrameTooLarge { limit: max_payload });
        }
        if opcode.is_control() && (!fin || len > 125) {
            return Err(Error::InvalidFrame("fragmented or oversized control frame"));
        }

        let mask = match masked {
            true => match buf.get(pos..pos + 4) {
                Some(key) => {
                    pos += 4;
                    Some([key[0], key[1], key[2], key[3]])
                }
                None => return Ok(None),
            },
            false => None,
        };

        let end = pos + len as usize;
        let Some(data) = buf.get(pos..end) else {
            return Ok(None);
        };

        let mut payload = data.to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        let frame = Frame {
            fin,
            opcode,
            payload,
            mask,
        };
        Ok(Some((frame, end)))
    }

    /// Serializes the frame for sending. Never masked.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 10);
        self.write_header(&mut out, false);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Serializes the frame the way a client would send it.
    #[cfg(test)]
    pub(crate) fn encode_masked(&self, key: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 14);
        self.write_header(&mut out, true);
        out.extend_from_slice(&key);

        let start = out.len();
        out.extend_from_slice(&self.payload);
        apply_mask(&mut out[start..], key);
        out
    }

    fn write_header(&self, out: &mut Vec<u8>, masked: bool) {
        let fin = if self.fin { 0x80 } else { 0x00 };
        out.push(fin | self.opcode.as_u8());

        let mask = if masked { 0x80 } else { 0x00 };
        let len = self.payload.len();
        match len {
            0..=125 => out.push(mask | len as u8),
            126..=0xFFFF => {
                out.push(mask | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            _ => {
                out.push(mask | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
    }
}

#[inline]
fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("fin", &self.fin)
            .field("opcode", &self.opcode)
            .field("len", &self.payload.len())
            .field("masked", &self.mask.is_some())
            .finish()
    }
}
