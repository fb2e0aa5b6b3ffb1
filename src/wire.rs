//! Byte level primitives of the SoulSeek wire format.
//!
//! Every message travels as a length prefixed frame: a little-endian `u32`
//! counting everything after itself, followed by a message code and payload.
//! All integers are little-endian. Strings are a `u32` length prefix followed
//! by that many bytes of UTF-8 (with a latin-1 fallback for legacy clients).
//!
//! The one deliberate oddity is the IPv4 field in server messages: the four
//! octets appear in network order packed into the little-endian `u32`, so the
//! high byte of the decoded word is the first octet.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Frames over this size abort the connection; nothing legitimate comes
/// close.
pub(crate) const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Strings over this size mark the containing message as malformed.
pub(crate) const MAX_STRING_LEN: usize = 10 * 1024 * 1024;

/// Hard cap on any count prefixed list.
pub(crate) const MAX_LIST_LEN: usize = 100_000;

/// Hard cap on the attribute list of a single file entry.
pub(crate) const MAX_FILE_ATTRS: usize = 100;

/// Splits one length prefixed frame off the front of `src`.
///
/// Returns the frame body with the length prefix stripped, `Ok(None)` if
/// fewer than `4 + length` bytes are buffered, or an error if the advertised
/// length exceeds [`MAX_FRAME_LEN`].
pub(crate) fn split_frame(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    if src.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol("frame length over 100 MB"));
    }
    if src.len() < 4 + len {
        // reserve what we know is still coming so the next read has room
        src.reserve(4 + len - src.len());
        return Ok(None);
    }
    let mut frame = src.split_to(4 + len);
    frame.advance(4);
    Ok(Some(frame))
}

/// A checked cursor over a message payload.
///
/// Unlike raw [`Buf`] accessors, every read reports truncation as a
/// [`Error::Protocol`] instead of panicking, so a short payload rejects the
/// message and leaves the session alive.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.buf.remaining() < 1 {
            return Err(Error::Protocol("truncated payload"));
        }
        Ok(self.buf.get_u8())
    }

    /// No current message carries a bare u16, but the width is part of the
    /// wire vocabulary.
    #[allow(dead_code)]
    pub fn read_u16(&mut self) -> Result<u16> {
        if self.buf.remaining() < 2 {
            return Err(Error::Protocol("truncated payload"));
        }
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(Error::Protocol("truncated payload"));
        }
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        if self.buf.remaining() < 8 {
            return Err(Error::Protocol("truncated payload"));
        }
        Ok(self.buf.get_u64_le())
    }

    /// A bool is a single byte; any non-zero value is true.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `u32` length prefixed string. UTF-8 is attempted first; bytes
    /// that aren't valid UTF-8 are decoded as ISO-8859-1, which cannot fail.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(Error::Protocol("string over 10 MB"));
        }
        if self.buf.remaining() < len {
            return Err(Error::Protocol("truncated string"));
        }
        let raw = &self.buf[..len];
        let s = match std::str::from_utf8(raw) {
            Ok(s) => s.to_owned(),
            Err(_) => raw.iter().map(|&b| b as char).collect(),
        };
        self.buf.advance(len);
        Ok(s)
    }

    /// Reads the network-order-in-LE-word IPv4 field: the high byte of the
    /// decoded word is the first octet.
    pub fn read_ipv4(&mut self) -> Result<Ipv4Addr> {
        Ok(Ipv4Addr::from(self.read_u32()?))
    }

    /// Reads a list count and validates it against [`MAX_LIST_LEN`].
    pub fn read_list_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len > MAX_LIST_LEN {
            return Err(Error::Protocol("list count over cap"));
        }
        Ok(len)
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.buf.remaining() < len {
            return Err(Error::Protocol("truncated payload"));
        }
        let raw = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(raw)
    }

    /// Takes whatever is left of the payload.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let raw = self.buf.to_vec();
        self.buf.advance(raw.len());
        raw
    }
}

/// Writer-side helpers layered on top of [`BufMut`].
pub(crate) trait WireWrite: BufMut {
    fn put_str(&mut self, s: &str) {
        self.put_u32_le(s.len() as u32);
        self.put_slice(s.as_bytes());
    }

    fn put_bool(&mut self, b: bool) {
        self.put_u8(b as u8);
    }

    fn put_ipv4(&mut self, ip: Ipv4Addr) {
        self.put_u32_le(u32::from(ip));
    }
}

impl<T: BufMut> WireWrite for T {}

/// Finishes a frame under construction: `dst` holds the message body from
/// `body_start` on, and the four bytes just before it are patched with the
/// body length.
pub(crate) fn finish_frame(dst: &mut BytesMut, body_start: usize) {
    let body_len = (dst.len() - body_start) as u32;
    dst[body_start - 4..body_start].copy_from_slice(&body_len.to_le_bytes());
}

/// Starts a frame: reserves the four length bytes and returns the body start
/// offset to later pass to [`finish_frame`].
pub(crate) fn start_frame(dst: &mut BytesMut) -> usize {
    dst.put_u32_le(0);
    dst.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_needs_more_data() {
        let mut buf = BytesMut::from(&[10u8, 0, 0, 0, 1, 2, 3][..]);
        assert!(split_frame(&mut buf).unwrap().is_none());
        // nothing consumed
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn frame_over_cap_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_FRAME_LEN as u32 + 1);
        assert!(split_frame(&mut buf).is_err());
    }

    #[test]
    fn frame_split_strips_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.put_slice(&[7, 8, 9]);
        buf.put_u32_le(1);
        buf.put_u8(42);
        let first = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], &[7, 8, 9]);
        let second = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&second[..], &[42]);
        assert!(split_frame(&mut buf).unwrap().is_none());
    }

    // Any byte-wise split of a frame stream must produce the same frames.
    #[test]
    fn frame_boundary_is_split_independent() {
        let mut stream = BytesMut::new();
        let bodies: Vec<Vec<u8>> = vec![vec![1], vec![2, 3], vec![], vec![4, 5, 6, 7]];
        for body in &bodies {
            stream.put_u32_le(body.len() as u32);
            stream.put_slice(body);
        }
        let stream = stream.freeze();

        for chunk_size in 1..stream.len() {
            let mut buf = BytesMut::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                buf.put_slice(chunk);
                while let Some(frame) = split_frame(&mut buf).unwrap() {
                    out.push(frame.to_vec());
                }
            }
            assert_eq!(out, bodies, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn string_utf8_and_latin1_fallback() {
        let mut buf = BytesMut::new();
        buf.put_str("héllo");
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string().unwrap(), "héllo");

        // 0xE9 is 'é' in ISO-8859-1 but invalid UTF-8 on its own
        let raw = [2u8, 0, 0, 0, 0x65, 0xE9];
        let mut r = Reader::new(&raw);
        assert_eq!(r.read_string().unwrap(), "eé");
    }

    #[test]
    fn oversize_string_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_STRING_LEN as u32 + 1);
        let mut r = Reader::new(&buf);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn oversize_list_count_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1_000_000);
        let mut r = Reader::new(&buf);
        assert!(r.read_list_len().is_err());
    }

    #[test]
    fn truncated_reads_are_errors_not_panics() {
        let mut r = Reader::new(&[1, 2]);
        assert!(r.read_u32().is_err());
        let mut r = Reader::new(&[5, 0, 0, 0, 1, 2]);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn integer_widths_are_little_endian() {
        let raw = [
            0x01, // u8
            0x02, 0x01, // u16
            0x04, 0x03, 0x02, 0x01, // u32
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // u64
        ];
        let mut r = Reader::new(&raw);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0102);
        assert_eq!(r.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(r.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.remaining(), 0);
    }

    // Pins the high-byte-first interpretation of the IP word.
    #[test]
    fn ipv4_high_byte_first() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0x0102_0304);
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_ipv4().unwrap(), Ipv4Addr::new(1, 2, 3, 4));

        let mut buf = BytesMut::new();
        buf.put_ipv4(Ipv4Addr::new(1, 2, 3, 4));
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn bool_any_nonzero_is_true() {
        let mut r = Reader::new(&[0, 1, 7]);
        assert!(!r.read_bool().unwrap());
        assert!(r.read_bool().unwrap());
        assert!(r.read_bool().unwrap());
    }

    #[test]
    fn frame_writer_patches_length() {
        let mut dst = BytesMut::new();
        let start = start_frame(&mut dst);
        dst.put_u32_le(40);
        dst.put_str("abc");
        finish_frame(&mut dst, start);
        assert_eq!(&dst[..4], &11u32.to_le_bytes());
    }
}
