use crate::{Command, NetAddress};

/// Offset of the payload within a serialized frame: `cmd(1) + length(4) + reqid(4)`.
pub const HEADER_SIZE: usize = 9;

/// Largest frame this codec will treat as well-formed on decode (§4.1, §6).
pub const MAX_FRAME_LEN: usize = 16 * 1024;

/// Sanity cap applied before `length` itself is trusted, mirroring the
/// original `Socket::DoRecv`'s guard against a bogus length field driving an
/// unbounded allocation.
pub const MAX_RAW_RECV_LEN: usize = 64 * 1024;

/// An in-memory frame: command, request id, and payload. `length` is a
/// derived header field, recomputed whenever the frame is serialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Command,
    pub reqid: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// `reqid == 0` seeds a fresh, nonzero request id the way the original
    /// packet constructor does when the caller doesn't care about
    /// correlating a response (e.g. `IN_PORT`).
    pub fn new(cmd: Command, reqid: u32) -> Self {
        let reqid = if reqid == 0 { rand::random::<u32>().max(1) } else { reqid };
        Self { cmd, reqid, payload: Vec::new() }
    }

    pub fn writer(cmd: Command, reqid: u32) -> FrameWriter {
        FrameWriter::new(cmd, reqid)
    }

    pub fn reader(self) -> FrameReader {
        FrameReader::new(self.cmd, self.reqid, self.payload)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let preview_len = self.payload.len().min(64);
        write!(f, "Frame[{}, len={}, reqid={}, payload=", self.cmd, self.payload.len(), self.reqid)?;
        for b in &self.payload[..preview_len] {
            write!(f, "{b:02x}")?;
        }
        if self.payload.len() > preview_len {
            write!(f, "..")?;
        }
        write!(f, "]")
    }
}

/// Typed, capacity-growing appender for building a wire frame. Mirrors the
/// original `Packet`'s `Write*` family and its `PreWrite`/`EnsureCapacity`
/// growth-by-`max(needed, 64)` policy.
pub struct FrameWriter {
    cmd: Command,
    reqid: u32,
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new(cmd: Command, reqid: u32) -> Self {
        let reqid = if reqid == 0 { rand::random::<u32>().max(1) } else { reqid };
        let mut buf = Vec::with_capacity(64);
        buf.resize(HEADER_SIZE, 0);
        Self { cmd, reqid, buf }
    }

    fn ensure_capacity(&mut self, additional: usize) {
        let needed = additional.max(64);
        self.buf.reserve(needed);
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.ensure_capacity(1);
        self.buf.push(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(u8::from(v))
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.ensure_capacity(2);
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.write_u16(v as u16)
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.ensure_capacity(4);
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.write_u32(v as u32)
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.ensure_capacity(v.len());
        self.buf.extend_from_slice(v);
        self
    }

    /// NUL-terminated ASCII, as the wire's string encoding (§4.1).
    pub fn write_ascii(&mut self, v: &str) -> &mut Self {
        self.ensure_capacity(v.len() + 1);
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn write_addr(&mut self, addr: NetAddress) -> &mut Self {
        self.write_u32(u32::from(addr.ip)).write_u16(addr.port)
    }

    /// Finalizes the `length` header field in place and returns the frame.
    pub fn finish(mut self) -> Frame {
        let len = self.buf.len() as u32;
        self.buf[0] = self.cmd as u8;
        self.buf[1..5].copy_from_slice(&len.to_be_bytes());
        self.buf[5..9].copy_from_slice(&self.reqid.to_be_bytes());
        Frame { cmd: self.cmd, reqid: self.reqid, payload: self.buf.split_off(HEADER_SIZE) }
    }

    /// Serializes straight to wire bytes (header + payload), for handing to
    /// the reactor's egress queue.
    pub fn finish_bytes(self) -> Vec<u8> {
        let cmd = self.cmd;
        let reqid = self.reqid;
        let mut buf = self.buf;
        let len = buf.len() as u32;
        buf[0] = cmd as u8;
        buf[1..5].copy_from_slice(&len.to_be_bytes());
        buf[5..9].copy_from_slice(&reqid.to_be_bytes());
        buf
    }
}

/// Cursor over an owned payload buffer. Typed reads advance the cursor and
/// return `None` on short buffer rather than panicking, matching the
/// original's `-1`/empty sentinel convention re-expressed as `Option`.
pub struct FrameReader {
    pub cmd: Command,
    pub reqid: u32,
    buf: Vec<u8>,
    pos: usize,
}

impl FrameReader {
    pub fn new(cmd: Command, reqid: u32, payload: Vec<u8>) -> Self {
        Self { cmd, reqid, buf: payload, pos: 0 }
    }

    /// Decodes a full wire frame (header + payload) from raw bytes.
    ///
    /// Returns `None` if `bytes` is shorter than the length it declares;
    /// callers are expected to have already validated `length` against
    /// [`MAX_FRAME_LEN`]/[`MAX_RAW_RECV_LEN`] before calling this.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let cmd = Command::try_from(bytes[0]).ok()?;
        let length = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
        let reqid = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        if length < HEADER_SIZE || length > bytes.len() {
            return None;
        }
        Some(Self::new(cmd, reqid, bytes[HEADER_SIZE..length].to_vec()))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|b| b != 0)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes: [u8; 2] = self.buf.get(self.pos..self.pos + 2)?.try_into().ok()?;
        self.pos += 2;
        Some(u16::from_be_bytes(bytes))
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.read_u16().map(|v| v as i16)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes: [u8; 4] = self.buf.get(self.pos..self.pos + 4)?.try_into().ok()?;
        self.pos += 4;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        let slice = self.buf.get(self.pos..self.pos + len)?;
        let out = slice.to_vec();
        self.pos += len;
        Some(out)
    }

    /// Reads a NUL-terminated ASCII string, stopping at NUL or at
    /// `max_len` bytes, whichever comes first (caller-supplied bound, as
    /// the original `ReadASCII` truncates rather than overruns).
    pub fn read_ascii(&mut self, max_len: usize) -> Option<String> {
        let start = self.pos;
        let mut end = start;
        while end < self.buf.len() && end - start < max_len && self.buf[end] != 0 {
            end += 1;
        }
        let s = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
        self.pos = end;
        if self.pos < self.buf.len() && self.buf[self.pos] == 0 {
            self.pos += 1;
        }
        Some(s)
    }

    pub fn read_addr(&mut self) -> Option<NetAddress> {
        let ip = self.read_u32()?;
        let port = self.read_u16()?;
        Some(NetAddress::new(ip.into(), port))
    }

    /// Reconstitutes an owned [`Frame`] from whatever payload remains
    /// unread, for single-hop forwarding (`FORWARD_REQ`, `CREATE_RESP`
    /// fan-out) without needing to re-encode field by field.
    pub fn to_frame(&self) -> Frame {
        Frame { cmd: self.cmd, reqid: self.reqid, payload: self.buf[self.pos..].to_vec() }
    }
}

/// `length ∈ [HEADER_SIZE, MAX_FRAME_LEN]`, the one validity check the
/// reactor applies before trusting a decoded length field (§4.1).
pub fn is_valid_length(length: usize) -> bool {
    (HEADER_SIZE..=MAX_FRAME_LEN).contains(&length)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn round_trips_every_typed_field() {
        let addr = NetAddress::new(Ipv4Addr::new(10, 1, 2, 3), 9001);
        let frame = Frame::writer(Command::Handshake, 42)
            .write_u8(7)
            .write_bool(true)
            .write_u16(4000)
            .write_i16(-4000)
            .write_u32(123_456)
            .write_i32(-123_456)
            .write_ascii("hello")
            .write_addr(addr)
            .write_bytes(&[1, 2, 3])
            .finish();

        assert_eq!(frame.cmd, Command::Handshake);
        assert_eq!(frame.reqid, 42);

        let mut reader = frame.reader();
        assert_eq!(reader.read_u8(), Some(7));
        assert_eq!(reader.read_bool(), Some(true));
        assert_eq!(reader.read_u16(), Some(4000));
        assert_eq!(reader.read_i16(), Some(-4000));
        assert_eq!(reader.read_u32(), Some(123_456));
        assert_eq!(reader.read_i32(), Some(-123_456));
        assert_eq!(reader.read_ascii(256), Some("hello".to_string()));
        assert_eq!(reader.read_addr(), Some(addr));
        assert_eq!(reader.read_bytes(3), Some(vec![1, 2, 3]));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn wire_bytes_decode_back_to_the_same_frame() {
        let wire = Frame::writer(Command::Ping, 7).write_u8(9).finish_bytes();

        let decoded = FrameReader::decode(&wire).expect("decodes");
        assert_eq!(decoded.cmd, Command::Ping);
        assert_eq!(decoded.reqid, 7);
        assert_eq!(decoded.to_frame().payload, vec![9]);
    }

    #[test]
    fn short_reads_return_none_not_panic() {
        let frame = Frame::writer(Command::Ping, 1).write_u8(1).finish();
        let mut reader = frame.reader();
        assert_eq!(reader.read_u8(), Some(1));
        assert_eq!(reader.read_u32(), None);
    }

    #[test]
    fn validates_length_bounds() {
        assert!(!is_valid_length(HEADER_SIZE - 1));
        assert!(is_valid_length(HEADER_SIZE));
        assert!(is_valid_length(MAX_FRAME_LEN));
        assert!(!is_valid_length(MAX_FRAME_LEN + 1));
    }

    #[test]
    fn ascii_reads_stop_at_caller_bound() {
        let frame = Frame::writer(Command::Ping, 1).write_ascii("abcdef").finish();
        let mut reader = frame.reader();
        assert_eq!(reader.read_ascii(3), Some("abc".to_string()));
    }
}
