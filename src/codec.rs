//! Framing codec over a byte stream.
//!
//! Provides buffered frame-oriented I/O with EINTR handling. The write side
//! coalesces the serializer's many small writes behind a 64 KiB buffer; the
//! read side keeps a carry buffer so the boundary scan never loses bytes
//! belonging to the next frame.

use std::io::{self, BufWriter, Read, Write};
use std::net::TcpStream;

use serde_json::Value;

use crate::error::{Result, SkiffError};
use crate::protocol::BOUNDARY;

/// Write-side buffer size (64 KiB).
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Read chunk size.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Apply the low-latency TCP options both ends use: disable Nagle and, on
/// Linux, enable quick-ack.
pub fn tune_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_QUICKACK,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

/// A frame as read off the wire. The body is kept as a `Result` so callers
/// can rewrite undecodable bodies into the synthetic bad-payload kind while
/// the stream itself stays aligned on the next frame.
#[derive(Debug)]
pub struct RawFrame {
    pub kind: u8,
    pub id: u64,
    pub body: std::result::Result<Value, String>,
}

/// Buffered frame writer.
pub struct FrameWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::with_capacity(WRITE_BUFFER_SIZE, inner),
        }
    }

    /// Emit one frame: header, body, boundary, then flush.
    ///
    /// Callers serialize access externally; a single frame is always written
    /// contiguously.
    pub fn write_frame(&mut self, kind: u8, id: u64, body: &[u8]) -> io::Result<()> {
        self.inner.write_all(&[kind])?;
        self.inner.write_all(&id.to_le_bytes())?;
        self.inner.write_all(body)?;
        self.inner.write_all(&BOUNDARY)?;
        self.inner.flush()
    }
}

/// Incremental frame reader with a carry buffer.
pub struct FrameReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. An
    /// end-of-stream anywhere inside a frame is a protocol error. A body that
    /// fails to decode is returned as `body: Err(..)` with the stream already
    /// positioned at the next frame.
    pub fn read_frame(&mut self) -> Result<Option<RawFrame>> {
        if !self.fill_to(1)? {
            return Ok(None);
        }
        let kind = self.buf[0];

        // Header byte consumed conceptually: from here on a short read is fatal.
        if !self.fill_to(1 + 8)? {
            return Err(SkiffError::Protocol(
                "stream closed inside a frame header".into(),
            ));
        }
        let id = u64::from_le_bytes(
            self.buf[1..9]
                .try_into()
                .expect("slice of 8 bytes fits u64"),
        );

        let boundary_at = self.scan_boundary(9)?;
        let body = serde_json::from_slice::<Value>(&self.buf[9..boundary_at])
            .map_err(|e| e.to_string());
        self.buf.drain(..boundary_at + BOUNDARY.len());

        Ok(Some(RawFrame { kind, id, body }))
    }

    /// Ensure at least `n` buffered bytes. `Ok(false)` means end-of-stream
    /// was reached first.
    fn fill_to(&mut self, n: usize) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while self.buf.len() < n {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(read) => self.buf.extend_from_slice(&chunk[..read]),
                // Interrupts delivered during idle waits are discarded.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Find the boundary marker at or after `from`, reading more as needed.
    /// Returns the offset where the marker starts.
    fn scan_boundary(&mut self, from: usize) -> Result<usize> {
        let mut search_from = from;
        loop {
            if self.buf.len() >= search_from + BOUNDARY.len() {
                if let Some(pos) = find_boundary(&self.buf[search_from..]) {
                    return Ok(search_from + pos);
                }
                // No match yet; a partial marker may straddle the chunk edge.
                search_from = self.buf.len() - (BOUNDARY.len() - 1);
            }
            let want = self.buf.len() + 1;
            if !self.fill_to(want)? {
                return Err(SkiffError::Protocol(
                    "stream closed before the frame boundary".into(),
                ));
            }
        }
    }
}

fn find_boundary(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(BOUNDARY.len())
        .position(|window| window == BOUNDARY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn encode(kind: u8, id: u64, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        writer.write_frame(kind, id, body).unwrap();
        drop(writer);
        out
    }

    /// Reader that yields one byte at a time, to exercise boundary markers
    /// straddling read chunks.
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for TrickleReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn test_roundtrip_single_frame() {
        let body = serde_json::to_vec(&json!({"x": [1, 2, 3]})).unwrap();
        let bytes = encode(0x50, 42, &body);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.kind, 0x50);
        assert_eq!(frame.id, 42);
        assert_eq!(frame.body.unwrap(), json!({"x": [1, 2, 3]}));
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut bytes = encode(0x01, 1, &serde_json::to_vec(&json!("first")).unwrap());
        bytes.extend(encode(0x02, 0, &serde_json::to_vec(&json!("second")).unwrap()));

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let first = reader.read_frame().unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.body.unwrap(), json!("first"));
        let second = reader.read_frame().unwrap().unwrap();
        assert_eq!(second.id, 0);
        assert_eq!(second.body.unwrap(), json!("second"));
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_garbage_body_resynchronizes() {
        // Invalid JSON in the body: the reader must report the decode error
        // and still deliver the following frame intact.
        let mut bytes = encode(0x50, 7, &[0x00, 0xC3, 0x28, 0x01]);
        bytes.extend(encode(0x50, 8, &serde_json::to_vec(&json!(true)).unwrap()));

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let bad = reader.read_frame().unwrap().unwrap();
        assert_eq!(bad.id, 7);
        assert!(bad.body.is_err());
        let good = reader.read_frame().unwrap().unwrap();
        assert_eq!(good.id, 8);
        assert_eq!(good.body.unwrap(), json!(true));
    }

    #[test]
    fn test_trickle_reads() {
        let mut bytes = encode(0x51, 9, &serde_json::to_vec(&json!([1, 2])).unwrap());
        bytes.extend(encode(0x50, 10, &serde_json::to_vec(&json!(null)).unwrap()));

        let mut reader = FrameReader::new(TrickleReader { data: bytes, pos: 0 });
        assert_eq!(reader.read_frame().unwrap().unwrap().id, 9);
        assert_eq!(reader.read_frame().unwrap().unwrap().id, 10);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_eof_at_frame_start_is_closed() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_truncated_header_is_fatal() {
        // kind byte present, id cut short
        let mut reader = FrameReader::new(Cursor::new(vec![0x50, 0x01, 0x02]));
        assert!(matches!(
            reader.read_frame(),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_body_is_fatal() {
        let full = encode(0x50, 3, &serde_json::to_vec(&json!("abc")).unwrap());
        let cut = full[..full.len() - 4].to_vec();
        let mut reader = FrameReader::new(Cursor::new(cut));
        assert!(matches!(
            reader.read_frame(),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_empty_body_frame() {
        // An interrupt frame carries an empty tuple.
        let bytes = encode(0x14, 0, &serde_json::to_vec(&json!([])).unwrap());
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.kind, 0x14);
        assert_eq!(frame.id, 0);
        assert_eq!(frame.body.unwrap(), json!([]));
    }
}
