use std::io::{self, ErrorKind, Read};

use log::trace;

use crate::constants::CAPTURE_BUFFER_SIZE;

/// Fixed size buffer keeping the most recent output of a testee.
///
/// Once more than 3/4 full, the oldest half is thrown away. Allocated once per `TestBinary`
/// and handed from testee to testee.
pub struct CaptureBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::with_capacity(CAPTURE_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 4, "capture buffer too small: {}", capacity);

        Self {
            data: vec![0; capacity],
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn contents(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Read everything `src` has to offer right now.
    ///
    /// Returns `Ok(true)` if `src` would block (still open) and `Ok(false)` on EOF.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<bool> {
        loop {
            // Compaction keeps `filled` at or below 3/4 capacity, so this slice is never empty
            match src.read(&mut self.data[self.filled..]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    trace!(
                        "testee: {}",
                        String::from_utf8_lossy(&self.data[self.filled..self.filled + n])
                    );
                    self.filled += n;
                    self.compact();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop the oldest half once we're past 3/4 full
    fn compact(&mut self) {
        let capacity = self.capacity();
        if self.filled > capacity / 4 * 3 {
            self.data.copy_within(capacity / 2..self.filled, 0);
            self.filled -= capacity / 2;
        }
    }

    /// Copy out what we have and start over
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.contents().to_vec();
        self.filled = 0;
        out
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out its chunks one read at a time, then either blocks or hits EOF
#[cfg(test)]
struct Chunked {
    chunks: Vec<Vec<u8>>,
    eof: bool,
}

#[cfg(test)]
impl Read for Chunked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.chunks.is_empty() {
            return if self.eof {
                Ok(0)
            } else {
                Err(ErrorKind::WouldBlock.into())
            };
        }

        let chunk = self.chunks.remove(0);
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.insert(0, chunk[n..].to_vec());
        }
        Ok(n)
    }
}

#[test]
fn test_fill_until_blocked_or_eof() {
    let mut buffer = CaptureBuffer::with_capacity(64);

    let mut open = Chunked {
        chunks: vec![b"hello ".to_vec(), b"world".to_vec()],
        eof: false,
    };
    assert!(buffer.fill_from(&mut open).unwrap());
    assert_eq!(buffer.contents(), b"hello world");

    let mut closed = Chunked {
        chunks: vec![b"!".to_vec()],
        eof: true,
    };
    assert!(!buffer.fill_from(&mut closed).unwrap());
    assert_eq!(buffer.take(), b"hello world!".to_vec());
    assert!(buffer.is_empty());
}

#[test]
fn test_compaction_keeps_newest_bytes() {
    let mut buffer = CaptureBuffer::with_capacity(16);

    // 13 bytes > 3/4 * 16, so the oldest 8 get dropped
    let mut src = Chunked {
        chunks: vec![b"abcdefghijklm".to_vec()],
        eof: false,
    };
    buffer.fill_from(&mut src).unwrap();
    assert_eq!(buffer.contents(), b"ijklm");
    assert!(buffer.len() <= buffer.capacity() / 2);

    // Lots of small writes never overflow and always keep a suffix of the stream
    let stream: Vec<u8> = (0..200u8).collect();
    let mut src = Chunked {
        chunks: stream.chunks(3).map(|c| c.to_vec()).collect(),
        eof: true,
    };
    let mut buffer = CaptureBuffer::with_capacity(16);
    assert!(!buffer.fill_from(&mut src).unwrap());
    assert!(buffer.len() <= buffer.capacity() / 4 * 3);
    assert!(stream.ends_with(buffer.contents()));
    assert!(!buffer.is_empty());
}
