//! Wire format spoken over the control and reply pipes.
//!
//! The statement itself never crosses a pipe. It is copied into the input region of the
//! shared mapping before the header is written.

use std::convert::TryInto;

use crate::constants::{CONTROL_HEADER_SIZE, REPLY_SIZE};

/// Runner -> testee: "run function `function` on the first `len` bytes of the input region"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub function: u8,
    pub len: u64,
}

impl ControlHeader {
    pub fn encode(&self) -> [u8; CONTROL_HEADER_SIZE] {
        let mut buf = [0u8; CONTROL_HEADER_SIZE];
        buf[0] = self.function;
        buf[1..].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; CONTROL_HEADER_SIZE]) -> Self {
        Self {
            function: buf[0],
            len: le_u64(&buf[1..]),
        }
    }
}

/// Testee -> runner, once per request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reply {
    pub result: u64,
    pub elapsed_ns: u64,
    /// Number of valid bytes at the start of the sonar region
    pub sonar_len: u64,
}

impl Reply {
    pub fn encode(&self) -> [u8; REPLY_SIZE] {
        let mut buf = [0u8; REPLY_SIZE];
        buf[..8].copy_from_slice(&self.result.to_le_bytes());
        buf[8..16].copy_from_slice(&self.elapsed_ns.to_le_bytes());
        buf[16..].copy_from_slice(&self.sonar_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REPLY_SIZE]) -> Self {
        Self {
            result: le_u64(&buf[..8]),
            elapsed_ns: le_u64(&buf[8..16]),
            sonar_len: le_u64(&buf[16..]),
        }
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    // Callers always hand in exactly 8 bytes
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

#[test]
fn test_header_layout() {
    let header = ControlHeader {
        function: 7,
        len: 0x0102_0304,
    };
    let buf = header.encode();

    assert_eq!(buf, [7, 4, 3, 2, 1, 0, 0, 0, 0]);
    assert_eq!(ControlHeader::decode(&buf), header);
}

#[test]
fn test_reply_layout() {
    let mut raw = [0u8; REPLY_SIZE];
    raw[0] = 1;
    raw[8..10].copy_from_slice(&[0xe8, 0x03]);
    raw[16] = 16;

    let reply = Reply::decode(&raw);
    assert_eq!(reply.result, 1);
    assert_eq!(reply.elapsed_ns, 1000);
    assert_eq!(reply.sonar_len, 16);
    assert_eq!(reply.encode(), raw);
}
