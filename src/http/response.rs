// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    http::HTTP_HEADERS_MAX,
    runtime::{
        fail::Fail,
        memory::MemBuf,
    },
};
use ::arrayvec::ArrayVec;
use ::std::net::SocketAddrV4;

//==============================================================================
// Constants
//==============================================================================

/// Initial head arena capacity. Status line plus headers fit comfortably.
const HEAD_ARENA_SIZE: usize = 4096;

/// Initial body arena capacity.
const BODY_ARENA_SIZE: usize = 5_000_000;

const SERVER_HEADER: &str = "Server: phttp\r\n";

//==============================================================================
// Structures
//==============================================================================

/// Destination of a requested handoff, set by the handler alongside the
/// handoff status. Pointer-free so it can ride inside a serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffTarget {
    pub addr: SocketAddrV4,
}

/// An HTTP response under construction by a handler.
#[derive(Debug)]
pub struct Response {
    pub mem: MemBuf,
    pub body: MemBuf,
    pub status: u16,
    pub reason: &'static str,
    pub headers: ArrayVec<(String, String), HTTP_HEADERS_MAX>,
    pub handoff: Option<HandoffTarget>,
    /// Marks this response as a preliminary signal; only the status line is
    /// sent and the request state survives for the real response.
    pub continuation: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Response {
    pub fn new() -> Self {
        Self {
            mem: MemBuf::new(HEAD_ARENA_SIZE),
            body: MemBuf::new(BODY_ARENA_SIZE),
            status: 0,
            reason: "Uninitialized",
            headers: ArrayVec::new(),
            handoff: None,
            continuation: false,
        }
    }

    pub fn reset(&mut self) {
        self.mem.reset();
        self.body.reset();
        self.status = 0;
        self.reason = "Uninitialized";
        self.headers.clear();
        self.handoff = None;
        self.continuation = false;
    }

    pub fn set_status(&mut self, status: u16, reason: &'static str) {
        self.status = status;
        self.reason = reason;
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), Fail> {
        if self.headers.is_full() {
            return Err(Fail::new(libc::EBUSY, "response header table full"));
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Serializes the response head into the head arena. A continuation
    /// response is a bare status line used as a preliminary signal; the full
    /// form carries the server header, a computed `Content-Length`, and the
    /// handler-supplied headers.
    pub fn serialize_head(&mut self, continuation: bool) {
        let mut head: String = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        if !continuation {
            head.push_str(SERVER_HEADER);
            head.push_str(&format!("Content-Length: {}\r\n", self.body.used()));
            for (name, value) in self.headers.iter() {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        head.push_str("\r\n");
        self.mem.push(head.as_bytes());
    }

    pub fn head(&self) -> &[u8] {
        self.mem.filled()
    }

    pub fn body_bytes(&self) -> &[u8] {
        self.body.filled()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::Response;

    #[test]
    fn test_serialize_full() {
        let mut res = Response::new();
        res.set_status(200, "OK");
        res.add_header("X-Test", "yes").unwrap();
        res.body.push(b"hello");
        res.serialize_head(false);
        let head = std::str::from_utf8(res.head()).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Server: phttp\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("X-Test: yes\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_serialize_continuation() {
        let mut res = Response::new();
        res.set_status(100, "Continue");
        res.serialize_head(true);
        assert_eq!(res.head(), b"HTTP/1.1 100 Continue\r\n\r\n");
    }

    #[test]
    fn test_header_table_full() {
        let mut res = Response::new();
        for i in 0..super::HTTP_HEADERS_MAX {
            res.add_header(&format!("H{}", i), "v").unwrap();
        }
        assert!(res.add_header("overflow", "v").is_err());
    }

    #[test]
    fn test_reset_is_fresh() {
        let mut res = Response::new();
        res.set_status(200, "OK");
        res.body.push(b"x");
        res.serialize_head(false);
        res.reset();
        assert_eq!(res.status, 0);
        assert_eq!(res.mem.used(), 0);
        assert_eq!(res.body.used(), 0);
        assert!(res.headers.is_empty());
        assert!(res.handoff.is_none());
    }
}
