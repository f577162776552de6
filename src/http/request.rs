// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    http::HTTP_HEADERS_MAX,
    runtime::{
        fail::Fail,
        memory::{MemBuf, Span},
    },
};
use ::arrayvec::ArrayVec;

//==============================================================================
// Constants
//==============================================================================

/// Initial request arena capacity, sized to hold a large upload body without
/// growing in the common case.
const REQUEST_ARENA_SIZE: usize = 5_000_000;

//==============================================================================
// Structures
//==============================================================================

/// Outcome of a header parse attempt over the bytes buffered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// Header section complete; value is its length in bytes from the start
    /// of the arena.
    Complete(usize),
    /// More bytes needed.
    Partial,
}

/// A parsed (or in-progress) HTTP request.
///
/// All parsed fields are offset spans into `mem`, never addresses, so they
/// survive arena growth and can be copied across processes together with the
/// arena contents.
#[derive(Debug)]
pub struct Request {
    pub mem: MemBuf,
    pub minor_version: u8,
    pub method: Span,
    pub path: Span,
    pub headers: ArrayVec<(Span, Span), HTTP_HEADERS_MAX>,
    pub body: Span,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Request {
    pub fn new() -> Self {
        Self {
            mem: MemBuf::new(REQUEST_ARENA_SIZE),
            minor_version: 0,
            method: Span::new(0, 0),
            path: Span::new(0, 0),
            headers: ArrayVec::new(),
            body: Span::new(0, 0),
        }
    }

    /// Rewinds the arena and clears all spans, yielding a state equivalent to
    /// a freshly constructed request.
    pub fn reset(&mut self) {
        self.mem.reset();
        self.minor_version = 0;
        self.method = Span::new(0, 0);
        self.path = Span::new(0, 0);
        self.headers.clear();
        self.body = Span::new(0, 0);
    }

    /// Attempts to parse a complete request line and header section from the
    /// buffered bytes. An incomplete request is not an error; a malformed one
    /// is, and the caller closes the connection.
    pub fn parse(&mut self) -> Result<ParseResult, Fail> {
        let mut headers = [httparse::EMPTY_HEADER; HTTP_HEADERS_MAX];
        let mut parsed = httparse::Request::new(&mut headers);
        let nparsed: usize = match parsed.parse(self.mem.filled()) {
            Ok(httparse::Status::Complete(nparsed)) => nparsed,
            Ok(httparse::Status::Partial) => return Ok(ParseResult::Partial),
            Err(_) => return Err(Fail::new(libc::EBADMSG, "malformed http request")),
        };

        let method: &str = parsed
            .method
            .ok_or_else(|| Fail::new(libc::EBADMSG, "missing http method"))?;
        let path: &str = parsed
            .path
            .ok_or_else(|| Fail::new(libc::EBADMSG, "missing http path"))?;
        let minor_version: u8 = parsed.version.unwrap_or(0);
        let method: Span = self.mem.span_of(method.as_bytes());
        let path: Span = self.mem.span_of(path.as_bytes());

        self.headers.clear();
        for h in parsed.headers.iter() {
            let name: Span = self.mem.span_of(h.name.as_bytes());
            let value: Span = self.mem.span_of(h.value);
            self.headers.push((name, value));
        }

        self.minor_version = minor_version;
        self.method = method;
        self.path = path;
        Ok(ParseResult::Complete(nparsed))
    }

    /// Looks up a header by case-insensitive name.
    pub fn find_header(&self, name: &str) -> Option<&[u8]> {
        for (name_span, value_span) in self.headers.iter() {
            if self.mem.resolve(*name_span).eq_ignore_ascii_case(name.as_bytes()) {
                return Some(self.mem.resolve(*value_span));
            }
        }
        None
    }

    /// Declared body length from `Content-Length`. Absent or unclean values
    /// mean no body.
    pub fn determine_body_len(&self) -> u64 {
        let value: &[u8] = match self.find_header("Content-Length") {
            Some(value) => value,
            None => return 0,
        };
        match std::str::from_utf8(value) {
            Ok(s) => s.trim().parse::<u64>().unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub fn method(&self) -> &[u8] {
        self.mem.resolve(self.method)
    }

    pub fn path(&self) -> &[u8] {
        self.mem.resolve(self.path)
    }

    pub fn body(&self) -> &[u8] {
        self.mem.resolve(self.body)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{ParseResult, Request};

    fn feed(req: &mut Request, bytes: &[u8]) {
        req.mem.push(bytes);
    }

    #[test]
    fn test_parse_complete() {
        let mut req = Request::new();
        feed(&mut req, b"GET /42 HTTP/1.1\r\nHost: example\r\n\r\n");
        match req.parse().unwrap() {
            ParseResult::Complete(n) => assert_eq!(n, req.mem.used()),
            ParseResult::Partial => panic!("expected complete parse"),
        }
        assert_eq!(req.method(), b"GET");
        assert_eq!(req.path(), b"/42");
        assert_eq!(req.minor_version, 1);
        assert_eq!(req.find_header("host").unwrap(), b"example");
    }

    #[test]
    fn test_parse_partial() {
        let mut req = Request::new();
        feed(&mut req, b"GET /42 HTTP/1.1\r\nHost: exa");
        assert_eq!(req.parse().unwrap(), ParseResult::Partial);
        feed(&mut req, b"mple\r\n\r\n");
        assert!(matches!(req.parse().unwrap(), ParseResult::Complete(_)));
        assert_eq!(req.path(), b"/42");
    }

    #[test]
    fn test_parse_malformed() {
        let mut req = Request::new();
        feed(&mut req, b"\0garbage\r\n\r\n");
        assert!(req.parse().is_err());
    }

    #[test]
    fn test_body_len() {
        let mut req = Request::new();
        feed(&mut req, b"PUT /obj HTTP/1.1\r\nContent-Length: 13\r\n\r\n");
        req.parse().unwrap();
        assert_eq!(req.determine_body_len(), 13);
    }

    #[test]
    fn test_body_len_unclean() {
        let mut req = Request::new();
        feed(&mut req, b"PUT /obj HTTP/1.1\r\nContent-Length: 12abc\r\n\r\n");
        req.parse().unwrap();
        assert_eq!(req.determine_body_len(), 0);

        let mut req = Request::new();
        feed(&mut req, b"GET / HTTP/1.1\r\n\r\n");
        req.parse().unwrap();
        assert_eq!(req.determine_body_len(), 0);
    }

    #[test]
    fn test_reset_is_fresh() {
        let mut req = Request::new();
        feed(&mut req, b"GET /x HTTP/1.1\r\nA: b\r\n\r\n");
        req.parse().unwrap();
        req.reset();
        assert_eq!(req.mem.used(), 0);
        assert!(req.headers.is_empty());
        assert!(req.method.is_empty());
        assert!(req.path.is_empty());
        assert!(req.body.is_empty());
    }
}
