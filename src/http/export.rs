// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    http::{
        request::Request,
        HTTP_HEADERS_MAX,
    },
    runtime::{
        fail::Fail,
        memory::Span,
    },
};
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};
use ::libc::EBADMSG;

//==============================================================================
// Structures
//==============================================================================

//
//  Serialized request format:
//
//  Offset  Size    Data
//  0       4       Arena Length (L)
//  4       L       Arena Bytes
//  4+L     1       Minor Version
//  5+L     4       Method Offset
//  9+L     4       Method Length
//  13+L    4       Path Offset
//  17+L    4       Path Length
//  21+L    4       Body Offset
//  25+L    4       Body Length
//  29+L    1       Header Count (N)
//  30+L    16*N    Header Spans (name offset/length, value offset/length)
//

/// A pointer-free copy of a parsed request: the raw arena bytes plus every
/// parsed field expressed as an offset span into that copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReqState {
    pub buf: Vec<u8>,
    pub minor_version: u8,
    pub method: Span,
    pub path: Span,
    pub body: Span,
    pub headers: Vec<(Span, Span)>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl HttpReqState {
    /// Flattens a parsed request. Spans carry over verbatim since they were
    /// already offsets into the request's own arena.
    pub fn export(req: &Request) -> Self {
        Self {
            buf: req.mem.filled().to_vec(),
            minor_version: req.minor_version,
            method: req.method,
            path: req.path,
            body: req.body,
            headers: req.headers.iter().copied().collect(),
        }
    }

    /// Reconstructs a request in `req`'s arena from a flattened copy.
    pub fn import(&self, req: &mut Request) -> Result<(), Fail> {
        if self.headers.len() > HTTP_HEADERS_MAX {
            return Err(Fail::new(EBADMSG, "imported request has too many headers"));
        }
        req.reset();
        req.mem.push(&self.buf);
        req.minor_version = self.minor_version;
        req.method = self.method;
        req.path = self.path;
        req.body = self.body;
        req.headers.clear();
        for spans in self.headers.iter() {
            req.headers.push(*spans);
        }
        Ok(())
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.buf.len() + 1 + 6 * 4 + 1 + 16 * self.headers.len()
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        let mut scratch: [u8; 4] = [0; 4];
        NetworkEndian::write_u32(&mut scratch, self.buf.len() as u32);
        out.extend_from_slice(&scratch);
        out.extend_from_slice(&self.buf);
        out.push(self.minor_version);
        write_span(out, self.method);
        write_span(out, self.path);
        write_span(out, self.body);
        out.push(self.headers.len() as u8);
        for (name, value) in self.headers.iter() {
            write_span(out, *name);
            write_span(out, *value);
        }
    }

    /// Parses one serialized request, returning it and the unconsumed tail.
    pub fn parse_from_slice(buf: &[u8]) -> Result<(Self, &[u8]), Fail> {
        if buf.len() < 4 {
            return Err(Fail::new(EBADMSG, "serialized request too small"));
        }
        let buf_len: usize = NetworkEndian::read_u32(&buf[0..4]) as usize;
        let fixed_end: usize = 4 + buf_len + 1 + 6 * 4 + 1;
        if buf.len() < fixed_end {
            return Err(Fail::new(EBADMSG, "serialized request truncated"));
        }
        let arena: Vec<u8> = buf[4..4 + buf_len].to_vec();
        let mut at: usize = 4 + buf_len;
        let minor_version: u8 = buf[at];
        at += 1;
        let method: Span = read_span(buf, &mut at);
        let path: Span = read_span(buf, &mut at);
        let body: Span = read_span(buf, &mut at);
        let nheaders: usize = buf[at] as usize;
        at += 1;
        if nheaders > HTTP_HEADERS_MAX {
            return Err(Fail::new(EBADMSG, "serialized request has too many headers"));
        }
        if buf.len() < at + 16 * nheaders {
            return Err(Fail::new(EBADMSG, "serialized request truncated"));
        }
        let mut headers: Vec<(Span, Span)> = Vec::with_capacity(nheaders);
        for _ in 0..nheaders {
            let name: Span = read_span(buf, &mut at);
            let value: Span = read_span(buf, &mut at);
            headers.push((name, value));
        }

        let state: Self = Self {
            buf: arena,
            minor_version,
            method,
            path,
            body,
            headers,
        };
        state.check_bounds()?;
        Ok((state, &buf[at..]))
    }

    // Every span must land inside the copied arena before anything resolves
    // against it.
    fn check_bounds(&self) -> Result<(), Fail> {
        let len: u64 = self.buf.len() as u64;
        let spans = [self.method, self.path, self.body];
        let all = spans.iter().chain(self.headers.iter().flat_map(|(n, v)| [n, v]));
        for span in all {
            if span.off as u64 + span.len as u64 > len {
                return Err(Fail::new(EBADMSG, "span out of arena bounds"));
            }
        }
        Ok(())
    }
}

//==============================================================================
// Functions
//==============================================================================

fn write_span(out: &mut Vec<u8>, span: Span) {
    let mut scratch: [u8; 8] = [0; 8];
    NetworkEndian::write_u32(&mut scratch[0..4], span.off);
    NetworkEndian::write_u32(&mut scratch[4..8], span.len);
    out.extend_from_slice(&scratch);
}

fn read_span(buf: &[u8], at: &mut usize) -> Span {
    let off: u32 = NetworkEndian::read_u32(&buf[*at..*at + 4]);
    let len: u32 = NetworkEndian::read_u32(&buf[*at + 4..*at + 8]);
    *at += 8;
    Span::new(off, len)
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::HttpReqState;
    use crate::http::request::Request;

    fn parsed_request() -> Request {
        let mut req = Request::new();
        req.mem.push(b"GET /42 HTTP/1.1\r\nHost: example\r\n\r\n");
        req.parse().unwrap();
        req
    }

    #[test]
    fn test_export_import_preserves_fields() {
        let req = parsed_request();
        let state = HttpReqState::export(&req);

        let mut rebuilt = Request::new();
        state.import(&mut rebuilt).unwrap();
        assert_eq!(rebuilt.method(), b"GET");
        assert_eq!(rebuilt.path(), b"/42");
        assert_eq!(rebuilt.minor_version, 1);
        assert_eq!(rebuilt.find_header("Host").unwrap(), b"example");
    }

    #[test]
    fn test_wire_round_trip() {
        let state = HttpReqState::export(&parsed_request());
        let mut wire: Vec<u8> = Vec::new();
        state.serialize_into(&mut wire);
        assert_eq!(wire.len(), state.serialized_size());

        let (decoded, rest) = HttpReqState::parse_from_slice(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_parse_rejects_bad_span() {
        let state = HttpReqState::export(&parsed_request());
        let mut wire: Vec<u8> = Vec::new();
        state.serialize_into(&mut wire);
        // Corrupt the method length field, just past the arena and version.
        let at = 4 + state.buf.len() + 1 + 4;
        wire[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(HttpReqState::parse_from_slice(&wire).is_err());
    }

    #[test]
    fn test_parse_truncated() {
        let state = HttpReqState::export(&parsed_request());
        let mut wire: Vec<u8> = Vec::new();
        state.serialize_into(&mut wire);
        assert!(HttpReqState::parse_from_slice(&wire[..wire.len() - 1]).is_err());
    }
}
