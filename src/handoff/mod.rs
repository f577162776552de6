// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod channel;
pub mod frame;

//==============================================================================
// Imports
//==============================================================================

use crate::{
    http::export::HttpReqState,
    runtime::fail::Fail,
    tcp::transplant::TcpState,
    tls::TlsState,
};
use ::libc::EBADMSG;

pub use self::channel::HandoffChannel;

//==============================================================================
// Constants
//==============================================================================

const FLAG_HAS_TLS: u8 = 1 << 0;

//==============================================================================
// Structures
//==============================================================================

//
//  Serialized record format:
//
//  Offset  Size    Data
//  0       1       Flags (bit 0: TLS state present)
//  1       ...     Connection State
//  ...     ...     Session State (only when flagged)
//  ...     ...     Request State
//

/// Everything one connection needs to continue elsewhere: the raw TCP state,
/// the TLS session when the connection is encrypted, and the parsed request.
/// Consumed exactly once by the receiving process, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRecord {
    pub tcp: TcpState,
    pub tls: Option<TlsState>,
    pub http: HttpReqState,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl HandoffRecord {
    pub fn serialized_size(&self) -> usize {
        1 + self.tcp.serialized_size()
            + self.tls.as_ref().map_or(0, |tls| tls.serialized_size())
            + self.http.serialized_size()
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        let flags: u8 = if self.tls.is_some() { FLAG_HAS_TLS } else { 0 };
        out.push(flags);
        self.tcp.serialize_into(out);
        if let Some(tls) = &self.tls {
            tls.serialize_into(out);
        }
        self.http.serialize_into(out);
    }

    pub fn parse_from_slice(buf: &[u8]) -> Result<(Self, &[u8]), Fail> {
        if buf.is_empty() {
            return Err(Fail::new(EBADMSG, "empty handoff record"));
        }
        let flags: u8 = buf[0];
        if flags & !FLAG_HAS_TLS != 0 {
            return Err(Fail::new(EBADMSG, "unknown handoff record flags"));
        }
        let (tcp, rest) = TcpState::parse_from_slice(&buf[1..])?;
        let (tls, rest) = if flags & FLAG_HAS_TLS != 0 {
            let (tls, rest) = TlsState::parse_from_slice(rest)?;
            (Some(tls), rest)
        } else {
            (None, rest)
        };
        let (http, rest) = HttpReqState::parse_from_slice(rest)?;
        Ok((Self { tcp, tls, http }, rest))
    }

    /// Serializes and frames the record for the handoff channel.
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = Vec::with_capacity(self.serialized_size());
        self.serialize_into(&mut payload);
        let mut wire: Vec<u8> = Vec::with_capacity(frame::frame_size(payload.len()));
        frame::encode_into(&mut wire, &payload);
        wire
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
pub(crate) mod test {
    use super::HandoffRecord;
    use crate::{
        http::{export::HttpReqState, request::Request},
        tcp::transplant::{TcpState, TcpWindow},
        tls::TlsState,
    };
    use ::std::{net::SocketAddrV4, str::FromStr};

    pub fn sample_record(with_tls: bool) -> HandoffRecord {
        let mut req = Request::new();
        req.mem.push(b"GET /42 HTTP/1.1\r\nHost: example\r\n\r\n");
        req.parse().unwrap();

        HandoffRecord {
            tcp: TcpState {
                self_addr: SocketAddrV4::from_str("10.0.1.8:10000").unwrap(),
                peer_addr: SocketAddrV4::from_str("10.0.1.9:45678").unwrap(),
                snd_seq: 1000,
                rcv_seq: 2000,
                mss: 1460,
                snd_wscale: 7,
                rcv_wscale: 2,
                timestamp: 777,
                window: TcpWindow::default(),
                sendq: b"queued".to_vec(),
                unsent_len: 2,
                recvq: Vec::new(),
            },
            tls: if with_tls {
                Some(TlsState {
                    buf: b"opaque-session".to_vec(),
                })
            } else {
                None
            },
            http: HttpReqState::export(&req),
        }
    }

    #[test]
    fn test_record_round_trip_plain() {
        let record = sample_record(false);
        let mut wire: Vec<u8> = Vec::new();
        record.serialize_into(&mut wire);
        assert_eq!(wire.len(), record.serialized_size());
        let (decoded, rest) = HandoffRecord::parse_from_slice(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_round_trip_tls() {
        let record = sample_record(true);
        let mut wire: Vec<u8> = Vec::new();
        record.serialize_into(&mut wire);
        let (decoded, _) = HandoffRecord::parse_from_slice(&wire).unwrap();
        assert_eq!(decoded.tls, record.tls);
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decoded_request_matches_origin() {
        let record = sample_record(false);
        let (decoded, _) = HandoffRecord::parse_from_slice(&{
            let mut wire = Vec::new();
            record.serialize_into(&mut wire);
            wire
        })
        .unwrap();

        let mut rebuilt = Request::new();
        decoded.http.import(&mut rebuilt).unwrap();
        assert_eq!(rebuilt.method(), b"GET");
        assert_eq!(rebuilt.path(), b"/42");
    }

    #[test]
    fn test_rejects_unknown_flags() {
        let record = sample_record(false);
        let mut wire: Vec<u8> = Vec::new();
        record.serialize_into(&mut wire);
        wire[0] |= 0x80;
        assert!(HandoffRecord::parse_from_slice(&wire).is_err());
    }
}
