// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    runtime::{
        fail::Fail,
        socket::SocketFd,
    },
    tcp::repair::{
        self,
        TcpInfoSub,
        TcpRepairWindow,
        TCP_RECV_QUEUE,
        TCP_SEND_QUEUE,
    },
};
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};
use ::libc::EBADMSG;
use ::std::net::{
    Ipv4Addr,
    SocketAddrV4,
};

//==============================================================================
// Constants
//==============================================================================

/// Size of the fixed portion of a serialized connection state (in bytes).
const TCP_STATE_FIXED_SIZE: usize = 62;

//==============================================================================
// Structures
//==============================================================================

//
//  Serialized connection state format:
//
//  Offset  Size    Data
//  0       4       Self IP
//  4       2       Self Port
//  6       4       Peer IP
//  10      2       Peer Port
//  12      4       Send Sequence
//  16      4       Receive Sequence
//  20      4       MSS
//  24      1       Send Window Scale
//  25      1       Receive Window Scale
//  26      4       Timestamp
//  30      4       Snd Wl1
//  34      4       Snd Wnd
//  38      4       Max Window
//  42      4       Rcv Wnd
//  46      4       Rcv Wup
//  50      4       Send Queue Length (S)
//  54      4       Unsent Length
//  58      4       Receive Queue Length (R)
//  62      S       Send Queue Bytes
//  62+S    R       Receive Queue Bytes
//
//  TOTAL 62 + S + R
//

/// A captured TCP connection: everything needed to rebuild the same
/// established 4-tuple in another process without a handshake.
///
/// The send queue holds both parts of the write buffer in one run of bytes;
/// `unsent_len` marks where the sent-but-unacknowledged prefix ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpState {
    pub self_addr: SocketAddrV4,
    pub peer_addr: SocketAddrV4,
    pub snd_seq: u32,
    pub rcv_seq: u32,
    pub mss: u32,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    pub timestamp: u32,
    pub window: TcpWindow,
    pub sendq: Vec<u8>,
    pub unsent_len: u32,
    pub recvq: Vec<u8>,
}

/// Window parameters captured from TCP_REPAIR_WINDOW.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpWindow {
    pub snd_wl1: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    pub rcv_wnd: u32,
    pub rcv_wup: u32,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl TcpState {
    /// Length of the sent-but-unacknowledged prefix of the send queue.
    pub fn sent_len(&self) -> usize {
        self.sendq.len() - self.unsent_len as usize
    }

    /// Captures the full connection state of an established socket.
    ///
    /// The socket must be quiescent and owned exclusively by the caller; no
    /// other operation may touch it until this returns. On success repair
    /// mode stays on so dropping the socket afterwards does not emit a FIN
    /// towards the peer. On failure repair mode is switched back off so the
    /// connection dies with an ordinary reset the peer can observe.
    pub fn export(sock: &SocketFd) -> Result<Self, Fail> {
        let fd = sock.raw();
        repair::repair_on(fd)?;
        match Self::export_in_repair(sock) {
            Ok(state) => Ok(state),
            Err(e) => {
                repair::repair_off_best_effort(fd);
                Err(e)
            },
        }
    }

    fn export_in_repair(sock: &SocketFd) -> Result<Self, Fail> {
        let fd = sock.raw();
        let info: TcpInfoSub = repair::established_info(fd)?;
        let (sendq_len, unsent_len, recvq_len) = repair::queue_lengths(fd)?;
        let mss: u32 = repair::get_mss(fd)?;
        let timestamp: u32 = repair::get_timestamp(fd)?;
        let w: TcpRepairWindow = repair::get_window(fd)?;
        let self_addr: SocketAddrV4 = sock.local_addr()?;
        let peer_addr: SocketAddrV4 = sock.peer_addr()?;

        repair::select_queue(fd, TCP_SEND_QUEUE)?;
        let snd_seq: u32 = repair::get_queue_seq(fd)?;
        let sendq: Vec<u8> = repair::peek_queue(fd, sendq_len as usize)?;

        repair::select_queue(fd, TCP_RECV_QUEUE)?;
        let rcv_seq: u32 = repair::get_queue_seq(fd)?;
        let recvq: Vec<u8> = repair::peek_queue(fd, recvq_len as usize)?;

        Ok(Self {
            self_addr,
            peer_addr,
            snd_seq,
            rcv_seq,
            mss,
            snd_wscale: info.snd_wscale(),
            rcv_wscale: info.rcv_wscale(),
            timestamp,
            window: TcpWindow {
                snd_wl1: w.snd_wl1,
                snd_wnd: w.snd_wnd,
                max_window: w.max_window,
                rcv_wnd: w.rcv_wnd,
                rcv_wup: w.rcv_wup,
            },
            sendq,
            unsent_len,
            recvq,
        })
    }

    /// Rebuilds this connection on a fresh socket. On failure the socket must
    /// be discarded, never registered with a connection object.
    pub fn import(&self, sock: &SocketFd) -> Result<(), Fail> {
        let fd = sock.raw();
        if self.unsent_len as usize > self.sendq.len() {
            return Err(Fail::new(libc::EINVAL, "unsent length exceeds send queue"));
        }
        repair::repair_on(fd)?;
        match self.import_in_repair(sock) {
            Ok(()) => repair::repair_off(fd),
            Err(e) => {
                repair::repair_off_best_effort(fd);
                Err(e)
            },
        }
    }

    fn import_in_repair(&self, sock: &SocketFd) -> Result<(), Fail> {
        let fd = sock.raw();

        repair::select_queue(fd, TCP_SEND_QUEUE)?;
        repair::set_queue_seq(fd, self.snd_seq)?;
        repair::select_queue(fd, TCP_RECV_QUEUE)?;
        repair::set_queue_seq(fd, self.rcv_seq)?;

        // Rebuild the 4-tuple. In repair mode connect() installs the peer
        // without any packets on the wire.
        sock.bind(self.self_addr)?;
        sock.connect(self.peer_addr)?;

        self.replay_send_queue(fd)?;
        self.replay_recv_queue(fd)?;

        repair::set_repair_options(fd, self.mss, self.snd_wscale, self.rcv_wscale)?;
        repair::set_timestamp(fd, self.timestamp)?;

        let window: TcpRepairWindow = TcpRepairWindow {
            snd_wl1: self.window.snd_wl1,
            snd_wnd: self.window.snd_wnd,
            max_window: self.window.max_window,
            rcv_wnd: self.window.rcv_wnd,
            rcv_wup: self.window.rcv_wup,
        };
        repair::set_window(fd, &window)?;
        Ok(())
    }

    // The write buffer splits into sent-but-unacknowledged data and unsent
    // data. The stack must learn which bytes were already on the wire, since
    // acknowledgements can arrive for them; those are restored under repair
    // mode. The unsent remainder has never left this host and is pushed as
    // an ordinary send with repair mode temporarily off.
    fn replay_send_queue(&self, fd: libc::c_int) -> Result<(), Fail> {
        let sent_len: usize = self.sent_len();
        if sent_len > 0 {
            repair::select_queue(fd, TCP_SEND_QUEUE)?;
            repair::replay_queue(fd, &self.sendq[..sent_len])?;
        }
        if self.unsent_len > 0 {
            repair::repair_off(fd)?;
            let result: Result<(), Fail> = repair::replay_queue(fd, &self.sendq[sent_len..]);
            repair::repair_on(fd)?;
            result?;
        }
        Ok(())
    }

    fn replay_recv_queue(&self, fd: libc::c_int) -> Result<(), Fail> {
        if self.recvq.is_empty() {
            return Ok(());
        }
        repair::select_queue(fd, TCP_RECV_QUEUE)?;
        repair::replay_queue(fd, &self.recvq)
    }

    pub fn serialized_size(&self) -> usize {
        TCP_STATE_FIXED_SIZE + self.sendq.len() + self.recvq.len()
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        let mut fixed: [u8; TCP_STATE_FIXED_SIZE] = [0; TCP_STATE_FIXED_SIZE];
        fixed[0..4].copy_from_slice(&self.self_addr.ip().octets());
        NetworkEndian::write_u16(&mut fixed[4..6], self.self_addr.port());
        fixed[6..10].copy_from_slice(&self.peer_addr.ip().octets());
        NetworkEndian::write_u16(&mut fixed[10..12], self.peer_addr.port());
        NetworkEndian::write_u32(&mut fixed[12..16], self.snd_seq);
        NetworkEndian::write_u32(&mut fixed[16..20], self.rcv_seq);
        NetworkEndian::write_u32(&mut fixed[20..24], self.mss);
        fixed[24] = self.snd_wscale;
        fixed[25] = self.rcv_wscale;
        NetworkEndian::write_u32(&mut fixed[26..30], self.timestamp);
        NetworkEndian::write_u32(&mut fixed[30..34], self.window.snd_wl1);
        NetworkEndian::write_u32(&mut fixed[34..38], self.window.snd_wnd);
        NetworkEndian::write_u32(&mut fixed[38..42], self.window.max_window);
        NetworkEndian::write_u32(&mut fixed[42..46], self.window.rcv_wnd);
        NetworkEndian::write_u32(&mut fixed[46..50], self.window.rcv_wup);
        NetworkEndian::write_u32(&mut fixed[50..54], self.sendq.len() as u32);
        NetworkEndian::write_u32(&mut fixed[54..58], self.unsent_len);
        NetworkEndian::write_u32(&mut fixed[58..62], self.recvq.len() as u32);
        out.extend_from_slice(&fixed);
        out.extend_from_slice(&self.sendq);
        out.extend_from_slice(&self.recvq);
    }

    /// Parses one serialized connection state, returning it and the
    /// unconsumed tail.
    pub fn parse_from_slice(buf: &[u8]) -> Result<(Self, &[u8]), Fail> {
        if buf.len() < TCP_STATE_FIXED_SIZE {
            return Err(Fail::new(EBADMSG, "serialized connection state too small"));
        }
        let sendq_len: usize = NetworkEndian::read_u32(&buf[50..54]) as usize;
        let unsent_len: u32 = NetworkEndian::read_u32(&buf[54..58]);
        let recvq_len: usize = NetworkEndian::read_u32(&buf[58..62]) as usize;
        if unsent_len as usize > sendq_len {
            return Err(Fail::new(EBADMSG, "unsent length exceeds send queue"));
        }
        let total: usize = TCP_STATE_FIXED_SIZE + sendq_len + recvq_len;
        if buf.len() < total {
            return Err(Fail::new(EBADMSG, "serialized connection state truncated"));
        }

        let self_addr = SocketAddrV4::new(
            Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            NetworkEndian::read_u16(&buf[4..6]),
        );
        let peer_addr = SocketAddrV4::new(
            Ipv4Addr::new(buf[6], buf[7], buf[8], buf[9]),
            NetworkEndian::read_u16(&buf[10..12]),
        );

        let state: Self = Self {
            self_addr,
            peer_addr,
            snd_seq: NetworkEndian::read_u32(&buf[12..16]),
            rcv_seq: NetworkEndian::read_u32(&buf[16..20]),
            mss: NetworkEndian::read_u32(&buf[20..24]),
            snd_wscale: buf[24],
            rcv_wscale: buf[25],
            timestamp: NetworkEndian::read_u32(&buf[26..30]),
            window: TcpWindow {
                snd_wl1: NetworkEndian::read_u32(&buf[30..34]),
                snd_wnd: NetworkEndian::read_u32(&buf[34..38]),
                max_window: NetworkEndian::read_u32(&buf[38..42]),
                rcv_wnd: NetworkEndian::read_u32(&buf[42..46]),
                rcv_wup: NetworkEndian::read_u32(&buf[46..50]),
            },
            sendq: buf[TCP_STATE_FIXED_SIZE..TCP_STATE_FIXED_SIZE + sendq_len].to_vec(),
            unsent_len,
            recvq: buf[TCP_STATE_FIXED_SIZE + sendq_len..total].to_vec(),
        };
        Ok((state, &buf[total..]))
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{TcpState, TcpWindow};
    use crate::runtime::socket::SocketFd;
    use ::std::{
        io::Read,
        net::{SocketAddrV4, TcpListener, TcpStream},
        os::unix::io::IntoRawFd,
        str::FromStr,
    };

    pub fn sample_state() -> TcpState {
        TcpState {
            self_addr: SocketAddrV4::from_str("10.0.1.8:10000").unwrap(),
            peer_addr: SocketAddrV4::from_str("10.0.1.9:45678").unwrap(),
            snd_seq: 0x1000_0000,
            rcv_seq: 0x2000_0000,
            mss: 1460,
            snd_wscale: 7,
            rcv_wscale: 7,
            timestamp: 12345678,
            window: TcpWindow {
                snd_wl1: 1,
                snd_wnd: 65535,
                max_window: 65535,
                rcv_wnd: 65535,
                rcv_wup: 2,
            },
            sendq: b"sent-part-unsent-part".to_vec(),
            unsent_len: 11,
            recvq: b"queued request bytes".to_vec(),
        }
    }

    #[test]
    fn test_split_invariant() {
        let state = sample_state();
        assert_eq!(state.sent_len() + state.unsent_len as usize, state.sendq.len());
        assert_eq!(&state.sendq[..state.sent_len()], b"sent-part-");
        assert_eq!(&state.sendq[state.sent_len()..], b"unsent-part");
    }

    // A failed export must leave the socket out of repair mode so that an
    // ordinary close still reaches the peer. Forced past the established
    // check by exporting a socket already in CLOSE_WAIT. Needs repair-mode
    // privileges; bails out where repair itself is refused.
    #[test]
    fn test_export_failure_leaves_repair_mode() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        drop(accepted);

        // Blocking read returns zero once the peer's FIN is processed, so
        // the socket has left the established state.
        let mut client = client;
        let mut scratch: [u8; 1] = [0; 1];
        assert_eq!(client.read(&mut scratch).unwrap(), 0);

        let sock: SocketFd = SocketFd::from_raw(client.into_raw_fd());
        match TcpState::export(&sock) {
            Err(e) if e.errno == libc::EPERM => return,
            Err(_) => {},
            Ok(_) => panic!("export of a half-closed socket succeeded"),
        }

        // In repair mode a send with no queue selected is rejected; out of
        // repair mode a half-closed socket still accepts writes.
        let nwritten = unsafe { libc::write(sock.raw(), b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(nwritten, 1);
    }

    #[test]
    fn test_wire_round_trip() {
        let state = sample_state();
        let mut wire: Vec<u8> = Vec::new();
        state.serialize_into(&mut wire);
        assert_eq!(wire.len(), state.serialized_size());

        let (decoded, rest) = TcpState::parse_from_slice(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_parse_truncated() {
        let state = sample_state();
        let mut wire: Vec<u8> = Vec::new();
        state.serialize_into(&mut wire);
        for cut in [0, 10, super::TCP_STATE_FIXED_SIZE, wire.len() - 1] {
            assert!(TcpState::parse_from_slice(&wire[..cut]).is_err());
        }
    }

    #[test]
    fn test_parse_rejects_bad_split() {
        let state = sample_state();
        let mut wire: Vec<u8> = Vec::new();
        state.serialize_into(&mut wire);
        // Claim more unsent bytes than the whole send queue.
        wire[54..58].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(TcpState::parse_from_slice(&wire).is_err());
    }
}
