// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use super::{
    Conn,
    ConnPhase,
    Entity,
    HttpServer,
    READ_GROW_SIZE,
    READ_LOW_WATER,
};
use crate::{
    handoff::{
        HandoffChannel,
        HandoffRecord,
    },
    http::{
        Handler,
        Request,
        Response,
        STATUS_HANDOFF,
    },
    monitor::SocketCloseMonitor,
    psw::{
        OwnerTriple,
        PswRequest,
    },
    runtime::{
        fail::Fail,
        Event,
        SocketFd,
        Timer,
        Token,
    },
    tcp::TcpState,
    tls::TlsSession,
};
use ::slab::Slab;
use ::std::{
    net::SocketAddrV4,
    os::unix::io::RawFd,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// Delay before retrying a refused channel connect.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connect attempts before the channel, and any records queued on it, are
/// dropped.
const CONNECT_RETRY_LIMIT: u32 = 10;

//==============================================================================
// Structures
//==============================================================================

/// One framed byte stream carrying serialized connections between two server
/// processes. Outbound channels are cached per target and reconnected with a
/// bounded retry; accepted ones live until the peer closes them.
pub(crate) struct ChannelConn {
    sock: Option<SocketFd>,
    /// Remote handoff address; `None` on accepted channels.
    target: Option<SocketAddrV4>,
    chan: HandoffChannel,
    out: Vec<u8>,
    out_at: usize,
    connecting: bool,
    retries: u32,
    retry_timer: Option<Timer>,
    timer_token: Option<Token>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ChannelConn {
    fn accepted(sock: SocketFd) -> Self {
        Self {
            sock: Some(sock),
            target: None,
            chan: HandoffChannel::new(),
            out: Vec::new(),
            out_at: 0,
            connecting: false,
            retries: 0,
            retry_timer: None,
            timer_token: None,
        }
    }

    fn outbound(sock: SocketFd, target: SocketAddrV4) -> Self {
        Self {
            sock: Some(sock),
            target: Some(target),
            chan: HandoffChannel::new(),
            out: Vec::new(),
            out_at: 0,
            connecting: true,
            retries: 0,
            retry_timer: None,
            timer_token: None,
        }
    }
}

impl<H: Handler> HttpServer<H> {
    //==========================================================================
    // Channel lifecycle
    //==========================================================================

    pub(crate) fn on_handoff_accept(&mut self, token: Token) -> Result<(), Fail> {
        loop {
            let accepted: Result<(SocketFd, SocketAddrV4), Fail> = match &self.entities[token] {
                Entity::HandoffListener(sock) => sock.accept(),
                _ => return Ok(()),
            };
            let (sock, peer): (SocketFd, SocketAddrV4) = match accepted {
                Ok(pair) => pair,
                Err(fail) if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK => {
                    return Ok(())
                },
                Err(fail) => return Err(fail),
            };
            trace!("handoff channel accepted from {}", peer);
            let fd: RawFd = sock.raw();
            let chan_token: Token = self
                .entities
                .insert(Entity::Channel(ChannelConn::accepted(sock)));
            if let Err(fail) = self.poller.register(fd, chan_token, true, false) {
                warn!("channel registration failed: {:?}", fail);
                self.entities.remove(chan_token);
            }
        }
    }

    /// The cached channel toward `target`, opening one if none exists. The
    /// connect is asynchronous; records queued meanwhile are flushed once it
    /// completes.
    pub(crate) fn ensure_channel(&mut self, target: SocketAddrV4) -> Result<Token, Fail> {
        if let Some(token) = self.channels.get(&target) {
            return Ok(*token);
        }
        let sock: SocketFd = SocketFd::tcp()?;
        sock.connect(target)?;
        let fd: RawFd = sock.raw();
        let token: Token = self
            .entities
            .insert(Entity::Channel(ChannelConn::outbound(sock, target)));
        if let Err(fail) = self.poller.register(fd, token, true, true) {
            self.entities.remove(token);
            return Err(fail);
        }
        self.channels.insert(target, token);
        trace!("handoff channel to {} opening", target);
        Ok(token)
    }

    /// Frames and queues a record on the channel toward `target`.
    pub(crate) fn send_record(
        &mut self,
        target: SocketAddrV4,
        record: &HandoffRecord,
    ) -> Result<(), Fail> {
        let token: Token = self.ensure_channel(target)?;
        let frame: Vec<u8> = record.encode_frame();
        let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
        chan.out.extend_from_slice(&frame);
        if chan.connecting {
            return Ok(());
        }
        self.flush_channel(token)
    }

    pub(crate) fn on_channel_event(&mut self, token: Token, ev: Event) -> Result<(), Fail> {
        let connecting: bool = chan_mut(&mut self.entities, token).connecting;
        if connecting {
            return self.on_channel_connected(token, ev);
        }
        if ev.error {
            return Err(Fail::new(libc::ECONNRESET, "channel error event"));
        }
        if ev.writable {
            self.flush_channel(token)?;
        }
        if ev.readable {
            self.on_channel_readable(token)?;
        }
        Ok(())
    }

    fn on_channel_connected(&mut self, token: Token, ev: Event) -> Result<(), Fail> {
        let err: libc::c_int = {
            let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
            let sock: &SocketFd = match &chan.sock {
                Some(sock) => sock,
                None => return Ok(()),
            };
            if ev.error || ev.writable {
                sock.take_error()?
            } else {
                return Ok(());
            }
        };
        if err == 0 {
            let (fd, has_pending): (Option<RawFd>, bool) = {
                let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
                chan.connecting = false;
                chan.retries = 0;
                (chan.sock.as_ref().map(|s| s.raw()), !chan.out.is_empty())
            };
            let fd: RawFd = match fd {
                Some(fd) => fd,
                None => return Ok(()),
            };
            trace!("handoff channel {} connected", token);
            self.poller.modify(fd, token, true, has_pending)?;
            if has_pending {
                self.flush_channel(token)?;
            }
            return Ok(());
        }
        if err == libc::ECONNREFUSED {
            return self.schedule_channel_retry(token);
        }
        Err(Fail::new(err, "channel connect failed"))
    }

    fn schedule_channel_retry(&mut self, token: Token) -> Result<(), Fail> {
        let retries: u32 = {
            let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
            chan.retries += 1;
            if let Some(sock) = chan.sock.take() {
                let _ = self.poller.deregister(sock.raw());
            }
            chan.retries
        };
        if retries > CONNECT_RETRY_LIMIT {
            return Err(Fail::new(
                libc::ECONNREFUSED,
                "channel connect retries exhausted",
            ));
        }
        let timer: Timer = Timer::new()?;
        timer.arm_oneshot(CONNECT_RETRY_DELAY)?;
        let timer_fd: RawFd = timer.raw();
        let timer_token: Token = self.entities.insert(Entity::ChannelTimer { chan: token });
        if let Err(fail) = self.poller.register(timer_fd, timer_token, true, false) {
            self.entities.remove(timer_token);
            return Err(fail);
        }
        let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
        chan.retry_timer = Some(timer);
        chan.timer_token = Some(timer_token);
        trace!(
            "channel connect refused, retry {} of {}",
            retries,
            CONNECT_RETRY_LIMIT
        );
        Ok(())
    }

    pub(crate) fn on_channel_timer(&mut self, token: Token) -> Result<(), Fail> {
        let timer_token: Option<Token> = {
            let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
            if let Some(timer) = chan.retry_timer.take() {
                let _ = timer.acknowledge();
                let _ = self.poller.deregister(timer.raw());
            }
            chan.timer_token.take()
        };
        if let Some(timer_token) = timer_token {
            self.entities.remove(timer_token);
        }
        let target: SocketAddrV4 = match chan_mut(&mut self.entities, token).target {
            Some(target) => target,
            None => return Ok(()),
        };
        let sock: SocketFd = SocketFd::tcp()?;
        sock.connect(target)?;
        let fd: RawFd = sock.raw();
        self.poller.register(fd, token, true, true)?;
        chan_mut(&mut self.entities, token).sock = Some(sock);
        Ok(())
    }

    fn flush_channel(&mut self, token: Token) -> Result<(), Fail> {
        let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
        let fd: RawFd = match &chan.sock {
            Some(sock) => sock.raw(),
            None => return Ok(()),
        };
        while chan.out_at < chan.out.len() {
            let pending: &[u8] = &chan.out[chan.out_at..];
            let ret: libc::ssize_t =
                unsafe { libc::write(fd, pending.as_ptr() as *const libc::c_void, pending.len()) };
            if ret == -1 {
                let fail: Fail = Fail::last_os_error("write");
                if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK {
                    return self.poller.modify(fd, token, true, true);
                }
                return Err(fail);
            }
            chan.out_at += ret as usize;
        }
        chan.out.clear();
        chan.out_at = 0;
        self.poller.modify(fd, token, true, false)
    }

    fn on_channel_readable(&mut self, token: Token) -> Result<(), Fail> {
        let records: Vec<HandoffRecord> = {
            let chan: &mut ChannelConn = chan_mut(&mut self.entities, token);
            let fd: RawFd = match &chan.sock {
                Some(sock) => sock.raw(),
                None => return Ok(()),
            };
            let mem = chan.chan.mem_mut();
            if mem.avail() < READ_LOW_WATER {
                mem.grow(READ_GROW_SIZE);
            }
            let spare: &mut [u8] = mem.spare();
            let ret: libc::ssize_t =
                unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len()) };
            if ret == 0 {
                return Err(Fail::new(libc::ECONNRESET, "channel peer closed"));
            }
            if ret == -1 {
                let fail: Fail = Fail::last_os_error("read");
                if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK {
                    return Ok(());
                }
                return Err(fail);
            }
            mem.consume(ret as usize)?;
            chan.chan.drain()?
        };
        for record in records {
            // A record that cannot be imported costs one connection, not the
            // channel.
            if let Err(fail) = self.on_handoff_record(record) {
                warn!("connection import failed: {:?}", fail);
            }
        }
        Ok(())
    }

    /// Drops a channel and whatever was queued on it.
    pub(crate) fn close_channel(&mut self, token: Token) {
        match self.entities.get(token) {
            Some(Entity::Channel(_)) => {},
            _ => return,
        }
        let chan: ChannelConn = match self.entities.remove(token) {
            Entity::Channel(chan) => chan,
            _ => return,
        };
        if !chan.out.is_empty() {
            warn!(
                "dropping {} unsent handoff bytes",
                chan.out.len() - chan.out_at
            );
        }
        if let Some(sock) = &chan.sock {
            let _ = self.poller.deregister(sock.raw());
        }
        if let Some(timer) = &chan.retry_timer {
            let _ = self.poller.deregister(timer.raw());
        }
        if let Some(timer_token) = chan.timer_token {
            self.entities.remove(timer_token);
        }
        if let Some(target) = chan.target {
            self.channels.remove(&target);
        }
    }

    //==========================================================================
    // Import
    //==========================================================================

    /// Handles one record from a peer: the handler decides whether the
    /// connection is served here or forwarded another hop. Forwarding ships
    /// the record exactly as it arrived.
    fn on_handoff_record(&mut self, record: HandoffRecord) -> Result<(), Fail> {
        let mut req: Request = Request::new();
        record.http.import(&mut req)?;
        let mut res: Response = Response::new();
        self.handler.handle(&req, &mut res, true)?;
        if res.status == STATUS_HANDOFF {
            let target: SocketAddrV4 = res
                .handoff
                .ok_or_else(|| Fail::new(libc::EINVAL, "handoff status without target"))?
                .addr;
            trace!(
                "forwarding connection of {} to {}",
                record.tcp.peer_addr,
                target
            );
            return self.send_record(target, &record);
        }
        if res.status > 500 {
            return Err(Fail::new(libc::EINVAL, "unsupported handler status"));
        }

        // Rebuild the socket under the local address; the virtual endpoint
        // the client sees is unchanged.
        let mut tcp: TcpState = record.tcp.clone();
        tcp.self_addr = self.cfg.server_addr;
        let sock: SocketFd = SocketFd::tcp()?;
        sock.set_reuse()?;
        tcp.import(&sock)?;
        sock.set_nodelay()?;
        let monitor: Option<SocketCloseMonitor> = match SocketCloseMonitor::new(sock.raw()) {
            Ok(monitor) => Some(monitor),
            Err(fail) => {
                warn!("close monitor unavailable for imported flow: {:?}", fail);
                None
            },
        };
        let tls: Option<Box<dyn TlsSession>> = match &record.tls {
            Some(state) => {
                let acceptor = self
                    .tls_acceptor
                    .as_ref()
                    .ok_or_else(|| Fail::new(libc::EINVAL, "record carries a session but tls is off"))?;
                Some(state.import(acceptor.as_ref(), sock.raw())?)
            },
            None => None,
        };

        let peer: SocketAddrV4 = record.tcp.peer_addr;
        let mut conn: Conn = Conn::new(sock, peer, true, ConnPhase::AwaitOwner, tls, monitor);
        conn.req = req;
        conn.res = res;
        // The response stays buffered until the switch points the flow here.
        let token: Token = self.install_conn(conn, false)?;
        let owner: OwnerTriple = OwnerTriple {
            addr: self.cfg.server_addr,
            mac: self.cfg.server_mac,
        };
        if let Err(fail) = self.submit_switch(
            token,
            PswRequest::ChangeOwner {
                peer,
                owner,
                unlock: true,
            },
        ) {
            self.close_conn(token);
            return Err(fail);
        }
        trace!("imported connection of {}", peer);
        Ok(())
    }
}

//==============================================================================
// Functions
//==============================================================================

fn chan_mut(entities: &mut Slab<Entity>, token: Token) -> &mut ChannelConn {
    match entities.get_mut(token) {
        Some(Entity::Channel(chan)) => chan,
        _ => panic!("token {} is not a handoff channel", token),
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::super::test::test_config;
    use crate::{
        handoff::test::sample_record,
        handoff::HandoffRecord,
        http::{
            HandoffTarget,
            Request,
            Response,
            STATUS_HANDOFF,
        },
        runtime::fail::Fail,
        server::HttpServer,
    };
    use ::anyhow::Result;
    use ::std::{
        io::Read,
        net::{SocketAddr, SocketAddrV4, TcpListener},
        thread,
        time::Duration,
    };

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(addr) => addr,
            _ => panic!("expected an ipv4 address"),
        }
    }

    /// A record whose handler says "not mine" is re-framed byte-identically
    /// toward the next hop.
    #[test]
    fn test_forward_record_to_next_hop() -> Result<()> {
        let next: TcpListener = TcpListener::bind("127.0.0.1:0")?;
        let next_addr: SocketAddrV4 = v4(next.local_addr()?);
        let handler = move |_: &Request, res: &mut Response, _: bool| -> Result<(), Fail> {
            res.set_status(STATUS_HANDOFF, "Handoff");
            res.handoff = Some(HandoffTarget { addr: next_addr });
            Ok(())
        };
        let mut server = HttpServer::new(test_config(), handler, None)?;

        let record: HandoffRecord = sample_record(false);
        let frame: Vec<u8> = record.encode_frame();
        let want: usize = frame.len();
        server.on_handoff_record(record)?;

        let collector = thread::spawn(move || -> Result<Vec<u8>> {
            let (mut stream, _) = next.accept()?;
            stream.set_read_timeout(Some(Duration::from_secs(5)))?;
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk: [u8; 4096] = [0; 4096];
            while buf.len() < want {
                let nread: usize = stream.read(&mut chunk)?;
                if nread == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..nread]);
            }
            Ok(buf)
        });

        for _ in 0..400 {
            server.poll_once(Some(Duration::from_millis(25)))?;
            if collector.is_finished() {
                break;
            }
        }
        assert_eq!(collector.join().unwrap()?, frame);
        Ok(())
    }

    #[test]
    fn test_channel_is_cached_per_target() -> Result<()> {
        let next: TcpListener = TcpListener::bind("127.0.0.1:0")?;
        let next_addr: SocketAddrV4 = v4(next.local_addr()?);
        let handler = |_: &Request, res: &mut Response, _: bool| -> Result<(), Fail> {
            res.set_status(200, "OK");
            Ok(())
        };
        let mut server = HttpServer::new(test_config(), handler, None)?;
        let first = server.ensure_channel(next_addr)?;
        let second = server.ensure_channel(next_addr)?;
        assert_eq!(first, second);
        Ok(())
    }
}
