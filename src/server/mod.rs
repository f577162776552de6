// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

pub mod handoff_server;
pub mod pool;

use self::handoff_server::ChannelConn;
use crate::{
    config::Config,
    handoff::HandoffRecord,
    http::{
        export::HttpReqState,
        Handler,
        HttpState,
        ParseResult,
        Request,
        Response,
        STATUS_HANDOFF,
    },
    monitor::SocketCloseMonitor,
    psw::{
        OwnerTriple,
        PswRequest,
        PswResponse,
        SwitchRequest,
    },
    runtime::{
        fail::Fail,
        logging,
        memory::Span,
        Event,
        Poller,
        SocketFd,
        Token,
    },
    tcp::TcpState,
    tls::{
        TlsAcceptor,
        TlsSession,
        TlsState,
    },
};
use ::eui48::MacAddress;
use ::slab::Slab;
use ::std::{
    collections::HashMap,
    mem,
    net::SocketAddrV4,
    os::unix::io::RawFd,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// Arena headroom below which the request buffer grows before a read.
const READ_LOW_WATER: usize = 1024;

/// Increment by which request and channel arenas grow.
const READ_GROW_SIZE: usize = 4096;

//==============================================================================
// Structures
//==============================================================================

/// Resolved server parameters, pulled out of the YAML configuration once at
/// startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The address clients connect to; also the virtual address installed at
    /// the switch for migrated flows.
    pub server_addr: SocketAddrV4,
    pub server_mac: MacAddress,
    /// Where peer servers deliver serialized connections.
    pub handoff_addr: SocketAddrV4,
    pub switch_addr: SocketAddrV4,
    pub backlog: i32,
}

/// What a connection is currently doing. Only `Serving` connections have
/// read interest on their socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    /// Driving the TLS handshake in userspace before kernel offload.
    TlsHandshake,
    /// Normal request and response processing.
    Serving,
    /// Handoff started; waiting for the switch to lock the flow.
    AwaitSwitch,
    /// State captured and the socket released to the kernel; waiting for the
    /// close monitor to confirm destruction before shipping the record.
    AwaitClose,
    /// Imported; waiting for the switch to accept the ownership change.
    AwaitOwner,
    /// Imported connection shutting down; the switch entry is deleted once
    /// the close is observed.
    Closing,
}

/// One client connection and everything hanging off it.
pub(crate) struct Conn {
    sock: Option<SocketFd>,
    peer: SocketAddrV4,
    req: Request,
    res: Response,
    http_state: HttpState,
    imported: bool,
    phase: ConnPhase,
    tls: Option<Box<dyn TlsSession>>,
    monitor: Option<SocketCloseMonitor>,
    monitor_token: Option<Token>,
    switch: Option<SwitchRequest>,
    switch_sock_token: Option<Token>,
    switch_timer_token: Option<Token>,
    handoff_target: Option<SocketAddrV4>,
    /// Captured state awaiting the close observation before shipping.
    pending_record: Option<HandoffRecord>,
    out: Vec<u8>,
    out_at: usize,
}

/// Everything a poller token can point at. Auxiliary descriptors (monitor
/// eventfds, switch sockets and timers) get their own slab entries that refer
/// back to the owning connection.
pub(crate) enum Entity {
    HttpListener(SocketFd),
    HandoffListener(SocketFd),
    Conn(Conn),
    Channel(ChannelConn),
    MonitorFd { conn: Token },
    SwitchSock { conn: Token },
    SwitchTimer { conn: Token },
    ChannelTimer { chan: Token },
}

/// Single-threaded HTTP front end with live connection handoff.
///
/// One instance owns one epoll set and every descriptor registered with it;
/// all state is reached through the slab, never through globals. `run` loops
/// forever; `poll_once` drives one iteration for callers that interleave the
/// server with other work.
pub struct HttpServer<H: Handler> {
    cfg: ServerConfig,
    handler: H,
    tls_acceptor: Option<Box<dyn TlsAcceptor>>,
    poller: Poller,
    entities: Slab<Entity>,
    /// Cached outbound handoff channels, one per peer server.
    channels: HashMap<SocketAddrV4, Token>,
    http_token: Token,
    handoff_token: Token,
    scratch: Vec<Event>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ServerConfig {
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            server_addr: config.server_addr()?,
            server_mac: config.server_mac()?,
            handoff_addr: config.handoff_addr()?,
            switch_addr: config.switch_addr()?,
            backlog: config.backlog(),
        })
    }
}

impl Conn {
    fn new(
        sock: SocketFd,
        peer: SocketAddrV4,
        imported: bool,
        phase: ConnPhase,
        tls: Option<Box<dyn TlsSession>>,
        monitor: Option<SocketCloseMonitor>,
    ) -> Self {
        Self {
            sock: Some(sock),
            peer,
            req: Request::new(),
            res: Response::new(),
            http_state: HttpState::ParsingHeader,
            imported,
            phase,
            tls,
            monitor,
            monitor_token: None,
            switch: None,
            switch_sock_token: None,
            switch_timer_token: None,
            handoff_target: None,
            pending_record: None,
            out: Vec::new(),
            out_at: 0,
        }
    }

    fn sock_fd(&self) -> Result<RawFd, Fail> {
        match &self.sock {
            Some(sock) => Ok(sock.raw()),
            None => Err(Fail::new(libc::EBADF, "connection has no socket")),
        }
    }
}

impl<H: Handler> HttpServer<H> {
    pub fn new(
        cfg: ServerConfig,
        handler: H,
        tls_acceptor: Option<Box<dyn TlsAcceptor>>,
    ) -> Result<Self, Fail> {
        logging::initialize();
        let poller: Poller = Poller::new()?;
        let mut entities: Slab<Entity> = Slab::new();

        let http_listener: SocketFd = SocketFd::tcp()?;
        http_listener.set_reuse()?;
        http_listener.bind(cfg.server_addr)?;
        http_listener.listen(cfg.backlog)?;
        let fd: RawFd = http_listener.raw();
        let http_token: Token = entities.insert(Entity::HttpListener(http_listener));
        poller.register(fd, http_token, true, false)?;

        let handoff_listener: SocketFd = SocketFd::tcp()?;
        handoff_listener.set_reuse()?;
        handoff_listener.bind(cfg.handoff_addr)?;
        handoff_listener.listen(cfg.backlog)?;
        let fd: RawFd = handoff_listener.raw();
        let handoff_token: Token = entities.insert(Entity::HandoffListener(handoff_listener));
        poller.register(fd, handoff_token, true, false)?;

        info!(
            "listening on {} (handoff on {})",
            cfg.server_addr, cfg.handoff_addr
        );

        Ok(Self {
            cfg,
            handler,
            tls_acceptor,
            poller,
            entities,
            channels: HashMap::new(),
            http_token,
            handoff_token,
            scratch: Vec::new(),
        })
    }

    /// Bound HTTP address; differs from the configured one when the port is
    /// ephemeral.
    pub fn http_addr(&self) -> Result<SocketAddrV4, Fail> {
        match self.entities.get(self.http_token) {
            Some(Entity::HttpListener(sock)) => sock.local_addr(),
            _ => Err(Fail::new(libc::EBADF, "http listener missing")),
        }
    }

    /// Bound handoff address.
    pub fn handoff_addr(&self) -> Result<SocketAddrV4, Fail> {
        match self.entities.get(self.handoff_token) {
            Some(Entity::HandoffListener(sock)) => sock.local_addr(),
            _ => Err(Fail::new(libc::EBADF, "handoff listener missing")),
        }
    }

    /// Runs the event loop forever.
    pub fn run(&mut self) -> Result<(), Fail> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Waits for readiness once and services every delivered event.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), Fail> {
        let mut events: Vec<Event> = mem::take(&mut self.scratch);
        events.clear();
        if let Err(fail) = self.poller.wait(&mut events, timeout) {
            self.scratch = events;
            return Err(fail);
        }
        for event in events.iter() {
            self.dispatch(*event);
        }
        self.scratch = events;
        Ok(())
    }

    /// Routes one event to its owner. A failure tears down the owning
    /// connection or channel; listener failures are only logged.
    fn dispatch(&mut self, ev: Event) {
        #[derive(Clone, Copy)]
        enum Target {
            HttpListener,
            HandoffListener,
            Conn(Token),
            Channel(Token),
            Monitor(Token),
            SwitchSock(Token),
            SwitchTimer(Token),
            ChannelTimer(Token),
        }

        let target: Target = match self.entities.get(ev.token) {
            Some(Entity::HttpListener(_)) => Target::HttpListener,
            Some(Entity::HandoffListener(_)) => Target::HandoffListener,
            Some(Entity::Conn(_)) => Target::Conn(ev.token),
            Some(Entity::Channel(_)) => Target::Channel(ev.token),
            Some(Entity::MonitorFd { conn }) => Target::Monitor(*conn),
            Some(Entity::SwitchSock { conn }) => Target::SwitchSock(*conn),
            Some(Entity::SwitchTimer { conn }) => Target::SwitchTimer(*conn),
            Some(Entity::ChannelTimer { chan }) => Target::ChannelTimer(*chan),
            // The entity went away while this event sat in the batch.
            None => return,
        };

        let result: Result<(), Fail> = match target {
            Target::HttpListener => self.on_http_accept(ev.token),
            Target::HandoffListener => self.on_handoff_accept(ev.token),
            Target::Conn(token) => self.on_conn_event(token, ev),
            Target::Channel(token) => self.on_channel_event(token, ev),
            Target::Monitor(conn) => self.on_monitor_event(conn),
            Target::SwitchSock(conn) => self.on_switch_sock(conn),
            Target::SwitchTimer(conn) => self.on_switch_timer(conn),
            Target::ChannelTimer(chan) => self.on_channel_timer(chan),
        };

        if let Err(fail) = result {
            match target {
                Target::HttpListener | Target::HandoffListener => {
                    warn!("listener error: {:?}", fail);
                },
                Target::Channel(token) | Target::ChannelTimer(token) => {
                    if fail.errno == libc::ECONNRESET {
                        trace!("dropping handoff channel: {:?}", fail);
                    } else {
                        warn!("dropping handoff channel: {:?}", fail);
                    }
                    self.close_channel(token);
                },
                Target::Conn(token)
                | Target::Monitor(token)
                | Target::SwitchSock(token)
                | Target::SwitchTimer(token) => {
                    if fail.errno == libc::ECONNRESET {
                        trace!("closing connection: {:?}", fail);
                    } else {
                        warn!("closing connection: {:?}", fail);
                    }
                    self.close_conn(token);
                },
            }
        }
    }

    //==========================================================================
    // Accept path
    //==========================================================================

    fn on_http_accept(&mut self, token: Token) -> Result<(), Fail> {
        loop {
            let accepted: Result<(SocketFd, SocketAddrV4), Fail> = match &self.entities[token] {
                Entity::HttpListener(sock) => sock.accept(),
                _ => return Ok(()),
            };
            let (sock, peer): (SocketFd, SocketAddrV4) = match accepted {
                Ok(pair) => pair,
                Err(fail) if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK => {
                    return Ok(())
                },
                Err(fail) => return Err(fail),
            };
            if let Err(fail) = self.admit(sock, peer) {
                warn!("dropping accepted connection from {}: {:?}", peer, fail);
            }
        }
    }

    fn admit(&mut self, sock: SocketFd, peer: SocketAddrV4) -> Result<(), Fail> {
        sock.set_nodelay()?;
        // The monitor needs a patched kernel; without one the connection can
        // still be served, it just cannot be handed off.
        let monitor: Option<SocketCloseMonitor> = match SocketCloseMonitor::new(sock.raw()) {
            Ok(monitor) => Some(monitor),
            Err(fail) => {
                warn!("close monitor unavailable for {}: {:?}", peer, fail);
                None
            },
        };
        let (tls, phase): (Option<Box<dyn TlsSession>>, ConnPhase) = match &self.tls_acceptor {
            Some(acceptor) => {
                let mut session: Box<dyn TlsSession> = acceptor.accept()?;
                session.make_exportable(true);
                (Some(session), ConnPhase::TlsHandshake)
            },
            None => (None, ConnPhase::Serving),
        };
        trace!("accepted connection from {}", peer);
        self.install_conn(Conn::new(sock, peer, false, phase, tls, monitor), true)
            .map(|_| ())
    }

    /// Registers a connection and its monitor with the poller.
    fn install_conn(&mut self, conn: Conn, readable: bool) -> Result<Token, Fail> {
        let fd: RawFd = conn.sock_fd()?;
        let mon_fd: Option<RawFd> = conn.monitor.as_ref().map(|monitor| monitor.raw());
        let token: Token = self.entities.insert(Entity::Conn(conn));
        if let Err(fail) = self.poller.register(fd, token, readable, false) {
            self.entities.remove(token);
            return Err(fail);
        }
        if let Some(mon_fd) = mon_fd {
            let mon_token: Token = self.entities.insert(Entity::MonitorFd { conn: token });
            match self.poller.register(mon_fd, mon_token, true, false) {
                Ok(()) => conn_mut(&mut self.entities, token).monitor_token = Some(mon_token),
                Err(fail) => {
                    warn!("monitor registration failed: {:?}", fail);
                    self.entities.remove(mon_token);
                    conn_mut(&mut self.entities, token).monitor = None;
                },
            }
        }
        Ok(token)
    }

    //==========================================================================
    // Connection events
    //==========================================================================

    fn on_conn_event(&mut self, token: Token, ev: Event) -> Result<(), Fail> {
        if ev.error {
            return Err(Fail::new(libc::ECONNRESET, "connection error event"));
        }
        let phase: ConnPhase = conn_mut(&mut self.entities, token).phase;
        match phase {
            ConnPhase::TlsHandshake => {
                if ev.writable {
                    self.flush_out(token)?;
                }
                if ev.readable {
                    self.on_tls_handshake(token)?;
                }
                Ok(())
            },
            ConnPhase::Serving => {
                if ev.writable {
                    self.flush_out(token)?;
                }
                if ev.readable {
                    self.on_conn_readable(token)?;
                }
                Ok(())
            },
            // Read interest is off in the handoff phases; stray events are
            // ignored.
            _ => Ok(()),
        }
    }

    fn on_tls_handshake(&mut self, token: Token) -> Result<(), Fail> {
        let mut buf: [u8; 4096] = [0; 4096];
        let established: bool = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            let fd: RawFd = conn.sock_fd()?;
            let ret: libc::ssize_t =
                unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if ret == 0 {
                return Err(Fail::new(libc::ECONNRESET, "peer closed during handshake"));
            }
            if ret == -1 {
                let fail: Fail = Fail::last_os_error("read");
                if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK {
                    return Ok(());
                }
                return Err(fail);
            }
            let session: &mut Box<dyn TlsSession> = conn
                .tls
                .as_mut()
                .ok_or_else(|| Fail::new(libc::EINVAL, "handshake phase without session"))?;
            if session.consume_stream(&buf[..ret as usize])? {
                let output: Vec<u8> = session.pending_writes();
                conn.out.extend_from_slice(&output);
            }
            session.is_established()
        };
        self.flush_out(token)?;
        if established {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            let fd: RawFd = conn.sock_fd()?;
            let session: &mut Box<dyn TlsSession> = conn
                .tls
                .as_mut()
                .ok_or_else(|| Fail::new(libc::EINVAL, "handshake phase without session"))?;
            // Records are sealed and opened in the kernel from here on;
            // application reads and writes see plaintext.
            session.attach_ktls(fd)?;
            conn.phase = ConnPhase::Serving;
            trace!("tls established with {}", conn.peer);
        }
        Ok(())
    }

    fn on_conn_readable(&mut self, token: Token) -> Result<(), Fail> {
        {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            let fd: RawFd = conn.sock_fd()?;
            if conn.req.mem.avail() < READ_LOW_WATER {
                warn!("request arena for {} growing by {}", conn.peer, READ_GROW_SIZE);
                conn.req.mem.grow(READ_GROW_SIZE);
            }
            let spare: &mut [u8] = conn.req.mem.spare();
            let ret: libc::ssize_t =
                unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len()) };
            if ret == 0 {
                return Err(Fail::new(libc::ECONNRESET, "peer closed"));
            }
            if ret == -1 {
                let fail: Fail = Fail::last_os_error("read");
                if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK {
                    return Ok(());
                }
                return Err(fail);
            }
            conn.req.mem.consume(ret as usize)?;
        }
        self.advance_http(token)
    }

    /// Drives the request state machine over whatever is buffered.
    fn advance_http(&mut self, token: Token) -> Result<(), Fail> {
        loop {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            match conn.http_state {
                HttpState::ParsingHeader => match conn.req.parse()? {
                    ParseResult::Partial => return Ok(()),
                    ParseResult::Complete(nparsed) => {
                        let body_len: u64 = conn.req.determine_body_len();
                        conn.req.body = Span::new(nparsed as u32, body_len as u32);
                        conn.http_state = HttpState::ReceivingBody;
                    },
                },
                HttpState::ReceivingBody => {
                    let have: u64 = (conn.req.mem.used() as u64) - conn.req.body.off as u64;
                    let want: u64 = conn.req.body.len as u64;
                    if have < want {
                        return Ok(());
                    }
                    if have > want {
                        return Err(Fail::new(libc::EBADMSG, "bytes past request body"));
                    }
                    return self.invoke_handler(token);
                },
            }
        }
    }

    fn invoke_handler(&mut self, token: Token) -> Result<(), Fail> {
        let status: u16 = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            conn.res.reset();
            let imported: bool = conn.imported;
            self.handler.handle(&conn.req, &mut conn.res, imported)?;
            conn.res.status
        };
        if status == STATUS_HANDOFF {
            if let Err(fail) = self.start_handoff(token) {
                warn!("handoff failed, answering 500: {:?}", fail);
                let conn: &mut Conn = conn_mut(&mut self.entities, token);
                conn.res.reset();
                conn.res.set_status(500, "Internal Server Error");
                self.send_response(token)?;
            }
            return Ok(());
        }
        self.send_response(token)
    }

    //==========================================================================
    // Response path
    //==========================================================================

    fn send_response(&mut self, token: Token) -> Result<(), Fail> {
        let conn: &mut Conn = conn_mut(&mut self.entities, token);
        let continuation: bool = conn.res.continuation;
        conn.res.serialize_head(continuation);
        conn.out.extend_from_slice(conn.res.head());
        if !continuation {
            conn.out.extend_from_slice(conn.res.body_bytes());
        }
        self.flush_out(token)
    }

    /// Writes buffered output. A short write arms writable interest and
    /// resumes on the next event; completion of a response resets the
    /// request machinery for the next one.
    fn flush_out(&mut self, token: Token) -> Result<(), Fail> {
        let conn: &mut Conn = conn_mut(&mut self.entities, token);
        let fd: RawFd = conn.sock_fd()?;
        while conn.out_at < conn.out.len() {
            let pending: &[u8] = &conn.out[conn.out_at..];
            let ret: libc::ssize_t =
                unsafe { libc::write(fd, pending.as_ptr() as *const libc::c_void, pending.len()) };
            if ret == -1 {
                let fail: Fail = Fail::last_os_error("write");
                if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK {
                    return self.poller.modify(fd, token, true, true);
                }
                return Err(fail);
            }
            conn.out_at += ret as usize;
        }
        conn.out.clear();
        conn.out_at = 0;
        if conn.res.status != 0 {
            if conn.res.continuation {
                // Preliminary signal done; the request lives on for the real
                // response.
                conn.res.reset();
            } else {
                conn.req.reset();
                conn.res.reset();
                conn.http_state = HttpState::ParsingHeader;
            }
        }
        self.poller.modify(fd, token, true, false)
    }

    //==========================================================================
    // Handoff export
    //==========================================================================

    /// Begins migrating a connection. Reading stops immediately; the flow is
    /// locked (or installed locked) at the switch. Capture and socket release
    /// happen on the switch acknowledgement.
    fn start_handoff(&mut self, token: Token) -> Result<(), Fail> {
        let (peer, imported, target, fd): (SocketAddrV4, bool, SocketAddrV4, RawFd) = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            let target: SocketAddrV4 = conn
                .res
                .handoff
                .ok_or_else(|| Fail::new(libc::EINVAL, "handoff status without target"))?
                .addr;
            if conn.monitor.is_none() {
                return Err(Fail::new(libc::ENOTSUP, "close monitor unavailable"));
            }
            (conn.peer, conn.imported, target, conn.sock_fd()?)
        };
        // No request bytes may land after the capture point.
        self.poller.modify(fd, token, false, false)?;
        // Open (or reuse) the channel toward the target now so the connect
        // overlaps with the switch round trip.
        self.ensure_channel(target)?;
        let request: PswRequest = if imported {
            // The switch already has an entry for this flow.
            PswRequest::Lock { peer }
        } else {
            PswRequest::Add {
                peer,
                virtual_addr: self.cfg.server_addr,
                owner: OwnerTriple {
                    addr: self.cfg.server_addr,
                    mac: self.cfg.server_mac,
                },
                lock: true,
            }
        };
        self.submit_switch(token, request)?;
        let conn: &mut Conn = conn_mut(&mut self.entities, token);
        conn.phase = ConnPhase::AwaitSwitch;
        conn.handoff_target = Some(target);
        trace!("handoff of {} to {} started", peer, target);
        Ok(())
    }

    /// Captures the full connection state and releases the socket. Runs on
    /// the switch acknowledgement: the flow is locked, reading stopped, so
    /// nothing races the inspection. The socket is still in repair mode when
    /// dropped, which lets the kernel destroy it without a FIN towards the
    /// client and fires the close monitor.
    fn capture_and_close(&mut self, token: Token) -> Result<(), Fail> {
        let record: HandoffRecord = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            let sock: &SocketFd = conn
                .sock
                .as_ref()
                .ok_or_else(|| Fail::new(libc::EBADF, "connection has no socket"))?;
            let tcp: TcpState = TcpState::export(sock)?;
            let tls: Option<TlsState> = match conn.tls.as_mut() {
                Some(session) => Some(TlsState::export(session.as_mut(), sock.raw())?),
                None => None,
            };
            let http: HttpReqState = HttpReqState::export(&conn.req);
            HandoffRecord { tcp, tls, http }
        };
        let sock: Option<SocketFd> = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            conn.pending_record = Some(record);
            conn.phase = ConnPhase::AwaitClose;
            conn.sock.take()
        };
        if let Some(sock) = sock {
            let _ = self.poller.deregister(sock.raw());
        }
        Ok(())
    }

    /// Ships the captured state. Runs only once the close monitor confirmed
    /// the kernel destroyed the socket, so the flow cannot still mutate on
    /// this host while the record is in flight.
    fn ship_record(&mut self, token: Token) -> Result<(), Fail> {
        let (record, target): (HandoffRecord, SocketAddrV4) = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            let target: SocketAddrV4 = conn
                .handoff_target
                .ok_or_else(|| Fail::new(libc::EINVAL, "no handoff target"))?;
            let record: HandoffRecord = conn
                .pending_record
                .take()
                .ok_or_else(|| Fail::new(libc::EINVAL, "no captured state to ship"))?;
            (record, target)
        };
        self.send_record(target, &record)?;
        trace!("connection state shipped to {}", target);
        self.teardown_conn(token);
        Ok(())
    }

    //==========================================================================
    // Switch interaction
    //==========================================================================

    fn submit_switch(&mut self, token: Token, request: PswRequest) -> Result<(), Fail> {
        let pending: SwitchRequest = SwitchRequest::new(self.cfg.switch_addr, &request)?;
        let sock_token: Token = self.entities.insert(Entity::SwitchSock { conn: token });
        let timer_token: Token = self.entities.insert(Entity::SwitchTimer { conn: token });
        if let Err(fail) = self.poller.register(pending.sock_fd(), sock_token, true, false) {
            self.entities.remove(sock_token);
            self.entities.remove(timer_token);
            return Err(fail);
        }
        if let Err(fail) = self.poller.register(pending.timer_fd(), timer_token, true, false) {
            let _ = self.poller.deregister(pending.sock_fd());
            self.entities.remove(sock_token);
            self.entities.remove(timer_token);
            return Err(fail);
        }
        let conn: &mut Conn = conn_mut(&mut self.entities, token);
        conn.switch = Some(pending);
        conn.switch_sock_token = Some(sock_token);
        conn.switch_timer_token = Some(timer_token);
        Ok(())
    }

    fn on_switch_sock(&mut self, token: Token) -> Result<(), Fail> {
        let response: Option<PswResponse> = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            match conn.switch.as_mut() {
                Some(pending) => pending.on_readable()?,
                None => return Ok(()),
            }
        };
        let response: PswResponse = match response {
            Some(response) => response,
            None => return Ok(()),
        };
        if response.status != 0 {
            return Err(Fail::new(libc::EREMOTEIO, "switch rejected request"));
        }
        self.retire_switch(token);
        self.on_switch_acked(token)
    }

    fn on_switch_timer(&mut self, token: Token) -> Result<(), Fail> {
        let conn: &mut Conn = conn_mut(&mut self.entities, token);
        match conn.switch.as_mut() {
            Some(pending) => pending.on_timer(),
            None => Ok(()),
        }
    }

    /// Tears down the switch request plumbing once a response has arrived.
    fn retire_switch(&mut self, token: Token) {
        let (pending, sock_token, timer_token) = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            let pending: SwitchRequest = match conn.switch.take() {
                Some(pending) => pending,
                None => return,
            };
            (
                pending,
                conn.switch_sock_token.take(),
                conn.switch_timer_token.take(),
            )
        };
        let _ = self.poller.deregister(pending.sock_fd());
        let _ = self.poller.deregister(pending.timer_fd());
        if let Some(token) = sock_token {
            self.entities.remove(token);
        }
        if let Some(token) = timer_token {
            self.entities.remove(token);
        }
    }

    fn on_switch_acked(&mut self, token: Token) -> Result<(), Fail> {
        let phase: ConnPhase = conn_mut(&mut self.entities, token).phase;
        match phase {
            // Export side: the flow is locked. Capture now, while the socket
            // is still alive, then hand it back to the kernel.
            ConnPhase::AwaitSwitch => self.capture_and_close(token),
            // Import side: the flow now points here. Release the buffered
            // response and start serving.
            ConnPhase::AwaitOwner => {
                let fd: RawFd = conn_mut(&mut self.entities, token).sock_fd()?;
                self.poller.modify(fd, token, true, false)?;
                conn_mut(&mut self.entities, token).phase = ConnPhase::Serving;
                self.send_response(token)
            },
            // Delete acknowledged; the connection record can go away.
            ConnPhase::Closing => {
                self.teardown_conn(token);
                Ok(())
            },
            _ => Ok(()),
        }
    }

    //==========================================================================
    // Close monitor
    //==========================================================================

    fn on_monitor_event(&mut self, token: Token) -> Result<(), Fail> {
        let fired: bool = {
            let conn: &mut Conn = conn_mut(&mut self.entities, token);
            match conn.monitor.as_mut() {
                Some(monitor) => monitor.on_readable()?,
                None => return Ok(()),
            }
        };
        if !fired {
            return Ok(());
        }
        let phase: ConnPhase = conn_mut(&mut self.entities, token).phase;
        match phase {
            ConnPhase::AwaitClose => self.ship_record(token),
            ConnPhase::Closing => self.on_close_observed(token),
            // Client went away outside a handoff.
            _ => Err(Fail::new(libc::ECONNRESET, "close observed")),
        }
    }

    fn on_close_observed(&mut self, token: Token) -> Result<(), Fail> {
        let peer: SocketAddrV4 = conn_mut(&mut self.entities, token).peer;
        trace!("imported flow of {} fully closed, deleting switch entry", peer);
        self.submit_switch(token, PswRequest::Delete { peer })
    }

    //==========================================================================
    // Teardown
    //==========================================================================

    /// Closes a connection. An imported connection keeps its slab entry
    /// until the close is observed and the switch entry deleted; everything
    /// else is torn down on the spot.
    pub(crate) fn close_conn(&mut self, token: Token) {
        let (imported, phase, fired, has_monitor): (bool, ConnPhase, bool, bool) =
            match self.entities.get(token) {
                Some(Entity::Conn(conn)) => (
                    conn.imported,
                    conn.phase,
                    conn.monitor.as_ref().map_or(false, |m| m.has_fired()),
                    conn.monitor.is_some(),
                ),
                _ => return,
            };
        if imported && has_monitor && phase != ConnPhase::Closing {
            {
                let conn: &mut Conn = conn_mut(&mut self.entities, token);
                conn.phase = ConnPhase::Closing;
                if let Some(sock) = conn.sock.take() {
                    let _ = self.poller.deregister(sock.raw());
                }
            }
            self.retire_switch(token);
            if fired {
                // The kernel already reported the socket gone; delete the
                // switch entry right away.
                let peer: SocketAddrV4 = conn_mut(&mut self.entities, token).peer;
                if let Err(fail) = self.submit_switch(token, PswRequest::Delete { peer }) {
                    warn!("switch delete failed: {:?}", fail);
                    self.teardown_conn(token);
                }
            }
            return;
        }
        self.teardown_conn(token);
    }

    /// Removes a connection and every auxiliary entity hanging off it.
    /// Dropping the owned handles closes the descriptors.
    fn teardown_conn(&mut self, token: Token) {
        match self.entities.get(token) {
            Some(Entity::Conn(_)) => {},
            _ => return,
        }
        let conn: Conn = match self.entities.remove(token) {
            Entity::Conn(conn) => conn,
            _ => return,
        };
        if let Some(sock) = &conn.sock {
            let _ = self.poller.deregister(sock.raw());
        }
        if let Some(monitor) = &conn.monitor {
            let _ = self.poller.deregister(monitor.raw());
        }
        if let Some(mon_token) = conn.monitor_token {
            self.entities.remove(mon_token);
        }
        if let Some(pending) = &conn.switch {
            let _ = self.poller.deregister(pending.sock_fd());
            let _ = self.poller.deregister(pending.timer_fd());
        }
        if let Some(sock_token) = conn.switch_sock_token {
            self.entities.remove(sock_token);
        }
        if let Some(timer_token) = conn.switch_timer_token {
            self.entities.remove(timer_token);
        }
        trace!("connection of {} torn down", conn.peer);
    }
}

//==============================================================================
// Functions
//==============================================================================

fn conn_mut(entities: &mut Slab<Entity>, token: Token) -> &mut Conn {
    match entities.get_mut(token) {
        Some(Entity::Conn(conn)) => conn,
        _ => panic!("token {} is not a connection", token),
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{conn_mut, Conn, ConnPhase, Entity, HttpServer, ServerConfig};
    use crate::{
        http::{Request, Response},
        runtime::{fail::Fail, socket::SocketFd},
    };
    use ::anyhow::Result;
    use ::std::{
        io::{Read, Write},
        net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream},
        os::unix::io::IntoRawFd,
        thread,
        time::Duration,
    };

    pub fn test_config() -> ServerConfig {
        ServerConfig {
            server_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            server_mac: eui48::MacAddress::new([0x02, 0, 0, 0, 0, 1]),
            handoff_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            switch_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
            backlog: 8,
        }
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("expected an IPv4 address"),
        }
    }

    // The switch acknowledgement must capture state and release the socket in
    // one step: the close monitor only fires once the kernel destroys the
    // socket, which it cannot do while the server still holds the open
    // descriptor. Needs repair-mode privileges; bails out where repair is
    // refused.
    #[test]
    fn test_switch_ack_captures_and_releases_socket() -> Result<()> {
        let handler = |_req: &Request, res: &mut Response, _imported: bool| -> Result<(), Fail> {
            res.set_status(200, "OK");
            Ok(())
        };
        let mut server = HttpServer::new(test_config(), handler, None)?;

        let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
        let client: TcpStream = TcpStream::connect(listener.local_addr()?)?;
        let (accepted, peer) = listener.accept()?;

        let sock: SocketFd = SocketFd::from_raw(accepted.into_raw_fd());
        let mut conn: Conn = Conn::new(sock, v4(peer), false, ConnPhase::AwaitSwitch, None, None);
        conn.handoff_target = Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        let token = server.entities.insert(Entity::Conn(conn));

        match server.on_switch_acked(token) {
            Err(fail) if fail.errno == libc::EPERM => return Ok(()),
            other => other?,
        }

        let conn: &mut Conn = conn_mut(&mut server.entities, token);
        assert_eq!(conn.phase, ConnPhase::AwaitClose);
        assert!(conn.sock.is_none());
        let record = conn.pending_record.as_ref().unwrap();
        assert_eq!(record.tcp.peer_addr, v4(client.local_addr()?));
        Ok(())
    }

    #[test]
    fn test_serve_plain_request() -> Result<()> {
        let handler = |req: &Request, res: &mut Response, _imported: bool| -> Result<(), Fail> {
            res.set_status(200, "OK");
            res.body.push(req.path());
            Ok(())
        };
        let mut server = HttpServer::new(test_config(), handler, None)?;
        let addr: SocketAddrV4 = server.http_addr()?;

        let client = thread::spawn(move || -> Result<String> {
            let mut stream: TcpStream = TcpStream::connect(addr)?;
            stream.set_read_timeout(Some(Duration::from_secs(5)))?;
            stream.write_all(b"GET /hello HTTP/1.1\r\nHost: test\r\n\r\n")?;
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk: [u8; 1024] = [0; 1024];
            loop {
                let nread: usize = stream.read(&mut chunk)?;
                if nread == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..nread]);
                if buf.ends_with(b"/hello") {
                    break;
                }
            }
            Ok(String::from_utf8_lossy(&buf).into_owned())
        });

        for _ in 0..400 {
            server.poll_once(Some(Duration::from_millis(25)))?;
            if client.is_finished() {
                break;
            }
        }
        let response: String = client.join().unwrap()?;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Server: phttp\r\n"));
        assert!(response.contains("Content-Length: 6\r\n"));
        assert!(response.ends_with("/hello"));
        Ok(())
    }

    #[test]
    fn test_request_with_body_reaches_handler() -> Result<()> {
        let handler = |req: &Request, res: &mut Response, _imported: bool| -> Result<(), Fail> {
            res.set_status(200, "OK");
            res.body.push(req.body());
            Ok(())
        };
        let mut server = HttpServer::new(test_config(), handler, None)?;
        let addr: SocketAddrV4 = server.http_addr()?;

        let client = thread::spawn(move || -> Result<Vec<u8>> {
            let mut stream: TcpStream = TcpStream::connect(addr)?;
            stream.set_read_timeout(Some(Duration::from_secs(5)))?;
            stream.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\n")?;
            // Body trickles in separately from the header.
            thread::sleep(Duration::from_millis(50));
            stream.write_all(b"ping")?;
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk: [u8; 1024] = [0; 1024];
            loop {
                let nread: usize = stream.read(&mut chunk)?;
                if nread == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..nread]);
                if buf.ends_with(b"ping") {
                    break;
                }
            }
            Ok(buf)
        });

        for _ in 0..400 {
            server.poll_once(Some(Duration::from_millis(25)))?;
            if client.is_finished() {
                break;
            }
        }
        let response: Vec<u8> = client.join().unwrap()?;
        let text: String = String::from_utf8_lossy(&response).into_owned();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("ping"));
        Ok(())
    }

    #[test]
    fn test_malformed_request_closes_connection() -> Result<()> {
        let handler = |_: &Request, res: &mut Response, _: bool| -> Result<(), Fail> {
            res.set_status(200, "OK");
            Ok(())
        };
        let mut server = HttpServer::new(test_config(), handler, None)?;
        let addr: SocketAddrV4 = server.http_addr()?;

        let client = thread::spawn(move || -> Result<usize> {
            let mut stream: TcpStream = TcpStream::connect(addr)?;
            stream.set_read_timeout(Some(Duration::from_secs(5)))?;
            stream.write_all(b"\x01\x02 not http at all\r\n\r\n")?;
            let mut buf: [u8; 64] = [0; 64];
            Ok(stream.read(&mut buf)?)
        });

        for _ in 0..400 {
            server.poll_once(Some(Duration::from_millis(25)))?;
            if client.is_finished() {
                break;
            }
        }
        assert_eq!(client.join().unwrap()?, 0);
        Ok(())
    }
}
