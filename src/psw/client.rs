// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    psw::{
        PswRequest,
        PswResponse,
    },
    runtime::{
        event_loop::Timer,
        fail::Fail,
        socket::SocketFd,
    },
};
use ::std::{
    net::SocketAddrV4,
    os::unix::io::RawFd,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// Fixed retransmit interval. No backoff and no retry cap; the switch is
/// assumed to answer eventually.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const RESPONSE_BUF_SIZE: usize = 64;

//==============================================================================
// Structures
//==============================================================================

/// One in-flight request to the switch control plane.
///
/// Each request gets its own datagram socket, so any datagram arriving on it
/// is the response to this request; there is no request id on the wire. The
/// same encoded datagram is retransmitted on a fixed interval until a
/// response shows up, then the timer stops and the completion is delivered
/// exactly once.
#[derive(Debug)]
pub struct SwitchRequest {
    sock: SocketFd,
    timer: Timer,
    datagram: Vec<u8>,
    switch_addr: SocketAddrV4,
    done: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl SwitchRequest {
    /// Encodes and sends the first datagram and arms the retry timer. The
    /// caller registers both descriptors with its poller and drives
    /// [`on_timer`](Self::on_timer) and [`on_readable`](Self::on_readable)
    /// from readiness events.
    pub fn new(switch_addr: SocketAddrV4, request: &PswRequest) -> Result<Self, Fail> {
        let sock: SocketFd = SocketFd::udp()?;
        let timer: Timer = Timer::new()?;
        let datagram: Vec<u8> = request.serialize();

        sock.send_to(&datagram, switch_addr)?;
        timer.arm_periodic(RETRY_INTERVAL)?;

        Ok(Self {
            sock,
            timer,
            datagram,
            switch_addr,
            done: false,
        })
    }

    pub fn sock_fd(&self) -> RawFd {
        self.sock.raw()
    }

    pub fn timer_fd(&self) -> RawFd {
        self.timer.raw()
    }

    /// Retransmits on timer expiry. A no-op once the response has arrived.
    pub fn on_timer(&mut self) -> Result<(), Fail> {
        let expiries: u64 = self.timer.acknowledge()?;
        if self.done || expiries == 0 {
            return Ok(());
        }
        trace!("retransmitting switch request to {}", self.switch_addr);
        self.sock.send_to(&self.datagram, self.switch_addr)
    }

    /// Consumes the response when the socket polls readable. Returns `None`
    /// if the datagram was a spurious wakeup or the request already
    /// completed; otherwise stops the retry timer and returns the decoded
    /// response, exactly once.
    pub fn on_readable(&mut self) -> Result<Option<PswResponse>, Fail> {
        if self.done {
            return Ok(None);
        }
        let mut buf: [u8; RESPONSE_BUF_SIZE] = [0; RESPONSE_BUF_SIZE];
        let (nread, _) = match self.sock.recv_from(&mut buf)? {
            Some(read) => read,
            None => return Ok(None),
        };
        let response: PswResponse = PswResponse::parse(&buf[..nread])?;
        self.timer.disarm()?;
        self.done = true;
        Ok(Some(response))
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{SwitchRequest, RETRY_INTERVAL};
    use crate::{
        psw::{PswRequest, PswReqType},
        runtime::{
            event_loop::{Event, Poller},
            socket::SocketFd,
        },
    };
    use ::std::{net::SocketAddrV4, str::FromStr, time::Duration};

    fn loopback_switch() -> (SocketFd, SocketAddrV4) {
        let sock = SocketFd::udp().unwrap();
        sock.bind(SocketAddrV4::from_str("127.0.0.1:0").unwrap()).unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    fn wait_readable(poller: &mut Poller, token: usize) {
        let mut events: Vec<Event> = Vec::new();
        while !events.iter().any(|e| e.token == token && e.readable) {
            events.clear();
            poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
            assert!(!events.is_empty(), "timed out waiting for readiness");
        }
    }

    #[test]
    fn test_delayed_response_fires_once() {
        let (switch, switch_addr) = loopback_switch();
        let mut poller = Poller::new().unwrap();

        let request = PswRequest::Lock {
            peer: SocketAddrV4::from_str("192.168.1.50:41000").unwrap(),
        };
        let mut pending = SwitchRequest::new(switch_addr, &request).unwrap();
        poller.register(pending.sock_fd(), 1, true, false).unwrap();
        poller.register(pending.timer_fd(), 2, true, false).unwrap();
        poller.register(switch.raw(), 3, true, false).unwrap();

        // Let the response lag past a few retry intervals, driving the
        // retransmit path each time the timer fires.
        let mut retries: usize = 0;
        while retries < 3 {
            wait_readable(&mut poller, 2);
            pending.on_timer().unwrap();
            retries += 1;
        }

        // The switch saw the original datagram plus the retransmits,
        // all identical.
        let mut datagrams: Vec<(Vec<u8>, SocketAddrV4)> = Vec::new();
        let mut buf = [0u8; 64];
        while let Some((n, from)) = switch.recv_from(&mut buf).unwrap() {
            datagrams.push((buf[..n].to_vec(), from));
        }
        assert!(datagrams.len() >= 2);
        assert!(datagrams.windows(2).all(|w| w[0].0 == w[1].0));

        // Now answer with status 0.
        let (mut reply, from) = datagrams.pop().unwrap();
        reply[1..3].copy_from_slice(&0u16.to_be_bytes());
        switch.send_to(&reply, from).unwrap();

        wait_readable(&mut poller, 1);
        let response = pending.on_readable().unwrap().expect("expected a response");
        assert_eq!(response.rtype, PswReqType::Lock);
        assert_eq!(response.status, 0);
        assert!(pending.is_done());

        // Completion is delivered exactly once, and the timer is stopped.
        assert!(pending.on_readable().unwrap().is_none());
        std::thread::sleep(RETRY_INTERVAL * 2);
        pending.on_timer().unwrap();
        assert!(switch.recv_from(&mut buf).unwrap().is_none());
    }
}
