// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    mem,
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    os::unix::io::RawFd,
};

//==============================================================================
// Structures
//==============================================================================

/// An owned kernel socket handle.
///
/// Exactly one connection object owns a given handle at a time; transplant
/// operations consume and return it instead of reaching into ambient OS
/// state. Dropping the handle closes the descriptor.
#[derive(Debug)]
pub struct SocketFd(RawFd);

//==============================================================================
// Associate Functions
//==============================================================================

impl SocketFd {
    /// Creates a new non-blocking TCP socket.
    pub fn tcp() -> Result<Self, Fail> {
        let fd: RawFd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd == -1 {
            return Err(Fail::last_os_error("socket"));
        }
        Ok(Self(fd))
    }

    /// Creates a new non-blocking UDP socket.
    pub fn udp() -> Result<Self, Fail> {
        let fd: RawFd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd == -1 {
            return Err(Fail::last_os_error("socket"));
        }
        Ok(Self(fd))
    }

    /// Wraps an already-open descriptor, taking ownership.
    pub fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    /// The underlying descriptor, ownership retained.
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Releases ownership of the descriptor without closing it.
    pub fn into_raw(mut self) -> RawFd {
        mem::replace(&mut self.0, -1)
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<(), Fail> {
        let sin: libc::sockaddr_in = sockaddr_in_from(addr);
        let ret: libc::c_int = unsafe {
            libc::bind(
                self.0,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(Fail::last_os_error("bind"));
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), Fail> {
        if unsafe { libc::listen(self.0, backlog) } == -1 {
            return Err(Fail::last_os_error("listen"));
        }
        Ok(())
    }

    /// Initiates a non-blocking connect. `EINPROGRESS` is not an error;
    /// completion is observed as a writable event.
    pub fn connect(&self, addr: SocketAddrV4) -> Result<(), Fail> {
        let sin: libc::sockaddr_in = sockaddr_in_from(addr);
        let ret: libc::c_int = unsafe {
            libc::connect(
                self.0,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            let fail: Fail = Fail::last_os_error("connect");
            if fail.errno != libc::EINPROGRESS {
                return Err(fail);
            }
        }
        Ok(())
    }

    /// Accepts one pending connection, returning the peer address.
    pub fn accept(&self) -> Result<(SocketFd, SocketAddrV4), Fail> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd: RawFd = unsafe {
            libc::accept4(
                self.0,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(Fail::last_os_error("accept4"));
        }
        Ok((SocketFd(fd), sockaddr_in_to(&sin)))
    }

    pub fn set_reuse(&self) -> Result<(), Fail> {
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
    }

    pub fn set_nodelay(&self) -> Result<(), Fail> {
        self.setsockopt_int(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4, Fail> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret: libc::c_int = unsafe {
            libc::getsockname(self.0, &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr, &mut len)
        };
        if ret == -1 {
            return Err(Fail::last_os_error("getsockname"));
        }
        Ok(sockaddr_in_to(&sin))
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4, Fail> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret: libc::c_int = unsafe {
            libc::getpeername(self.0, &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr, &mut len)
        };
        if ret == -1 {
            return Err(Fail::last_os_error("getpeername"));
        }
        Ok(sockaddr_in_to(&sin))
    }

    /// Sends one datagram. Short sends do not happen on UDP.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> Result<(), Fail> {
        let sin: libc::sockaddr_in = sockaddr_in_from(addr);
        let ret: libc::ssize_t = unsafe {
            libc::sendto(
                self.0,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(Fail::last_os_error("sendto"));
        }
        Ok(())
    }

    /// Receives one datagram, or `None` when nothing is queued.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>, Fail> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret: libc::ssize_t = unsafe {
            libc::recvfrom(
                self.0,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret == -1 {
            let fail: Fail = Fail::last_os_error("recvfrom");
            if fail.errno == libc::EAGAIN || fail.errno == libc::EWOULDBLOCK {
                return Ok(None);
            }
            return Err(fail);
        }
        Ok(Some((ret as usize, sockaddr_in_to(&sin))))
    }

    /// The pending error on the socket, consumed by reading it. Zero means a
    /// deferred connect completed successfully.
    pub fn take_error(&self) -> Result<libc::c_int, Fail> {
        let mut value: libc::c_int = 0;
        let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret: libc::c_int = unsafe {
            libc::getsockopt(
                self.0,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret == -1 {
            return Err(Fail::last_os_error("getsockopt"));
        }
        Ok(value)
    }

    fn setsockopt_int(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<(), Fail> {
        let ret: libc::c_int = unsafe {
            libc::setsockopt(
                self.0,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(Fail::last_os_error("setsockopt"));
        }
        Ok(())
    }
}

//==============================================================================
// Functions
//==============================================================================

pub fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

pub fn sockaddr_in_to(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for SocketFd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe { libc::close(self.0) };
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{sockaddr_in_from, sockaddr_in_to};
    use ::std::{net::SocketAddrV4, str::FromStr};

    #[test]
    fn test_sockaddr_round_trip() {
        let addr = SocketAddrV4::from_str("198.18.0.7:20001").unwrap();
        let sin = sockaddr_in_from(addr);
        assert_eq!(sockaddr_in_to(&sin), addr);
    }
}
