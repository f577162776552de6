// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    mem,
    os::unix::io::RawFd,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// Maximum number of kernel events drained per poll.
const EVENT_BATCH_SIZE: usize = 1024;

//==============================================================================
// Structures
//==============================================================================

/// Identifies the entity a kernel event belongs to.
pub type Token = usize;

/// A readiness notification delivered by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Edge-less epoll wrapper. Descriptors are registered level-triggered with a
/// caller-chosen token that comes back on each event.
pub struct Poller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

/// A one-shot timer backed by a timerfd. Arming replaces any previous
/// deadline; reading after expiry resets the readable state.
#[derive(Debug)]
pub struct Timer {
    fd: RawFd,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Poller {
    pub fn new() -> Result<Self, Fail> {
        let epfd: RawFd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(Fail::last_os_error("epoll_create1"));
        }
        Ok(Self {
            epfd,
            events: Vec::with_capacity(EVENT_BATCH_SIZE),
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, readable: bool, writable: bool) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, readable, writable)
    }

    pub fn modify(&self, fd: RawFd, token: Token, readable: bool, writable: bool) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, readable, writable)
    }

    pub fn deregister(&self, fd: RawFd) -> Result<(), Fail> {
        let ret: libc::c_int =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret == -1 {
            return Err(Fail::last_os_error("epoll_ctl del"));
        }
        Ok(())
    }

    /// Blocks until at least one descriptor is ready, then appends the batch
    /// to `out`. Interrupted waits return an empty batch.
    pub fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> Result<(), Fail> {
        let timeout_ms: libc::c_int = match timeout {
            Some(d) => d.as_millis() as libc::c_int,
            None => -1,
        };
        let n: libc::c_int = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                EVENT_BATCH_SIZE as libc::c_int,
                timeout_ms,
            )
        };
        if n == -1 {
            let fail: Fail = Fail::last_os_error("epoll_wait");
            if fail.errno == libc::EINTR {
                return Ok(());
            }
            return Err(fail);
        }
        unsafe { self.events.set_len(n as usize) };
        for ev in self.events.iter() {
            out.push(Event {
                token: ev.u64 as Token,
                readable: ev.events & (libc::EPOLLIN as u32) != 0,
                writable: ev.events & (libc::EPOLLOUT as u32) != 0,
                error: ev.events & ((libc::EPOLLERR | libc::EPOLLHUP) as u32) != 0,
            });
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, readable: bool, writable: bool) -> Result<(), Fail> {
        let mut interest: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        if readable {
            interest |= libc::EPOLLIN as u32;
        }
        if writable {
            interest |= libc::EPOLLOUT as u32;
        }
        let mut ev: libc::epoll_event = libc::epoll_event {
            events: interest,
            u64: token as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } == -1 {
            return Err(Fail::last_os_error("epoll_ctl"));
        }
        Ok(())
    }
}

impl Timer {
    pub fn new() -> Result<Self, Fail> {
        let fd: RawFd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(Fail::last_os_error("timerfd_create"));
        }
        Ok(Self { fd })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Arms a periodic timer with a fixed interval starting one interval
    /// from now.
    pub fn arm_periodic(&self, interval: Duration) -> Result<(), Fail> {
        let ts: libc::timespec = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let spec: libc::itimerspec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };
        let ret: libc::c_int =
            unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret == -1 {
            return Err(Fail::last_os_error("timerfd_settime"));
        }
        Ok(())
    }

    /// Arms a single expiry `delay` from now.
    pub fn arm_oneshot(&self, delay: Duration) -> Result<(), Fail> {
        let spec: libc::itimerspec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret: libc::c_int =
            unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret == -1 {
            return Err(Fail::last_os_error("timerfd_settime"));
        }
        Ok(())
    }

    pub fn disarm(&self) -> Result<(), Fail> {
        let spec: libc::itimerspec = unsafe { mem::zeroed() };
        let ret: libc::c_int =
            unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret == -1 {
            return Err(Fail::last_os_error("timerfd_settime"));
        }
        Ok(())
    }

    /// Consumes the expiry counter so the descriptor stops polling readable.
    pub fn acknowledge(&self) -> Result<u64, Fail> {
        let mut count: u64 = 0;
        let ret: libc::ssize_t = unsafe {
            libc::read(
                self.fd,
                &mut count as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret == -1 {
            let fail: Fail = Fail::last_os_error("timerfd read");
            if fail.errno == libc::EAGAIN {
                return Ok(0);
            }
            return Err(fail);
        }
        Ok(count)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{Event, Poller, Timer};
    use ::std::time::Duration;

    #[test]
    fn test_timer_fires() {
        let poller = Poller::new().unwrap();
        let timer = Timer::new().unwrap();
        timer.arm_periodic(Duration::from_millis(5)).unwrap();
        poller.register(timer.raw(), 7, true, false).unwrap();

        let mut events: Vec<Event> = Vec::new();
        let mut poller = poller;
        poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token == 7 && e.readable));
        assert!(timer.acknowledge().unwrap() >= 1);
    }

    #[test]
    fn test_timer_disarm() {
        let timer = Timer::new().unwrap();
        timer.arm_periodic(Duration::from_millis(5)).unwrap();
        timer.disarm().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(timer.acknowledge().unwrap(), 0);
    }
}
