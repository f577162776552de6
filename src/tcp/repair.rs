// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    mem,
    os::unix::io::RawFd,
};

//==============================================================================
// Constants
//==============================================================================

// Queue selectors for TCP_REPAIR_QUEUE.
pub const TCP_SEND_QUEUE: libc::c_int = 1;
pub const TCP_RECV_QUEUE: libc::c_int = 2;

pub const TCP_ESTABLISHED: u8 = 1;

// Kernel option codes understood by TCP_REPAIR_OPTIONS.
pub const TCPOPT_MSS: u32 = 2;
pub const TCPOPT_WINDOW: u32 = 3;
pub const TCPOPT_SACK_PERM: u32 = 4;
pub const TCPOPT_TIMESTAMP: u32 = 8;

// Queue-length ioctls.
pub const SIOCOUTQ: libc::c_ulong = 0x5411;
pub const SIOCOUTQNSD: libc::c_ulong = 0x894B;
pub const SIOCINQ: libc::c_ulong = 0x541B;

// Replaying a large queue in one send can exceed what the slab allocator
// will give the kernel for a linear skb. Chunks are halved on refusal down
// to this floor.
const MIN_SEND_CHUNK: usize = 1024;

//==============================================================================
// Structures
//==============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TcpRepairOpt {
    pub opt_code: u32,
    pub opt_val: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpRepairWindow {
    pub snd_wl1: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    pub rcv_wnd: u32,
    pub rcv_wup: u32,
}

/// Leading fields of the kernel's `tcp_info`, enough for the connection
/// state and the window scale factors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpInfoSub {
    pub tcpi_state: u8,
    pub tcpi_ca_state: u8,
    pub tcpi_retransmits: u8,
    pub tcpi_probes: u8,
    pub tcpi_backoff: u8,
    pub tcpi_options: u8,
    // snd_wscale and rcv_wscale packed low/high nibble.
    pub tcpi_wscale: u8,
}

impl TcpInfoSub {
    pub fn snd_wscale(&self) -> u8 {
        self.tcpi_wscale & 0x0f
    }

    pub fn rcv_wscale(&self) -> u8 {
        self.tcpi_wscale >> 4
    }
}

//==============================================================================
// Functions
//==============================================================================

pub fn repair_on(fd: RawFd) -> Result<(), Fail> {
    setsockopt_int(fd, libc::TCP_REPAIR, 1)
}

pub fn repair_off(fd: RawFd) -> Result<(), Fail> {
    setsockopt_int(fd, libc::TCP_REPAIR, -1)
}

/// Leaves repair mode on an error path. The original failure is what gets
/// surfaced, so a secondary failure here is only logged.
pub fn repair_off_best_effort(fd: RawFd) {
    if let Err(e) = repair_off(fd) {
        warn!("failed to leave repair mode on fd {}: {:?}", fd, e);
    }
}

/// Reads the leading `tcp_info` fields and checks the connection is
/// established. Anything else cannot be exported safely.
pub fn established_info(fd: RawFd) -> Result<TcpInfoSub, Fail> {
    let mut info: TcpInfoSub = TcpInfoSub::default();
    let mut opt_len: libc::socklen_t = mem::size_of::<TcpInfoSub>() as libc::socklen_t;
    let ret: libc::c_int = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut TcpInfoSub as *mut libc::c_void,
            &mut opt_len,
        )
    };
    if ret == -1 || opt_len != mem::size_of::<TcpInfoSub>() as libc::socklen_t {
        return Err(Fail::last_os_error("getsockopt TCP_INFO"));
    }
    if info.tcpi_state != TCP_ESTABLISHED {
        return Err(Fail::new(libc::EINVAL, "connection not established"));
    }
    Ok(info)
}

/// Queued byte counts: (send queue, unsent part, receive queue).
pub fn queue_lengths(fd: RawFd) -> Result<(u32, u32, u32), Fail> {
    let sendq_len: u32 = ioctl_int(fd, SIOCOUTQ)?;
    let unsentq_len: u32 = ioctl_int(fd, SIOCOUTQNSD)?;
    let recvq_len: u32 = ioctl_int(fd, SIOCINQ)?;
    Ok((sendq_len, unsentq_len, recvq_len))
}

pub fn get_mss(fd: RawFd) -> Result<u32, Fail> {
    getsockopt_u32(fd, libc::TCP_MAXSEG)
}

pub fn get_timestamp(fd: RawFd) -> Result<u32, Fail> {
    getsockopt_u32(fd, libc::TCP_TIMESTAMP)
}

pub fn set_timestamp(fd: RawFd, timestamp: u32) -> Result<(), Fail> {
    setsockopt_raw(fd, libc::TCP_TIMESTAMP, &timestamp)
}

/// Selects which queue subsequent TCP_QUEUE_SEQ and queue replay operations
/// address.
pub fn select_queue(fd: RawFd, queue: libc::c_int) -> Result<(), Fail> {
    setsockopt_raw(fd, libc::TCP_REPAIR_QUEUE, &queue)
}

pub fn get_queue_seq(fd: RawFd) -> Result<u32, Fail> {
    getsockopt_u32(fd, libc::TCP_QUEUE_SEQ)
}

pub fn set_queue_seq(fd: RawFd, seq: u32) -> Result<(), Fail> {
    setsockopt_raw(fd, libc::TCP_QUEUE_SEQ, &seq)
}

pub fn get_window(fd: RawFd) -> Result<TcpRepairWindow, Fail> {
    let mut window: TcpRepairWindow = TcpRepairWindow::default();
    let mut opt_len: libc::socklen_t = mem::size_of::<TcpRepairWindow>() as libc::socklen_t;
    let ret: libc::c_int = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_REPAIR_WINDOW,
            &mut window as *mut TcpRepairWindow as *mut libc::c_void,
            &mut opt_len,
        )
    };
    if ret != 0 {
        return Err(Fail::last_os_error("getsockopt TCP_REPAIR_WINDOW"));
    }
    Ok(window)
}

pub fn set_window(fd: RawFd, window: &TcpRepairWindow) -> Result<(), Fail> {
    setsockopt_raw(fd, libc::TCP_REPAIR_WINDOW, window)
}

/// Restores the negotiated TCP options. The window scales ride in one
/// option slot, send scale in the low half and receive scale in the high.
pub fn set_repair_options(fd: RawFd, mss: u32, snd_wscale: u8, rcv_wscale: u8) -> Result<(), Fail> {
    let opts: [TcpRepairOpt; 4] = [
        TcpRepairOpt {
            opt_code: TCPOPT_SACK_PERM,
            opt_val: 0,
        },
        TcpRepairOpt {
            opt_code: TCPOPT_WINDOW,
            opt_val: snd_wscale as u32 + ((rcv_wscale as u32) << 16),
        },
        TcpRepairOpt {
            opt_code: TCPOPT_TIMESTAMP,
            opt_val: 0,
        },
        TcpRepairOpt {
            opt_code: TCPOPT_MSS,
            opt_val: mss,
        },
    ];
    let ret: libc::c_int = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_REPAIR_OPTIONS,
            opts.as_ptr() as *const libc::c_void,
            mem::size_of::<[TcpRepairOpt; 4]>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(Fail::last_os_error("setsockopt TCP_REPAIR_OPTIONS"));
    }
    Ok(())
}

/// Non-destructively reads `len` queued bytes from the currently selected
/// queue. A short peek means the queue changed underneath us, which repair
/// mode is supposed to prevent.
pub fn peek_queue(fd: RawFd, len: usize) -> Result<Vec<u8>, Fail> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buf: Vec<u8> = vec![0; len + 1];
    let ret: libc::ssize_t = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            len + 1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if ret < 0 || ret as usize != len {
        return Err(Fail::new(libc::EINVAL, "short peek of repair queue"));
    }
    buf.truncate(len);
    Ok(buf)
}

/// Replays bytes into the currently selected queue. Adapted from CRIU's
/// soccr: when the kernel refuses a chunk outright the chunk size is halved
/// and retried, since a repair-mode recv-queue restore allocates one linear
/// skb of the full requested size.
pub fn replay_queue(fd: RawFd, buf: &[u8]) -> Result<(), Fail> {
    let mut max_chunk: usize = buf.len();
    let mut off: usize = 0;
    let mut len: usize = buf.len();

    while len > 0 {
        let chunk: usize = len.min(max_chunk);
        let ret: libc::ssize_t = unsafe {
            libc::send(
                fd,
                buf[off..].as_ptr() as *const libc::c_void,
                chunk,
                0,
            )
        };
        if ret <= 0 {
            if max_chunk > MIN_SEND_CHUNK {
                max_chunk >>= 1;
                continue;
            }
            return Err(Fail::last_os_error("queue replay send"));
        }
        off += ret as usize;
        len -= ret as usize;
    }
    Ok(())
}

fn ioctl_int(fd: RawFd, request: libc::c_ulong) -> Result<u32, Fail> {
    let mut value: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, request, &mut value) } == -1 {
        return Err(Fail::last_os_error("queue length ioctl"));
    }
    Ok(value as u32)
}

fn getsockopt_u32(fd: RawFd, name: libc::c_int) -> Result<u32, Fail> {
    let mut value: u32 = 0;
    let mut opt_len: libc::socklen_t = mem::size_of::<u32>() as libc::socklen_t;
    let ret: libc::c_int = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            name,
            &mut value as *mut u32 as *mut libc::c_void,
            &mut opt_len,
        )
    };
    if ret == -1 {
        return Err(Fail::last_os_error("getsockopt"));
    }
    Ok(value)
}

fn setsockopt_int(fd: RawFd, name: libc::c_int, value: libc::c_int) -> Result<(), Fail> {
    setsockopt_raw(fd, name, &value)
}

fn setsockopt_raw<T>(fd: RawFd, name: libc::c_int, value: &T) -> Result<(), Fail> {
    let ret: libc::c_int = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(Fail::last_os_error("setsockopt"));
    }
    Ok(())
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::TcpInfoSub;

    #[test]
    fn test_wscale_nibbles() {
        let info = TcpInfoSub {
            tcpi_wscale: 0x72,
            ..Default::default()
        };
        assert_eq!(info.snd_wscale(), 2);
        assert_eq!(info.rcv_wscale(), 7);
    }
}
