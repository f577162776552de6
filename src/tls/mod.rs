// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};
use ::libc::EBADMSG;
use ::std::os::unix::io::RawFd;

//==============================================================================
// Constants
//==============================================================================

/// Upper bound on a serialized session export.
pub const EXPORT_SCRATCH_SIZE: usize = 0xFFFF;

// Kernel TLS plumbing. `set_tls_ulp` consumes TCP_ULP; the rest are for
// [TlsSession] implementations, whose `attach_ktls` pushes the negotiated
// crypto material with `setsockopt(SOL_TLS, TLS_TX/TLS_RX)`.
pub const TCP_ULP: libc::c_int = 31;
pub const SOL_TLS: libc::c_int = 282;
pub const TLS_TX: libc::c_int = 1;
pub const TLS_RX: libc::c_int = 2;

//==============================================================================
// Structures
//==============================================================================

//
//  Serialized session format:
//
//  Offset  Size    Data
//  0       4       Blob Length (L)
//  4       L       Opaque Session Blob
//

/// An exported TLS session: an opaque blob from the session library holding
/// enough material to resume symmetric record processing elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsState {
    pub buf: Vec<u8>,
}

//==============================================================================
// Traits
//==============================================================================

/// Seam over the TLS session library. The record-layer cryptography itself
/// lives behind this trait; the migration path only needs handshake driving,
/// an exportable blob, and kernel offload control.
pub trait TlsSession {
    /// Feeds handshake bytes from the peer. Returns true when the library
    /// produced output that must be flushed to the socket.
    fn consume_stream(&mut self, input: &[u8]) -> Result<bool, Fail>;

    /// Drains bytes the library wants on the wire.
    fn pending_writes(&mut self) -> Vec<u8>;

    fn is_established(&self) -> bool;

    /// Serializes the session into `out`, returning the number of bytes
    /// written. Zero means the session was not exportable.
    fn export_session(&self, out: &mut [u8]) -> Result<usize, Fail>;

    /// Marks the session so future exports are permitted.
    fn make_exportable(&mut self, on: bool);

    /// Hands symmetric record processing to the kernel for this socket.
    fn attach_ktls(&mut self, fd: RawFd) -> Result<(), Fail>;

    /// Reclaims record processing from the kernel. Offload and repair mode
    /// must not overlap on the same socket.
    fn detach_ktls(&mut self, fd: RawFd) -> Result<(), Fail>;
}

/// Server-side session factory, built once from certificate and key
/// material at startup.
pub trait TlsAcceptor {
    /// A fresh server session for a newly accepted connection.
    fn accept(&self) -> Result<Box<dyn TlsSession>, Fail>;

    /// Rebuilds a session from an exported blob.
    fn import(&self, state: &TlsState) -> Result<Box<dyn TlsSession>, Fail>;
}

//==============================================================================
// Associate Functions
//==============================================================================

impl TlsState {
    /// Captures the session of a connection being handed off. Kernel offload
    /// is disengaged first.
    pub fn export(session: &mut dyn TlsSession, fd: RawFd) -> Result<Self, Fail> {
        session.detach_ktls(fd)?;
        let mut scratch: Vec<u8> = vec![0; EXPORT_SCRATCH_SIZE];
        let nwritten: usize = session.export_session(&mut scratch)?;
        if nwritten == 0 {
            return Err(Fail::new(libc::EINVAL, "session export produced no bytes"));
        }
        scratch.truncate(nwritten);
        Ok(Self { buf: scratch })
    }

    /// Rebuilds a session on a reconstituted socket and re-engages kernel
    /// offload. The rebuilt session is itself exportable so the connection
    /// can migrate again.
    pub fn import(&self, acceptor: &dyn TlsAcceptor, fd: RawFd) -> Result<Box<dyn TlsSession>, Fail> {
        let mut session: Box<dyn TlsSession> = acceptor.import(self)?;
        session.make_exportable(true);
        session.attach_ktls(fd)?;
        Ok(session)
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.buf.len()
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        let mut scratch: [u8; 4] = [0; 4];
        NetworkEndian::write_u32(&mut scratch, self.buf.len() as u32);
        out.extend_from_slice(&scratch);
        out.extend_from_slice(&self.buf);
    }

    pub fn parse_from_slice(buf: &[u8]) -> Result<(Self, &[u8]), Fail> {
        if buf.len() < 4 {
            return Err(Fail::new(EBADMSG, "serialized session too small"));
        }
        let len: usize = NetworkEndian::read_u32(&buf[0..4]) as usize;
        if buf.len() < 4 + len {
            return Err(Fail::new(EBADMSG, "serialized session truncated"));
        }
        Ok((
            Self {
                buf: buf[4..4 + len].to_vec(),
            },
            &buf[4 + len..],
        ))
    }
}

//==============================================================================
// Functions
//==============================================================================

/// Installs the TLS upper-layer protocol on a socket, the prerequisite for
/// pushing crypto state into the kernel.
pub fn set_tls_ulp(fd: RawFd) -> Result<(), Fail> {
    let name: &[u8] = b"tls\0";
    let ret: libc::c_int = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            TCP_ULP,
            name.as_ptr() as *const libc::c_void,
            3,
        )
    };
    if ret == -1 {
        return Err(Fail::last_os_error("setsockopt TCP_ULP"));
    }
    Ok(())
}

//==============================================================================
// Unit Tests
//==============================================================================
