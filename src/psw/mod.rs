// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod client;

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};
use ::eui48::MacAddress;
use ::libc::EBADMSG;
use ::std::{
    convert::TryFrom,
    net::SocketAddrV4,
};

pub use self::client::SwitchRequest;

//==============================================================================
// Constants
//==============================================================================

/// Size of the fixed request head shared by every message (in bytes).
pub const PSW_BASE_SIZE: usize = 9;

/// Size of an add request (in bytes).
pub const PSW_ADD_SIZE: usize = 28;

/// Size of a change-owner request (in bytes).
pub const PSW_CHOWN_SIZE: usize = 22;

//==============================================================================
// Structures
//==============================================================================

//
//  Message format (shared head):
//
//  Offset  Size    Data
//  0       1       Type
//  1       2       Status
//  3       4       Peer IP
//  7       2       Peer Port
//
//  Add appends:
//
//  9       4       Virtual IP
//  13      2       Virtual Port
//  15      4       Owner IP
//  19      2       Owner Port
//  21      6       Owner MAC
//  27      1       Lock Flag
//
//  Change-owner appends:
//
//  9       4       Owner IP
//  13      2       Owner Port
//  15      6       Owner MAC
//  21      1       Unlock Flag
//
//  Delete, lock, and unlock are the bare head. A response mirrors the
//  request shape with the status field set.
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PswReqType {
    Add = 0,
    Delete = 1,
    ChangeOwner = 2,
    Lock = 3,
    Unlock = 4,
}

/// The (address, port, MAC) triple the dataplane steers packets with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerTriple {
    pub addr: SocketAddrV4,
    pub mac: MacAddress,
}

/// One typed request to the switch control plane, keyed by the flow's peer
/// identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PswRequest {
    /// Install a flow entry. Carries the virtual endpoint clients connect to
    /// and the owning server triple; `lock` holds the entry against
    /// concurrent changes while a handoff is in flight.
    Add {
        peer: SocketAddrV4,
        virtual_addr: SocketAddrV4,
        owner: OwnerTriple,
        lock: bool,
    },
    /// Point an existing entry at a new owner; `unlock` releases the lock
    /// taken for the handoff in the same message.
    ChangeOwner {
        peer: SocketAddrV4,
        owner: OwnerTriple,
        unlock: bool,
    },
    Delete { peer: SocketAddrV4 },
    Lock { peer: SocketAddrV4 },
    Unlock { peer: SocketAddrV4 },
}

/// A decoded response datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PswResponse {
    pub rtype: PswReqType,
    pub status: u16,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl PswRequest {
    pub fn rtype(&self) -> PswReqType {
        match self {
            PswRequest::Add { .. } => PswReqType::Add,
            PswRequest::ChangeOwner { .. } => PswReqType::ChangeOwner,
            PswRequest::Delete { .. } => PswReqType::Delete,
            PswRequest::Lock { .. } => PswReqType::Lock,
            PswRequest::Unlock { .. } => PswReqType::Unlock,
        }
    }

    pub fn peer(&self) -> SocketAddrV4 {
        match self {
            PswRequest::Add { peer, .. }
            | PswRequest::ChangeOwner { peer, .. }
            | PswRequest::Delete { peer }
            | PswRequest::Lock { peer }
            | PswRequest::Unlock { peer } => *peer,
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            PswRequest::Add { .. } => PSW_ADD_SIZE,
            PswRequest::ChangeOwner { .. } => PSW_CHOWN_SIZE,
            _ => PSW_BASE_SIZE,
        }
    }

    /// Encodes the request datagram. The status field is zero on requests.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(self.serialized_size());
        out.push(self.rtype() as u8);
        out.extend_from_slice(&[0, 0]);
        write_endpoint(&mut out, self.peer());

        match self {
            PswRequest::Add {
                virtual_addr,
                owner,
                lock,
                ..
            } => {
                write_endpoint(&mut out, *virtual_addr);
                write_endpoint(&mut out, owner.addr);
                out.extend_from_slice(owner.mac.as_bytes());
                out.push(*lock as u8);
            },
            PswRequest::ChangeOwner { owner, unlock, .. } => {
                write_endpoint(&mut out, owner.addr);
                out.extend_from_slice(owner.mac.as_bytes());
                out.push(*unlock as u8);
            },
            _ => {},
        }
        out
    }
}

impl PswResponse {
    /// Decodes the head of a response datagram.
    pub fn parse(buf: &[u8]) -> Result<Self, Fail> {
        if buf.len() < 3 {
            return Err(Fail::new(EBADMSG, "switch response too small"));
        }
        // The switch fills the status field from a packed struct in its own
        // byte order, unlike the addresses and ports around it.
        Ok(Self {
            rtype: PswReqType::try_from(buf[0])?,
            status: u16::from_ne_bytes([buf[1], buf[2]]),
        })
    }
}

//==============================================================================
// Functions
//==============================================================================

fn write_endpoint(out: &mut Vec<u8>, addr: SocketAddrV4) {
    out.extend_from_slice(&addr.ip().octets());
    let mut port: [u8; 2] = [0; 2];
    NetworkEndian::write_u16(&mut port, addr.port());
    out.extend_from_slice(&port);
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl TryFrom<u8> for PswReqType {
    type Error = Fail;

    fn try_from(value: u8) -> Result<Self, Fail> {
        match value {
            0 => Ok(PswReqType::Add),
            1 => Ok(PswReqType::Delete),
            2 => Ok(PswReqType::ChangeOwner),
            3 => Ok(PswReqType::Lock),
            4 => Ok(PswReqType::Unlock),
            _ => Err(Fail::new(EBADMSG, "invalid switch request type")),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{
        OwnerTriple,
        PswRequest,
        PswResponse,
        PswReqType,
        PSW_ADD_SIZE,
        PSW_BASE_SIZE,
        PSW_CHOWN_SIZE,
    };
    use ::eui48::MacAddress;
    use ::std::{net::SocketAddrV4, str::FromStr};

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::from_str("192.168.1.50:41000").unwrap()
    }

    fn owner() -> OwnerTriple {
        OwnerTriple {
            addr: SocketAddrV4::from_str("10.0.1.8:10000").unwrap(),
            mac: MacAddress::parse_str("08:00:27:c2:17:e8").unwrap(),
        }
    }

    #[test]
    fn test_datagram_sizes() {
        let add = PswRequest::Add {
            peer: peer(),
            virtual_addr: SocketAddrV4::from_str("10.0.1.1:80").unwrap(),
            owner: owner(),
            lock: true,
        };
        let chown = PswRequest::ChangeOwner {
            peer: peer(),
            owner: owner(),
            unlock: true,
        };
        assert_eq!(add.serialize().len(), PSW_ADD_SIZE);
        assert_eq!(chown.serialize().len(), PSW_CHOWN_SIZE);
        assert_eq!(PswRequest::Delete { peer: peer() }.serialize().len(), PSW_BASE_SIZE);
        assert_eq!(PswRequest::Lock { peer: peer() }.serialize().len(), PSW_BASE_SIZE);
        assert_eq!(PswRequest::Unlock { peer: peer() }.serialize().len(), PSW_BASE_SIZE);
    }

    #[test]
    fn test_add_layout() {
        let add = PswRequest::Add {
            peer: peer(),
            virtual_addr: SocketAddrV4::from_str("10.0.1.1:80").unwrap(),
            owner: owner(),
            lock: true,
        };
        let wire = add.serialize();
        assert_eq!(wire[0], PswReqType::Add as u8);
        assert_eq!(&wire[1..3], &[0, 0]);
        assert_eq!(&wire[3..7], &[192, 168, 1, 50]);
        assert_eq!(&wire[7..9], &41000u16.to_be_bytes());
        assert_eq!(&wire[9..13], &[10, 0, 1, 1]);
        assert_eq!(&wire[13..15], &80u16.to_be_bytes());
        assert_eq!(&wire[21..27], owner().mac.as_bytes());
        assert_eq!(wire[27], 1);
    }

    // The dataplane dispatches on these codes; they are fixed by the switch,
    // not negotiable between peers.
    #[test]
    fn test_wire_type_codes() {
        let chown = PswRequest::ChangeOwner {
            peer: peer(),
            owner: owner(),
            unlock: false,
        };
        assert_eq!(
            PswRequest::Add {
                peer: peer(),
                virtual_addr: peer(),
                owner: owner(),
                lock: false,
            }
            .serialize()[0],
            0
        );
        assert_eq!(PswRequest::Delete { peer: peer() }.serialize()[0], 1);
        assert_eq!(chown.serialize()[0], 2);
        assert_eq!(PswRequest::Lock { peer: peer() }.serialize()[0], 3);
        assert_eq!(PswRequest::Unlock { peer: peer() }.serialize()[0], 4);
    }

    #[test]
    fn test_response_parse() {
        let mut wire = PswRequest::Lock { peer: peer() }.serialize();
        wire[1..3].copy_from_slice(&7u16.to_ne_bytes());
        let res = PswResponse::parse(&wire).unwrap();
        assert_eq!(res.rtype, PswReqType::Lock);
        assert_eq!(res.status, 7);

        assert!(PswResponse::parse(&[9, 0, 0]).is_err());
        assert!(PswResponse::parse(&[0]).is_err());
    }
}
