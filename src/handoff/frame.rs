// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::{
    fail::Fail,
    memory::MemBuf,
};
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};

//==============================================================================
// Constants
//==============================================================================

/// Size of the length prefix (in bytes).
pub const FRAME_HEADER_SIZE: usize = 4;

//==============================================================================
// Functions
//==============================================================================

//
//  Frame format:
//
//  Offset  Size    Data
//  0       4       Payload Length (L)
//  4       P       Zero Padding, P = (8 - L mod 8) mod 8
//  4+P     L       Payload
//
//  The pad sits between the prefix and the payload and is derived from the
//  payload length. It does not align the start of the next frame; the
//  layout is kept as-is for wire compatibility.
//

/// Pad bytes carried by a frame of the given payload length.
pub fn pad_len(payload_len: usize) -> usize {
    (8 - payload_len % 8) % 8
}

/// Total on-wire size of a frame carrying `payload_len` bytes.
pub fn frame_size(payload_len: usize) -> usize {
    FRAME_HEADER_SIZE + pad_len(payload_len) + payload_len
}

/// Appends one framed payload to `out`.
pub fn encode_into(out: &mut Vec<u8>, payload: &[u8]) {
    let mut prefix: [u8; FRAME_HEADER_SIZE] = [0; FRAME_HEADER_SIZE];
    NetworkEndian::write_u32(&mut prefix, payload.len() as u32);
    out.extend_from_slice(&prefix);
    out.resize(out.len() + pad_len(payload.len()), 0);
    out.extend_from_slice(payload);
}

/// Peels every complete frame out of `mem`, handing each payload to
/// `on_payload`, then compacts leftover partial bytes to the front of the
/// buffer. A callback error aborts the drain and is fatal to the channel,
/// since length framing has already been trusted.
pub fn drain<F>(mem: &mut MemBuf, mut on_payload: F) -> Result<(), Fail>
where
    F: FnMut(&[u8]) -> Result<(), Fail>,
{
    let mut cursor: usize = 0;
    loop {
        let filled: &[u8] = mem.filled();
        let avail: usize = filled.len() - cursor;
        if avail < FRAME_HEADER_SIZE {
            break;
        }
        let payload_len: usize = NetworkEndian::read_u32(&filled[cursor..cursor + 4]) as usize;
        let total: usize = frame_size(payload_len);
        if avail < total {
            break;
        }
        let payload_at: usize = cursor + FRAME_HEADER_SIZE + pad_len(payload_len);
        if let Err(e) = on_payload(&filled[payload_at..cursor + total]) {
            mem.compact(cursor + total);
            return Err(e);
        }
        cursor += total;
    }
    mem.compact(cursor);
    Ok(())
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::{drain, encode_into, frame_size, pad_len};
    use crate::runtime::memory::MemBuf;

    #[test]
    fn test_pad_len() {
        assert_eq!(pad_len(0), 0);
        assert_eq!(pad_len(1), 7);
        assert_eq!(pad_len(7), 1);
        assert_eq!(pad_len(8), 0);
        assert_eq!(pad_len(9), 7);
        assert_eq!(pad_len(16), 0);
    }

    #[test]
    fn test_round_trip_all_residues() {
        // One frame per length residue mod 8.
        for len in 0..16usize {
            let payload: Vec<u8> = (0..len as u8).collect();
            let mut wire: Vec<u8> = Vec::new();
            encode_into(&mut wire, &payload);
            assert_eq!(wire.len(), frame_size(len));

            let mut mem = MemBuf::new(4096);
            mem.push(&wire);
            let mut seen: Vec<Vec<u8>> = Vec::new();
            drain(&mut mem, |p| {
                seen.push(p.to_vec());
                Ok(())
            })
            .unwrap();
            assert_eq!(seen, vec![payload]);
            assert_eq!(mem.used(), 0);
        }
    }

    #[test]
    fn test_drain_multiple_and_partial() {
        let mut wire: Vec<u8> = Vec::new();
        encode_into(&mut wire, b"first");
        encode_into(&mut wire, b"second-record");
        let mut partial: Vec<u8> = Vec::new();
        encode_into(&mut partial, b"third");
        wire.extend_from_slice(&partial[..6]);

        let mut mem = MemBuf::new(4096);
        mem.push(&wire);
        let mut seen: Vec<Vec<u8>> = Vec::new();
        drain(&mut mem, |p| {
            seen.push(p.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], b"first");
        assert_eq!(seen[1], b"second-record");
        // Leftover partial bytes survive for the next read.
        assert_eq!(mem.used(), 6);

        mem.push(&partial[6..]);
        let mut seen: Vec<Vec<u8>> = Vec::new();
        drain(&mut mem, |p| {
            seen.push(p.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"third".to_vec()]);
        assert_eq!(mem.used(), 0);
    }

    #[test]
    fn test_drain_byte_by_byte() {
        let mut wire: Vec<u8> = Vec::new();
        encode_into(&mut wire, b"trickled");
        let mut mem = MemBuf::new(4096);
        let mut seen: usize = 0;
        for byte in wire.iter() {
            mem.push(&[*byte]);
            drain(&mut mem, |p| {
                assert_eq!(p, b"trickled");
                seen += 1;
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(seen, 1);
    }
}
