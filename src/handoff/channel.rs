// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    handoff::{
        frame,
        HandoffRecord,
    },
    runtime::{
        fail::Fail,
        memory::MemBuf,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Initial receive arena capacity. A record carries a request arena plus
/// queue bytes, so this starts large.
const CHANNEL_ARENA_SIZE: usize = 5_000_000;

//==============================================================================
// Structures
//==============================================================================

/// Receive side of one handoff channel connection. Accumulates stream bytes
/// and peels complete records off the front.
#[derive(Debug)]
pub struct HandoffChannel {
    mem: MemBuf,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl HandoffChannel {
    pub fn new() -> Self {
        Self {
            mem: MemBuf::new(CHANNEL_ARENA_SIZE),
        }
    }

    /// Arena to read socket bytes into; callers fill `spare()` and then
    /// `consume()` what was read.
    pub fn mem_mut(&mut self) -> &mut MemBuf {
        &mut self.mem
    }

    /// Decodes every complete record buffered so far. Partial trailing bytes
    /// are retained. A record that fails to parse inside a complete frame is
    /// an error, fatal to this channel.
    pub fn drain(&mut self) -> Result<Vec<HandoffRecord>, Fail> {
        let mut records: Vec<HandoffRecord> = Vec::new();
        frame::drain(&mut self.mem, |payload| {
            let (record, rest) = HandoffRecord::parse_from_slice(payload)?;
            if !rest.is_empty() {
                return Err(Fail::new(libc::EBADMSG, "trailing bytes inside handoff frame"));
            }
            records.push(record);
            Ok(())
        })?;
        Ok(records)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::HandoffChannel;
    use crate::handoff::{frame, test::sample_record};

    #[test]
    fn test_drain_two_records_and_partial() {
        let first = sample_record(false);
        let second = sample_record(true);

        let mut chan = HandoffChannel::new();
        chan.mem_mut().push(&first.encode_frame());
        chan.mem_mut().push(&second.encode_frame());
        let third = first.encode_frame();
        chan.mem_mut().push(&third[..10]);

        let records = chan.drain().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], first);
        assert_eq!(records[1], second);

        chan.mem_mut().push(&third[10..]);
        let records = chan.drain().unwrap();
        assert_eq!(records, vec![first]);
    }

    #[test]
    fn test_garbage_in_complete_frame_is_fatal() {
        let mut chan = HandoffChannel::new();
        let mut wire: Vec<u8> = Vec::new();
        frame::encode_into(&mut wire, &[0xff; 24]);
        chan.mem_mut().push(&wire);
        assert!(chan.drain().is_err());
    }
}
