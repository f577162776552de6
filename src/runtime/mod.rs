// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod event_loop;
pub mod fail;
pub mod logging;
pub mod memory;
pub mod socket;

pub use self::{
    event_loop::{Event, Poller, Timer, Token},
    fail::Fail,
    memory::{MemBuf, Span},
    socket::SocketFd,
};
