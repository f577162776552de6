// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod export;
pub mod request;
pub mod response;

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;

pub use self::{
    export::HttpReqState,
    request::{ParseResult, Request},
    response::{HandoffTarget, Response},
};

//==============================================================================
// Constants
//==============================================================================

/// Maximum number of headers tracked per request or response.
pub const HTTP_HEADERS_MAX: usize = 16;

/// Private status value a handler sets to request connection handoff instead
/// of a response.
pub const STATUS_HANDOFF: u16 = 600;

//==============================================================================
// Structures
//==============================================================================

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    ParsingHeader,
    ReceivingBody,
}

//==============================================================================
// Traits
//==============================================================================

/// Application request handler. Invoked once per complete request, with
/// `imported` distinguishing a reconstituted connection from a freshly
/// accepted one. Must complete synchronously; a returned error is fatal to
/// the connection.
pub trait Handler {
    fn handle(&mut self, req: &Request, res: &mut Response, imported: bool) -> Result<(), Fail>;
}

impl<F> Handler for F
where
    F: FnMut(&Request, &mut Response, bool) -> Result<(), Fail>,
{
    fn handle(&mut self, req: &Request, res: &mut Response, imported: bool) -> Result<(), Fail> {
        self(req, res, imported)
    }
}
