// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! HTTP front end whose connections can migrate, live, between server
//! processes. A connection is captured as three serializable pieces (raw TCP
//! state, the TLS session when present, and the parsed request), shipped over
//! a framed channel, and reconstituted on the receiving side while a
//! programmable switch redirects the flow.

#[macro_use]
extern crate log;

pub mod config;
pub mod handoff;
pub mod http;
pub mod monitor;
pub mod psw;
pub mod runtime;
pub mod server;
pub mod tcp;
pub mod tls;

pub use self::{
    config::Config,
    handoff::HandoffRecord,
    http::{
        Handler,
        HandoffTarget,
        Request,
        Response,
        STATUS_HANDOFF,
    },
    runtime::fail::Fail,
    server::{
        pool::BackendPool,
        HttpServer,
        ServerConfig,
    },
    tls::{
        TlsAcceptor,
        TlsSession,
    },
};
