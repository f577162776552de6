// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod repair;
pub mod transplant;

pub use self::transplant::{TcpState, TcpWindow};
