// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod membuf;

//==============================================================================
// Exports
//==============================================================================

pub use self::membuf::{
    MemBuf,
    Span,
};
