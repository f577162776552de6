// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Operation failure, carrying the errno that caused it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fail {
    /// Error code.
    pub errno: libc::c_int,
    /// Cause of the failure.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Fail {
    /// Creates a new failure.
    pub fn new(errno: libc::c_int, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Creates a failure from the calling thread's last OS error.
    pub fn last_os_error(cause: &str) -> Self {
        let errno: libc::c_int = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self::new(errno, cause)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "error {}: {}", self.errno, self.cause)
    }
}

impl std::error::Error for Fail {}

impl From<Fail> for io::Error {
    fn from(fail: Fail) -> Self {
        io::Error::from_raw_os_error(fail.errno)
    }
}
