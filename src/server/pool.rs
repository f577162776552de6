// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::arrayvec::ArrayVec;
use ::std::net::SocketAddrV4;

//==============================================================================
// Constants
//==============================================================================

/// Maximum number of back ends a front end rotates through.
pub const BACKENDS_MAX: usize = 16;

//==============================================================================
// Structures
//==============================================================================

/// The set of back-end handoff addresses a front end rotates through. The
/// round-robin cursor lives here, not in any shared state.
#[derive(Debug, Clone)]
pub struct BackendPool {
    backends: ArrayVec<SocketAddrV4, BACKENDS_MAX>,
    next: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl BackendPool {
    /// Builds a pool from the configured addresses; anything past
    /// [`BACKENDS_MAX`] is ignored.
    pub fn new(backends: Vec<SocketAddrV4>) -> Self {
        let mut pool: ArrayVec<SocketAddrV4, BACKENDS_MAX> = ArrayVec::new();
        for addr in backends.into_iter().take(BACKENDS_MAX) {
            pool.push(addr);
        }
        Self {
            backends: pool,
            next: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Next backend in rotation, or `None` when the pool is empty.
    pub fn select(&mut self) -> Option<SocketAddrV4> {
        if self.backends.is_empty() {
            return None;
        }
        let picked: SocketAddrV4 = self.backends[self.next % self.backends.len()];
        self.next = self.next.wrapping_add(1);
        Some(picked)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::BackendPool;
    use ::std::{net::SocketAddrV4, str::FromStr};

    #[test]
    fn test_round_robin() {
        let a = SocketAddrV4::from_str("10.0.1.9:20000").unwrap();
        let b = SocketAddrV4::from_str("10.0.1.10:20000").unwrap();
        let mut pool = BackendPool::new(vec![a, b]);
        assert_eq!(pool.select(), Some(a));
        assert_eq!(pool.select(), Some(b));
        assert_eq!(pool.select(), Some(a));
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = BackendPool::new(Vec::new());
        assert!(pool.is_empty());
        assert_eq!(pool.select(), None);
    }
}
