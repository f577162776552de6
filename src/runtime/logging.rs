// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::flexi_logger::Logger;
use ::std::sync::Once;

static INIT_LOG: Once = Once::new();

/// Initializes logging features. Drives log levels from the `RUST_LOG`
/// environment variable; silent when unset.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env() {
            let _ = logger.start();
        }
    });
}
