// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::{self, IsTerminal};

use tracing_subscriber::EnvFilter;

use crate::Error;

/// Filter directive for a `-v` count; `RUST_LOG` wins when set
pub fn level(verbose: u64) -> &'static str {
    match verbose {
        0 => "error",
        1 => "debug",
        _ => "trace",
    }
}

/// Sends diagnostics to stderr, never from inside a signal handler
pub fn init(verbose: u64) -> Result<(), Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .without_time()
        .try_init()
        .map_err(|e| Error::from(format!("failed to initialize logging: {}", e)))
}
