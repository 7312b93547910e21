// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Supervise a pipeline of shell commands as one process group

pub mod config;
mod error;
pub mod funnel;
pub mod logging;
pub mod monitor;
pub mod pipe;
pub mod pipeline;
pub mod signal;
pub mod supervise;
pub mod tree;

pub use error::{Error, ErrorKind};
