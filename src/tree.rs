// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::env;
use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::path::Path;

use nix::unistd::{getpgid, getpgrp, Pid};

use crate::pipeline::PipelineInfo;
use crate::supervise::SupervisorState;

/// Name this process was invoked as, like `__progname`
pub fn program_name() -> String {
    env::args_os()
        .next()
        .as_ref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

fn pgid_of(pid: Option<Pid>) -> String {
    pid.and_then(|pid| getpgid(Some(pid)).ok())
        .map(|pgid| pgid.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn pid_of(pid: Option<Pid>) -> String {
    pid.map(|pid| pid.to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Renders the supervisor, the monitor and each pipeline member, one per line:
///
/// ```text
/// pipewatch(100,100) /bin/sh -c true | /bin/sh -c false
///    |-monitor(101,99)
///    |-/bin/sh -c true(102,100)
///    |-/bin/sh -c false(103,100)
/// ```
pub fn render(program: &str, state: &SupervisorState, pipeline: &dyn PipelineInfo) -> String {
    let mut tree = String::new();

    writeln!(
        tree,
        "{}({},{}) {}",
        program,
        state.pid(),
        getpgrp(),
        pipeline.describe()
    )
    .ok();

    if let Some(monitor) = state.monitor_pid() {
        writeln!(tree, "   |-monitor({},{})", monitor, pgid_of(Some(monitor))).ok();
    }

    for index in 0..pipeline.ncommands() {
        let pid = pipeline.pid(index);
        writeln!(
            tree,
            "   |-{}({},{})",
            pipeline.label(index).unwrap_or_default(),
            pid_of(pid),
            pgid_of(pid)
        )
        .ok();
    }

    tree
}

/// Writes the process tree to stderr
pub fn report(state: &SupervisorState, pipeline: &dyn PipelineInfo) -> io::Result<()> {
    let tree = render(&program_name(), state, pipeline);

    let stderr = io::stderr();
    let mut stderr = stderr.lock();
    stderr.write_all(tree.as_bytes())?;
    stderr.flush()
}
