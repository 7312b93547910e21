// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::env;
use std::process;

use nix::unistd::{getpid, setpgid, Pid};
use tracing::{debug, error, warn};

use pipewatch::config::Config;
use pipewatch::funnel::Funnel;
use pipewatch::logging;
use pipewatch::monitor::MonitorHandle;
use pipewatch::pipeline::{self, Pipeline, PipelineInfo};
use pipewatch::signal::{self, Target};
use pipewatch::supervise::{supervise, OsHost, SupervisorState};
use pipewatch::tree;
use pipewatch::Error;

fn main() {
    let config = match Config::from_args(env::args_os()) {
        Ok(config) => config,
        Err(e) if e.kind == clap::ErrorKind::HelpDisplayed => {
            eprintln!("{}", e.message);
            process::exit(libc::EXIT_FAILURE);
        }
        Err(e) => e.exit(),
    };

    if let Err(e) = logging::init(config.verbose) {
        eprintln!("{}", e);
    }

    let status = match run(&config) {
        Ok(status) => status,
        Err(e) => {
            error!("{}", e);
            libc::EXIT_FAILURE
        }
    };

    process::exit(status)
}

fn run(config: &Config) -> Result<i32, Error> {
    // forked while single threaded and still in the caller's process group, so the monitor
    //   is not hit by its own broadcast
    let monitor_pid = if config.monitor {
        let monitor = MonitorHandle::spawn(Target::Group(getpid()), config.signal)?;
        Some(monitor.hold_until_exit())
    } else {
        None
    };

    let state = SupervisorState::new(config, monitor_pid);

    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(|e| Error::setup("setpgid", e))?;

    if state.verbose() == 0 {
        env::set_var(pipeline::QUIET_ENV, "1");
    }

    // handlers go in before any child exists, so no child state change can be missed
    let funnel = Funnel::new()?;
    funnel.install()?;

    let mut pipeline = Pipeline::new();
    for command in &config.commands {
        pipeline.shell(command);
    }

    if let Err(e) = pipeline.start() {
        signal::broadcast(Target::OwnGroup, state.signal());
        return Err(e);
    }

    if state.verbose() > 0 {
        if let Err(e) = tree::report(&state, &pipeline) {
            warn!("failed to write process tree: {}", e);
        }
    }

    let verdict = supervise(&state, &mut OsHost::new(&funnel), pipeline.ncommands());
    debug!("{}", verdict);

    if !verdict.is_success() {
        debug!(
            "broadcasting {} to the process group",
            signal::name(state.signal())
        );
        signal::broadcast(Target::OwnGroup, state.signal());
    }

    Ok(verdict.code())
}
