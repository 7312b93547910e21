// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::os::unix::io::AsRawFd;

use nix::unistd::{fork, ForkResult, Pid};
use tracing::debug;

use crate::pipe::{Pipe, PipeEnd, Read, Write};
use crate::signal::{self, Signo, Target};
use crate::Error;

/// The supervisor's side of the watchdog monitor.
///
/// The monitor is a forked child blocked on a one byte read. It is released when the channel
/// closes, either because the handle is dropped or because the kernel closes it as the
/// supervisor exits, however that happens. Once released it signals the target group and exits.
#[derive(Debug)]
pub struct MonitorHandle {
    pid: Pid,
    notify: PipeEnd<Write>,
}

impl MonitorHandle {
    /// Forks the monitor.
    ///
    /// Must be called while the process is still single threaded, and before the supervisor
    /// moves into its own process group.
    pub fn spawn(target: Target, signo: Signo) -> Result<Self, Error> {
        let (read, write) = Pipe::new()
            .map_err(|e| Error::setup("pipe", e))?
            .split();

        // This is safe, the caller guarantees no other threads exist, and the child only
        //   reads, sends a signal and exits
        match unsafe { fork() }.map_err(|e| Error::setup("fork", e))? {
            ForkResult::Child => {
                drop(write);
                watch(read, target, signo)
            }
            ForkResult::Parent { child } => {
                drop(read);
                debug!("monitor started: {}", child);

                Ok(Self {
                    pid: child,
                    notify: write,
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Leaves the channel open for the rest of this process's life.
    ///
    /// The monitor then fires only once the kernel closes the channel during exit, after the
    /// exit status is already fixed.
    pub fn hold_until_exit(self) -> Pid {
        let MonitorHandle { pid, mut notify } = self;

        debug!("monitor {} released at exit, channel: {}", pid, notify.as_raw_fd());
        notify.forget();
        pid
    }
}

/// Body of the monitor process
fn watch(read: PipeEnd<Read>, target: Target, signo: Signo) -> ! {
    let mut buf = [0u8; 1];

    // a byte, end-of-stream or an error all mean the supervisor is done
    read.read_full(&mut buf).ok();

    debug!(
        "monitor: broadcasting signal={} {}",
        signal::name(signo),
        target
    );
    signal::broadcast(target, signo);

    // This is safe, _exit skips the atexit handlers inherited from the supervisor
    unsafe { libc::_exit(0) }
}
