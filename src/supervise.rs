// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The supervision loop
//!
//! Rules:
//!   - signals not raised by a child are forwarded to the whole process group
//!   - the first member to exit nonzero, or to be killed, decides the exit status
//!   - every reapable child is reaped on each wakeup, whichever child caused it
//!   - the run succeeds once every member has been reaped with status zero

use std::fmt;

use libc::c_int;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, Pid};
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::funnel::{Funnel, SignalEvent};
use crate::signal::{self, Signo, Target};

/// Settings and identities shared by every part of the supervisor, fixed at startup
#[derive(Clone, Debug)]
pub struct SupervisorState {
    signal: Signo,
    verbose: u64,
    pid: Pid,
    monitor_pid: Option<Pid>,
}

impl SupervisorState {
    pub fn new(config: &Config, monitor_pid: Option<Pid>) -> Self {
        Self {
            signal: config.signal,
            verbose: config.verbose,
            pid: getpid(),
            monitor_pid,
        }
    }

    /// Signal broadcast to the process group when the run fails
    pub fn signal(&self) -> Signo {
        self.signal
    }

    pub fn verbose(&self) -> u64 {
        self.verbose
    }

    /// The supervisor's pid, which is also its process group id once running
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn monitor_pid(&self) -> Option<Pid> {
        self.monitor_pid
    }

    fn is_monitor(&self, pid: Pid) -> bool {
        self.monitor_pid == Some(pid)
    }
}

/// How the run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Every member exited zero
    Success,
    /// A member exited nonzero or was killed; `status` is its exit code or signal number
    MemberFailed { pid: Pid, status: c_int },
    /// Reading the funnel or reaping failed
    Plumbing(Errno),
}

/// Statuses above this one are reserved for the supervisor's own failures
pub const PLUMBING_BASE: c_int = 127;

impl Verdict {
    pub fn is_success(&self) -> bool {
        *self == Verdict::Success
    }

    /// The exit status of the supervisor for this verdict
    pub fn code(&self) -> c_int {
        match *self {
            Verdict::Success => 0,
            Verdict::MemberFailed { status, .. } => status,
            Verdict::Plumbing(errno) => PLUMBING_BASE + errno as c_int,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Verdict::Success => f.write_str("all pipeline members exited 0"),
            Verdict::MemberFailed { pid, status } => {
                write!(f, "pipeline member {} failed: {}", pid, status)
            }
            Verdict::Plumbing(errno) => write!(f, "supervisor failure: {}", errno),
        }
    }
}

/// What to do with one event from the funnel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Not from a child, pass it on to the process group
    Forward(Signo),
    /// A member failed, stop with this status
    Fail(c_int),
    /// Reap whatever can be reaped
    Reap,
}

/// Statuses of a child-state-changed event that don't by themselves mean failure
fn is_benign_status(status: c_int) -> bool {
    match status {
        0 | libc::SIGTRAP | libc::SIGTTIN | libc::SIGTTOU | libc::SIGTSTP | libc::SIGCONT
        | libc::SIGSTOP => true,
        _ => false,
    }
}

pub fn classify(state: &SupervisorState, event: &SignalEvent) -> Dispatch {
    if !event.is_child() {
        return Dispatch::Forward(event.signo);
    }

    // the monitor is a child but not a member, whatever it did
    if state.is_monitor(event.pid) {
        return Dispatch::Reap;
    }

    if event.exited() && event.status != 0 {
        return Dispatch::Fail(event.status);
    }

    if is_benign_status(event.status) {
        Dispatch::Reap
    } else {
        Dispatch::Fail(event.status)
    }
}

/// One result of a non-blocking reap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reaped {
    /// Nothing more to reap right now
    Drained,
    /// A child exited zero
    Clean(Pid),
    /// A child exited nonzero or was killed, with its exit code or signal number
    Failed(Pid, c_int),
    /// A state change that isn't a termination
    Ignored,
}

pub fn classify_wait(status: WaitStatus) -> Reaped {
    match status {
        WaitStatus::StillAlive => Reaped::Drained,
        WaitStatus::Exited(pid, 0) => Reaped::Clean(pid),
        WaitStatus::Exited(pid, code) => Reaped::Failed(pid, code),
        WaitStatus::Signaled(pid, sig, _) => Reaped::Failed(pid, sig as c_int),
        _ => Reaped::Ignored,
    }
}

/// The OS operations the supervision loop depends on
pub trait Host {
    /// Blocks for the next signal event
    fn next_event(&mut self) -> Result<SignalEvent, Errno>;

    /// Reaps one terminated child without blocking
    fn try_reap(&mut self) -> nix::Result<WaitStatus>;

    fn broadcast(&mut self, target: Target, signo: Signo);
}

/// [`Host`] backed by the signal funnel and `waitpid(2)`
pub struct OsHost<'a> {
    funnel: &'a Funnel,
}

impl<'a> OsHost<'a> {
    pub fn new(funnel: &'a Funnel) -> Self {
        Self { funnel }
    }
}

impl<'a> Host for OsHost<'a> {
    fn next_event(&mut self) -> Result<SignalEvent, Errno> {
        self.funnel.next_event()
    }

    fn try_reap(&mut self) -> nix::Result<WaitStatus> {
        waitpid(None, Some(WaitPidFlag::WNOHANG))
    }

    fn broadcast(&mut self, target: Target, signo: Signo) {
        signal::broadcast(target, signo)
    }
}

/// Runs until every one of `members` has been reaped, a member fails, or the plumbing fails
pub fn supervise<H: Host>(state: &SupervisorState, host: &mut H, members: usize) -> Verdict {
    let mut remaining = members;

    if remaining == 0 {
        return Verdict::Success;
    }

    loop {
        let event = match host.next_event() {
            Ok(event) => event,
            Err(errno) => {
                error!("signal funnel failed: {}", errno);
                return Verdict::Plumbing(errno);
            }
        };

        debug!("{}", event);

        match classify(state, &event) {
            Dispatch::Forward(signo) => {
                debug!("forwarding {} to the process group", signal::name(signo));
                host.broadcast(Target::OwnGroup, signo);
                continue;
            }
            Dispatch::Fail(status) => {
                return Verdict::MemberFailed {
                    pid: event.pid,
                    status,
                }
            }
            Dispatch::Reap => (),
        }

        loop {
            // no children left at all ends the drain the same way as none ready
            let status = match host.try_reap() {
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    error!("waitpid failed: {}", errno);
                    return Verdict::Plumbing(errno);
                }
            };

            match classify_wait(status) {
                Reaped::Drained => break,
                Reaped::Ignored => continue,
                Reaped::Clean(pid) | Reaped::Failed(pid, _) if state.is_monitor(pid) => {
                    debug!("monitor {} exited", pid);
                }
                Reaped::Failed(pid, status) => {
                    debug!("reaped {}: {}", pid, status);
                    return Verdict::MemberFailed { pid, status };
                }
                Reaped::Clean(pid) => {
                    remaining = remaining.saturating_sub(1);
                    trace!("reaped {}, {} remaining", pid, remaining);

                    if remaining == 0 {
                        return Verdict::Success;
                    }
                }
            }
        }
    }
}
