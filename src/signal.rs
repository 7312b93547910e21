// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Signal numbers, dispositions and the process group broadcaster

use std::borrow::Cow;
use std::convert::TryFrom;
use std::fmt;
use std::mem;
use std::ptr;
use std::str::FromStr;

use libc::c_int;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::trace;

use crate::funnel;

/// A raw signal number, realtime signals included
pub type Signo = c_int;

/// Signals that are never funneled.
///
/// Catching job control signals would break the terminal's job control, SIGTRAP belongs to
/// debuggers, and SIGKILL/SIGSTOP can't be caught at all.
pub const EXCLUDED: [Signo; 7] = [
    libc::SIGTRAP,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGTSTP,
    libc::SIGCONT,
    libc::SIGSTOP,
    libc::SIGKILL,
];

/// One past the highest valid signal number
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn nsig() -> Signo {
    libc::SIGRTMAX() + 1
}

/// One past the highest valid signal number
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn nsig() -> Signo {
    32
}

pub fn is_excluded(signo: Signo) -> bool {
    EXCLUDED.contains(&signo)
}

/// Human readable name for diagnostics, `SIGTERM`, `SIGRT3`, or the bare number
pub fn name(signo: Signo) -> Cow<'static, str> {
    if let Ok(signal) = Signal::try_from(signo) {
        return Cow::Borrowed(signal.as_str());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if signo >= libc::SIGRTMIN() && signo <= libc::SIGRTMAX() {
            return Cow::Owned(format!("SIGRT{}", signo - libc::SIGRTMIN()));
        }
    }

    Cow::Owned(signo.to_string())
}

/// Parses a signal given as a number (`15`) or a name (`TERM`, `sigterm`)
pub fn parse(value: &str) -> Result<Signo, String> {
    let value = value.trim();

    let signo = match value.parse::<Signo>() {
        Ok(signo) => signo,
        Err(_) => {
            let upper = value.to_ascii_uppercase();
            let full = if upper.starts_with("SIG") {
                upper
            } else {
                format!("SIG{}", upper)
            };

            Signal::from_str(&full)
                .map(|s| s as Signo)
                .map_err(|_| format!("unknown signal: {}", value))?
        }
    };

    if signo < 0 || signo >= nsig() {
        return Err(format!("signal out of range: {}", signo));
    }

    Ok(signo)
}

/// What the process does when a signal arrives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Write the signal info to the funnel
    Funnel,
    Ignore,
}

/// Sets the disposition of `signo`, every other signal is blocked while the handler runs
pub fn set_disposition(signo: Signo, disposition: Disposition) -> nix::Result<()> {
    // This is safe, sigaction is plain old data and every field is initialized below
    unsafe {
        let mut act: libc::sigaction = mem::zeroed();
        libc::sigfillset(&mut act.sa_mask);

        match disposition {
            Disposition::Funnel => {
                act.sa_sigaction = funnel::on_signal as usize;
                act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            }
            Disposition::Ignore => act.sa_sigaction = libc::SIG_IGN,
        }

        Errno::result(libc::sigaction(signo, &act, ptr::null_mut())).map(drop)
    }
}

/// Who receives a broadcast
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Every member of the caller's own process group, the caller included
    OwnGroup,
    /// A single process
    Process(Pid),
    /// Every member of the process group led by the pid
    Group(Pid),
}

impl Target {
    /// The pid argument `kill(2)` expects for this target
    pub fn as_raw(self) -> libc::pid_t {
        match self {
            Target::OwnGroup => 0,
            Target::Process(pid) => pid.as_raw(),
            Target::Group(pid) => -pid.as_raw(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::OwnGroup => f.write_str("own process group"),
            Target::Process(pid) => write!(f, "pid {}", pid),
            Target::Group(pid) => write!(f, "pgid {}", pid),
        }
    }
}

/// Best effort delivery of `signo` to `target`.
///
/// When the target is the caller's own group the caller ignores `signo` for the duration of
/// the send, then the funnel handler is put back. Delivery failures are dropped.
pub fn broadcast(target: Target, signo: Signo) {
    let own_group = target == Target::OwnGroup;

    if own_group {
        set_disposition(signo, Disposition::Ignore).ok();
    }

    // This is safe, kill has no memory effects on this process
    let sent = Errno::result(unsafe { libc::kill(target.as_raw(), signo) });

    if own_group {
        set_disposition(signo, Disposition::Funnel).ok();
    }

    match sent {
        Ok(_) => trace!("sent {} to {}", name(signo), target),
        Err(e) => trace!("failed to send {} to {}: {}", name(signo), target, e),
    }
}

#[cfg(test)]
pub(crate) fn current_handler(signo: Signo) -> nix::Result<libc::sighandler_t> {
    unsafe {
        let mut old: libc::sigaction = mem::zeroed();
        Errno::result(libc::sigaction(signo, ptr::null(), &mut old))?;
        Ok(old.sa_sigaction)
    }
}
