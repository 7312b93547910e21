// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Turns asynchronous signal delivery into an ordered stream of events.
//!
//! Every catchable signal gets the same handler, which does one thing: write the raw
//! `siginfo_t` to a close-on-exec pipe. The supervision loop reads those records back with
//! plain blocking reads, so no decision is ever made inside the handler.

use std::fmt;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void, siginfo_t};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::pipe::{Pipe, PipeEnd, Read, Write};
use crate::signal::{self, Disposition, Signo};
use crate::Error;

/// Write end of the funnel, `-1` until a funnel exists or after the handler gave up on it
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const RECORD_LEN: usize = mem::size_of::<siginfo_t>();

/// The signal handler.
///
/// Only async-signal-safe calls are made here, and the interrupted code's `errno` is left as
/// it was. A short or failed write closes the write end, which the reader then observes as
/// end-of-stream.
pub extern "C" fn on_signal(_signo: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    // This is safe, errno is thread local and the handler runs on the interrupted thread
    let saved = unsafe { *errno_location() };

    write_record(info);

    unsafe {
        *errno_location() = saved;
    }
}

fn write_record(info: *const siginfo_t) {
    let fd = WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }

    // This is safe, the kernel hands us a valid siginfo_t for SA_SIGINFO handlers
    let written = unsafe { libc::write(fd, info as *const c_void, RECORD_LEN) };

    if written != RECORD_LEN as isize
        && WRITE_FD
            .compare_exchange(fd, -1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

/// One delivered signal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalEvent {
    /// The signal number
    pub signo: Signo,
    /// The process that raised the signal, or the child whose state changed
    pub pid: Pid,
    /// `si_code`, e.g. `CLD_EXITED` or `CLD_KILLED` for SIGCHLD
    pub code: c_int,
    /// For SIGCHLD the exit code, or the signal that stopped or killed the child
    pub status: c_int,
}

impl SignalEvent {
    pub fn is_child(&self) -> bool {
        self.signo == libc::SIGCHLD
    }

    /// True if the child exited normally (as opposed to killed, stopped or continued)
    pub fn exited(&self) -> bool {
        self.code == libc::CLD_EXITED
    }
}

impl From<&siginfo_t> for SignalEvent {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn from(info: &siginfo_t) -> Self {
        // This is safe, si_pid and si_status are read from the union that the kernel filled
        //   for this signal; for non-child signals si_status is simply not meaningful
        let (pid, status) = unsafe { (info.si_pid(), info.si_status()) };

        Self {
            signo: info.si_signo,
            pid: Pid::from_raw(pid),
            code: info.si_code,
            status,
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn from(info: &siginfo_t) -> Self {
        Self {
            signo: info.si_signo,
            pid: Pid::from_raw(info.si_pid),
            code: info.si_code,
            status: info.si_status,
        }
    }
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_child() {
            write!(f, "status={}:{}", self.pid, self.status)
        } else {
            write!(f, "signal={}:{}", self.pid, self.signo)
        }
    }
}

/// The read side of the funnel, only the supervision loop reads from it
pub struct Funnel {
    read: PipeEnd<Read>,
}

impl Funnel {
    /// Creates the funnel pipe and publishes its write end to the handler.
    ///
    /// No handler is installed yet, see [`Funnel::install`]. Only one funnel may exist per
    /// process.
    pub fn new() -> Result<Self, Error> {
        let (read, write) = Pipe::new()
            .map_err(|e| Error::setup("pipe", e))?
            .split();

        // A full pipe must fail the handler's write rather than block it
        fcntl(write.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| Error::setup("fcntl", e))?;

        let write = write.into_raw_fd();
        if WRITE_FD
            .compare_exchange(-1, write, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // This is safe, ownership was just released by into_raw_fd
            drop(unsafe { PipeEnd::<Write>::from_raw_fd(write) });
            return Err(Error::setup("funnel", Errno::EBUSY));
        }

        debug!("signal funnel created, write end: {}", write);
        Ok(Self { read })
    }

    #[cfg(test)]
    pub(crate) fn from_reader(read: PipeEnd<Read>) -> Self {
        Self { read }
    }

    /// Points every catchable signal at the funnel.
    ///
    /// Signal numbers the OS rejects as invalid are skipped, any other failure is fatal.
    /// Returns the number of signals installed.
    pub fn install(&self) -> Result<usize, Error> {
        let mut installed = 0;

        for signo in 1..signal::nsig() {
            if signal::is_excluded(signo) {
                continue;
            }

            if install_one(signo)? {
                installed += 1;
            }
        }

        debug!("installed handlers for {} signals", installed);
        Ok(installed)
    }

    /// Blocks for the next signal event.
    ///
    /// Interrupted reads are retried. End-of-stream is reported as `EPIPE`, a partial record
    /// as `EIO`.
    pub fn next_event(&self) -> Result<SignalEvent, Errno> {
        loop {
            // This is safe, siginfo_t is plain old data and all zeroes is a valid value
            let mut info: siginfo_t = unsafe { mem::zeroed() };
            let buf = unsafe {
                slice::from_raw_parts_mut(&mut info as *mut siginfo_t as *mut u8, RECORD_LEN)
            };

            match self.read.read_full(buf) {
                Ok(RECORD_LEN) => return Ok(SignalEvent::from(&info)),
                Ok(0) => return Err(Errno::EPIPE),
                Ok(_) => return Err(Errno::EIO),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Installs the funnel handler for one signal, `Ok(false)` if the OS says it isn't a signal
pub(crate) fn install_one(signo: Signo) -> Result<bool, Error> {
    match signal::set_disposition(signo, Disposition::Funnel) {
        Ok(()) => Ok(true),
        Err(Errno::EINVAL) => {
            trace!("skipping signal {}", signo);
            Ok(false)
        }
        Err(e) => Err(Error::setup("sigaction", e)),
    }
}

/// Points the handler at `fd`, returning the previous write end
#[cfg(test)]
pub(crate) fn swap_write_fd(fd: c_int) -> c_int {
    WRITE_FD.swap(fd, Ordering::SeqCst)
}

/// Runs `body` in a forked, single threaded child and returns its exit code.
///
/// The funnel is process wide, so tests that repoint it or signal their own process group run
/// here. `body` must not panic or allocate, it reports failures through its return value.
#[cfg(test)]
pub(crate) fn in_child(body: fn() -> c_int) -> c_int {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => unsafe { libc::_exit(body()) },
        ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid") {
            WaitStatus::Exited(_, code) => code,
            other => panic!("child ended with {:?}", other),
        },
    }
}
