// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::{close, pipe2, read as nix_read, write as nix_write};
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug)]
pub struct Read;
#[derive(Clone, Copy, Debug)]
pub struct Write;

// A marker trait to designate the end of the pipe this represents
pub trait End: Clone + Copy + Debug {
    fn display() -> &'static str;
}

impl End for Read {
    fn display() -> &'static str {
        "Read"
    }
}
impl End for Write {
    fn display() -> &'static str {
        "Write"
    }
}

/// One end of an OS pipe, closed on drop
#[derive(Debug)]
pub struct PipeEnd<E: End> {
    raw_fd: RawFd,
    ghost: PhantomData<E>,
}

impl<E: End> PipeEnd<E> {
    /// Forget the fd so that drop does not close it
    pub fn forget(&mut self) {
        self.raw_fd = -1;
    }
}

impl PipeEnd<Read> {
    /// Reads until `buf` is full, end-of-stream, or an error.
    ///
    /// Interrupted reads are retried. Returns the number of bytes read, which is only
    /// short of `buf.len()` at end-of-stream.
    pub fn read_full(&self, buf: &mut [u8]) -> nix::Result<usize> {
        let mut filled = 0;

        while filled < buf.len() {
            match nix_read(self.raw_fd, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(filled)
    }
}

impl<E: End> FromRawFd for PipeEnd<E> {
    unsafe fn from_raw_fd(raw_fd: RawFd) -> Self {
        Self {
            raw_fd,
            ghost: PhantomData,
        }
    }
}

impl<E: End> AsRawFd for PipeEnd<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd
    }
}

impl<E: End> IntoRawFd for PipeEnd<E> {
    fn into_raw_fd(mut self) -> RawFd {
        let raw_fd = self.raw_fd;
        self.forget();
        raw_fd
    }
}

impl<E: End> Drop for PipeEnd<E> {
    fn drop(&mut self) {
        match self.raw_fd {
            // don't implicitly close any of the std io
            0..=2 => return,
            // don't close -1, NULL
            i if i < 0 => return,
            _ => (),
        }

        trace!("closing fd: {} ({})", self.raw_fd, E::display());

        close(self.raw_fd)
            .map_err(|e| warn!("error closing file handle ({}): {}", self.raw_fd, e))
            .ok();
    }
}

impl io::Write for PipeEnd<Write> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        nix_write(self.as_raw_fd(), buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        // pipes are unbuffered
        Ok(())
    }
}

/// A close-on-exec pipe, neither end leaks into the pipeline's commands
pub struct Pipe {
    read: PipeEnd<Read>,
    write: PipeEnd<Write>,
}

impl Pipe {
    /// Creates a new pipe, if possible.
    ///
    /// It's expected that this is created before forking, and then split after forking.
    pub fn new() -> nix::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        trace!("created pipe, read: {} write: {}", read, write);

        // This is safe, because the PipeEnds are taking direct ownership of the fds
        unsafe {
            Ok(Self {
                read: PipeEnd::from_raw_fd(read),
                write: PipeEnd::from_raw_fd(write),
            })
        }
    }

    pub fn take_reader(self) -> PipeEnd<Read> {
        let Pipe { read, .. } = self;
        read
    }

    pub fn split(self) -> (PipeEnd<Read>, PipeEnd<Write>) {
        (self.read, self.write)
    }
}
