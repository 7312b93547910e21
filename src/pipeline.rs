// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal pipeline engine: commands started together, stdout of each feeding stdin of the next
//!
//! The engine only starts processes. It never waits on them, reaping belongs to the
//! supervision loop.

use std::env;
use std::fmt;
use std::process::{Child, ChildStdout, Command, Stdio};

use nix::unistd::Pid;
use tracing::debug;

use crate::Error;

/// When set, the engine keeps its own diagnostics to itself
pub const QUIET_ENV: &str = "PIPELINE_QUIET";

/// Interpreter each pipeline stage is run with
pub const SHELL: &str = "/bin/sh";

/// Read-only view of a started pipeline, for diagnostics
pub trait PipelineInfo {
    fn ncommands(&self) -> usize;

    /// Pid of the member at `index`, `None` if not started
    fn pid(&self, index: usize) -> Option<Pid>;

    /// Short description of the member at `index`
    fn label(&self, index: usize) -> Option<String>;

    /// The whole pipeline, as a shell would write it
    fn describe(&self) -> String;
}

/// One stage of a pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipeCmd {
    program: String,
    args: Vec<String>,
}

impl PipeCmd {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));

    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

impl fmt::Display for PipeCmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Pipeline {
    commands: Vec<PipeCmd>,
    children: Vec<Child>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage running `program` with `args`
    pub fn command_args<I, S>(&mut self, program: &str, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.push(PipeCmd::new(program, args));
        self
    }

    /// Appends a stage run by the shell, `/bin/sh -c <line>`
    pub fn shell(&mut self, line: &str) -> &mut Self {
        self.command_args(SHELL, vec!["-c", line])
    }

    pub fn command(&self, index: usize) -> Option<&PipeCmd> {
        self.commands.get(index)
    }

    pub fn is_started(&self) -> bool {
        !self.children.is_empty()
    }

    /// Starts every stage, connected by pipes.
    ///
    /// The first stage reads the supervisor's stdin and the last writes its stdout; every
    /// stage inherits stderr and the supervisor's process group. If a stage fails to spawn the
    /// stages already running are left to the caller.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.commands.is_empty() {
            return Err(Error::config("pipeline has no commands"));
        }
        if self.is_started() {
            return Err(Error::from("pipeline already started"));
        }

        let quiet = env::var_os(QUIET_ENV).is_some();
        let last = self.commands.len() - 1;
        let mut upstream: Option<ChildStdout> = None;

        for (index, cmd) in self.commands.iter().enumerate() {
            let mut command = cmd.command();

            if let Some(stdout) = upstream.take() {
                command.stdin(Stdio::from(stdout));
            }
            if index != last {
                command.stdout(Stdio::piped());
            }

            let mut child = command
                .spawn()
                .map_err(|e| Error::spawn(cmd.to_string(), e))?;

            if !quiet {
                debug!("pipeline: started {} as {}", cmd, child.id());
            }

            upstream = child.stdout.take();
            self.children.push(child);
        }

        Ok(())
    }
}

impl PipelineInfo for Pipeline {
    fn ncommands(&self) -> usize {
        self.commands.len()
    }

    fn pid(&self, index: usize) -> Option<Pid> {
        self.children
            .get(index)
            .map(|child| Pid::from_raw(child.id() as libc::pid_t))
    }

    fn label(&self, index: usize) -> Option<String> {
        self.command(index).map(ToString::to_string)
    }

    fn describe(&self) -> String {
        self.commands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read as _;

    #[test]
    fn test_display() {
        let mut pipeline = Pipeline::new();
        pipeline.shell("true").shell("grep -v 'x'").command_args("cat", vec!["-n"]);

        assert_eq!(pipeline.ncommands(), 3);
        assert_eq!(
            pipeline.command(0).unwrap().to_string(),
            "/bin/sh -c true"
        );
        assert_eq!(
            pipeline.describe(),
            r"/bin/sh -c true | /bin/sh -c 'grep -v '\''x'\''' | cat -n"
        );
        assert_eq!(pipeline.pid(0), None);
    }

    #[test]
    fn test_start_connects_stages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");

        let mut pipeline = Pipeline::new();
        pipeline
            .shell("printf 'b\\na\\n'")
            .shell("sort")
            .shell(&format!("cat > {}", out.display()));
        pipeline.start().expect("start");

        for index in 0..pipeline.ncommands() {
            let pid = pipeline.pid(index).expect("started");
            nix::sys::wait::waitpid(pid, None).expect("waitpid");
        }

        let mut contents = String::new();
        std::fs::File::open(&out)
            .expect("open")
            .read_to_string(&mut contents)
            .expect("read");
        assert_eq!(contents, "a\nb\n");
    }

    #[test]
    fn test_start_twice_and_empty() {
        assert!(Pipeline::new().start().is_err());

        let mut pipeline = Pipeline::new();
        pipeline.shell("true");
        pipeline.start().expect("start");
        assert!(pipeline.start().is_err());

        let pid = pipeline.pid(0).expect("started");
        nix::sys::wait::waitpid(pid, None).expect("waitpid");
    }

    #[test]
    fn test_spawn_failure_names_the_command() {
        let mut pipeline = Pipeline::new();
        pipeline.command_args("/nonexistent/pipewatch-test", Vec::<String>::new());

        let err = pipeline.start().expect_err("spawn should fail");
        assert!(err.to_string().contains("/nonexistent/pipewatch-test"));
    }
}
