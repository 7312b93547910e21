// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const TIMEOUT: Duration = Duration::from_secs(20);

fn pipewatch() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_pipewatch"));
    command
        .env_remove("RUST_LOG")
        .env_remove("PIPEWATCH_SIGNAL")
        .stdin(Stdio::null());
    command
}

fn run(args: &[&str]) -> Output {
    pipewatch().args(args).output().expect("failed to run pipewatch")
}

fn wait_timeout(child: &mut Child) -> ExitStatus {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }

        if start.elapsed() > TIMEOUT {
            child.kill().ok();
            panic!("pipewatch did not exit in time");
        }

        thread::sleep(Duration::from_millis(20));
    }
}

fn wait_for_file(path: &Path) -> String {
    let start = Instant::now();

    while start.elapsed() < TIMEOUT {
        if let Ok(contents) = fs::read_to_string(path) {
            if !contents.is_empty() {
                return contents;
            }
        }

        thread::sleep(Duration::from_millis(20));
    }

    panic!("{} never appeared", path.display());
}

/// A stage that records the first `signal` it gets into `dir/<name>` and then exits 0
fn trapping_stage(dir: &Path, signal: &str, name: &str) -> String {
    format!(
        "trap 'echo {sig} > {dir}/{name}; exit 0' {sig}; touch {dir}/ready; \
         while :; do sleep 0.1; done",
        sig = signal,
        dir = dir.display(),
        name = name,
    )
}

fn ready(dir: &Path) {
    let start = Instant::now();
    let ready = dir.join("ready");

    while !ready.exists() {
        assert!(start.elapsed() < TIMEOUT, "stage never became ready");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_all_stages_succeed() {
    let output = run(&["true", "true", "true"]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn test_data_flows_through_the_pipeline() {
    let output = run(&["printf 'b\\na\\n'", "sort"]);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "a\nb\n");
}

#[test]
fn test_failing_stage_sets_status() {
    let output = run(&["true", "exit 3", "true"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_racing_failures() {
    let output = run(&["exit 2", "exit 2"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_killed_stage_reports_signal() {
    let output = run(&["kill -TERM $$"]);
    assert_eq!(output.status.code(), Some(libc::SIGTERM));
}

#[test]
fn test_verbose_tree() {
    let output = run(&["-v", "true", "false", "true"]);
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    let supervisor = stderr
        .lines()
        .filter(|line| line.starts_with("pipewatch("))
        .count();
    let members = stderr.lines().filter(|line| line.starts_with("   |-")).count();

    assert_eq!(supervisor, 1, "{}", stderr);
    assert_eq!(members, 3, "{}", stderr);
}

#[test]
fn test_quiet_by_default() {
    let output = run(&["true"]);
    assert!(output.stderr.is_empty());
}

#[test]
fn test_no_commands_is_usage() {
    let output = run(&[]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("USAGE"));
}

#[test]
fn test_help_fails() {
    let output = run(&["--help"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_bad_signal_fails() {
    let output = run(&["-s", "NOPE", "true"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_external_signal_is_forwarded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = pipewatch()
        .arg(trapping_stage(dir.path(), "USR1", "usr1"))
        .spawn()
        .expect("spawn");

    ready(dir.path());
    kill(Pid::from_raw(child.id() as i32), Signal::SIGUSR1).expect("kill");

    assert_eq!(wait_for_file(&dir.path().join("usr1")).trim(), "USR1");
    assert_eq!(wait_timeout(&mut child).code(), Some(0));
}

#[test]
fn test_failure_is_broadcast_to_siblings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let failing = format!(
        "while [ ! -e {}/ready ]; do sleep 0.05; done; exit 3",
        dir.path().display()
    );

    let mut child = pipewatch()
        .arg(trapping_stage(dir.path(), "TERM", "term"))
        .arg(failing)
        .spawn()
        .expect("spawn");

    assert_eq!(wait_timeout(&mut child).code(), Some(3));
    assert_eq!(wait_for_file(&dir.path().join("term")).trim(), "TERM");
}

#[test]
fn test_configured_signal_is_broadcast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let failing = format!(
        "while [ ! -e {}/ready ]; do sleep 0.05; done; exit 4",
        dir.path().display()
    );

    let mut child = pipewatch()
        .args(&["--signal", "HUP"])
        .arg(trapping_stage(dir.path(), "HUP", "hup"))
        .arg(failing)
        .spawn()
        .expect("spawn");

    assert_eq!(wait_timeout(&mut child).code(), Some(4));
    assert_eq!(wait_for_file(&dir.path().join("hup")).trim(), "HUP");
}

#[test]
fn test_monitor_cleans_up_after_sigkill() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = pipewatch()
        .arg("--monitor")
        .arg(trapping_stage(dir.path(), "TERM", "term"))
        .spawn()
        .expect("spawn");

    ready(dir.path());
    child.kill().expect("SIGKILL");

    let status = wait_timeout(&mut child);
    assert_eq!(status.signal(), Some(libc::SIGKILL));

    assert_eq!(wait_for_file(&dir.path().join("term")).trim(), "TERM");
}

#[test]
fn test_monitor_never_kills_a_successful_run() {
    for _ in 0..20 {
        let output = run(&["-m", "-s", "KILL", "true"]);
        assert_eq!(output.status.signal(), None, "{:?}", output.status);
        assert_eq!(output.status.code(), Some(0));
    }
}
