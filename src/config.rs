// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::OsString;

use clap::{App, Arg, ArgMatches};

use crate::signal::{self, Signo};

pub const SIGNAL: &str = "signal";
pub const MONITOR: &str = "monitor";
pub const VERBOSE: &str = "verbose";
pub const COMMAND: &str = "COMMAND";

/// Environment variable that may supply `--signal`
pub const SIGNAL_ENV: &str = "PIPEWATCH_SIGNAL";

/// Everything the command line decides
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Broadcast to the process group when the pipeline fails
    pub signal: Signo,
    pub verbose: u64,
    /// Fork a watchdog monitor
    pub monitor: bool,
    /// Pipeline stages, each run with `/bin/sh -c`
    pub commands: Vec<String>,
}

pub fn app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name(SIGNAL)
                .short("s")
                .long(SIGNAL)
                .value_name("SIGNUM")
                .env(SIGNAL_ENV)
                .default_value("TERM")
                .validator(|s| signal::parse(&s).map(drop))
                .help("signal sent to the process group on error, a number or a name")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(MONITOR)
                .short("m")
                .long(MONITOR)
                .help("fork a monitor process that signals the process group if pipewatch dies"),
        )
        .arg(
            Arg::with_name(VERBOSE)
                .short("v")
                .long(VERBOSE)
                .multiple(true)
                .help("verbose mode, repeat for more"),
        )
        .arg(
            Arg::with_name(COMMAND)
                .multiple(true)
                .help("pipeline stages, each run as `/bin/sh -c <COMMAND>`"),
        )
}

impl Config {
    /// Parses the command line.
    ///
    /// Asking for help, or giving no commands, is a `HelpDisplayed` error carrying the usage.
    pub fn from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = app().get_matches_from_safe(args)?;
        Self::from_matches(&matches)
    }

    pub fn from_matches(matches: &ArgMatches<'_>) -> Result<Self, clap::Error> {
        let commands: Vec<String> = matches
            .values_of(COMMAND)
            .map(|values| values.map(ToString::to_string).collect())
            .unwrap_or_default();

        if commands.is_empty() {
            return Err(usage());
        }

        let signal = matches
            .value_of(SIGNAL)
            .map(signal::parse)
            .unwrap_or(Ok(libc::SIGTERM))
            .map_err(|e| clap::Error::with_description(&e, clap::ErrorKind::InvalidValue))?;

        Ok(Self {
            signal,
            verbose: matches.occurrences_of(VERBOSE),
            monitor: matches.is_present(MONITOR),
            commands,
        })
    }
}

fn usage() -> clap::Error {
    let mut help = Vec::new();
    let message = match app().write_help(&mut help) {
        Ok(()) => String::from_utf8_lossy(&help).into_owned(),
        Err(e) => e.message,
    };

    clap::Error::with_description(&message, clap::ErrorKind::HelpDisplayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_args(vec!["pipewatch", "true"]).expect("config");

        assert_eq!(
            config,
            Config {
                signal: libc::SIGTERM,
                verbose: 0,
                monitor: false,
                commands: vec!["true".to_string()],
            }
        );
    }

    #[test]
    fn test_all_options() {
        let config = Config::from_args(vec![
            "pipewatch", "-s", "9", "-m", "-vv", "cat", "grep -v x",
        ])
        .expect("config");

        assert_eq!(config.signal, libc::SIGKILL);
        assert!(config.monitor);
        assert_eq!(config.verbose, 2);
        assert_eq!(config.commands, vec!["cat", "grep -v x"]);
    }

    #[test]
    fn test_signal_names() {
        let config =
            Config::from_args(vec!["pipewatch", "--signal", "HUP", "true"]).expect("config");
        assert_eq!(config.signal, libc::SIGHUP);
    }

    #[test]
    fn test_bad_signal() {
        let err = Config::from_args(vec!["pipewatch", "-s", "BOGUS", "true"]).unwrap_err();
        assert_eq!(err.kind, clap::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_no_commands_is_usage() {
        let err = Config::from_args(vec!["pipewatch"]).unwrap_err();
        assert_eq!(err.kind, clap::ErrorKind::HelpDisplayed);
        assert!(err.message.contains("--monitor"));
    }

    #[test]
    fn test_help() {
        let err = Config::from_args(vec!["pipewatch", "-h"]).unwrap_err();
        assert_eq!(err.kind, clap::ErrorKind::HelpDisplayed);
    }
}
