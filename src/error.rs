use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("{0}")]
    NixError(#[from] nix::Error),
    #[error("{context}: {source}")]
    Setup {
        context: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    /// Wraps an OS error from one of the startup steps with the name of the step
    pub fn setup(context: &'static str, source: nix::Error) -> Self {
        Self::from_kind(ErrorKind::Setup { context, source })
    }

    pub fn spawn(command: impl Into<String>, source: io::Error) -> Self {
        Self::from_kind(ErrorKind::Spawn {
            command: command.into(),
            source,
        })
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Config(msg.into()))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_setup_error_names_the_step() {
        let err = Error::setup("setpgid", Errno::EPERM);
        assert!(err.to_string().starts_with("setpgid: "));
        assert!(matches!(err.kind(), ErrorKind::Setup { .. }));
    }

    #[test]
    fn test_from_nix() {
        let err = Error::from(Errno::ECHILD);
        assert!(matches!(err.kind(), ErrorKind::NixError(Errno::ECHILD)));
    }
}
