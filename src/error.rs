// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types raised by the build pipeline.
//!
//! Pipeline functions return `anyhow::Result` and carry these types inside
//! the `anyhow::Error`, so callers that care about the failure class can
//! `downcast_ref` to them.

use thiserror::Error;

/// Bad or missing command-line parameters. Raised before any resource is
/// acquired.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A domain failure during a build, e.g. missing install media or a Windows
/// installation that reported an error from inside the guest.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BuildError(pub String);

impl BuildError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure to create or destroy a tap device.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NetworkError {
    message: String,
    #[source]
    source: ExecutionError,
}

impl NetworkError {
    pub fn new(message: impl Into<String>, source: ExecutionError) -> Self {
        Self { message: message.into(), source }
    }
}

/// An external process could not be spawned or exited with a status outside
/// its allowed set.
#[derive(Debug, Error)]
#[error(
    "unexpected error while running command\n\
     Command: {command}\n\
     Exit code: {}\n\
     Reason: {reason}\n\
     Stdout: {stdout:?}\n\
     Stderr: {stderr:?}",
    display_exit_code(.exit_code)
)]
pub struct ExecutionError {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub reason: String,
}

fn display_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn execution_error_renders_missing_exit_code() {
        let err = ExecutionError {
            command: "kpartx -d disk.img".to_string(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            reason: "No such file or directory".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("Command: kpartx -d disk.img"));
        assert!(msg.contains("Exit code: -"));
        assert!(msg.contains("Reason: No such file or directory"));
    }

    #[test]
    fn network_error_keeps_source() {
        let err = NetworkError::new(
            "Failed to bring up vmtap0.",
            ExecutionError {
                command: "ip link set vmtap0 up".to_string(),
                exit_code: Some(2),
                stdout: String::new(),
                stderr: "RTNETLINK answers: Operation not permitted".into(),
                reason: "-".to_string(),
            },
        );

        assert_eq!(err.to_string(), "Failed to bring up vmtap0.");
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("Exit code: 2"));
    }
}
