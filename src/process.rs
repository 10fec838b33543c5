// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running external commands.
//!
//! Every external tool the builders use is launched through a [`Runner`] so
//! that the pipelines can be driven against a recording fake in tests.

use std::{
    fmt,
    io::Write,
    process::{Command, Stdio},
};

use itertools::Itertools;
use tracing::debug;

use crate::error::ExecutionError;

/// A single external command to run.
#[derive(Clone, Debug)]
pub struct Invocation {
    argv: Vec<String>,
    stdin: Option<Vec<u8>>,
    allowed_exit_codes: Vec<i32>,
    capture: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            stdin: None,
            allowed_exit_codes: vec![0],
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feeds `data` to the process on standard input.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Replaces the set of exit codes that count as success.
    pub fn allow_exit_codes(mut self, codes: &[i32]) -> Self {
        self.allowed_exit_codes = codes.to_vec();
        self
    }

    /// Captures stdout and stderr instead of passing them through.
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn is_captured(&self) -> bool {
        self.capture
    }

    pub fn allows(&self, code: i32) -> bool {
        self.allowed_exit_codes.contains(&code)
    }

    fn error(&self, reason: impl Into<String>) -> ExecutionError {
        ExecutionError {
            command: self.to_string(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.iter().join(" "))
    }
}

/// Output of a completed process. Both streams are empty unless the
/// invocation asked for capture or the runner pipes output.
#[derive(Clone, Debug, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Launches external commands. Calls are synchronous; a call returns once the
/// process has exited.
pub trait Runner {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> Result<ProcessOutput, ExecutionError>;
}

/// Runs commands on the host.
pub struct SystemRunner {
    /// If set, output from uncaptured commands goes straight to the
    /// terminal. Interactive sessions pipe it instead so that it doesn't
    /// trample the progress display.
    passthrough: bool,
}

impl SystemRunner {
    pub fn new(interactive: bool) -> Self {
        Self { passthrough: !interactive }
    }
}

impl Runner for SystemRunner {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> Result<ProcessOutput, ExecutionError> {
        debug!(command = %invocation, "executing");

        let mut cmd = Command::new(invocation.program());
        cmd.args(&invocation.argv()[1..]);
        cmd.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        if invocation.is_captured() || !self.passthrough {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| invocation.error(format!("failed to spawn: {e}")))?;

        if let Some(data) = &invocation.stdin {
            // Dropping the handle closes the pipe so the child sees EOF.
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data).map_err(|e| {
                    invocation.error(format!("failed to write stdin: {e}"))
                })?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| invocation.error(format!("failed to wait: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(code) if invocation.allows(code) => {
                Ok(ProcessOutput { stdout, stderr })
            }
            code => Err(ExecutionError {
                command: invocation.to_string(),
                exit_code: code,
                stdout,
                stderr,
                reason: match code {
                    Some(_) => "-".to_string(),
                    None => format!("terminated by signal ({})", output.status),
                },
            }),
        }
    }
}
