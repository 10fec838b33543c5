// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles for driving pipelines without touching the host.

use std::{cell::RefCell, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::{
    contrib::Contrib,
    error::ExecutionError,
    loopback::RetryPolicy,
    net::TapManager,
    process::{Invocation, ProcessOutput, Runner},
    runner::{Context, Ui},
};

/// One command the fake was asked to run.
#[derive(Clone, Debug)]
pub struct Call {
    pub argv: Vec<String>,
    pub ok: bool,
}

type Hook = Box<dyn Fn(&[String])>;

struct Failure {
    prefix: Vec<String>,
    remaining: usize,
}

fn has_prefix(argv: &[String], prefix: &[String]) -> bool {
    argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p)
}

fn owned(prefix: &[&str]) -> Vec<String> {
    prefix.iter().map(|s| s.to_string()).collect()
}

/// A [`Runner`] that records every invocation instead of executing it.
///
/// Commands succeed with empty output unless told otherwise. `kpartx -l`
/// reports two partitions by default. Hooks run for successful commands and
/// stand in for the side effects the real tools would have.
pub struct FakeRunner {
    calls: RefCell<Vec<Call>>,
    fail_at: Option<usize>,
    failures: RefCell<Vec<Failure>>,
    responses: Vec<(Vec<String>, String)>,
    hooks: Vec<(Vec<String>, Hook)>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            fail_at: None,
            failures: RefCell::new(Vec::new()),
            responses: vec![(
                owned(&["kpartx", "-l"]),
                "loop0p1 : 0 1024000 /dev/loop0 2048\n\
                 loop0p2 : 0 8192000 /dev/loop0 1026048\n"
                    .to_string(),
            )],
            hooks: Vec::new(),
        }
    }

    /// Fails the `index`th (zero-based) invocation, whatever it is.
    pub fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Fails the next `times` invocations that start with `prefix`.
    pub fn fail_matching(self, prefix: &[&str], times: usize) -> Self {
        self.failures
            .borrow_mut()
            .push(Failure { prefix: owned(prefix), remaining: times });
        self
    }

    /// Runs `hook` with the argv of every successful invocation that starts
    /// with `prefix`.
    pub fn on(
        mut self,
        prefix: &[&str],
        hook: impl Fn(&[String]) + 'static,
    ) -> Self {
        self.hooks.push((owned(prefix), Box::new(hook)));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// Every invocation, rendered as a command line.
    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.argv.join(" ")).collect()
    }

    /// How many invocations started with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        let prefix = owned(prefix);
        self.calls
            .borrow()
            .iter()
            .filter(|c| has_prefix(&c.argv, &prefix))
            .count()
    }

    /// How many invocations that started with `prefix` succeeded.
    pub fn succeeded(&self, prefix: &[&str]) -> usize {
        let prefix = owned(prefix);
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.ok && has_prefix(&c.argv, &prefix))
            .count()
    }

    fn should_fail(&self, index: usize, argv: &[String]) -> bool {
        if self.fail_at == Some(index) {
            return true;
        }

        let mut failures = self.failures.borrow_mut();
        match failures
            .iter_mut()
            .find(|f| f.remaining > 0 && has_prefix(argv, &f.prefix))
        {
            Some(failure) => {
                failure.remaining -= 1;
                true
            }
            None => false,
        }
    }
}

impl Runner for FakeRunner {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> Result<ProcessOutput, ExecutionError> {
        let argv = invocation.argv().to_vec();
        let index = self.calls.borrow().len();
        let fail = self.should_fail(index, &argv);
        self.calls.borrow_mut().push(Call { argv: argv.clone(), ok: !fail });

        if fail {
            return Err(ExecutionError {
                command: invocation.to_string(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "injected failure".to_string(),
                reason: "-".to_string(),
            });
        }

        for (prefix, hook) in &self.hooks {
            if has_prefix(&argv, prefix) {
                hook(&argv);
            }
        }

        let stdout = self
            .responses
            .iter()
            .find(|(prefix, _)| has_prefix(&argv, prefix))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(ProcessOutput { stdout, stderr: String::new() })
    }
}

pub struct NullUi;

impl Ui for NullUi {
    fn begin_step(&self, _label: &str) {}
    fn set_substep(&self, _substep: &str) {}
    fn finish(&self, _success: bool) {}
}

/// Owns everything a [`Context`] borrows, plus scratch directories for the
/// workspace root, build outputs, and the tap device search path.
pub struct TestEnv {
    pub runner: FakeRunner,
    pub ui: NullUi,
    pub contrib: Contrib,
    pub taps: TapManager,
    _tmp: TempDir,
    pub root: Utf8PathBuf,
}

impl TestEnv {
    pub fn new(runner: FakeRunner) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        for dir in ["work", "out", "net"] {
            std::fs::create_dir(root.join(dir)).unwrap();
        }

        Self {
            runner,
            ui: NullUi,
            contrib: Contrib::new(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/contrib"
            )),
            taps: TapManager::new(root.join("net"), "builder"),
            _tmp: tmp,
            root,
        }
    }

    pub fn ctx(&self) -> Context<'_> {
        Context::new(&self.runner, &self.ui, &self.contrib, &self.taps)
            .with_unmap_retry(RetryPolicy {
                attempts: 10,
                delay: Duration::ZERO,
            })
    }

    pub fn work_root(&self) -> Utf8PathBuf {
        self.root.join("work")
    }

    pub fn output(&self, name: &str) -> Utf8PathBuf {
        self.root.join("out").join(name)
    }

    /// True when no workspace is left under the work root.
    pub fn work_root_is_empty(&self) -> bool {
        std::fs::read_dir(self.work_root()).unwrap().next().is_none()
    }
}

/// Creates an empty file at `path`, along with its parent directories.
pub fn touch(path: &Utf8Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, "").unwrap();
}

/// Returns the argument following `flag` in `argv`.
pub fn arg_after<'a>(argv: &'a [String], flag: &str) -> &'a str {
    let pos = argv.iter().position(|a| a == flag).unwrap();
    &argv[pos + 1]
}

/// Removes everything inside `dir`, standing in for the files that vanish
/// from a mount point when the filesystem behind it is unmounted.
pub fn clear_dir(dir: &Utf8Path) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
    }
}
