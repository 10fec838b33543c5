// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structs, traits, and functions for driving a builder: printing its
//! configuration, checking prerequisites, and reporting progress as its
//! pipeline runs.

use std::{
    cell::RefCell,
    io::{Read, Write},
};

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::{
    builders::Builder,
    contrib::Contrib,
    error::ExecutionError,
    loopback::RetryPolicy,
    net::TapManager,
    params::BuildParameters,
    process::{Invocation, ProcessOutput, Runner},
    util::{check_executable_prerequisites, check_file_prerequisites},
};

const PROGRESS_TICK_INTERVAL: std::time::Duration =
    std::time::Duration::from_millis(100);

/// Receives progress updates from a running pipeline.
pub trait Ui {
    /// Marks the previous step (if any) as done and starts a new one.
    fn begin_step(&self, label: &str);

    /// Updates the description of what the current step is doing.
    fn set_substep(&self, substep: &str);

    /// Marks the current step as succeeded or failed.
    fn finish(&self, success: bool);
}

struct ActiveStep {
    label: String,
    bar: ProgressBar,
}

/// Displays one spinner per pipeline step. In non-interactive mode the bars
/// are hidden and steps are only reported through the log.
pub struct ProgressUi {
    multi: Option<MultiProgress>,
    current: RefCell<Option<ActiveStep>>,
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl ProgressUi {
    pub fn new(interactive: bool) -> Self {
        Self {
            multi: interactive.then(MultiProgress::new),
            current: RefCell::new(None),
        }
    }

    fn finish_current(&self, success: bool) {
        if let Some(step) = self.current.borrow_mut().take() {
            step.bar.set_message(step.label);
            step.bar.set_style(if success {
                style("✓ {msg:.green}")
            } else {
                style("⚠ {msg:.bold.red}")
            });
            step.bar.finish();
        }
    }
}

impl Ui for ProgressUi {
    fn begin_step(&self, label: &str) {
        self.finish_current(true);
        info!(step = label, "starting step");

        let bar = match &self.multi {
            Some(multi) => multi.add(ProgressBar::new_spinner()),
            None => ProgressBar::hidden(),
        };

        bar.set_style(ProgressStyle::default_spinner());
        bar.set_message(label.to_owned());
        bar.enable_steady_tick(PROGRESS_TICK_INTERVAL);
        *self.current.borrow_mut() =
            Some(ActiveStep { label: label.to_owned(), bar });
    }

    fn set_substep(&self, substep: &str) {
        if let Some(step) = self.current.borrow().as_ref() {
            step.bar.set_message(format!("{}: {}", step.label, substep));
        }
    }

    fn finish(&self, success: bool) {
        self.finish_current(success);
    }
}

/// The services a builder uses while it runs: a way to launch processes, a
/// place to report progress, the contrib tree, and host networking state.
pub struct Context<'a> {
    runner: &'a dyn Runner,
    ui: &'a dyn Ui,
    contrib: &'a Contrib,
    taps: &'a TapManager,
    unmap_retry: RetryPolicy,
}

impl<'a> Context<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        ui: &'a dyn Ui,
        contrib: &'a Contrib,
        taps: &'a TapManager,
    ) -> Self {
        Self { runner, ui, contrib, taps, unmap_retry: RetryPolicy::default() }
    }

    pub fn with_unmap_retry(mut self, policy: RetryPolicy) -> Self {
        self.unmap_retry = policy;
        self
    }

    /// Runs `invocation`, showing it as the current substep.
    pub fn run(
        &self,
        invocation: &Invocation,
    ) -> Result<ProcessOutput, ExecutionError> {
        self.ui.set_substep(&format!("executing: {invocation}"));
        self.runner.run(invocation)
    }

    pub fn step(&self, label: &str) {
        self.ui.begin_step(label);
    }

    pub fn contrib(&self) -> &Contrib {
        self.contrib
    }

    pub fn taps(&self) -> &TapManager {
        self.taps
    }

    pub fn unmap_retry(&self) -> RetryPolicy {
        self.unmap_retry
    }
}

/// Problems found while checking a build's prerequisites. Errors prevent the
/// build from starting; warnings are only displayed.
#[derive(Debug, Default)]
pub struct MissingPrerequisites {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl MissingPrerequisites {
    pub fn check(
        builder: &dyn Builder,
        params: &BuildParameters,
        contrib: &Contrib,
    ) -> Self {
        let prereqs = builder.prerequisites(params, contrib);
        let mut errors = check_file_prerequisites(&prereqs.files);
        errors.extend(check_executable_prerequisites(&prereqs.commands));
        let warnings = check_file_prerequisites(&prereqs.optional_files);
        Self { errors, warnings }
    }
}

/// Validates the request, prints the configuration, checks prerequisites,
/// and then runs the builder's pipeline.
pub fn run_build(
    builder: &dyn Builder,
    params: &BuildParameters,
    ctx: &Context,
    interactive: bool,
) -> anyhow::Result<()> {
    builder.validate(params)?;

    let mut stdout = std::io::stdout();
    builder.print_configuration(params, &mut stdout)?;
    println!();

    debug!(contrib = %ctx.contrib().root(), "checking prerequisites");
    let missing = MissingPrerequisites::check(builder, params, ctx.contrib());
    if !missing.warnings.is_empty() {
        println!("{}", "Some optional files were not found:".bold());
        for warning in &missing.warnings {
            println!("  {}", warning);
        }

        println!();
    }

    if !missing.errors.is_empty() {
        println!("{}", "Some prerequisites were not satisfied:".bold());
        for unsatisfied in &missing.errors {
            println!("  {}", unsatisfied);
        }

        println!();
        anyhow::bail!("some build prerequisites weren't satisfied");
    }

    if interactive {
        println!("Press Enter to continue or CTRL-C to cancel.");
        stdout.flush()?;
        std::io::stdin().read(&mut [0u8])?;
    }

    let result = builder.build_image(params, ctx);
    ctx.ui.finish(result.is_ok());
    match &result {
        Ok(()) => info!(output = %params.output, "build complete"),
        Err(e) => debug!(error = ?e, "build failed"),
    }

    result
}
