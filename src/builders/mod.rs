// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image builders and the registry the command line is built from.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::ArgMatches;
use colored::Colorize;
use itertools::Itertools;

use crate::{
    contrib::Contrib,
    error::ValidationError,
    params::{Arch, BuildParameters, OsOptions},
    runner::Context,
};

pub mod centos;
pub mod rhel;
mod virt_install;
pub mod windows;

/// What must be present on the host before a build can start.
#[derive(Debug, Default)]
pub struct Prerequisites {
    /// Executables that must be on `PATH`.
    pub commands: Vec<&'static str>,

    /// Files that must exist.
    pub files: Vec<Utf8PathBuf>,

    /// Files the build uses if they exist and skips otherwise.
    pub optional_files: Vec<Utf8PathBuf>,
}

/// An image builder. Each builder contributes a subcommand to the command
/// line and owns the pipeline that produces its image.
pub trait Builder {
    fn name(&self) -> &'static str;

    /// A one-line description for `--help`.
    fn about(&self) -> &'static str;

    fn arches(&self) -> &'static [Arch];

    /// Adds this builder's options to its subcommand.
    fn populate_options(&self, cmd: clap::Command) -> clap::Command;

    fn parse_options(
        &self,
        matches: &ArgMatches,
    ) -> Result<OsOptions, clap::Error>;

    /// Checks the parameters against what this builder supports. Nothing is
    /// acquired until validation passes.
    fn validate(
        &self,
        params: &BuildParameters,
    ) -> Result<(), ValidationError> {
        if !self.arches().contains(&params.arch) {
            return Err(ValidationError::new(format!(
                "{} does not support {}; supported architectures: {}",
                self.name(),
                params.arch,
                self.arches().iter().join(", ")
            )));
        }

        self.validate_options(params)
    }

    /// Builder-specific validation, run after the architecture check.
    fn validate_options(
        &self,
        params: &BuildParameters,
    ) -> Result<(), ValidationError>;

    fn prerequisites(
        &self,
        params: &BuildParameters,
        contrib: &Contrib,
    ) -> Prerequisites;

    /// Prints the options that only this builder has.
    fn print_options(
        &self,
        params: &BuildParameters,
        out: &mut dyn Write,
    ) -> std::io::Result<()>;

    /// Prints the full configuration of the build about to run.
    fn print_configuration(
        &self,
        params: &BuildParameters,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        writeln!(out, "{}", format!("Building {} image", self.name()).bold())?;
        print_field(out, "arch", params.arch)?;
        print_field(out, "ram", format!("{} MiB", params.ram))?;
        print_field(out, "vcpus", params.vcpus)?;
        print_field(out, "interface", &params.interface)?;
        print_field(out, "work root", &params.work_root)?;
        print_field(out, "output", &params.output)?;
        self.print_options(params, out)
    }

    /// Runs the pipeline. On success the artifact is at `params.output`; on
    /// failure nothing is left there and every acquired resource has been
    /// released.
    fn build_image(
        &self,
        params: &BuildParameters,
        ctx: &Context,
    ) -> anyhow::Result<()>;
}

pub(crate) fn print_field(
    out: &mut dyn Write,
    label: &str,
    value: impl std::fmt::Display,
) -> std::io::Result<()> {
    writeln!(out, "  {:<18}{}", format!("{label}:").bold(), value)
}

pub(crate) fn print_optional<T: std::fmt::Display>(
    out: &mut dyn Write,
    label: &str,
    value: Option<T>,
) -> std::io::Result<()> {
    match value {
        Some(v) => print_field(out, label, v),
        None => print_field(out, label, "-".dimmed()),
    }
}

/// Every builder, in the order they're listed in `--help`.
pub fn builders() -> Vec<Box<dyn Builder>> {
    vec![
        Box::new(centos::CentosBuilder),
        Box::new(rhel::RhelBuilder),
        Box::new(windows::WindowsBuilder),
    ]
}

/// Looks up a builder by its subcommand name.
pub fn lookup(name: &str) -> Option<Box<dyn Builder>> {
    builders().into_iter().find(|b| b.name() == name)
}
