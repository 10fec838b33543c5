// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command line. Each builder in the registry contributes a subcommand
//! carrying the common flags plus its own options.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use clap::{error::ErrorKind, ArgAction, ArgMatches, Args, FromArgMatches};

use crate::{
    builders::{self, Builder},
    contrib::DEFAULT_CONTRIB_DIR,
    params::{Arch, BuildParameters},
};

pub const DEFAULT_WORK_ROOT: &str = "/var/lib/libvirt/images";

#[derive(Args, Clone, Debug)]
pub struct CommonArgs {
    /// The architecture of the image to build.
    #[arg(long, value_enum, default_value_t = Arch::Amd64)]
    pub arch: Arch,

    /// Memory to give the installation VM, in MiB.
    #[arg(long, default_value_t = 2048)]
    pub ram: u32,

    /// Virtual CPUs to give the installation VM.
    #[arg(long, default_value_t = 4)]
    pub vcpus: u32,

    /// The host bridge the installation VM's NIC is attached to.
    #[arg(long, default_value = "virbr0")]
    pub interface: String,

    /// Where to put the finished image. Nothing is written here unless the
    /// build succeeds.
    #[arg(short, long)]
    pub output: Utf8PathBuf,

    /// The directory in which each build creates its temporary workspace.
    #[arg(long, env = "MIB_WORK_ROOT", default_value = DEFAULT_WORK_ROOT)]
    pub work_root: Utf8PathBuf,

    /// The directory holding kickstarts, answer file templates, and guest
    /// scripts.
    #[arg(long, env = "MIB_CONTRIB_DIR", default_value = DEFAULT_CONTRIB_DIR)]
    pub contrib_dir: Utf8PathBuf,

    /// Forces the tool to run in an interactive or non-interactive mode. If
    /// not set, the tool infers whether to run interactively from whether it
    /// is running in an interactive terminal.
    #[arg(long)]
    pub interactive: Option<bool>,

    /// Log more detail. Overridden by RUST_LOG.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// How the tool itself should behave, as opposed to what it should build.
#[derive(Clone, Debug)]
pub struct Settings {
    pub contrib_dir: Utf8PathBuf,
    pub interactive: Option<bool>,
    pub verbose: u8,
}

/// A parsed command line.
pub struct Request {
    pub builder: Box<dyn Builder>,
    pub params: BuildParameters,
    pub settings: Settings,
}

pub fn command() -> clap::Command {
    let mut cmd = clap::Command::new("mib")
        .about("Builds CentOS, RHEL, and Windows images for fleet deployment")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true);

    for builder in builders::builders() {
        let sub = clap::Command::new(builder.name()).about(builder.about());
        let sub = CommonArgs::augment_args(sub);
        cmd = cmd.subcommand(builder.populate_options(sub));
    }

    cmd
}

/// Parses the process's command line, exiting with a usage message if it is
/// malformed.
pub fn parse() -> Request {
    parse_from(std::env::args_os()).unwrap_or_else(|e| e.exit())
}

pub fn parse_from<I, T>(args: I) -> Result<Request, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command().try_get_matches_from(args)?;
    request_from(&matches)
}

fn request_from(matches: &ArgMatches) -> Result<Request, clap::Error> {
    let Some((name, sub)) = matches.subcommand() else {
        return Err(command()
            .error(ErrorKind::MissingSubcommand, "an image type is required"));
    };

    let Some(builder) = builders::lookup(name) else {
        return Err(command().error(
            ErrorKind::InvalidSubcommand,
            format!("unknown image type '{name}'"),
        ));
    };

    let common = CommonArgs::from_arg_matches(sub)?;
    let os = builder.parse_options(sub)?;

    Ok(Request {
        builder,
        params: BuildParameters {
            arch: common.arch,
            ram: common.ram,
            vcpus: common.vcpus,
            output: common.output,
            interface: common.interface,
            work_root: common.work_root,
            os,
        },
        settings: Settings {
            contrib_dir: common.contrib_dir,
            interactive: common.interactive,
            verbose: common.verbose,
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::OsOptions;

    #[test]
    fn command_is_well_formed() {
        command().debug_assert();
    }

    #[test]
    fn common_defaults() {
        let request = parse_from([
            "mib",
            "centos",
            "-o",
            "/out/centos.tar.gz",
            "--work-root",
            "/scratch",
            "--contrib-dir",
            "/contrib",
        ])
        .unwrap();

        assert_eq!(request.builder.name(), "centos");
        let params = &request.params;
        assert_eq!(params.arch, Arch::Amd64);
        assert_eq!(params.ram, 2048);
        assert_eq!(params.vcpus, 4);
        assert_eq!(params.interface, "virbr0");
        assert_eq!(params.output, "/out/centos.tar.gz");
        assert_eq!(params.work_root, "/scratch");
        assert_eq!(request.settings.contrib_dir, "/contrib");
        assert_eq!(request.settings.interactive, None);
        assert_eq!(request.settings.verbose, 0);

        let OsOptions::Centos(opts) = &params.os else {
            panic!("expected CentOS options, got {:?}", params.os);
        };
        assert_eq!(opts.edition, "7");
        assert!(opts.custom_kickstart.is_none());
    }

    #[test]
    fn windows_options() {
        let request = parse_from([
            "mib",
            "windows",
            "--arch",
            "i386",
            "--ram",
            "4096",
            "--interactive",
            "false",
            "-vv",
            "--output",
            "/out/win.ddtgz",
            "--windows-iso",
            "/isos/win.iso",
            "--windows-edition",
            "win2016",
            "--windows-updates",
            "--vnc",
            "localhost:1",
        ])
        .unwrap();

        assert_eq!(request.params.arch, Arch::I386);
        assert_eq!(request.params.ram, 4096);
        assert_eq!(request.settings.interactive, Some(false));
        assert_eq!(request.settings.verbose, 2);

        let OsOptions::Windows(opts) = &request.params.os else {
            panic!("expected Windows options, got {:?}", request.params.os);
        };
        assert_eq!(
            opts.windows_iso.as_deref(),
            Some(camino::Utf8Path::new("/isos/win.iso"))
        );
        assert_eq!(opts.windows_edition.as_deref(), Some("win2016"));
        assert!(opts.windows_updates);
        assert_eq!(opts.windows_language, "en-US");
        assert_eq!(opts.vnc.as_deref(), Some("localhost:1"));
    }

    #[test]
    fn output_is_required() {
        let err = parse_from(["mib", "rhel", "--rhel-iso", "/isos/rhel.iso"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn options_belong_to_their_builder() {
        let err = parse_from([
            "mib",
            "centos",
            "-o",
            "/out/x",
            "--windows-iso",
            "/isos/win.iso",
        ])
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn unknown_architecture() {
        let err = parse_from(["mib", "centos", "-o", "/out/x", "--arch", "arm"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }
}
