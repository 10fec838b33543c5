// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CentOS images, installed from the CentOS mirror with a kickstart.

use std::io::Write;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{ArgMatches, Args, FromArgMatches};

use super::{
    print_field, print_optional,
    virt_install::{self, Plan},
    Builder, Prerequisites,
};
use crate::{
    contrib::Contrib,
    error::ValidationError,
    kickstart::write_kickstart,
    params::{Arch, BuildParameters, OsOptions},
    runner::Context,
    virt::InstallSource,
    workspace::Workspace,
};

#[derive(Args, Clone, Debug)]
pub struct CentosOptions {
    /// CentOS edition to generate (6 or 7).
    #[arg(long, default_value = "7")]
    pub edition: String,

    /// A kickstart file to append to the built-in one, for customizing the
    /// image.
    #[arg(long)]
    pub custom_kickstart: Option<Utf8PathBuf>,
}

/// How to install one edition on one architecture.
struct Release {
    tree: &'static str,
    kickstart: &'static str,
    os_variant: &'static str,
    curtin: &'static str,

    /// Whether the tool ships deployment hooks for this release. Shipped
    /// hooks are required; otherwise a user-supplied directory is optional.
    ships_curtin: bool,
}

impl Release {
    fn lookup(edition: &str, arch: Arch) -> Option<Self> {
        match (edition, arch) {
            ("6", Arch::I386) => Some(Self {
                tree: "http://mirror.centos.org/centos/6/os/i386",
                kickstart: "centos6/centos6-i386.ks",
                os_variant: "centos6.5",
                curtin: "centos6/curtin",
                ships_curtin: false,
            }),
            ("6", Arch::Amd64) => Some(Self {
                tree: "http://mirror.centos.org/centos/6/os/x86_64",
                kickstart: "centos6/centos6-amd64.ks",
                os_variant: "centos6.5",
                curtin: "centos6/curtin",
                ships_curtin: false,
            }),
            ("7", Arch::Amd64) => Some(Self {
                tree: "http://mirror.centos.org/centos/7/os/x86_64",
                kickstart: "centos7/centos7-amd64.ks",
                os_variant: "centos7.0",
                curtin: "centos7/curtin",
                ships_curtin: true,
            }),
            _ => None,
        }
    }

    /// Kernel arguments that point the installer at the kickstart injected
    /// into the initrd as `ks_name`.
    fn boot_args(&self, ks_name: &str) -> String {
        if self.os_variant == "centos6.5" {
            format!("console=ttyS0 ks=file:/{ks_name} text utf8")
        } else {
            format!(
                "console=ttyS0 inst.ks=file:/{ks_name} text inst.cmdline \
                 inst.headless"
            )
        }
    }
}

fn options(
    params: &BuildParameters,
) -> Result<&CentosOptions, ValidationError> {
    match &params.os {
        OsOptions::Centos(opts) => Ok(opts),
        _ => Err(ValidationError::new(
            "centos builder got options for another OS",
        )),
    }
}

pub struct CentosBuilder;

impl Builder for CentosBuilder {
    fn name(&self) -> &'static str {
        "centos"
    }

    fn about(&self) -> &'static str {
        "Builds a CentOS 6 or 7 root filesystem tarball"
    }

    fn arches(&self) -> &'static [Arch] {
        &[Arch::I386, Arch::Amd64]
    }

    fn populate_options(&self, cmd: clap::Command) -> clap::Command {
        CentosOptions::augment_args(cmd)
    }

    fn parse_options(
        &self,
        matches: &ArgMatches,
    ) -> Result<OsOptions, clap::Error> {
        CentosOptions::from_arg_matches(matches).map(OsOptions::Centos)
    }

    fn validate_options(
        &self,
        params: &BuildParameters,
    ) -> Result<(), ValidationError> {
        let opts = options(params)?;
        if opts.edition != "6" && opts.edition != "7" {
            return Err(ValidationError::new(format!(
                "Unknown CentOS edition: {}.",
                opts.edition
            )));
        }

        if opts.edition == "7" && params.arch == Arch::I386 {
            return Err(ValidationError::new(
                "Cannot generate CentOS 7 for i386, as only amd64 is \
                 supported.",
            ));
        }

        if let Some(ks) = &opts.custom_kickstart {
            if !ks.exists() {
                return Err(ValidationError::new(format!(
                    "Custom kickstart file '{ks}' does not exist!"
                )));
            }
        }

        Ok(())
    }

    fn prerequisites(
        &self,
        params: &BuildParameters,
        contrib: &Contrib,
    ) -> Prerequisites {
        let mut prereqs = Prerequisites {
            commands: virt_install::COMMANDS.to_vec(),
            ..Default::default()
        };

        if let Ok(opts) = options(params) {
            if let Some(release) = Release::lookup(&opts.edition, params.arch) {
                prereqs.files.push(contrib.path("centos", release.kickstart));
                let curtin = contrib.path("centos", release.curtin);
                if release.ships_curtin {
                    prereqs.files.push(curtin);
                } else {
                    prereqs.optional_files.push(curtin);
                }
            }
            prereqs.files.extend(opts.custom_kickstart.iter().cloned());
        }

        prereqs
    }

    fn print_options(
        &self,
        params: &BuildParameters,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        if let Ok(opts) = options(params) {
            print_field(out, "edition", &opts.edition)?;
            print_optional(
                out,
                "custom kickstart",
                opts.custom_kickstart.as_ref(),
            )?;
        }

        Ok(())
    }

    fn build_image(
        &self,
        params: &BuildParameters,
        ctx: &Context,
    ) -> Result<()> {
        let opts = options(params)?;
        let release =
            Release::lookup(&opts.edition, params.arch).ok_or_else(|| {
                ValidationError::new(format!(
                    "Unknown CentOS edition: {}.",
                    opts.edition
                ))
            })?;

        ctx.step("Preparing workspace");
        let ws = Workspace::acquire(&params.work_root)?;

        let base = ctx.contrib().path("centos", release.kickstart);
        let kickstart = match &opts.custom_kickstart {
            Some(custom) => {
                let dest = ws.join("kickstart.ks");
                write_kickstart(&dest, &base, Some(custom.as_path()))?;
                dest
            }
            None => base,
        };

        let ks_name = kickstart.file_name().unwrap_or("kickstart.ks");
        let plan = Plan {
            full_name: format!("centos{}-{}", opts.edition, params.arch),
            os_variant: release.os_variant,
            source: InstallSource::Location {
                url: release.tree.to_string(),
                extra_args: Some(release.boot_args(ks_name)),
                initrd_inject: Some(kickstart.clone()),
            },
            curtin: ctx.contrib().path("centos", release.curtin),
            curtin_required: release.ships_curtin,
        };

        virt_install::run(ctx, params, &ws, &plan)
    }
}
