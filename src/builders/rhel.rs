// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RHEL images. The customer's installation ISO is repacked with a
//! kickstart and a boot menu that starts the installer without waiting, and
//! the result is installed with virt-install.

use std::io::Write;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{ArgMatches, Args, FromArgMatches};

use super::{
    print_optional,
    virt_install::{self, Plan},
    Builder, Prerequisites,
};
use crate::{
    contrib::Contrib,
    error::ValidationError,
    kickstart::write_kickstart,
    loopback::Mount,
    params::{Arch, BuildParameters, OsOptions},
    process::Invocation,
    runner::Context,
    util::{copy_tree, make_world_accessible},
    virt::InstallSource,
    workspace::Workspace,
};

const ISOLINUX_CFG: &str = "default text\n\
timeout 0\n\
\n\
label text\n\
\x20 kernel vmlinuz\n\
\x20 append initrd=initrd.img linux text console=ttyS0 inst.repo=cdrom \
inst.ks=cdrom:/ks.cfg inst.cmdline inst.headless\n";

const BASE_KICKSTART: &str = "rhel7-amd64.ks";

#[derive(Args, Clone, Debug)]
pub struct RhelOptions {
    /// Path to the RHEL installation ISO.
    #[arg(long)]
    pub rhel_iso: Option<Utf8PathBuf>,

    /// A kickstart file to append to the built-in one, for customizing the
    /// image.
    #[arg(long)]
    pub custom_kickstart: Option<Utf8PathBuf>,
}

fn options(
    params: &BuildParameters,
) -> Result<&RhelOptions, ValidationError> {
    match &params.os {
        OsOptions::Rhel(opts) => Ok(opts),
        _ => Err(ValidationError::new(
            "rhel builder got options for another OS",
        )),
    }
}

fn rhel_iso(opts: &RhelOptions) -> Result<&Utf8Path, ValidationError> {
    opts.rhel_iso.as_deref().ok_or_else(|| {
        ValidationError::new("RHEL requires the --rhel-iso option.")
    })
}

/// Copies the contents of the ISO at `iso` to `tree`, using `mount_dir` as a
/// temporary mount point that is removed afterwards.
fn extract_iso(
    ctx: &Context,
    iso: &Utf8Path,
    mount_dir: &Utf8Path,
    tree: &Utf8Path,
) -> Result<()> {
    std::fs::create_dir(mount_dir)
        .with_context(|| format!("creating {mount_dir}"))?;

    let mount = Mount::new(ctx, iso, mount_dir, &[])?;
    copy_tree(mount.target(), tree)?;
    mount.unmount()?;

    std::fs::remove_dir_all(mount_dir)
        .with_context(|| format!("removing {mount_dir}"))
}

/// Makes the installer boot straight into a text-mode kickstart install.
fn set_timeout_zero(tree: &Utf8Path) -> Result<()> {
    let cfg = tree.join("isolinux").join("isolinux.cfg");
    std::fs::write(&cfg, format!("{ISOLINUX_CFG}\n"))
        .with_context(|| format!("writing {cfg}"))
}

fn create_iso(ctx: &Context, output: &Utf8Path, tree: &Utf8Path) -> Result<()> {
    ctx.run(&Invocation::new("mkisofs").args([
        "-o",
        output.as_str(),
        "-b",
        "isolinux/isolinux.bin",
        "-c",
        "isolinux/boot.cat",
        "-no-emul-boot",
        "-boot-load-size",
        "4",
        "-boot-info-table",
        "-R",
        "-J",
        "-v",
        "-T",
        tree.as_str(),
    ]))
    .context("creating installation ISO")?;

    make_world_accessible(output)
}

pub struct RhelBuilder;

impl Builder for RhelBuilder {
    fn name(&self) -> &'static str {
        "rhel"
    }

    fn about(&self) -> &'static str {
        "Builds a RHEL 7 root filesystem tarball from an installation ISO"
    }

    fn arches(&self) -> &'static [Arch] {
        &[Arch::Amd64]
    }

    fn populate_options(&self, cmd: clap::Command) -> clap::Command {
        RhelOptions::augment_args(cmd)
    }

    fn parse_options(
        &self,
        matches: &ArgMatches,
    ) -> Result<OsOptions, clap::Error> {
        RhelOptions::from_arg_matches(matches).map(OsOptions::Rhel)
    }

    fn validate_options(
        &self,
        params: &BuildParameters,
    ) -> Result<(), ValidationError> {
        let opts = options(params)?;
        if !rhel_iso(opts)?.exists() {
            return Err(ValidationError::new(
                "Invalid RHEL iso. File does not exist.",
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
        let mut commands = virt_install::COMMANDS.to_vec();
        commands.push("mkisofs");

        let mut files = vec![contrib.path("rhel", BASE_KICKSTART)];
        if let Ok(opts) = options(params) {
            files.extend(opts.rhel_iso.iter().cloned());
            files.extend(opts.custom_kickstart.iter().cloned());
        }

        Prerequisites {
            commands,
            files,
            optional_files: vec![contrib.path("rhel", "curtin")],
        }
    }

    fn print_options(
        &self,
        params: &BuildParameters,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        if let Ok(opts) = options(params) {
            print_optional(out, "rhel iso", opts.rhel_iso.as_ref())?;
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
        let iso = rhel_iso(opts)?;

        ctx.step("Preparing workspace");
        let ws = Workspace::acquire(&params.work_root)?;

        ctx.step("Extracting installation ISO");
        let tree = ws.join("output");
        extract_iso(ctx, iso, &ws.join("iso"), &tree)?;

        ctx.step("Repacking installation ISO");
        write_kickstart(
            &tree.join("ks.cfg"),
            &ctx.contrib().path("rhel", BASE_KICKSTART),
            opts.custom_kickstart.as_deref(),
        )?;
        set_timeout_zero(&tree)?;

        let install_iso = ws.join("output.iso");
        create_iso(ctx, &install_iso, &tree)?;
        std::fs::remove_dir_all(&tree)
            .with_context(|| format!("removing {tree}"))?;

        let plan = Plan {
            full_name: format!("rhel-{}", params.arch),
            os_variant: "rhel7.0",
            source: InstallSource::Cdrom(install_iso),
            curtin: ctx.contrib().path("rhel", "curtin"),
            curtin_required: false,
        };

        virt_install::run(ctx, params, &ws, &plan)
    }
}
