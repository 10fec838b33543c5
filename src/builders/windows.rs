// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Windows images.
//!
//! Windows setup runs in a QEMU VM with three extra drives: a floppy with the
//! rendered `Autounattend.xml`, and an ISO (labeled `SCRIPTS`) holding
//! cloudbase-init, the first-logon scripts, and any extra drivers. The
//! scripts install cloudbase-init, generalize the installation, and leave
//! either `success.tch` or `error_log.txt` on the system drive before
//! powering the VM off. The system drive is then checked, cleaned up, and
//! archived as a sparse raw disk image.

use std::{io::Write, sync::OnceLock};

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{ArgMatches, Args, FromArgMatches};
use itertools::Itertools;
use regex::Regex;
use tracing::{debug, warn};

use super::{print_field, print_optional, Builder, Prerequisites};
use crate::{
    autounattend::{AnswerFileSettings, AutounattendUpdater},
    contrib::Contrib,
    error::{BuildError, ValidationError},
    loopback::{LoopMount, Mount},
    net::TapDevice,
    params::{Arch, BuildParameters, OsOptions},
    process::Invocation,
    runner::Context,
    steps,
    util::copy_tree,
    virt,
    vm::{self, VmSpec},
    workspace::Workspace,
};

/// Editions that can be installed, and the name of each one's image in the
/// installation media's `install.wim`.
pub const EDITIONS: &[(&str, &str)] = &[
    ("win2008r2", "Windows Server 2008 R2 SERVERSTANDARD"),
    ("win2008hvr2", "Windows Server 2008 R2 SERVERHYPERCORE"),
    ("win2012", "Windows Server 2012 SERVERSTANDARD"),
    ("win2012hv", "Hyper-V Server 2012 SERVERHYPERCORE"),
    ("win2012r2", "Windows Server 2012 R2 SERVERSTANDARD"),
    ("win2012hvr2", "Hyper-V Server 2012 R2 SERVERHYPERCORE"),
    ("win2016", "Windows Server 2016 SERVERSTANDARD"),
    ("win2016hv", "Hyper-V Server 2016 SERVERHYPERCORE"),
];

pub const DEFAULT_CLOUDBASE_INIT_URL: &str =
    "http://www.cloudbase.it/downloads/";
pub const DEFAULT_WINDOWS_UPDATES_URL: &str =
    "http://gallery.technet.microsoft.com/scriptcenter/\
     2d191bcd-3308-4edd-9de2-88dff796b0bc/file/41459/43/PSWindowsUpdate.zip";

const LICENSE_KEY_PATTERN: &str = r"^([A-Za-z0-9]{5}-){4}[A-Za-z0-9]{5}$";
const DISK_SIZE_GIB: u32 = 16;

/// The partition Windows is installed to. Partition 0 is the system
/// reserved partition.
const SYSTEM_PARTITION: usize = 1;

/// cloudbase-init logs to the serial port while the image is built. Left in
/// place it would slow down every boot of a deployed machine.
const SERIAL_LOG_SETTING: &str =
    "logging_serial_port_settings=COM1,115200,N,8\r\n";

const CLOUDBASE_INIT_CONFIGS: &[&str] =
    &["cloudbase-init.conf", "cloudbase-init-unattend.conf"];

#[derive(Args, Clone, Debug)]
pub struct WindowsOptions {
    /// Path to the Windows installation ISO.
    #[arg(long)]
    pub windows_iso: Option<Utf8PathBuf>,

    /// Windows edition to install from the ISO.
    #[arg(long)]
    pub windows_edition: Option<String>,

    /// Windows license key to embed into the generated image.
    #[arg(long)]
    pub windows_license_key: Option<String>,

    /// Install all Windows updates into the generated image. The VM needs
    /// access to microsoft.com, so a tap device on --interface is created
    /// for it.
    #[arg(long)]
    pub windows_updates: bool,

    /// Directory of drivers to inject into the installation before the
    /// image is generated.
    #[arg(long)]
    pub windows_drivers: Option<Utf8PathBuf>,

    /// Windows installation language.
    #[arg(long, default_value = "en-US")]
    pub windows_language: String,

    /// Path to the cloudbase-init installer to use instead of downloading
    /// one.
    #[arg(long)]
    pub cloudbase_init: Option<Utf8PathBuf>,

    /// Where to download the cloudbase-init installer from.
    #[arg(long, default_value = DEFAULT_CLOUDBASE_INIT_URL)]
    pub cloudbase_init_url: String,

    /// Where to download the PSWindowsUpdate module from.
    #[arg(long, default_value = DEFAULT_WINDOWS_UPDATES_URL)]
    pub windows_updates_url: String,

    /// Expose the installation VM's console on this VNC display (e.g.
    /// localhost:1).
    #[arg(long)]
    pub vnc: Option<String>,
}

fn options(
    params: &BuildParameters,
) -> Result<&WindowsOptions, ValidationError> {
    match &params.os {
        OsOptions::Windows(opts) => Ok(opts),
        _ => Err(ValidationError::new(
            "windows builder got options for another OS",
        )),
    }
}

/// Returns the image name for `edition`, if it is a known edition.
pub fn image_name(edition: &str) -> Option<&'static str> {
    EDITIONS.iter().find(|(name, _)| *name == edition).map(|(_, image)| *image)
}

/// Checks that `key` looks like a product key. This doesn't check that the
/// key will activate the selected edition.
pub fn validate_license_key(key: &str) -> bool {
    static LICENSE_KEY: OnceLock<Regex> = OnceLock::new();
    LICENSE_KEY
        .get_or_init(|| {
            Regex::new(LICENSE_KEY_PATTERN).expect("valid license key pattern")
        })
        .is_match(key)
}

fn cloudbase_init_msi(arch: Arch) -> &'static str {
    match arch {
        Arch::Amd64 => "CloudbaseInitSetup_x64.msi",
        Arch::I386 => "CloudbaseInitSetup_x86.msi",
    }
}

/// Where the guest's error log is saved if the installation fails.
fn error_log_path(params: &BuildParameters, edition: &str) -> Utf8PathBuf {
    let name = format!("windows-{edition}-{}-error.log", params.arch);
    match params.output.parent() {
        Some(dir) => dir.join(name),
        None => Utf8PathBuf::from(name),
    }
}

/// Looks at the installed system drive mounted at `mount` for the markers
/// the first-logon scripts leave behind. If the guest reported an error its
/// log is copied to `save_error_path`.
pub fn check_success(
    ctx: &Context,
    mount: &Utf8Path,
    save_error_path: &Utf8Path,
) -> Result<()> {
    let error_log = mount.join("error_log.txt");
    if error_log.exists() {
        std::fs::copy(&error_log, save_error_path).with_context(|| {
            format!("saving Windows error log to {save_error_path}")
        })?;

        // Only to make the log easier to read on the host.
        if let Err(e) =
            ctx.run(&Invocation::new("dos2unix").arg(save_error_path.as_str()))
        {
            debug!(error = %e, "dos2unix failed, leaving CRLF line endings");
        }

        return Err(BuildError::new(format!(
            "Windows installation failed, output placed {save_error_path}."
        ))
        .into());
    }

    let success = mount.join("success.tch");
    if !success.exists() {
        return Err(BuildError::new(
            "Windows installation failed with an unknown reason.",
        )
        .into());
    }

    std::fs::remove_file(&success)
        .with_context(|| format!("removing {success}"))
}

/// Stops cloudbase-init from logging to the serial port on deployed
/// machines.
pub fn remove_serial_log(mount: &Utf8Path) -> Result<()> {
    let conf_dir = mount
        .join("Program Files")
        .join("Cloudbase Solutions")
        .join("Cloudbase-Init")
        .join("conf");

    for name in CLOUDBASE_INIT_CONFIGS {
        let path = conf_dir.join(name);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {path}"))?;
        std::fs::write(&path, data.replace(SERIAL_LOG_SETTING, ""))
            .with_context(|| format!("writing {path}"))?;
    }

    Ok(())
}

/// Assembles the contents of the `SCRIPTS` ISO and packs it into
/// `install.iso` in the workspace.
fn build_install_iso(
    ctx: &Context,
    ws: &Workspace,
    arch: Arch,
    opts: &WindowsOptions,
) -> Result<Utf8PathBuf> {
    let install = ws.create_dir("install")?;

    let cloudbase = install.join("cloudbase");
    std::fs::create_dir(&cloudbase)
        .with_context(|| format!("creating {cloudbase}"))?;
    let msi = cloudbase.join("cloudbase_init.msi");
    match &opts.cloudbase_init {
        Some(path) => {
            std::fs::copy(path, &msi)
                .with_context(|| format!("copying {path} to {msi}"))?;
        }
        None => {
            let url = format!(
                "{}/{}",
                opts.cloudbase_init_url.trim_end_matches('/'),
                cloudbase_init_msi(arch)
            );
            steps::fetch(ctx, &url, &msi)?;
        }
    }

    copy_tree(
        &ctx.contrib().path("windows", "scripts"),
        &install.join("scripts"),
    )?;

    if let Some(drivers) = &opts.windows_drivers {
        copy_tree(drivers, &install.join("infs"))?;
    }

    if opts.windows_updates {
        let zip = ws.join("pswindowsupdate.zip");
        steps::fetch(ctx, &opts.windows_updates_url, &zip)?;
        steps::unzip(ctx, &zip, &install)?;
    }

    let iso = ws.join("install.iso");
    ctx.run(&Invocation::new("genisoimage").args([
        "-o",
        iso.as_str(),
        "-V",
        "SCRIPTS",
        "-J",
        install.as_str(),
    ]))
    .context("creating install ISO")?;

    std::fs::remove_dir_all(&install)
        .with_context(|| format!("removing {install}"))?;
    Ok(iso)
}

/// Creates a vfat floppy image holding the rendered answer file.
fn prepare_floppy(
    ctx: &Context,
    ws: &Workspace,
    settings: &AnswerFileSettings,
) -> Result<Utf8PathBuf> {
    let vfd = ws.join("Autounattend.vfd");
    ctx.run(&Invocation::new("dd").args([
        "if=/dev/zero",
        &format!("of={vfd}"),
        "bs=1024",
        "count=1440",
    ]))
    .context("creating floppy image")?;
    ctx.run(&Invocation::new("mkfs.vfat").arg(vfd.as_str()))
        .context("formatting floppy image")?;

    let mount_dir = ws.create_dir("vfd_mount")?;
    let mount =
        Mount::new(ctx, &vfd, &mount_dir, &["-t", "vfat", "-o", "loop"])?;
    let template = ctx.contrib().path("windows", "Autounattend.xml");
    let matches = AutounattendUpdater::new(settings)
        .run(&template, &mount_dir.join("Autounattend.xml"))?;
    debug!(matches, "rendered Autounattend.xml");
    mount.unmount()?;

    std::fs::remove_dir(&mount_dir)
        .with_context(|| format!("removing {mount_dir}"))?;
    Ok(vfd)
}

/// Unmounts the system partition, marks its NTFS volume clean so Windows
/// doesn't run a disk check on first boot, and removes the mappings.
fn release_system_partition(ctx: &Context, mount: LoopMount) -> Result<()> {
    let map = mount.unmount()?;
    let device = map.device(SYSTEM_PARTITION)?;
    ctx.run(&Invocation::new("ntfsfix").args(["-d", device.as_str()]))
        .with_context(|| format!("marking {device} clean"))?;
    steps::sync(ctx)?;
    map.delete()
}

pub struct WindowsBuilder;

impl Builder for WindowsBuilder {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn about(&self) -> &'static str {
        "Builds a Windows Server disk image with cloudbase-init"
    }

    fn arches(&self) -> &'static [Arch] {
        &[Arch::I386, Arch::Amd64]
    }

    fn populate_options(&self, cmd: clap::Command) -> clap::Command {
        WindowsOptions::augment_args(cmd)
    }

    fn parse_options(
        &self,
        matches: &ArgMatches,
    ) -> Result<OsOptions, clap::Error> {
        WindowsOptions::from_arg_matches(matches).map(OsOptions::Windows)
    }

    fn validate_options(
        &self,
        params: &BuildParameters,
    ) -> Result<(), ValidationError> {
        let opts = options(params)?;

        let Some(iso) = &opts.windows_iso else {
            return Err(ValidationError::new(
                "Windows requires the --windows-iso option.",
            ));
        };
        if !iso.exists() {
            return Err(ValidationError::new(format!(
                "Failed to access Windows ISO at: {iso}"
            )));
        }

        let edition = opts.windows_edition.as_deref().unwrap_or_default();
        if edition.is_empty() {
            return Err(ValidationError::new(
                "Windows requires the --windows-edition option.",
            ));
        }
        if image_name(edition).is_none() {
            return Err(ValidationError::new(format!(
                "Invalid Windows edition, should be one of {}.",
                EDITIONS.iter().map(|(name, _)| name).join(", ")
            )));
        }

        if let Some(key) = opts.windows_license_key.as_deref() {
            if !key.is_empty() && !validate_license_key(key) {
                return Err(ValidationError::new(
                    "Invalid Windows license key.",
                ));
            }
        }

        if let Some(drivers) = &opts.windows_drivers {
            if !drivers.is_dir() {
                return Err(ValidationError::new(format!(
                    "Invalid driver path: {drivers}"
                )));
            }
        }

        if let Some(msi) = &opts.cloudbase_init {
            if !msi.exists() {
                return Err(ValidationError::new(format!(
                    "Failed to access cloudbase-init installer at: {msi}"
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
            commands: vec![
                "genisoimage",
                "dd",
                "mkfs.vfat",
                "mount",
                "umount",
                "qemu-img",
                "kvm-spice",
                "kpartx",
                "ntfsfix",
                "sync",
                "tar",
            ],
            files: vec![
                contrib.path("windows", "Autounattend.xml"),
                contrib.path("windows", "scripts"),
            ],
            optional_files: vec![contrib.path("windows", "curtin")],
        };

        if let Ok(opts) = options(params) {
            if opts.cloudbase_init.is_none() || opts.windows_updates {
                prereqs.commands.push("wget");
            }
            if opts.windows_updates {
                prereqs.commands.extend(["unzip", "ip"]);
            }

            prereqs.files.extend(opts.windows_iso.iter().cloned());
            prereqs.files.extend(opts.cloudbase_init.iter().cloned());
            prereqs.files.extend(opts.windows_drivers.iter().cloned());
        }

        prereqs
    }

    fn print_options(
        &self,
        params: &BuildParameters,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        let Ok(opts) = options(params) else {
            return Ok(());
        };

        print_optional(out, "windows iso", opts.windows_iso.as_ref())?;
        print_optional(out, "edition", opts.windows_edition.as_ref())?;
        print_field(
            out,
            "license key",
            match opts.windows_license_key.as_deref() {
                Some(key) if !key.is_empty() => "provided",
                _ => "none",
            },
        )?;
        print_field(out, "updates", opts.windows_updates)?;
        print_optional(out, "drivers", opts.windows_drivers.as_ref())?;
        print_field(out, "language", &opts.windows_language)?;
        match &opts.cloudbase_init {
            Some(path) => print_field(out, "cloudbase-init", path)?,
            None => {
                print_field(out, "cloudbase-init", &opts.cloudbase_init_url)?
            }
        }
        print_optional(out, "vnc", opts.vnc.as_ref())
    }

    fn build_image(
        &self,
        params: &BuildParameters,
        ctx: &Context,
    ) -> Result<()> {
        let opts = options(params)?;
        let iso = opts
            .windows_iso
            .as_ref()
            .ok_or_else(|| {
                ValidationError::new(
                    "Windows requires the --windows-iso option.",
                )
            })?;
        let edition = opts.windows_edition.as_deref().unwrap_or_default();
        let image = image_name(edition).ok_or_else(|| {
            ValidationError::new(format!("Invalid Windows edition: {edition}"))
        })?;

        ctx.step("Preparing workspace");
        let ws = Workspace::acquire(&params.work_root)?;

        ctx.step("Building install ISO");
        let install_iso = build_install_iso(ctx, &ws, params.arch, opts)?;

        ctx.step("Building answer file floppy");
        let floppy = prepare_floppy(
            ctx,
            &ws,
            &AnswerFileSettings {
                arch: params.arch,
                image_name: image.to_string(),
                language: opts.windows_language.clone(),
                license_key: opts.windows_license_key.clone(),
                enable_updates: opts.windows_updates,
            },
        )?;

        ctx.step("Creating disk image");
        let disk = ws.join("output.img");
        virt::create_disk(ctx, &disk, DISK_SIZE_GIB)?;

        ctx.step("Installing Windows");
        let tap = if opts.windows_updates {
            Some(TapDevice::create(ctx, &params.interface)?)
        } else {
            None
        };

        let vm_result = vm::spawn(
            ctx,
            &VmSpec {
                ram: params.ram,
                vcpus: params.vcpus,
                cdrom: iso.clone(),
                floppy,
                install_iso,
                disk: disk.clone(),
                tap: tap.as_ref().map(|t| t.name().to_string()),
                vnc: opts.vnc.clone(),
            },
        );

        // The tap goes away whatever happened to the VM. A VM failure is the
        // more interesting error, so it wins.
        let tap_result = tap.map(TapDevice::delete).transpose();
        if let (Err(_), Err(e)) = (&vm_result, &tap_result) {
            warn!(error = %e, "failed to delete tap after VM failure");
        }
        vm_result?;
        tap_result?;

        ctx.step("Checking installation");
        let mount_dir = ws.create_dir("disk_mount")?;
        let mount =
            LoopMount::attach(ctx, &disk, &mount_dir, SYSTEM_PARTITION)?;
        let fixups = check_success(
            ctx,
            mount.target(),
            &error_log_path(params, edition),
        )
        .and_then(|()| {
            steps::install_curtin(
                &ctx.contrib().path("windows", "curtin"),
                mount.target(),
                false,
            )
        })
        .and_then(|()| remove_serial_log(mount.target()));

        let released = release_system_partition(ctx, mount);
        fixups?;
        released?;
        std::fs::remove_dir(&mount_dir)
            .with_context(|| format!("removing {mount_dir}"))?;

        ctx.step("Compressing disk image");
        let clean = ws.join("clean-output.img");
        virt::convert_to_raw(ctx, &disk, &clean)?;
        std::fs::remove_file(&disk)
            .with_context(|| format!("removing {disk}"))?;

        let tarball = ws.join("output.ddtgz");
        steps::create_disk_tarball(ctx, &tarball, &clean)?;

        steps::move_artifact(ctx, &tarball, &params.output)
    }
}
