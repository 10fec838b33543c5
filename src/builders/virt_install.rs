// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pipeline shared by the builders that install through `virt-install`.

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::{
    loopback::LoopMount,
    params::BuildParameters,
    runner::Context,
    steps,
    util::make_world_accessible,
    virt::{self, InstallSource, VirtInstall},
    workspace::Workspace,
};

const DISK_SIZE_GIB: u32 = 5;
const NIC_MODEL: &str = "virtio";

/// Commands every virt-install based build runs.
pub(super) const COMMANDS: &[&str] =
    &["qemu-img", "virt-install", "virsh", "kpartx", "mount", "umount", "tar"];

/// What a builder hands to the shared pipeline.
pub(super) struct Plan {
    /// Identifies the image, e.g. `centos7-amd64`. The VM is named after it.
    pub full_name: String,
    pub os_variant: &'static str,
    pub source: InstallSource,

    /// Curtin hooks to copy into the image.
    pub curtin: Utf8PathBuf,

    /// Whether the image is unusable without the hooks. Optional hooks are
    /// skipped when missing.
    pub curtin_required: bool,
}

/// Installs into a fresh disk with virt-install, then archives the root
/// filesystem of the result and moves the tarball to `params.output`.
pub(super) fn run(
    ctx: &Context,
    params: &BuildParameters,
    ws: &Workspace,
    plan: &Plan,
) -> Result<()> {
    ctx.step("Creating disk image");
    let disk = ws.join("disk.img");
    virt::create_disk(ctx, &disk, DISK_SIZE_GIB)?;
    make_world_accessible(&disk)?;

    ctx.step(&format!("Installing {}", plan.full_name));
    let install = VirtInstall {
        name: format!("img-build-{}", plan.full_name),
        ram: params.ram,
        arch: params.arch,
        vcpus: params.vcpus,
        os_type: "linux",
        os_variant: plan.os_variant,
        disk: format!("path={disk},format=raw"),
        network: format!("bridge={},model={NIC_MODEL}", params.interface),
        source: plan.source.clone(),
    };
    install.run(ctx)?;
    virt::undefine(ctx, &install.name)?;

    ctx.step("Archiving root filesystem");
    let mount_dir = ws.create_dir("mount")?;
    let tarball = ws.join("output.tar.gz");
    let mount = LoopMount::attach(ctx, &disk, &mount_dir, 0)?;
    steps::install_curtin(
        &plan.curtin,
        mount.target(),
        plan.curtin_required,
    )?;
    steps::create_tarball(ctx, &tarball, mount.target())?;
    mount.detach()?;

    steps::move_artifact(ctx, &tarball, &params.output)
}
