// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around `qemu-img`, `virt-install`, and `virsh`.

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::{params::Arch, process::Invocation, runner::Context};

/// Uses `qemu-img` to create a blank raw disk of `size_gib` GiB.
pub fn create_disk(
    ctx: &Context,
    path: &Utf8Path,
    size_gib: u32,
) -> Result<()> {
    ctx.run(&Invocation::new("qemu-img").args([
        "create",
        "-f",
        "raw",
        path.as_str(),
        &format!("{size_gib}G"),
    ]))
    .with_context(|| format!("creating disk image {path}"))?;

    Ok(())
}

/// Rewrites `src` as a raw image at `dst`, dropping the sparse space the
/// installer left behind.
pub fn convert_to_raw(
    ctx: &Context,
    src: &Utf8Path,
    dst: &Utf8Path,
) -> Result<()> {
    ctx.run(&Invocation::new("qemu-img").args([
        "convert",
        "-O",
        "raw",
        src.as_str(),
        dst.as_str(),
    ]))
    .with_context(|| format!("converting {src} to a raw image"))?;

    Ok(())
}

/// Removes a finished domain from libvirt without touching its storage.
pub fn undefine(ctx: &Context, name: &str) -> Result<()> {
    ctx.run(&Invocation::new("virsh").args(["undefine", name]))
        .with_context(|| format!("undefining domain {name}"))?;

    Ok(())
}

/// Where `virt-install` boots the installer from.
#[derive(Clone, Debug)]
pub enum InstallSource {
    /// A network install tree, with a kickstart injected into the initrd.
    Location {
        url: String,
        initrd_inject: Option<Utf8PathBuf>,
        extra_args: Option<String>,
    },

    /// A bootable installation ISO.
    Cdrom(Utf8PathBuf),
}

/// An unattended `virt-install` run. The VM doesn't reboot when the
/// installer finishes, so the call returns once the installation is done.
#[derive(Clone, Debug)]
pub struct VirtInstall {
    pub name: String,
    pub ram: u32,
    pub arch: Arch,
    pub vcpus: u32,
    pub os_type: &'static str,
    pub os_variant: &'static str,
    pub disk: String,
    pub network: String,
    pub source: InstallSource,
}

impl VirtInstall {
    pub fn invocation(&self) -> Invocation {
        let mut inv = Invocation::new("virt-install")
            .args(["--name", &self.name])
            .args(["--ram", &self.ram.to_string()])
            .args(["--arch", self.arch.qemu_name()])
            .args(["--vcpus", &self.vcpus.to_string()])
            .args(["--os-type", self.os_type])
            .args(["--os-variant", self.os_variant])
            .args(["--disk", &self.disk])
            .args(["--network", &self.network]);

        inv = match &self.source {
            InstallSource::Location { url, initrd_inject, extra_args } => {
                let mut inv = inv.args(["--location", url]);
                if let Some(ks) = initrd_inject {
                    inv = inv.arg(format!("--initrd-inject={ks}"));
                }
                if let Some(extra) = extra_args {
                    inv = inv.arg(format!("--extra-args={extra}"));
                }
                inv
            }
            InstallSource::Cdrom(iso) => inv.args(["--cdrom", iso.as_str()]),
        };

        inv.args(["--noreboot", "--nographics", "--force"])
    }

    pub fn run(&self, ctx: &Context) -> Result<()> {
        ctx.run(&self.invocation()).with_context(|| {
            format!("installing {} with virt-install", self.name)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{FakeRunner, TestEnv};

    fn install(source: InstallSource) -> VirtInstall {
        VirtInstall {
            name: "img-build-centos7-amd64".to_string(),
            ram: 2048,
            arch: Arch::Amd64,
            vcpus: 4,
            os_type: "linux",
            os_variant: "centos7.0",
            disk: "path=/w/disk.img,format=raw".to_string(),
            network: "bridge=virbr0,model=virtio".to_string(),
            source,
        }
    }

    #[test]
    fn disks_are_created_raw() {
        let env = TestEnv::new(FakeRunner::new());
        let ctx = env.ctx();

        create_disk(&ctx, Utf8Path::new("/w/disk.img"), 5).unwrap();
        assert_eq!(
            env.runner.commands(),
            vec!["qemu-img create -f raw /w/disk.img 5G"]
        );
    }

    #[test]
    fn location_install_arguments() {
        let inv = install(InstallSource::Location {
            url: "http://mirror.centos.org/centos/7/os/x86_64".to_string(),
            initrd_inject: Some("/c/centos7-amd64.ks".into()),
            extra_args: Some("console=ttyS0 text".to_string()),
        })
        .invocation();

        assert_eq!(
            inv.to_string(),
            "virt-install --name img-build-centos7-amd64 --ram 2048 \
             --arch x86_64 --vcpus 4 --os-type linux --os-variant centos7.0 \
             --disk path=/w/disk.img,format=raw \
             --network bridge=virbr0,model=virtio \
             --location http://mirror.centos.org/centos/7/os/x86_64 \
             --initrd-inject=/c/centos7-amd64.ks \
             --extra-args=console=ttyS0 text \
             --noreboot --nographics --force"
        );

        // The extra arguments stay a single argv entry.
        assert!(inv
            .argv()
            .contains(&"--extra-args=console=ttyS0 text".to_string()));
    }

    #[test]
    fn cdrom_install_arguments() {
        let inv = install(InstallSource::Cdrom("/w/output.iso".into()))
            .invocation();
        let argv = inv.argv();

        let cdrom = argv.iter().position(|a| a == "--cdrom").unwrap();
        assert_eq!(argv[cdrom + 1], "/w/output.iso");
        assert!(!argv.iter().any(|a| a.starts_with("--initrd-inject")));
        assert_eq!(
            &argv[argv.len() - 3..],
            ["--noreboot", "--nographics", "--force"]
        );
    }
}
