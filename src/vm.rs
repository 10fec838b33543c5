// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launches the QEMU VM that runs Windows setup.

use anyhow::{Context as _, Result};
use camino::Utf8PathBuf;

use crate::{net::random_qemu_mac, process::Invocation, runner::Context};

/// The drives and devices given to the installation VM.
#[derive(Clone, Debug)]
pub struct VmSpec {
    pub ram: u32,
    pub vcpus: u32,

    /// The Windows installation ISO the VM boots from.
    pub cdrom: Utf8PathBuf,

    /// The floppy image holding `Autounattend.xml`.
    pub floppy: Utf8PathBuf,

    /// The ISO with cloudbase-init, the setup scripts, and drivers.
    pub install_iso: Utf8PathBuf,

    /// The raw disk Windows installs to.
    pub disk: Utf8PathBuf,

    /// A tap device to attach a NIC to, if the guest needs the network.
    pub tap: Option<String>,

    /// A VNC display to expose the console on. The VM is headless if unset.
    pub vnc: Option<String>,
}

impl VmSpec {
    pub fn invocation(&self) -> Invocation {
        let mut inv = Invocation::new("kvm-spice")
            .args(["-m", &self.ram.to_string()])
            .args(["-smp", &self.vcpus.to_string()])
            .args(["-cdrom", self.cdrom.as_str()])
            .args([
                "-drive",
                &format!(
                    "file={},index=0,format=raw,if=ide,media=disk",
                    self.disk
                ),
            ])
            .args([
                "-drive",
                &format!("file={},index=1,format=raw,if=floppy", self.floppy),
            ])
            .args([
                "-drive",
                &format!(
                    "file={},index=3,format=raw,if=ide,media=cdrom",
                    self.install_iso
                ),
            ]);

        if let Some(tap) = &self.tap {
            inv = inv
                .args([
                    "-device",
                    &format!(
                        "rtl8139,netdev=net00,mac={}",
                        random_qemu_mac()
                    ),
                ])
                .args([
                    "-netdev",
                    &format!(
                        "type=tap,id=net00,script=no,downscript=no,ifname={tap}"
                    ),
                ]);
        }

        inv = inv.args(["-boot", "d", "-vga", "std", "-k", "en-us"]);
        match &self.vnc {
            Some(display) => inv.args(["-vnc", display]),
            None => inv.args(["-display", "none"]),
        }
    }
}

/// Runs the VM and waits for it to power off. There is no timeout; a guest
/// that never shuts down blocks the build.
pub fn spawn(ctx: &Context, spec: &VmSpec) -> Result<()> {
    ctx.run(&spec.invocation()).context("running the installation VM")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            ram: 2048,
            vcpus: 4,
            cdrom: "/isos/win.iso".into(),
            floppy: "/w/Autounattend.vfd".into(),
            install_iso: "/w/install.iso".into(),
            disk: "/w/output.img".into(),
            tap: None,
            vnc: None,
        }
    }

    #[test]
    fn headless_vm_without_network() {
        let inv = spec().invocation();
        assert_eq!(
            inv.to_string(),
            "kvm-spice -m 2048 -smp 4 -cdrom /isos/win.iso \
             -drive file=/w/output.img,index=0,format=raw,if=ide,media=disk \
             -drive file=/w/Autounattend.vfd,index=1,format=raw,if=floppy \
             -drive file=/w/install.iso,index=3,format=raw,if=ide,media=cdrom \
             -boot d -vga std -k en-us -display none"
        );
    }

    #[test]
    fn tap_adds_nic_and_vnc_exposes_console() {
        let inv = VmSpec {
            tap: Some("vmtap3".to_string()),
            vnc: Some("localhost:1".to_string()),
            ..spec()
        }
        .invocation();
        let argv = inv.argv();

        let device = argv.iter().position(|a| a == "-device").unwrap();
        assert!(argv[device + 1]
            .starts_with("rtl8139,netdev=net00,mac=52:54:00:"));
        let netdev = argv.iter().position(|a| a == "-netdev").unwrap();
        assert_eq!(
            argv[netdev + 1],
            "type=tap,id=net00,script=no,downscript=no,ifname=vmtap3"
        );
        assert_eq!(&argv[argv.len() - 2..], ["-vnc", "localhost:1"]);
    }
}
