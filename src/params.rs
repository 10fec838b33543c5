// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The immutable description of a requested build.

use std::fmt;

use camino::Utf8PathBuf;
use clap::ValueEnum;

use crate::builders::{
    centos::CentosOptions, rhel::RhelOptions, windows::WindowsOptions,
};

/// Guest architectures the builders know how to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Arch {
    I386,
    Amd64,
}

impl Arch {
    /// The architecture name QEMU and virt-install expect.
    pub fn qemu_name(self) -> &'static str {
        match self {
            Arch::I386 => "i386",
            Arch::Amd64 => "x86_64",
        }
    }

    /// The `processorArchitecture` value Windows setup expects.
    pub fn windows_name(self) -> &'static str {
        match self {
            Arch::I386 => "x86",
            Arch::Amd64 => "amd64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::I386 => "i386",
            Arch::Amd64 => "amd64",
        })
    }
}

/// Options that only make sense for one of the builders.
#[derive(Clone, Debug)]
pub enum OsOptions {
    Centos(CentosOptions),
    Rhel(RhelOptions),
    Windows(WindowsOptions),
}

/// Everything a builder needs to know about the image it is asked to
/// produce. Built once from the command line and never modified afterwards.
#[derive(Clone, Debug)]
pub struct BuildParameters {
    pub arch: Arch,

    /// Memory given to the installation VM, in MiB.
    pub ram: u32,
    pub vcpus: u32,

    /// Where the finished artifact is moved once the build succeeds.
    pub output: Utf8PathBuf,

    /// The bridge the installation VM's network interface attaches to.
    pub interface: String,

    /// The directory under which the build workspace is created.
    pub work_root: Utf8PathBuf,

    pub os: OsOptions,
}
