// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loopback access to disk and ISO images.
//!
//! A disk image is exposed to the host in two layers: `kpartx` maps each
//! partition in the image to a device under `/dev/mapper`, and `mount`
//! attaches one of those devices to a directory. Each layer is a guard that
//! releases itself when dropped, so declaring the guards in acquisition
//! order guarantees they are released in reverse order on every exit path.
//! Callers that want to observe release errors should use the explicit
//! `unmount`/`delete`/`detach` methods instead of relying on `Drop`.

use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::{
    error::{BuildError, ExecutionError},
    process::Invocation,
    runner::Context,
};

/// How hard to try when removing a partition mapping. The kernel can report
/// a mapping as busy for a short while after its filesystem is unmounted.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 10, delay: Duration::from_secs(1) }
    }
}

/// Parses the output of `kpartx -l` into device paths.
fn parse_kpartx_list(output: &str) -> Vec<Utf8PathBuf> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| Utf8PathBuf::from(format!("/dev/mapper/{name}")))
        .collect()
}

/// Removes the partition mappings for `image`, retrying according to the
/// context's unmap policy. The last error is returned if every attempt
/// fails.
pub fn kpartx_delete(
    ctx: &Context,
    image: &Utf8Path,
) -> Result<(), ExecutionError> {
    let policy = ctx.unmap_retry();
    let invocation = Invocation::new("kpartx").args(["-d", image.as_str()]);
    let mut attempt = 1;
    loop {
        match ctx.run(&invocation) {
            Ok(_) => return Ok(()),
            Err(e) if attempt < policy.attempts => {
                warn!(
                    %image,
                    attempt,
                    error = %e.stderr.trim(),
                    "removing partition mappings failed, retrying"
                );
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Partition mappings for a disk image, created with `kpartx -a`.
#[must_use]
pub struct PartitionMap<'a> {
    ctx: &'a Context<'a>,
    image: Utf8PathBuf,
    mapped: bool,
}

impl<'a> PartitionMap<'a> {
    pub fn add(ctx: &'a Context<'a>, image: &Utf8Path) -> Result<Self> {
        ctx.run(&Invocation::new("kpartx").args(["-s", "-a", image.as_str()]))?;
        debug!(%image, "mapped partitions");
        Ok(Self { ctx, image: image.to_owned(), mapped: true })
    }

    /// Lists the mapped partition devices, in partition order.
    pub fn devices(&self) -> Result<Vec<Utf8PathBuf>> {
        let output = self.ctx.run(
            &Invocation::new("kpartx")
                .args(["-l", self.image.as_str()])
                .capture(),
        )?;

        Ok(parse_kpartx_list(&output.stdout))
    }

    /// Returns the device for the zero-indexed partition `index`.
    pub fn device(&self, index: usize) -> Result<Utf8PathBuf> {
        let mut devices = self.devices()?;
        if index >= devices.len() {
            return Err(BuildError::new(format!(
                "{} has no partition with index {index} ({} mapped)",
                self.image,
                devices.len()
            ))
            .into());
        }

        Ok(devices.swap_remove(index))
    }

    /// Removes the mappings. The retry loop runs once; if it gives up the
    /// mapping is considered lost and the error is returned.
    pub fn delete(mut self) -> Result<()> {
        self.mapped = false;
        kpartx_delete(self.ctx, &self.image)?;
        debug!(image = %self.image, "removed partition mappings");
        Ok(())
    }
}

impl Drop for PartitionMap<'_> {
    fn drop(&mut self) {
        if self.mapped {
            if let Err(e) = kpartx_delete(self.ctx, &self.image) {
                warn!(
                    image = %self.image,
                    error = %e,
                    "leaking partition mappings"
                );
            }
        }
    }
}

/// A filesystem mounted on a directory.
#[must_use]
pub struct Mount<'a> {
    ctx: &'a Context<'a>,
    target: Utf8PathBuf,
    mounted: bool,
}

impl<'a> Mount<'a> {
    /// Runs `mount <options> <source> <target>`.
    pub fn new(
        ctx: &'a Context<'a>,
        source: &Utf8Path,
        target: &Utf8Path,
        options: &[&str],
    ) -> Result<Self> {
        ctx.run(
            &Invocation::new("mount")
                .args(options.iter().copied())
                .args([source.as_str(), target.as_str()]),
        )?;

        debug!(%source, %target, "mounted");
        Ok(Self { ctx, target: target.to_owned(), mounted: true })
    }

    pub fn target(&self) -> &Utf8Path {
        &self.target
    }

    fn release(&mut self) -> Result<(), ExecutionError> {
        if self.mounted {
            self.ctx.run(&Invocation::new("umount").arg(self.target.as_str()))?;
            self.mounted = false;
        }

        Ok(())
    }

    /// Unmounts the filesystem. If this fails, one more attempt is made when
    /// the guard is dropped.
    pub fn unmount(mut self) -> Result<()> {
        self.release()?;
        Ok(())
    }
}

impl Drop for Mount<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(target = %self.target, error = %e, "leaking mount");
        }
    }
}

/// A partition of a disk image, mapped with `kpartx` and mounted with
/// `mount -o loop`.
///
/// Field order matters: the mount is dropped before the partition map.
#[must_use]
pub struct LoopMount<'a> {
    mount: Mount<'a>,
    map: PartitionMap<'a>,
}

impl<'a> LoopMount<'a> {
    /// Maps `image` and mounts its zero-indexed partition `index` at
    /// `target`.
    pub fn attach(
        ctx: &'a Context<'a>,
        image: &Utf8Path,
        target: &Utf8Path,
        index: usize,
    ) -> Result<Self> {
        let map = PartitionMap::add(ctx, image)?;
        let device = map.device(index)?;
        let mount = Mount::new(ctx, &device, target, &["-o", "loop"])?;
        Ok(Self { mount, map })
    }

    pub fn target(&self) -> &Utf8Path {
        self.mount.target()
    }

    /// Unmounts the partition but keeps the mapping, so that the caller can
    /// operate on the partition device before deleting it.
    pub fn unmount(self) -> Result<PartitionMap<'a>> {
        let Self { mount, map } = self;
        mount.unmount()?;
        Ok(map)
    }

    /// Unmounts the partition and removes the image's mappings.
    pub fn detach(self) -> Result<()> {
        self.unmount()?.delete()
    }
}
