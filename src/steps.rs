// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipeline steps that are shared between multiple builders.

use anyhow::{Context as _, Result};
use camino::Utf8Path;
use tracing::{info, warn};

use crate::{
    error::BuildError,
    process::Invocation,
    runner::Context,
    util::{copy_tree, move_file},
};

/// Archives the contents of `dir` into a gzipped tarball at `output`,
/// preserving permissions.
pub fn create_tarball(
    ctx: &Context,
    output: &Utf8Path,
    dir: &Utf8Path,
) -> Result<()> {
    ctx.run(&Invocation::new("tar").args([
        "zcpf",
        output.as_str(),
        "-C",
        dir.as_str(),
        ".",
    ]))
    .with_context(|| format!("archiving {dir}"))?;

    Ok(())
}

/// Archives a single disk image into a gzipped tarball at `output`, keeping
/// the image sparse.
pub fn create_disk_tarball(
    ctx: &Context,
    output: &Utf8Path,
    disk: &Utf8Path,
) -> Result<()> {
    let dir = disk.parent().unwrap_or(Utf8Path::new("."));
    let file = disk
        .file_name()
        .with_context(|| format!("{disk} has no file name"))?;

    ctx.run(&Invocation::new("tar").args([
        "Szcf",
        output.as_str(),
        "-C",
        dir.as_str(),
        file,
    ]))
    .with_context(|| format!("archiving {disk}"))?;

    Ok(())
}

/// Copies the curtin deployment hooks in `src` to `/curtin` on the mounted
/// image at `mount`. A missing source fails the build when the image needs
/// hooks to be deployable, and is only a warning otherwise.
pub fn install_curtin(
    src: &Utf8Path,
    mount: &Utf8Path,
    required: bool,
) -> Result<()> {
    if !src.exists() {
        if required {
            return Err(BuildError::new(format!(
                "Curtin hooks not found at {src}."
            ))
            .into());
        }

        warn!(%src, "no curtin hooks found, skipping");
        return Ok(());
    }

    copy_tree(src, &mount.join("curtin"))
        .with_context(|| format!("installing curtin hooks from {src}"))
}

/// Downloads `url` to `dest` with `wget`.
pub fn fetch(ctx: &Context, url: &str, dest: &Utf8Path) -> Result<()> {
    ctx.run(&Invocation::new("wget").args(["-O", dest.as_str(), url]))
        .with_context(|| format!("downloading {url}"))?;

    Ok(())
}

/// Extracts the zip archive at `archive` into `dest`.
pub fn unzip(ctx: &Context, archive: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    ctx.run(&Invocation::new("unzip").args([
        "-q",
        archive.as_str(),
        "-d",
        dest.as_str(),
    ]))
    .with_context(|| format!("extracting {archive}"))?;

    Ok(())
}

/// Flushes cached writes to disk.
pub fn sync(ctx: &Context) -> Result<()> {
    ctx.run(&Invocation::new("sync")).context("syncing filesystems")?;
    Ok(())
}

/// Moves the finished artifact out of the workspace to its final location.
/// This is always the last step of a build, so a failed build never leaves
/// anything at `output`.
pub fn move_artifact(
    ctx: &Context,
    artifact: &Utf8Path,
    output: &Utf8Path,
) -> Result<()> {
    ctx.step("Moving image to output");
    move_file(artifact, output)
        .with_context(|| format!("moving {artifact} to {output}"))?;
    info!(%output, "image written");
    Ok(())
}
