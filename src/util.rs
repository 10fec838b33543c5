// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem and prerequisite helpers shared by all of the builders.

use std::os::unix::fs::PermissionsExt;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use tracing::debug;
use walkdir::WalkDir;

/// Returns a message for each path in `files` that doesn't exist.
pub fn check_file_prerequisites(files: &[Utf8PathBuf]) -> Vec<String> {
    files
        .iter()
        .filter(|path| !path.exists())
        .map(|path| format!("file not found: {path}"))
        .collect()
}

/// Returns a message for each command in `commands` that can't be found in
/// the current `PATH`.
pub fn check_executable_prerequisites(commands: &[&str]) -> Vec<String> {
    commands
        .iter()
        .unique()
        .filter(|cmd| which::which(cmd).is_err())
        .map(|cmd| format!("command not found: {cmd}"))
        .collect()
}

/// Sets mode 0777 on `path`. virt-install hands the workspace and disk image
/// to QEMU, which may not run as the invoking user.
pub fn make_world_accessible(path: &Utf8Path) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
        .with_context(|| format!("setting permissions on {path}"))
}

/// Recursively copies the directory at `src` to `dst`, which must not exist.
/// Symbolic links are recreated rather than followed.
pub fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if dst.exists() {
        anyhow::bail!("copy destination {dst} already exists");
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {src}"))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("walked outside the copy source")?;
        let target = dst.as_std_path().join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target).with_context(|| {
                format!("creating directory {}", target.display())
            })?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target).with_context(|| {
                format!("creating symlink {}", target.display())
            })?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }

    Ok(())
}

/// Moves `src` to `dst`. Falls back to a copy when the two paths are on
/// different filesystems; `dst` only appears once the copy is complete.
pub fn move_file(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    debug!(%src, %dst, "rename failed, copying instead");
    copy_into_place(src, dst)?;
    std::fs::remove_file(src).with_context(|| format!("removing {src}"))
}

/// Copies `src` into a temporary file next to `dst` and renames it over
/// `dst`. The temporary file is removed if any step fails.
fn copy_into_place(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let dir = match dst.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };

    let mut input = std::fs::File::open(src)
        .with_context(|| format!("opening {src}"))?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating a temporary file in {dir}"))?;

    std::io::copy(&mut input, staged.as_file_mut())
        .with_context(|| format!("copying {src} to {dst}"))?;
    let permissions = input.metadata()?.permissions();
    staged
        .as_file()
        .set_permissions(permissions)
        .with_context(|| format!("setting permissions on {dst}"))?;
    staged.as_file().sync_all()?;

    staged
        .persist(dst)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming the copy of {src} to {dst}"))?;
    Ok(())
}
