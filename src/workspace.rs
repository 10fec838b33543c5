// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-build scratch directory.

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use tracing::debug;

const WORKSPACE_PREFIX: &str = "img-builder-";

/// A temporary directory that holds every intermediate artifact of a single
/// build. The directory and everything under it is removed when the
/// workspace is dropped; removal errors are ignored.
///
/// Anything mounted or mapped from inside the workspace must be released
/// before the workspace goes out of scope.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    path: Utf8PathBuf,
}

impl Workspace {
    /// Creates a new workspace under `backing_dir`.
    ///
    /// The directory is made world-accessible because virt-install and the
    /// QEMU processes it launches may run as a different user.
    pub fn acquire(backing_dir: &Utf8Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(backing_dir)
            .with_context(|| {
                format!("creating workspace under {backing_dir}")
            })?;

        let path = Utf8PathBuf::try_from(dir.path().to_path_buf())
            .context("workspace path is not valid UTF-8")?;

        crate::util::make_world_accessible(&path)?;

        debug!(%path, "acquired workspace");
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> Utf8PathBuf {
        self.path.join(name)
    }

    /// Creates a directory named `name` inside the workspace.
    pub fn create_dir(&self, name: &str) -> Result<Utf8PathBuf> {
        let path = self.join(name);
        std::fs::create_dir(&path)
            .with_context(|| format!("creating directory {path}"))?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // `TempDir` does the actual removal once this returns.
        debug!(path = %self.dir.path().display(), "releasing workspace");
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn backing_dir() -> (TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn workspace_is_created_under_backing_dir() {
        let (_guard, backing) = backing_dir();
        let ws = Workspace::acquire(&backing).unwrap();

        assert!(ws.path().starts_with(&backing));
        assert!(ws.path().file_name().unwrap().starts_with(WORKSPACE_PREFIX));
        let mode = std::fs::metadata(ws.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[test]
    fn workspace_is_removed_with_contents_on_drop() {
        let (_guard, backing) = backing_dir();
        let ws = Workspace::acquire(&backing).unwrap();
        let path = ws.path().to_owned();
        let nested = ws.create_dir("iso").unwrap();
        std::fs::write(nested.join("ks.cfg"), "text\n").unwrap();

        drop(ws);
        assert!(!path.exists());
    }

    #[test]
    fn workspace_release_tolerates_missing_directory() {
        let (_guard, backing) = backing_dir();
        let ws = Workspace::acquire(&backing).unwrap();
        std::fs::remove_dir_all(ws.path()).unwrap();

        drop(ws);
    }

    #[test]
    fn acquire_fails_for_missing_backing_dir() {
        let (_guard, backing) = backing_dir();
        let missing = backing.join("does-not-exist");

        assert!(Workspace::acquire(&missing).is_err());
    }
}
