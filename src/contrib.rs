// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locating the data files (kickstarts, answer file templates, guest
//! scripts, deployment hooks) that ship alongside the tool.

use camino::{Utf8Path, Utf8PathBuf};

pub const DEFAULT_CONTRIB_DIR: &str = "/usr/lib/mib/contrib";

/// The root of the contrib tree. Each builder keeps its files in a
/// subdirectory named after the builder.
#[derive(Clone, Debug)]
pub struct Contrib {
    root: Utf8PathBuf,
}

impl Contrib {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the full path of `path` in `builder`'s contrib directory.
    pub fn path(&self, builder: &str, path: &str) -> Utf8PathBuf {
        self.root.join(builder).join(path)
    }
}
