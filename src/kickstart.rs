// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembling kickstart files for the Linux installers.

use std::{fs::File, io::Write};

use anyhow::{Context, Result};
use camino::Utf8Path;

/// Writes the kickstart the installer will use to `dest`.
///
/// Without a custom kickstart this is a copy of `base`. Otherwise the custom
/// file is appended to the base one, and each part is preceded by a comment
/// naming the file it came from, so later directives in the custom file
/// override the base ones.
pub fn write_kickstart(
    dest: &Utf8Path,
    base: &Utf8Path,
    custom: Option<&Utf8Path>,
) -> Result<()> {
    let Some(custom) = custom else {
        std::fs::copy(base, dest)
            .with_context(|| format!("copying kickstart {base} to {dest}"))?;
        return Ok(());
    };

    let mut out = File::create(dest)
        .with_context(|| format!("creating kickstart {dest}"))?;
    for part in [base, custom] {
        let contents = std::fs::read(part)
            .with_context(|| format!("reading kickstart {part}"))?;
        write!(out, "#\n# From {part}\n#\n\n")?;
        out.write_all(&contents)?;
    }

    Ok(())
}
