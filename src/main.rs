// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! mib: builds CentOS, RHEL, and Windows images by driving virt-install,
//! QEMU, and a handful of disk and network tools.

#[cfg(not(target_os = "linux"))]
compile_error!("only Linux targets are supported");

pub mod app;
pub mod autounattend;
pub mod builders;
pub mod contrib;
pub mod error;
pub mod kickstart;
pub mod logging;
pub mod loopback;
pub mod net;
pub mod params;
pub mod process;
pub mod runner;
pub mod steps;
pub mod util;
pub mod virt;
pub mod vm;
pub mod workspace;

#[cfg(test)]
mod testing;

use contrib::Contrib;
use net::TapManager;
use process::SystemRunner;
use runner::{Context, ProgressUi};

fn main() -> anyhow::Result<()> {
    let request = app::parse();
    let interactive = match request.settings.interactive {
        Some(val) => val,
        None => atty::is(atty::Stream::Stdout),
    };

    logging::init(interactive, request.settings.verbose);

    let runner = SystemRunner::new(interactive);
    let ui = ProgressUi::new(interactive);
    let contrib = Contrib::new(request.settings.contrib_dir);
    let taps = TapManager::from_env();
    let ctx = Context::new(&runner, &ui, &contrib, &taps);

    runner::run_build(
        request.builder.as_ref(),
        &request.params,
        &ctx,
        interactive,
    )
}
