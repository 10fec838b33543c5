// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ephemeral tap devices that give an installation VM access to a bridged
//! network.
//!
//! Tap names are picked by scanning for the lowest unused `vmtapN`. Nothing
//! coordinates this between concurrent builds, so two builds started at the
//! same moment can race for the same name.

use camino::Utf8PathBuf;
use rand::Rng;
use tracing::{debug, warn};

use crate::{error::NetworkError, process::Invocation, runner::Context};

pub const TAP_PREFIX: &str = "vmtap";
pub const TAP_SEARCH_PATH: &str = "/sys/class/net";

/// Host-side state used to allocate and own tap devices.
#[derive(Clone, Debug)]
pub struct TapManager {
    search_path: Utf8PathBuf,
    owner: String,
}

impl TapManager {
    pub fn new(
        search_path: impl Into<Utf8PathBuf>,
        owner: impl Into<String>,
    ) -> Self {
        Self { search_path: search_path.into(), owner: owner.into() }
    }

    /// Looks for interfaces in sysfs and hands new taps to the user that
    /// invoked sudo, or root if there is none.
    pub fn from_env() -> Self {
        let owner =
            std::env::var("SUDO_USER").unwrap_or_else(|_| "root".to_string());
        Self::new(TAP_SEARCH_PATH, owner)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the lowest-numbered tap name that isn't in use.
    pub fn next_name(&self) -> String {
        (0u32..)
            .map(|n| format!("{TAP_PREFIX}{n}"))
            .find(|name| !self.search_path.join(name).exists())
            .unwrap_or_else(|| format!("{TAP_PREFIX}0"))
    }
}

/// Returns a random MAC address in QEMU's locally administered range.
pub fn random_qemu_mac() -> String {
    let mut rng = rand::thread_rng();
    let mac = [
        0x52,
        0x54,
        0x00,
        rng.gen_range(0x00..=0x7f),
        rng.gen_range(0x00..=0xff),
        rng.gen_range(0x00..=0xff),
    ];

    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// A tap device attached to a bridge. The device is deleted when the guard
/// is dropped if it wasn't explicitly deleted first.
#[must_use]
pub struct TapDevice<'a> {
    ctx: &'a Context<'a>,
    name: String,
    active: bool,
}

impl<'a> TapDevice<'a> {
    /// Creates a tap, brings it up, and adds it to `bridge`. If any step
    /// fails the tap is deleted again before the error is returned.
    pub fn create(
        ctx: &'a Context<'a>,
        bridge: &str,
    ) -> Result<Self, NetworkError> {
        let name = ctx.taps().next_name();
        let owner = ctx.taps().owner();

        ctx.run(&Invocation::new("ip").args([
            "tuntap", "add", "mode", "tap", "user", owner, &name,
        ]))
        .map_err(|e| {
            NetworkError::new(
                format!("Failed to create tap {name} for {owner}."),
                e,
            )
        })?;

        // From here on, dropping `tap` on an early return rolls back the
        // creation.
        let tap = Self { ctx, name, active: true };

        ctx.run(&Invocation::new("ip").args(["link", "set", &tap.name, "up"]))
            .map_err(|e| {
                NetworkError::new(
                    format!("Failed to bring up {}.", tap.name),
                    e,
                )
            })?;

        ctx.run(&Invocation::new("ip").args([
            "link", "set", &tap.name, "master", bridge,
        ]))
        .map_err(|e| {
            NetworkError::new(
                format!("Failed to add tap {} to {bridge}.", tap.name),
                e,
            )
        })?;

        debug!(tap = %tap.name, bridge, "created tap device");
        Ok(tap)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<(), NetworkError> {
        if self.active {
            self.ctx
                .run(&Invocation::new("ip").args([
                    "tuntap", "del", "mode", "tap", &self.name,
                ]))
                .map_err(|e| {
                    NetworkError::new(
                        format!("Failed to delete tap {}.", self.name),
                        e,
                    )
                })?;
            self.active = false;
        }

        Ok(())
    }

    /// Deletes the tap. If this fails, one more attempt is made when the
    /// guard is dropped.
    pub fn delete(mut self) -> Result<(), NetworkError> {
        self.release()
    }
}

impl Drop for TapDevice<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(tap = %self.name, error = %e, "leaking tap device");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{FakeRunner, TestEnv};

    #[test]
    fn next_name_skips_existing_interfaces() {
        let env = TestEnv::new(FakeRunner::new());
        let net = env.root.join("net");
        std::fs::create_dir(net.join("vmtap0")).unwrap();
        std::fs::create_dir(net.join("vmtap1")).unwrap();

        assert_eq!(env.taps.next_name(), "vmtap2");
    }

    #[test]
    fn next_name_fills_gaps() {
        let env = TestEnv::new(FakeRunner::new());
        let net = env.root.join("net");
        std::fs::create_dir(net.join("vmtap1")).unwrap();

        assert_eq!(env.taps.next_name(), "vmtap0");
    }

    #[test]
    fn mac_has_qemu_prefix() {
        let mac = random_qemu_mac();
        let octets: Vec<u8> = mac
            .split(':')
            .map(|o| u8::from_str_radix(o, 16).unwrap())
            .collect();

        assert_eq!(octets.len(), 6);
        assert_eq!(&octets[..3], &[0x52, 0x54, 0x00]);
        assert!(octets[3] <= 0x7f);
    }

    #[test]
    fn create_and_delete_tap() {
        let env = TestEnv::new(FakeRunner::new());
        let ctx = env.ctx();

        let tap = TapDevice::create(&ctx, "br0").unwrap();
        assert_eq!(tap.name(), "vmtap0");
        tap.delete().unwrap();

        assert_eq!(
            env.runner.commands(),
            vec![
                "ip tuntap add mode tap user builder vmtap0",
                "ip link set vmtap0 up",
                "ip link set vmtap0 master br0",
                "ip tuntap del mode tap vmtap0",
            ]
        );
    }

    #[test]
    fn failure_to_join_bridge_rolls_back() {
        let env = TestEnv::new(
            FakeRunner::new()
                .fail_matching(&["ip", "link", "set", "vmtap0", "master"], 1),
        );
        let ctx = env.ctx();

        let err = TapDevice::create(&ctx, "br0").err().unwrap();
        assert_eq!(err.to_string(), "Failed to add tap vmtap0 to br0.");
        assert_eq!(env.runner.succeeded(&["ip", "tuntap", "del"]), 1);
    }

    #[test]
    fn failure_to_create_does_not_delete() {
        let env = TestEnv::new(
            FakeRunner::new().fail_matching(&["ip", "tuntap", "add"], 1),
        );
        let ctx = env.ctx();

        let err = TapDevice::create(&ctx, "br0").err().unwrap();
        assert_eq!(err.to_string(), "Failed to create tap vmtap0 for builder.");
        assert_eq!(env.runner.count(&["ip", "tuntap", "del"]), 0);
    }

    #[test]
    fn failed_delete_is_reported() {
        let env = TestEnv::new(
            FakeRunner::new().fail_matching(&["ip", "tuntap", "del"], 1),
        );
        let ctx = env.ctx();

        let tap = TapDevice::create(&ctx, "br0").unwrap();
        let err = tap.delete().unwrap_err();
        assert_eq!(err.to_string(), "Failed to delete tap vmtap0.");
        assert_eq!(env.runner.succeeded(&["ip", "tuntap", "del"]), 1);
    }
}
