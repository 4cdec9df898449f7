//! Hands the default NIC's link-layer identity to a macvtap device and back.
//!
//! `BridgeConfig::setup` moves the NIC's MAC onto a new macvtap, flushes the
//! NIC's addresses and creates a macvlan side LAN for the DHCP and ARP
//! services. The returned `BridgeState` owns everything needed to undo that,
//! and `BridgeState::recover` consumes it.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use nethandoff_networking::{random_device_name, IpCidr, MacAddr, LAN_PREFIX, TAP_PREFIX};
use tracing::{info, warn};

use super::discovery::{default_gateways, Gateways};
use super::LinkOps;
use crate::error::{NetError, Result};

/// Address given to the side LAN device so the services have something to
/// bind to. Reserved range, never handed to the VM.
pub const SERVICE_ADDRESS: &str = "240.0.0.1/32";

/// Default directory for the tap character device.
pub const DEFAULT_DEV_DIR: &str = "/dev";

/// An unconfigured bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Physical NIC to take over.
    pub nic: String,
    /// MAC the NIC gets once its own MAC moves to the tap.
    pub new_mac: MacAddr,
    /// macvtap device name.
    pub tap_name: String,
    /// macvlan side LAN device name.
    pub lan_name: String,
    /// Where the tap character device is created.
    pub dev_dir: PathBuf,
    /// Address assigned to the side LAN device.
    pub service_address: IpCidr,
}

impl BridgeConfig {
    /// Config for `nic` with fresh random device names and NIC MAC.
    pub fn new(nic: impl Into<String>) -> Result<Self> {
        Ok(Self {
            nic: nic.into(),
            new_mac: MacAddr::random_unicast(),
            tap_name: random_device_name(TAP_PREFIX)?,
            lan_name: random_device_name(LAN_PREFIX)?,
            dev_dir: PathBuf::from(DEFAULT_DEV_DIR),
            service_address: SERVICE_ADDRESS.parse()?,
        })
    }

    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    pub fn with_service_address(mut self, address: IpCidr) -> Self {
        self.service_address = address;
        self
    }

    /// Path of the tap character device once set up.
    pub fn tap_device_path(&self) -> PathBuf {
        self.dev_dir.join(&self.tap_name)
    }

    /// Configure the bridge.
    ///
    /// The NIC snapshot is taken before anything is changed. On failure no
    /// rollback happens; the snapshot is handed back in `SetupFailure` so the
    /// caller can decide whether to recover.
    pub fn setup(self, links: &dyn LinkOps) -> std::result::Result<BridgeState, SetupFailure> {
        let state = match self.snapshot(links) {
            Ok(state) => state,
            Err(error) => return Err(SetupFailure { error, state: None }),
        };

        match state.apply(links, self.service_address) {
            Ok(()) => {
                info!(
                    nic = %state.nic,
                    tap = %state.tap_name,
                    lan = %state.lan_name,
                    path = %state.tap_path.display(),
                    "bridge configured"
                );
                Ok(state)
            }
            Err(error) => Err(SetupFailure {
                error,
                state: Some(state),
            }),
        }
    }

    fn snapshot(&self, links: &dyn LinkOps) -> Result<BridgeState> {
        let link = links.link(&self.nic)?;
        let addresses = links.addresses(&self.nic)?;
        let gateways = default_gateways(links)?;

        info!(
            nic = %self.nic,
            mac = %link.mac,
            mtu = link.mtu,
            addresses = addresses.len(),
            gateway4 = ?gateways.v4,
            gateway6 = ?gateways.v6,
            "captured nic state"
        );

        Ok(BridgeState {
            nic: self.nic.clone(),
            tap_name: self.tap_name.clone(),
            tap_path: self.tap_device_path(),
            lan_name: self.lan_name.clone(),
            new_mac: self.new_mac,
            original_mac: link.mac,
            mtu: link.mtu,
            addresses,
            gateways,
        })
    }
}

/// A configured bridge.
///
/// Holds the NIC state captured before setup. Dropping it leaves the host
/// as configured; call `recover` to restore the NIC.
#[derive(Debug)]
pub struct BridgeState {
    nic: String,
    tap_name: String,
    tap_path: PathBuf,
    lan_name: String,
    new_mac: MacAddr,
    original_mac: MacAddr,
    mtu: u32,
    addresses: Vec<IpCidr>,
    gateways: Gateways,
}

impl BridgeState {
    pub fn nic(&self) -> &str {
        &self.nic
    }

    /// Character device to hand to the hypervisor.
    pub fn tap_device_path(&self) -> &Path {
        &self.tap_path
    }

    pub fn tap_name(&self) -> &str {
        &self.tap_name
    }

    /// Side LAN device the services listen on.
    pub fn lan_name(&self) -> &str {
        &self.lan_name
    }

    /// The NIC's MAC before setup, now carried by the tap.
    pub fn original_mac(&self) -> MacAddr {
        self.original_mac
    }

    /// MAC assigned to the NIC during setup.
    pub fn new_mac(&self) -> MacAddr {
        self.new_mac
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Addresses the NIC had before setup.
    pub fn addresses(&self) -> &[IpCidr] {
        &self.addresses
    }

    /// Default gateways before setup.
    pub fn gateways(&self) -> Gateways {
        self.gateways
    }

    fn apply(&self, links: &dyn LinkOps, service_address: IpCidr) -> Result<()> {
        let nic = self.nic.as_str();
        let tap = self.tap_name.as_str();
        let lan = self.lan_name.as_str();

        // Free the original MAC.
        links.set_down(nic)?;
        links.set_mac(nic, self.new_mac)?;
        links.set_up(nic)?;
        info!(nic, mac = %self.new_mac, "nic mac replaced");

        links.add_macvtap(nic, tap, self.mtu)?;
        links.set_mac(tap, self.original_mac)?;
        links.set_up(tap)?;
        info!(nic, tap, mac = %self.original_mac, mtu = self.mtu, "macvtap created");

        // Re-read: the kernel may have added addresses since the snapshot.
        for addr in links.addresses(nic)? {
            links.del_address(nic, &addr)?;
            info!(nic, address = %addr, "address removed from nic");
        }

        let (major, minor) = links.tap_device_numbers(tap)?;
        links.make_char_device(&self.tap_path, major, minor)?;
        info!(path = %self.tap_path.display(), major, minor, "tap device node created");

        links.add_macvlan(nic, lan, self.mtu)?;
        links.set_up(lan)?;
        links.add_address(lan, &service_address)?;
        info!(nic, lan, address = %service_address, "side lan created");

        Ok(())
    }

    /// Undo `setup`.
    ///
    /// Stops at the first failure. Only a failure to remove the tap device
    /// node is tolerated.
    pub fn recover(self, links: &dyn LinkOps) -> Result<()> {
        let nic = self.nic.as_str();
        let tap = self.tap_name.as_str();

        links.set_down(tap)?;
        info!(tap, "tap down");

        let tap_mac = links.link(tap)?.mac;
        links.set_mac(nic, tap_mac)?;
        info!(nic, mac = %tap_mac, "nic mac restored");

        for addr in &self.addresses {
            links.add_address(nic, addr)?;
            info!(nic, address = %addr, "address restored");
        }

        links.del_link(tap)?;
        info!(tap, "tap deleted");
        if let Err(e) = links.remove_device_node(&self.tap_path) {
            warn!(path = %self.tap_path.display(), error = %e, "failed to remove tap device node");
        }

        links.del_link(&self.lan_name)?;
        info!(lan = %self.lan_name, "side lan deleted");

        let gateways = [
            self.gateways.v4.map(IpAddr::V4),
            self.gateways.v6.map(IpAddr::V6),
        ];
        for gateway in gateways.into_iter().flatten() {
            links.add_default_route(nic, gateway)?;
            info!(nic, %gateway, "default route restored");
        }

        info!(nic, "bridge recovered");
        Ok(())
    }
}

/// A failed `BridgeConfig::setup`.
#[derive(Debug)]
pub struct SetupFailure {
    pub error: NetError,
    /// Captured state, if the failure happened after the snapshot.
    pub state: Option<BridgeState>,
}

impl fmt::Display for SetupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bridge setup failed: {}", self.error)
    }
}

impl std::error::Error for SetupFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
