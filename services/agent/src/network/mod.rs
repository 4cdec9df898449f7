//! Host link state: discovery, the macvtap bridge and its recovery.
//!
//! Architecture:
//! - `LinkOps` is the only way this crate reads or mutates kernel link state
//! - `IpRoute2` implements it with iproute2 (`ip -j ...`) and `mknod`
//! - `MockLinks` implements it in memory for tests
//! - `discovery` finds the default NIC and its gateways
//! - `bridge` moves the NIC's identity onto a macvtap device and back

mod bridge;
mod discovery;
mod iproute;
mod mock;

use std::net::IpAddr;
use std::path::Path;

use nethandoff_networking::{IpCidr, MacAddr};

use crate::error::Result;

pub use bridge::{BridgeConfig, BridgeState, SetupFailure, DEFAULT_DEV_DIR, SERVICE_ADDRESS};
pub use discovery::{default_gateways, discover_default_nic, Gateways, Nic, NeighborResolver};
pub use iproute::IpRoute2;
pub use mock::{MockLinkKind, MockLinks};

/// A network link as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Hardware address.
    pub mac: MacAddr,
    /// MTU.
    pub mtu: u32,
    /// Administrative state.
    pub up: bool,
}

/// A neighbor table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: IpAddr,
    pub mac: MacAddr,
}

/// Address family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Kernel link configuration primitives.
///
/// Each method mirrors one iproute2 invocation. Missing links, routes or
/// neighbor entries are reported as `NetError::NotFound`.
pub trait LinkOps: Send + Sync {
    /// Look up a link by name.
    fn link(&self, name: &str) -> Result<Link>;

    /// List all links.
    fn links(&self) -> Result<Vec<Link>>;

    /// Addresses of every family on a link, in kernel order.
    fn addresses(&self, name: &str) -> Result<Vec<IpCidr>>;

    /// `ip addr add <addr> dev <name>`
    fn add_address(&self, name: &str, addr: &IpCidr) -> Result<()>;

    /// `ip addr del <addr> dev <name>`
    fn del_address(&self, name: &str, addr: &IpCidr) -> Result<()>;

    /// `ip link set <name> up`
    fn set_up(&self, name: &str) -> Result<()>;

    /// `ip link set <name> down`
    fn set_down(&self, name: &str) -> Result<()>;

    /// `ip link set <name> address <mac>`
    fn set_mac(&self, name: &str, mac: MacAddr) -> Result<()>;

    /// `ip link add link <parent> name <name> mtu <mtu> type macvtap mode bridge`
    fn add_macvtap(&self, parent: &str, name: &str, mtu: u32) -> Result<()>;

    /// `ip link add link <parent> name <name> mtu <mtu> type macvlan mode bridge`
    fn add_macvlan(&self, parent: &str, name: &str, mtu: u32) -> Result<()>;

    /// `ip link del <name>`
    fn del_link(&self, name: &str) -> Result<()>;

    /// Gateway of the default route for a family, if there is one.
    fn default_gateway(&self, family: Family) -> Result<Option<IpAddr>>;

    /// `ip route add default via <gateway> dev <dev>` (`::/0` for IPv6).
    fn add_default_route(&self, dev: &str, gateway: IpAddr) -> Result<()>;

    /// Local address the kernel would use to reach `dest`.
    fn route_source(&self, dest: IpAddr) -> Result<IpAddr>;

    /// Neighbor table entries of one family on a link.
    fn neighbors(&self, index: u32, family: Family) -> Result<Vec<Neighbor>>;

    /// Character device numbers of a macvtap device.
    fn tap_device_numbers(&self, tap: &str) -> Result<(u32, u32)>;

    /// `mknod <path> c <major> <minor>`
    fn make_char_device(&self, path: &Path, major: u32, minor: u32) -> Result<()>;

    /// Remove a device node created by `make_char_device`.
    fn remove_device_node(&self, path: &Path) -> Result<()>;
}

/// Parse a sysfs `dev` attribute (`"<major>:<minor>\n"`).
pub fn parse_device_numbers(content: &str) -> Option<(u32, u32)> {
    let (major, minor) = content.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_numbers() {
        assert_eq!(parse_device_numbers("241:3\n"), Some((241, 3)));
        assert_eq!(parse_device_numbers("10:200"), Some((10, 200)));
        assert_eq!(parse_device_numbers("241"), None);
        assert_eq!(parse_device_numbers("a:b"), None);
        assert_eq!(parse_device_numbers(""), None);
    }

    #[test]
    fn test_family_of() {
        assert_eq!(Family::of("10.0.0.1".parse().unwrap()), Family::V4);
        assert_eq!(Family::of("fe80::1".parse().unwrap()), Family::V6);
    }
}
