//! Networking helpers for handing a container's network identity to a VM.
//!
//! This library provides helpers for:
//! - IP prefix arithmetic (subnet membership, masks, broadcast addresses)
//! - MAC address parsing and generation
//! - Naming of the macvtap/macvlan devices created on the host
//! - MTU validation
//! - resolv.conf parsing and cloud-init network descriptors
//!
//! Nothing in here touches the kernel; see the agent crate for that.

pub mod cloudinit;
pub mod resolv;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid hardware address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Invalid network device name.
    #[error("invalid device name: {0}")]
    InvalidName(String),

    /// Invalid MTU value.
    #[error("invalid MTU: {value} (must be between {min} and {max})")]
    InvalidMtu { value: u32, min: u32, max: u32 },

    /// An IPv4 address was required.
    #[error("IPv4 address required, got {0}")]
    NotIpv4(IpAddr),

    /// Document rendering failed.
    #[error("failed to render document: {0}")]
    Render(String),
}

// ============================================================================
// Prefix arithmetic
// ============================================================================

/// An interface address together with its prefix length, e.g. `10.0.0.5/24`.
///
/// The host bits are kept: this is an address assignment, not a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpCidr {
    address: IpAddr,
    prefix_len: u8,
}

impl IpCidr {
    /// Create a new address/prefix pair.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Pair a bare IPv4 address with its natural (classful) mask.
    pub fn with_natural_mask(address: IpAddr) -> Result<Self, NetworkError> {
        let IpAddr::V4(v4) = address else {
            return Err(NetworkError::NotIpv4(address));
        };
        let prefix_len = natural_prefix_len(v4).ok_or_else(|| {
            NetworkError::InvalidPrefix(format!("{} has no natural mask", v4))
        })?;
        Self::new(address, prefix_len)
    }

    /// The host address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// The network address (host bits cleared).
    pub fn network(&self) -> IpAddr {
        match self.address {
            IpAddr::V4(v4) => IpAddr::V4(mask_ipv4(v4, self.prefix_len)),
            IpAddr::V6(v6) => IpAddr::V6(mask_ipv6(v6, self.prefix_len)),
        }
    }

    /// Check if an address is within this prefix.
    ///
    /// Addresses of the other family are never contained.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(own), IpAddr::V4(other)) => {
                mask_ipv4(own, self.prefix_len) == mask_ipv4(other, self.prefix_len)
            }
            (IpAddr::V6(own), IpAddr::V6(other)) => {
                mask_ipv6(own, self.prefix_len) == mask_ipv6(other, self.prefix_len)
            }
            _ => false,
        }
    }
}

impl FromStr for IpCidr {
    type Err = NetworkError;

    /// Parse from CIDR notation (e.g., "192.168.1.3/24").
    ///
    /// A bare IPv4 address gets its natural mask.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            let address = IpAddr::from_str(s)
                .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
            return Self::with_natural_mask(address);
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn max_prefix_len(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Natural (classful) prefix length of an IPv4 address.
///
/// Class D and E addresses have none.
pub fn natural_prefix_len(addr: Ipv4Addr) -> Option<u8> {
    match addr.octets()[0] {
        0..=127 => Some(8),
        128..=191 => Some(16),
        192..=223 => Some(24),
        _ => None,
    }
}

/// Dotted-quad subnet mask for a prefix length.
pub fn ipv4_mask(prefix_len: u8) -> Ipv4Addr {
    let bits = match prefix_len {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    Ipv4Addr::from(bits)
}

/// Broadcast address: `ip | !mask`.
pub fn ipv4_broadcast(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(mask))
}

fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & u32::from(ipv4_mask(prefix_len)))
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// Hardware addresses
// ============================================================================

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Random locally administered unicast address.
    pub fn random_unicast() -> Self {
        let mut octets: [u8; 6] = rand::random();
        octets[0] = (octets[0] | 0x02) & 0xfe;
        Self(octets)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for MacAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(NetworkError::InvalidMac(s.to_string()));
            }
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

// ============================================================================
// Device naming
// ============================================================================

/// Kernel interface name buffer size, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Prefix for the tap device handed to the VM.
pub const TAP_PREFIX: &str = "macvtap";

/// Prefix for the side LAN device hosting DHCP/ARP.
pub const LAN_PREFIX: &str = "macvlan";

/// Build a device name from a prefix and a random 24-bit suffix.
///
/// Repeated runs on the same host pick fresh names, so leftovers from a
/// crashed run never collide with a new one.
pub fn random_device_name(prefix: &str) -> Result<String, NetworkError> {
    let suffix = rand::random::<u32>() & 0x00ff_ffff;
    let name = format!("{}{:06x}", prefix, suffix);
    validate_device_name(&name)?;
    Ok(name)
}

/// Validate a kernel interface name.
pub fn validate_device_name(name: &str) -> Result<(), NetworkError> {
    if name.is_empty() || name.len() >= IFNAMSIZ {
        return Err(NetworkError::InvalidName(format!(
            "'{}' must be 1..{} bytes",
            name,
            IFNAMSIZ - 1
        )));
    }
    if name.contains(['/', ' ', ':']) {
        return Err(NetworkError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ============================================================================
// MTU Configuration
// ============================================================================

/// Minimum MTU for IPv4.
pub const MTU_MIN_IPV4: u32 = 68;

/// Largest MTU a virtio-net device accepts.
pub const MTU_MAX: u32 = 65535;

/// Default MTU for Ethernet.
pub const MTU_DEFAULT_ETHERNET: u32 = 1500;

/// Validate an MTU value.
pub fn validate_mtu(mtu: u32) -> Result<u32, NetworkError> {
    if !(MTU_MIN_IPV4..=MTU_MAX).contains(&mtu) {
        return Err(NetworkError::InvalidMtu {
            value: mtu,
            min: MTU_MIN_IPV4,
            max: MTU_MAX,
        });
    }
    Ok(mtu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cidr_parse() {
        let cidr: IpCidr = "192.168.1.3/24".parse().unwrap();
        assert_eq!(cidr.address(), "192.168.1.3".parse::<IpAddr>().unwrap());
        assert_eq!(cidr.prefix_len(), 24);
        assert_eq!(cidr.network(), "192.168.1.0".parse::<IpAddr>().unwrap());
        assert_eq!(cidr.to_string(), "192.168.1.3/24");

        assert_eq!(
            "192.168.1.3".parse::<IpCidr>().unwrap(),
            "192.168.1.3/24".parse::<IpCidr>().unwrap()
        );
        assert!("2001:db8::1".parse::<IpCidr>().is_err());
        assert!("192.168.1.3/33".parse::<IpCidr>().is_err());
        assert!("2001:db8::1/129".parse::<IpCidr>().is_err());
    }

    #[test]
    fn test_cidr_contains() {
        let v4: IpCidr = "10.1.2.3/16".parse().unwrap();
        assert!(v4.contains("10.1.200.1".parse().unwrap()));
        assert!(!v4.contains("10.2.0.1".parse().unwrap()));
        assert!(!v4.contains("::1".parse().unwrap()));

        let v6: IpCidr = "2001:db8:1::242:ac11:2/64".parse().unwrap();
        assert!(v6.contains("2001:db8:1::1".parse().unwrap()));
        assert!(!v6.contains("2001:db8:2::1".parse().unwrap()));
    }

    #[test]
    fn test_host_prefix_contains_only_itself() {
        let cidr: IpCidr = "172.17.0.2/32".parse().unwrap();
        assert!(cidr.contains("172.17.0.2".parse().unwrap()));
        assert!(!cidr.contains("172.17.0.1".parse().unwrap()));
    }

    #[test]
    fn test_natural_mask() {
        let a = IpCidr::with_natural_mask("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(a.prefix_len(), 8);
        let b = IpCidr::with_natural_mask("172.16.0.1".parse().unwrap()).unwrap();
        assert_eq!(b.prefix_len(), 16);
        let c = IpCidr::with_natural_mask("192.168.1.3".parse().unwrap()).unwrap();
        assert_eq!(c.prefix_len(), 24);

        assert!(IpCidr::with_natural_mask("224.0.0.1".parse().unwrap()).is_err());
        assert!(matches!(
            IpCidr::with_natural_mask("2001:db8::1".parse().unwrap()),
            Err(NetworkError::NotIpv4(_))
        ));
    }

    #[test]
    fn test_mask_and_broadcast() {
        assert_eq!(ipv4_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(ipv4_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(ipv4_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(ipv4_mask(20), Ipv4Addr::new(255, 255, 240, 0));

        let broadcast = ipv4_broadcast(Ipv4Addr::new(192, 168, 1, 3), ipv4_mask(24));
        assert_eq!(broadcast, Ipv4Addr::new(192, 168, 1, 255));

        let host = ipv4_broadcast(Ipv4Addr::new(10, 0, 0, 7), ipv4_mask(32));
        assert_eq!(host, Ipv4Addr::new(10, 0, 0, 7));
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "02:42:AC:11:00:02".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0x42, 0xac, 0x11, 0x00, 0x02]);
        assert_eq!(mac.to_string(), "02:42:ac:11:00:02");

        assert!("02:42:ac:11:00".parse::<MacAddr>().is_err());
        assert!("02:42:ac:11:00:zz".parse::<MacAddr>().is_err());
        assert!("2:42:ac:11:00:02".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddr::random_unicast();
            assert!(mac.is_unicast());
            assert!(mac.is_locally_administered());
        }
    }

    #[test]
    fn test_random_device_names() {
        let tap = random_device_name(TAP_PREFIX).unwrap();
        let lan = random_device_name(LAN_PREFIX).unwrap();

        assert!(tap.starts_with("macvtap"));
        assert!(lan.starts_with("macvlan"));
        assert!(tap.len() < IFNAMSIZ);
        assert!(lan.len() < IFNAMSIZ);
    }

    #[test]
    fn test_device_name_validation() {
        assert!(validate_device_name("eth0").is_ok());
        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("averyveryverylongname").is_err());
        assert!(validate_device_name("a/b").is_err());
    }

    #[test]
    fn test_mtu_validation() {
        assert!(validate_mtu(68).is_ok());
        assert!(validate_mtu(1500).is_ok());
        assert!(validate_mtu(9000).is_ok());

        assert!(validate_mtu(67).is_err());
        assert!(validate_mtu(65536).is_err());
    }

    proptest! {
        #[test]
        fn prop_network_is_contained(raw in any::<u32>(), prefix in 0u8..=32) {
            let cidr = IpCidr::new(IpAddr::V4(Ipv4Addr::from(raw)), prefix).unwrap();
            prop_assert!(cidr.contains(cidr.network()));
            prop_assert!(cidr.contains(cidr.address()));
        }

        #[test]
        fn prop_broadcast_is_contained(raw in any::<u32>(), prefix in 0u8..=32) {
            let addr = Ipv4Addr::from(raw);
            let cidr = IpCidr::new(IpAddr::V4(addr), prefix).unwrap();
            let broadcast = ipv4_broadcast(addr, ipv4_mask(prefix));
            prop_assert!(cidr.contains(IpAddr::V4(broadcast)));
        }
    }
}
