//! Default NIC discovery and gateway hardware address resolution.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use nethandoff_networking::{IpCidr, MacAddr};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes};
use pnet::packet::Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info};

use super::{Family, LinkOps};
use crate::error::{NetError, Result};

/// Default gateways of the host, looked up per family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gateways {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

impl Gateways {
    /// The gateway used to pick the default NIC: IPv4 first.
    pub fn primary(&self) -> Option<IpAddr> {
        self.v4
            .map(IpAddr::V4)
            .or_else(|| self.v6.map(IpAddr::V6))
    }
}

/// The host's default outbound NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nic {
    /// Interface name.
    pub name: String,
    /// Interface index.
    pub index: u32,
    /// All addresses on the NIC, in kernel order.
    pub addresses: Vec<IpCidr>,
    /// The address the kernel uses to reach the default gateway.
    pub route_address: IpCidr,
    /// Hardware address.
    pub mac: MacAddr,
    /// MTU.
    pub mtu: u32,
    /// Default gateways.
    pub gateways: Gateways,
}

impl Nic {
    /// The IPv4 address facing the gateway, if the default route is IPv4.
    pub fn ipv4_route_address(&self) -> Option<IpCidr> {
        self.route_address.is_ipv4().then_some(self.route_address)
    }
}

/// Look up the IPv4 and IPv6 default gateways independently.
///
/// A missing gateway is not an error.
pub fn default_gateways(links: &dyn LinkOps) -> Result<Gateways> {
    let v4 = match links.default_gateway(Family::V4)? {
        Some(IpAddr::V4(gw)) => Some(gw),
        _ => None,
    };
    let v6 = match links.default_gateway(Family::V6)? {
        Some(IpAddr::V6(gw)) => Some(gw),
        _ => None,
    };
    Ok(Gateways { v4, v6 })
}

/// Find the interface carrying the default route.
///
/// Asks the kernel which local address it would use towards the default
/// gateway, then returns the interface holding that address. Read-only.
pub fn discover_default_nic(links: &dyn LinkOps) -> Result<Nic> {
    let gateways = default_gateways(links)?;
    let gateway = gateways
        .primary()
        .ok_or_else(|| NetError::NotFound("default gateway".to_string()))?;

    let local = links.route_source(gateway)?;
    debug!(%gateway, %local, "default route source address");

    for link in links.links()? {
        let addresses = links.addresses(&link.name)?;
        let Some(route_address) = addresses.iter().find(|a| a.address() == local).copied() else {
            continue;
        };

        info!(
            nic = %link.name,
            index = link.index,
            mac = %link.mac,
            mtu = link.mtu,
            address = %route_address,
            gateway4 = ?gateways.v4,
            gateway6 = ?gateways.v6,
            "default NIC discovered"
        );

        return Ok(Nic {
            name: link.name,
            index: link.index,
            addresses,
            route_address,
            mac: link.mac,
            mtu: link.mtu,
            gateways,
        });
    }

    Err(NetError::NotFound(format!("interface with address {}", local)))
}

/// Resolves a neighbor's hardware address from the kernel neighbor table.
///
/// There is no synchronous "resolve now" primitive, so a single ICMP echo
/// is sent first to make the kernel populate the table, which is then
/// polled until `timeout`. Best-effort: callers should treat `NotFound` as
/// "unknown" and carry on without the MAC.
#[derive(Debug, Clone)]
pub struct NeighborResolver {
    /// How long to keep polling after the probe.
    pub timeout: Duration,
    /// Delay between neighbor table reads.
    pub poll_interval: Duration,
    /// Whether to send the ICMP probe.
    pub probe: bool,
}

impl Default for NeighborResolver {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            probe: true,
        }
    }
}

impl NeighborResolver {
    /// Resolve `target` on the link with index `index`.
    pub async fn resolve(
        &self,
        links: &dyn LinkOps,
        index: u32,
        target: Ipv4Addr,
    ) -> Result<MacAddr> {
        if self.probe {
            if let Err(e) = send_echo_probe(target) {
                debug!(%target, error = %e, "echo probe failed, reading neighbor table anyway");
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let found = links
                .neighbors(index, Family::V4)?
                .into_iter()
                .find(|n| n.ip == IpAddr::V4(target) && !n.mac.is_zero());
            if let Some(neighbor) = found {
                debug!(%target, mac = %neighbor.mac, "neighbor resolved");
                return Ok(neighbor.mac);
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(NetError::NotFound(format!(
            "hardware address of {} on link {}",
            target, index
        )))
    }
}

/// Send one ICMP echo request to `target` without waiting for the reply.
fn send_echo_probe(target: Ipv4Addr) -> std::io::Result<()> {
    let mut buf = [0u8; 16];
    {
        let Some(mut echo) = MutableEchoRequestPacket::new(&mut buf) else {
            return Ok(());
        };
        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_identifier(std::process::id() as u16);
        echo.set_sequence_number(1);
        if let Some(packet) = IcmpPacket::new(echo.packet()) {
            let checksum = icmp::checksum(&packet);
            echo.set_checksum(checksum);
        }
    }

    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    let dest = SockAddr::from(SocketAddr::new(IpAddr::V4(target), 0));
    socket.send_to(&buf, &dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MockLinks;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn container() -> MockLinks {
        MockLinks::new()
            .with_link("lo", MacAddr::default(), 65536, &["127.0.0.1/8".parse().unwrap()])
            .with_link(
                "eth0",
                mac("02:42:ac:11:00:02"),
                1500,
                &[
                    "172.17.0.2/16".parse().unwrap(),
                    "fe80::42:acff:fe11:2/64".parse().unwrap(),
                ],
            )
            .with_default_route("eth0", "172.17.0.1".parse().unwrap())
    }

    fn resolver() -> NeighborResolver {
        NeighborResolver {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
            probe: false,
        }
    }

    #[test]
    fn test_discover_default_nic() {
        let links = container();
        let nic = discover_default_nic(&links).unwrap();

        assert_eq!(nic.name, "eth0");
        assert_eq!(nic.mac, mac("02:42:ac:11:00:02"));
        assert_eq!(nic.mtu, 1500);
        assert_eq!(nic.addresses.len(), 2);
        assert_eq!(nic.route_address, "172.17.0.2/16".parse().unwrap());
        assert_eq!(nic.gateways.v4, Some(Ipv4Addr::new(172, 17, 0, 1)));
        assert_eq!(nic.gateways.v6, None);
        assert!(nic.ipv4_route_address().is_some());
    }

    #[test]
    fn test_discover_ipv6_only() {
        let links = MockLinks::new()
            .with_link(
                "eth0",
                mac("02:42:ac:11:00:02"),
                1500,
                &["2001:db8:1::242:ac11:2/64".parse().unwrap()],
            )
            .with_default_route("eth0", "2001:db8:1::1".parse().unwrap());

        let nic = discover_default_nic(&links).unwrap();
        assert_eq!(nic.gateways.v4, None);
        assert_eq!(nic.gateways.v6, Some("2001:db8:1::1".parse().unwrap()));
        assert!(nic.ipv4_route_address().is_none());
    }

    #[test]
    fn test_discover_without_gateway() {
        let links = MockLinks::new().with_link(
            "eth0",
            mac("02:42:ac:11:00:02"),
            1500,
            &["172.17.0.2/16".parse().unwrap()],
        );

        let err = discover_default_nic(&links).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_default_gateways_both_families() {
        let links = container().with_default_route("eth0", "fe80::1".parse().unwrap());
        let gateways = default_gateways(&links).unwrap();
        assert_eq!(gateways.v4, Some(Ipv4Addr::new(172, 17, 0, 1)));
        assert_eq!(gateways.v6, Some("fe80::1".parse().unwrap()));
        assert_eq!(gateways.primary(), Some("172.17.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_resolve_gateway_mac() {
        let links = container().with_neighbor(
            "eth0",
            "172.17.0.1".parse().unwrap(),
            mac("02:42:8e:2f:6c:1a"),
        );
        let index = links.link("eth0").unwrap().index;

        let resolved = resolver()
            .resolve(&links, index, Ipv4Addr::new(172, 17, 0, 1))
            .await
            .unwrap();
        assert_eq!(resolved, mac("02:42:8e:2f:6c:1a"));
    }

    #[tokio::test]
    async fn test_resolve_missing_neighbor_is_not_found() {
        let links = container().with_neighbor(
            "eth0",
            "172.17.0.9".parse().unwrap(),
            mac("02:42:ac:11:00:09"),
        );
        let index = links.link("eth0").unwrap().index;

        let err = resolver()
            .resolve(&links, index, Ipv4Addr::new(172, 17, 0, 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
