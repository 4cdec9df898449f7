//! ARP responder for the VM.
//!
//! Answers ARP requests sent by the VM for addresses outside its own subnet
//! with the gateway's hardware address. Requests from any other host, and
//! requests for on-subnet targets, are left alone.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;

use nethandoff_networking::{IpCidr, MacAddr, NetworkError};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr as PnetMac;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};

const ETHERNET_HEADER_SIZE: usize = 14;
const ARP_PACKET_SIZE: usize = 28;
const ARP_FRAME_SIZE: usize = ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE;

/// Responder parameters.
#[derive(Debug, Clone)]
pub struct ArpResponderConfig {
    /// Device to listen on.
    pub device: String,
    /// The VM's address; its prefix defines the VM subnet.
    pub vm_address: IpCidr,
    /// Only requests from this hardware address are answered.
    pub vm_mac: MacAddr,
    /// Hardware address claimed in replies.
    pub gateway_mac: MacAddr,
}

#[derive(Debug, Clone)]
pub struct ArpResponder {
    device: String,
    vm_ip: Ipv4Addr,
    subnet: IpCidr,
    vm_mac: MacAddr,
    gateway_mac: MacAddr,
}

impl ArpResponder {
    /// Fails if the VM address is not IPv4.
    pub fn new(config: ArpResponderConfig) -> Result<Self> {
        let vm_ip = match config.vm_address.address() {
            IpAddr::V4(ip) => ip,
            other => return Err(NetworkError::NotIpv4(other).into()),
        };
        Ok(Self {
            device: config.device,
            vm_ip,
            subnet: config.vm_address,
            vm_mac: config.vm_mac,
            gateway_mac: config.gateway_mac,
        })
    }

    /// Whether a request from the VM for `target` gets a reply.
    pub fn should_answer(&self, target: Ipv4Addr) -> bool {
        target != self.vm_ip && !self.subnet.contains(IpAddr::V4(target))
    }

    /// Reply frame for one received Ethernet frame, if any.
    pub fn handle_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let ethernet = EthernetPacket::new(frame)?;
        if ethernet.get_ethertype() != EtherTypes::Arp {
            return None;
        }
        let request = ArpPacket::new(ethernet.payload())?;

        if request.get_operation() != ArpOperations::Request {
            debug!(operation = ?request.get_operation(), "ignoring arp packet");
            return None;
        }

        let sender_mac = from_pnet(request.get_sender_hw_addr());
        if sender_mac != self.vm_mac {
            debug!(sender = %sender_mac, "ignoring arp request not from vm");
            return None;
        }

        let target = request.get_target_proto_addr();
        if !self.should_answer(target) {
            debug!(%target, subnet = %self.subnet, "ignoring arp request");
            return None;
        }

        debug!(%target, gateway_mac = %self.gateway_mac, "answering arp request");
        Some(build_reply(
            self.gateway_mac,
            target,
            sender_mac,
            request.get_sender_proto_addr(),
        ))
    }

    /// Serve until `shutdown` flips.
    ///
    /// Only a failure to open the listener is returned. Read and send errors
    /// on single packets are logged.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = open_listener(&self.device)?;
        let socket = AsyncFd::new(socket)?;
        info!(
            device = %self.device,
            vm_mac = %self.vm_mac,
            vm_ip = %self.vm_ip,
            subnet = %self.subnet.network(),
            prefix_len = self.subnet.prefix_len(),
            gateway_mac = %self.gateway_mac,
            "arp responder listening"
        );

        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                ready = socket.readable() => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!(error = %e, "arp socket not readable");
                            continue;
                        }
                    };
                    let read = match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf)) {
                        Ok(read) => read,
                        Err(_would_block) => continue,
                    };
                    let len = match read {
                        Ok(len) => len,
                        Err(e) => {
                            warn!(error = %e, "failed to read arp packet");
                            continue;
                        }
                    };

                    if let Some(reply) = self.handle_frame(&buf[..len]) {
                        if let Err(e) = socket.get_ref().send(&reply) {
                            warn!(error = %e, "failed to send arp reply");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(device = %self.device, "arp responder shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Ethernet frame carrying an ARP reply that binds `claimed_ip` to
/// `claimed_mac`, addressed to the requester.
fn build_reply(
    claimed_mac: MacAddr,
    claimed_ip: Ipv4Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ARP_FRAME_SIZE];

    if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer) {
        ethernet.set_destination(to_pnet(requester_mac));
        ethernet.set_source(to_pnet(claimed_mac));
        ethernet.set_ethertype(EtherTypes::Arp);
    }

    if let Some(mut arp) = MutableArpPacket::new(&mut buffer[ETHERNET_HEADER_SIZE..]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Reply);
        arp.set_sender_hw_addr(to_pnet(claimed_mac));
        arp.set_sender_proto_addr(claimed_ip);
        arp.set_target_hw_addr(to_pnet(requester_mac));
        arp.set_target_proto_addr(requester_ip);
    }

    buffer
}

/// Raw ARP socket bound to `device`.
fn open_listener(device: &str) -> Result<Socket> {
    let listen_err = |e: io::Error| NetError::link("arp listen", format!("{}: {}", device, e));

    let index = nix::net::if_::if_nametoindex(device)
        .map_err(|_| NetError::NotFound(format!("link {}", device)))?;

    let protocol = (libc::ETH_P_ARP as u16).to_be();
    let socket = Socket::new(
        Domain::PACKET,
        Type::RAW,
        Some(Protocol::from(i32::from(protocol))),
    )
    .map_err(listen_err)?;
    socket.set_nonblocking(true).map_err(listen_err)?;

    // SAFETY: sockaddr_ll is plain old data and fully initialised below.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = index as i32;

    // SAFETY: addr is a valid sockaddr_ll and the length matches it.
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(listen_err(io::Error::last_os_error()));
    }

    debug!(device, index, "arp socket bound");
    Ok(socket)
}

fn to_pnet(mac: MacAddr) -> PnetMac {
    let [a, b, c, d, e, f] = mac.octets();
    PnetMac::new(a, b, c, d, e, f)
}

fn from_pnet(mac: PnetMac) -> MacAddr {
    MacAddr::new([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VM_MAC: [u8; 6] = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];
    const GATEWAY_MAC: [u8; 6] = [0x02, 0x42, 0x8e, 0x2f, 0x6c, 0x1a];

    fn responder() -> ArpResponder {
        ArpResponder::new(ArpResponderConfig {
            device: "macvlan0a1b2c".to_string(),
            vm_address: "172.17.0.2/16".parse().unwrap(),
            vm_mac: MacAddr::new(VM_MAC),
            gateway_mac: MacAddr::new(GATEWAY_MAC),
        })
        .unwrap()
    }

    fn request_frame(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
        let mut frame = vec![0u8; ARP_FRAME_SIZE];
        {
            let mut ethernet = MutableEthernetPacket::new(&mut frame).unwrap();
            ethernet.set_destination(PnetMac::broadcast());
            ethernet.set_source(to_pnet(MacAddr::new(sender_mac)));
            ethernet.set_ethertype(EtherTypes::Arp);
        }
        {
            let mut arp = MutableArpPacket::new(&mut frame[ETHERNET_HEADER_SIZE..]).unwrap();
            arp.set_hardware_type(ArpHardwareTypes::Ethernet);
            arp.set_protocol_type(EtherTypes::Ipv4);
            arp.set_hw_addr_len(6);
            arp.set_proto_addr_len(4);
            arp.set_operation(ArpOperations::Request);
            arp.set_sender_hw_addr(to_pnet(MacAddr::new(sender_mac)));
            arp.set_sender_proto_addr(sender_ip);
            arp.set_target_hw_addr(PnetMac::zero());
            arp.set_target_proto_addr(target_ip);
        }
        frame
    }

    fn vm_request(target: Ipv4Addr) -> Vec<u8> {
        request_frame(VM_MAC, Ipv4Addr::new(172, 17, 0, 2), target)
    }

    #[test]
    fn test_rejects_ipv6() {
        let err = ArpResponder::new(ArpResponderConfig {
            device: "macvlan0a1b2c".to_string(),
            vm_address: "2001:db8:1::242:ac11:2/64".parse().unwrap(),
            vm_mac: MacAddr::new(VM_MAC),
            gateway_mac: MacAddr::new(GATEWAY_MAC),
        })
        .unwrap_err();
        assert!(matches!(err, NetError::Network(NetworkError::NotIpv4(_))));
    }

    #[test]
    fn test_out_of_subnet_target_gets_gateway_mac() {
        let target = Ipv4Addr::new(8, 8, 8, 8);
        let reply = responder().handle_frame(&vm_request(target)).unwrap();

        let ethernet = EthernetPacket::new(&reply).unwrap();
        assert_eq!(ethernet.get_ethertype(), EtherTypes::Arp);
        assert_eq!(from_pnet(ethernet.get_source()), MacAddr::new(GATEWAY_MAC));
        assert_eq!(from_pnet(ethernet.get_destination()), MacAddr::new(VM_MAC));

        let arp = ArpPacket::new(ethernet.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Reply);
        assert_eq!(from_pnet(arp.get_sender_hw_addr()), MacAddr::new(GATEWAY_MAC));
        assert_eq!(arp.get_sender_proto_addr(), target);
        assert_eq!(from_pnet(arp.get_target_hw_addr()), MacAddr::new(VM_MAC));
        assert_eq!(arp.get_target_proto_addr(), Ipv4Addr::new(172, 17, 0, 2));
    }

    #[test]
    fn test_in_subnet_target_ignored() {
        let responder = responder();
        // Gateway and peers on the same /16 answer for themselves.
        assert!(responder
            .handle_frame(&vm_request(Ipv4Addr::new(172, 17, 0, 1)))
            .is_none());
        assert!(responder
            .handle_frame(&vm_request(Ipv4Addr::new(172, 17, 255, 254)))
            .is_none());
        // Just outside.
        assert!(responder
            .handle_frame(&vm_request(Ipv4Addr::new(172, 18, 0, 1)))
            .is_some());
    }

    #[test]
    fn test_own_address_ignored() {
        assert!(responder()
            .handle_frame(&vm_request(Ipv4Addr::new(172, 17, 0, 2)))
            .is_none());
    }

    #[test]
    fn test_host_route_subnet() {
        let responder = ArpResponder::new(ArpResponderConfig {
            device: "macvlan0a1b2c".to_string(),
            vm_address: "10.0.0.5/32".parse().unwrap(),
            vm_mac: MacAddr::new(VM_MAC),
            gateway_mac: MacAddr::new(GATEWAY_MAC),
        })
        .unwrap();
        assert!(responder.should_answer(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!responder.should_answer(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn test_non_requests_ignored() {
        let responder = responder();
        let mut frame = vm_request(Ipv4Addr::new(8, 8, 8, 8));
        {
            let mut arp = MutableArpPacket::new(&mut frame[ETHERNET_HEADER_SIZE..]).unwrap();
            arp.set_operation(ArpOperations::Reply);
        }
        assert!(responder.handle_frame(&frame).is_none());

        let mut frame = vm_request(Ipv4Addr::new(8, 8, 8, 8));
        {
            let mut ethernet = MutableEthernetPacket::new(&mut frame).unwrap();
            ethernet.set_ethertype(EtherTypes::Ipv4);
        }
        assert!(responder.handle_frame(&frame).is_none());

        assert!(responder.handle_frame(&[0u8; 10]).is_none());
        assert!(responder
            .handle_frame(&vm_request(Ipv4Addr::new(8, 8, 8, 8))[..20])
            .is_none());
    }

    proptest! {
        #[test]
        fn prop_only_vm_requests_answered(
            sender in prop::array::uniform6(any::<u8>()),
            sender_ip in any::<u32>(),
            target in any::<u32>(),
        ) {
            prop_assume!(sender != VM_MAC);
            let frame = request_frame(sender, Ipv4Addr::from(sender_ip), Ipv4Addr::from(target));
            prop_assert!(responder().handle_frame(&frame).is_none());
        }

        #[test]
        fn prop_reply_claims_requested_target(target in any::<u32>()) {
            let target = Ipv4Addr::from(target);
            let responder = responder();
            match responder.handle_frame(&vm_request(target)) {
                Some(reply) => {
                    prop_assert!(responder.should_answer(target));
                    let ethernet = EthernetPacket::new(&reply).unwrap();
                    let arp = ArpPacket::new(ethernet.payload()).unwrap();
                    prop_assert_eq!(arp.get_sender_proto_addr(), target);
                    prop_assert_eq!(from_pnet(arp.get_sender_hw_addr()), MacAddr::new(GATEWAY_MAC));
                }
                None => prop_assert!(!responder.should_answer(target)),
            }
        }
    }
}
