//! Single-client DHCPv4 server.
//!
//! Hands exactly one fixed, never-expiring lease to one hardware address
//! and ignores everything else on the segment. The server pretends to be
//! the router: server identifier and router options carry the gateway.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable, Name};
use nethandoff_networking::{ipv4_broadcast, ipv4_mask, IpCidr, MacAddr, NetworkError};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Lease time in seconds. The maximum value means "infinite".
pub const LEASE_TIME_INFINITE: u32 = u32::MAX;

/// Receive buffer: the largest UDP payload, whatever the link MTU.
const RECV_BUFFER_SIZE: usize = u16::MAX as usize;

/// What the single client gets.
#[derive(Debug, Clone)]
pub struct DhcpServerConfig {
    /// The only hardware address that is answered.
    pub client_mac: MacAddr,
    /// Address handed out; the prefix gives the subnet mask.
    pub client_address: IpCidr,
    /// Default gateway, also used as server identifier.
    pub router: Ipv4Addr,
    /// Gateway hardware address. Not sent on the wire.
    pub router_mac: Option<MacAddr>,
    /// DNS servers as found in resolv.conf.
    pub dns_servers: Vec<String>,
    pub search_domains: Vec<String>,
    pub hostname: String,
}

/// Message type of an incoming client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    Discover,
    Request,
    Other(MessageType),
    /// No message type option at all.
    Missing,
}

impl ClientMessage {
    pub fn of(msg: &Message) -> Self {
        match msg.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(MessageType::Discover)) => ClientMessage::Discover,
            Some(DhcpOption::MessageType(MessageType::Request)) => ClientMessage::Request,
            Some(DhcpOption::MessageType(other)) => ClientMessage::Other(*other),
            _ => ClientMessage::Missing,
        }
    }
}

/// The DHCP server. Immutable once built.
#[derive(Debug, Clone)]
pub struct DhcpServer {
    client_mac: MacAddr,
    client_ip: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    broadcast: Ipv4Addr,
    router: Ipv4Addr,
    router_mac: Option<MacAddr>,
    dns_servers: Vec<Ipv4Addr>,
    search_domains: Vec<Name>,
    hostname: String,
}

impl DhcpServer {
    /// Derive the lease from `config`. Fails for a non-IPv4 client address.
    pub fn new(config: DhcpServerConfig) -> Result<Self> {
        let client_ip = match config.client_address.address() {
            IpAddr::V4(ip) => ip,
            other => return Err(NetworkError::NotIpv4(other).into()),
        };
        let subnet_mask = ipv4_mask(config.client_address.prefix_len());
        let broadcast = ipv4_broadcast(client_ip, subnet_mask);

        let dns_servers = config
            .dns_servers
            .iter()
            .filter_map(|s| match s.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => Some(ip),
                _ => {
                    debug!(nameserver = %s, "nameserver not usable over DHCPv4, skipped");
                    None
                }
            })
            .collect();

        Ok(Self {
            client_mac: config.client_mac,
            client_ip,
            subnet_mask,
            broadcast,
            router: config.router,
            router_mac: config.router_mac,
            dns_servers,
            search_domains: parse_search_domains(&config.search_domains),
            hostname: config.hostname,
        })
    }

    pub fn client_ip(&self) -> Ipv4Addr {
        self.client_ip
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.subnet_mask
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.broadcast
    }

    /// Reply to one client message, if it deserves one.
    pub fn handle(&self, msg: &Message) -> Option<Message> {
        if msg.chaddr().get(..6) != Some(&self.client_mac.octets()[..]) {
            debug!(
                xid = msg.xid(),
                chaddr = ?msg.chaddr(),
                expected = %self.client_mac,
                "ignoring dhcp message from unexpected client"
            );
            return None;
        }

        let reply_type = match ClientMessage::of(msg) {
            ClientMessage::Discover => MessageType::Offer,
            ClientMessage::Request => MessageType::Ack,
            other => {
                debug!(xid = msg.xid(), message = ?other, "ignoring dhcp message");
                return None;
            }
        };

        debug!(xid = msg.xid(), reply = ?reply_type, client = %self.client_ip, "answering dhcp client");
        Some(self.compose_reply(msg, reply_type))
    }

    /// Build an OFFER or ACK for `msg`.
    pub fn compose_reply(&self, msg: &Message, reply_type: MessageType) -> Message {
        let mut reply = Message::default();
        reply.set_opcode(Opcode::BootReply);
        reply.set_xid(msg.xid());
        reply.set_flags(msg.flags());
        reply.set_giaddr(msg.giaddr());
        reply.set_chaddr(msg.chaddr());
        reply.set_ciaddr(msg.ciaddr());
        reply.set_yiaddr(self.client_ip);
        reply.set_siaddr(self.router);

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(reply_type));
        opts.insert(DhcpOption::ServerIdentifier(self.router));
        opts.insert(DhcpOption::AddressLeaseTime(LEASE_TIME_INFINITE));
        opts.insert(DhcpOption::BroadcastAddr(self.broadcast));
        opts.insert(DhcpOption::Router(vec![self.router]));
        opts.insert(DhcpOption::SubnetMask(self.subnet_mask));
        opts.insert(DhcpOption::Hostname(self.hostname.clone()));

        // Some clients reject these options when empty.
        if !self.dns_servers.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(self.dns_servers.clone()));
        }
        if !self.search_domains.is_empty() {
            opts.insert(DhcpOption::DomainSearch(self.search_domains.clone()));
        }

        reply
    }

    /// Serve on `device` until `shutdown` flips.
    ///
    /// Bind failures and receive errors end the loop with an error. A reply
    /// that cannot be sent is logged and skipped.
    pub async fn run(&self, device: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = bind_socket(device)?;
        info!(
            device,
            client_mac = %self.client_mac,
            client_ip = %self.client_ip,
            subnet_mask = %self.subnet_mask,
            broadcast = %self.broadcast,
            router = %self.router,
            router_mac = ?self.router_mac.map(|m| m.to_string()),
            hostname = %self.hostname,
            dns_servers = ?self.dns_servers,
            "dhcp server listening"
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    self.handle_datagram(&socket, &buf[..len], peer).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(device, "dhcp server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, socket: &UdpSocket, datagram: &[u8], peer: SocketAddr) {
        let msg = match Message::from_bytes(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%peer, error = %e, "undecodable dhcp datagram");
                return;
            }
        };
        if msg.opcode() != Opcode::BootRequest {
            return;
        }

        let Some(reply) = self.handle(&msg) else {
            return;
        };
        let bytes = match reply.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(xid = msg.xid(), error = %e, "failed to encode dhcp reply");
                return;
            }
        };

        let dest = reply_destination(&msg, peer);
        if let Err(e) = socket.send_to(&bytes, dest).await {
            warn!(%dest, xid = msg.xid(), error = %e, "failed to send dhcp reply");
        }
    }
}

/// Where a reply to `msg` received from `peer` goes.
///
/// A client without an address, or one asking for broadcast, is answered on
/// the limited broadcast address.
pub fn reply_destination(msg: &Message, peer: SocketAddr) -> SocketAddr {
    if peer.ip().is_unspecified() || msg.flags().broadcast() {
        SocketAddr::from((Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT))
    } else {
        peer
    }
}

/// Parse search domains for option 119. Invalid names are skipped.
pub fn parse_search_domains<S: AsRef<str>>(domains: &[S]) -> Vec<Name> {
    domains
        .iter()
        .map(AsRef::as_ref)
        .filter(|d| !d.is_empty())
        .filter_map(|domain| match Name::from_str(domain) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(domain, error = %e, "invalid search domain skipped");
                None
            }
        })
        .collect()
}

fn bind_socket(device: &str) -> Result<UdpSocket> {
    let bind_err = |e: std::io::Error| NetError::link("dhcp bind", format!("{}: {}", device, e));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_broadcast(true).map_err(bind_err)?;
    socket.bind_device(Some(device.as_bytes())).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT));
    socket.bind(&addr.into()).map_err(bind_err)?;

    Ok(UdpSocket::from_std(socket.into())?)
}
