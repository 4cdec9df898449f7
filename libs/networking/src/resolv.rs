//! Minimal resolv.conf reader.
//!
//! Only `nameserver`, `search` and `domain` are of interest; they are handed
//! to the guest through DHCP.

use std::net::IpAddr;

/// Resolver settings read from resolv.conf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    /// Nameservers in file order, verbatim.
    pub nameservers: Vec<String>,

    /// Search domains.
    pub search: Vec<String>,
}

impl ResolvConf {
    /// Parse resolv.conf contents.
    ///
    /// As with the libc resolver, the last `search` or `domain` line wins.
    pub fn parse(content: &str) -> Self {
        let mut conf = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(server) = fields.next() {
                        conf.nameservers.push(server.to_string());
                    }
                }
                Some("search") => {
                    conf.search = fields.map(str::to_string).collect();
                }
                Some("domain") => {
                    conf.search = fields.next().map(str::to_string).into_iter().collect();
                }
                _ => {}
            }
        }

        conf
    }
}

/// Keep nameservers a guest can actually reach.
///
/// Unparseable entries and loopback resolvers (docker's embedded DNS at
/// 127.0.0.11, for instance) are dropped.
pub fn usable_nameservers<S: AsRef<str>>(servers: &[S]) -> Vec<IpAddr> {
    servers
        .iter()
        .filter_map(|s| s.as_ref().trim().parse::<IpAddr>().ok())
        .filter(|ip| !ip.is_loopback())
        .collect()
}
