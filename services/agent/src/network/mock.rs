//! In-memory link state for tests and dry runs.
//!
//! Models just enough kernel behaviour to exercise the bridge state
//! machine: unique link names, per-link addresses, default routes that
//! disappear when their link goes down or loses its last address of the
//! family, neighbor entries and device nodes.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nethandoff_networking::{IpCidr, MacAddr};
use tracing::debug;

use super::{Family, Link, LinkOps, Neighbor};
use crate::error::{NetError, Result};

/// Kind of a mock link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockLinkKind {
    Physical,
    Macvtap,
    Macvlan,
}

#[derive(Debug, Clone)]
struct MockLink {
    link: Link,
    kind: MockLinkKind,
    parent: Option<String>,
    addresses: Vec<IpCidr>,
}

#[derive(Debug, Default)]
struct MockState {
    links: BTreeMap<String, MockLink>,
    /// (device, gateway) pairs.
    routes: Vec<(String, IpAddr)>,
    neighbors: Vec<(u32, Neighbor)>,
    device_nodes: BTreeMap<PathBuf, (u32, u32)>,
    next_index: u32,
    next_minor: u32,
    fail_op: Option<String>,
}

/// In-memory `LinkOps` implementation.
#[derive(Debug)]
pub struct MockLinks {
    state: Mutex<MockState>,
}

impl Default for MockLinks {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLinks {
    /// Create an empty host (no links).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_index: 1,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a physical link that is up.
    pub fn with_link(self, name: &str, mac: MacAddr, mtu: u32, addresses: &[IpCidr]) -> Self {
        {
            let mut state = self.lock();
            let index = state.next_index;
            state.next_index += 1;
            state.links.insert(
                name.to_string(),
                MockLink {
                    link: Link {
                        index,
                        name: name.to_string(),
                        mac,
                        mtu,
                        up: true,
                    },
                    kind: MockLinkKind::Physical,
                    parent: None,
                    addresses: addresses.to_vec(),
                },
            );
        }
        self
    }

    /// Install a default route.
    pub fn with_default_route(self, dev: &str, gateway: IpAddr) -> Self {
        self.lock().routes.push((dev.to_string(), gateway));
        self
    }

    /// Add a neighbor table entry to a link.
    pub fn with_neighbor(self, dev: &str, ip: IpAddr, mac: MacAddr) -> Self {
        {
            let mut state = self.lock();
            if let Some(index) = state.links.get(dev).map(|l| l.link.index) {
                state.neighbors.push((index, Neighbor { ip, mac }));
            }
        }
        self
    }

    /// Make every call of the named `LinkOps` method fail from now on.
    pub fn fail_on(&self, op: &str) {
        self.lock().fail_op = Some(op.to_string());
    }

    /// Stop injecting failures.
    pub fn clear_failure(&self) {
        self.lock().fail_op = None;
    }

    /// Names of all links, sorted.
    pub fn link_names(&self) -> Vec<String> {
        self.lock().links.keys().cloned().collect()
    }

    /// Kind and parent of a link.
    pub fn link_kind(&self, name: &str) -> Option<(MockLinkKind, Option<String>)> {
        self.lock()
            .links
            .get(name)
            .map(|l| (l.kind, l.parent.clone()))
    }

    /// All installed default routes as (device, gateway).
    pub fn default_routes(&self) -> Vec<(String, IpAddr)> {
        self.lock().routes.clone()
    }

    /// Device nodes created with `make_char_device`.
    pub fn device_nodes(&self) -> BTreeMap<PathBuf, (u32, u32)> {
        self.lock().device_nodes.clone()
    }

    fn check(state: &MockState, op: &str) -> Result<()> {
        if state.fail_op.as_deref() == Some(op) {
            return Err(NetError::link(op, "injected failure"));
        }
        Ok(())
    }

    fn get<'a>(state: &'a mut MockState, name: &str) -> Result<&'a mut MockLink> {
        state
            .links
            .get_mut(name)
            .ok_or_else(|| NetError::NotFound(format!("link {}", name)))
    }

    fn add_child(
        &self,
        op: &str,
        parent: &str,
        name: &str,
        mtu: u32,
        kind: MockLinkKind,
    ) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, op)?;
        if !state.links.contains_key(parent) {
            return Err(NetError::NotFound(format!("link {}", parent)));
        }
        if state.links.contains_key(name) {
            return Err(NetError::link(op, format!("link {} already exists", name)));
        }

        let index = state.next_index;
        state.next_index += 1;
        let mac = MacAddr::random_unicast();
        state.links.insert(
            name.to_string(),
            MockLink {
                link: Link {
                    index,
                    name: name.to_string(),
                    mac,
                    mtu,
                    up: false,
                },
                kind,
                parent: Some(parent.to_string()),
                addresses: Vec::new(),
            },
        );
        debug!(link = name, parent, ?kind, "[MOCK] link added");
        Ok(())
    }
}

impl LinkOps for MockLinks {
    fn link(&self, name: &str) -> Result<Link> {
        let mut state = self.lock();
        Self::check(&state, "link")?;
        Ok(Self::get(&mut state, name)?.link.clone())
    }

    fn links(&self) -> Result<Vec<Link>> {
        let state = self.lock();
        Self::check(&state, "links")?;
        Ok(state.links.values().map(|l| l.link.clone()).collect())
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpCidr>> {
        let mut state = self.lock();
        Self::check(&state, "addresses")?;
        Ok(Self::get(&mut state, name)?.addresses.clone())
    }

    fn add_address(&self, name: &str, addr: &IpCidr) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "add_address")?;
        let link = Self::get(&mut state, name)?;
        if link.addresses.contains(addr) {
            return Err(NetError::link(
                "add_address",
                format!("{} already assigned", addr),
            ));
        }
        link.addresses.push(*addr);
        Ok(())
    }

    fn del_address(&self, name: &str, addr: &IpCidr) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "del_address")?;
        let link = Self::get(&mut state, name)?;
        let before = link.addresses.len();
        link.addresses.retain(|a| a != addr);
        if link.addresses.len() == before {
            return Err(NetError::NotFound(format!("address {} on {}", addr, name)));
        }

        // The kernel drops routes whose source family vanished from the link.
        let family = Family::of(addr.address());
        let family_left = link
            .addresses
            .iter()
            .any(|a| Family::of(a.address()) == family);
        if !family_left {
            state
                .routes
                .retain(|(dev, gw)| dev != name || Family::of(*gw) != family);
        }
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "set_up")?;
        Self::get(&mut state, name)?.link.up = true;
        Ok(())
    }

    fn set_down(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "set_down")?;
        Self::get(&mut state, name)?.link.up = false;
        state.routes.retain(|(dev, _)| dev != name);
        Ok(())
    }

    fn set_mac(&self, name: &str, mac: MacAddr) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "set_mac")?;
        Self::get(&mut state, name)?.link.mac = mac;
        Ok(())
    }

    fn add_macvtap(&self, parent: &str, name: &str, mtu: u32) -> Result<()> {
        self.add_child("add_macvtap", parent, name, mtu, MockLinkKind::Macvtap)
    }

    fn add_macvlan(&self, parent: &str, name: &str, mtu: u32) -> Result<()> {
        self.add_child("add_macvlan", parent, name, mtu, MockLinkKind::Macvlan)
    }

    fn del_link(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "del_link")?;
        let removed = state
            .links
            .remove(name)
            .ok_or_else(|| NetError::NotFound(format!("link {}", name)))?;
        state.routes.retain(|(dev, _)| dev != name);
        state.neighbors.retain(|(index, _)| *index != removed.link.index);
        Ok(())
    }

    fn default_gateway(&self, family: Family) -> Result<Option<IpAddr>> {
        let state = self.lock();
        Self::check(&state, "default_gateway")?;
        Ok(state
            .routes
            .iter()
            .map(|(_, gw)| *gw)
            .find(|gw| Family::of(*gw) == family))
    }

    fn add_default_route(&self, dev: &str, gateway: IpAddr) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "add_default_route")?;
        if !state.links.contains_key(dev) {
            return Err(NetError::NotFound(format!("link {}", dev)));
        }
        let family = Family::of(gateway);
        if state.routes.iter().any(|(_, gw)| Family::of(*gw) == family) {
            return Err(NetError::link("add_default_route", "File exists"));
        }
        state.routes.push((dev.to_string(), gateway));
        Ok(())
    }

    fn route_source(&self, dest: IpAddr) -> Result<IpAddr> {
        let state = self.lock();
        Self::check(&state, "route_source")?;
        let family = Family::of(dest);
        let dev = state
            .routes
            .iter()
            .find(|(_, gw)| Family::of(*gw) == family)
            .map(|(dev, _)| dev.clone())
            .ok_or_else(|| NetError::NotFound(format!("route to {}", dest)))?;

        state
            .links
            .get(&dev)
            .and_then(|l| {
                l.addresses
                    .iter()
                    .map(IpCidr::address)
                    .find(|a| Family::of(*a) == family)
            })
            .ok_or_else(|| NetError::NotFound(format!("source address on {}", dev)))
    }

    fn neighbors(&self, index: u32, family: Family) -> Result<Vec<Neighbor>> {
        let state = self.lock();
        Self::check(&state, "neighbors")?;
        if !state.links.values().any(|l| l.link.index == index) {
            return Err(NetError::NotFound(format!("link with index {}", index)));
        }
        Ok(state
            .neighbors
            .iter()
            .filter(|(i, n)| *i == index && Family::of(n.ip) == family)
            .map(|(_, n)| n.clone())
            .collect())
    }

    fn tap_device_numbers(&self, tap: &str) -> Result<(u32, u32)> {
        let mut state = self.lock();
        Self::check(&state, "tap_device_numbers")?;
        match state.links.get(tap) {
            Some(l) if l.kind == MockLinkKind::Macvtap => {}
            Some(_) => {
                return Err(NetError::link(
                    "tap_device_numbers",
                    format!("{} is not a macvtap", tap),
                ))
            }
            None => return Err(NetError::NotFound(format!("link {}", tap))),
        }
        state.next_minor += 1;
        Ok((241, state.next_minor))
    }

    fn make_char_device(&self, path: &Path, major: u32, minor: u32) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "make_char_device")?;
        if state.device_nodes.contains_key(path) {
            return Err(NetError::link(
                "make_char_device",
                format!("{} exists", path.display()),
            ));
        }
        state.device_nodes.insert(path.to_path_buf(), (major, minor));
        Ok(())
    }

    fn remove_device_node(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, "remove_device_node")?;
        state.device_nodes.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> MockLinks {
        MockLinks::new()
            .with_link(
                "eth0",
                "02:42:ac:11:00:02".parse().unwrap(),
                1500,
                &["172.17.0.2/16".parse().unwrap()],
            )
            .with_default_route("eth0", "172.17.0.1".parse().unwrap())
    }

    #[test]
    fn test_duplicate_link_names_rejected() {
        let links = host();
        links.add_macvlan("eth0", "macvlan1", 1500).unwrap();
        assert!(links.add_macvlan("eth0", "macvlan1", 1500).is_err());
        assert!(links.add_macvtap("eth9", "macvtap1", 1500).unwrap_err().is_not_found());
    }

    #[test]
    fn test_routes_follow_link_state() {
        let links = host();
        assert_eq!(
            links.default_gateway(Family::V4).unwrap(),
            Some("172.17.0.1".parse().unwrap())
        );

        links.set_down("eth0").unwrap();
        assert_eq!(links.default_gateway(Family::V4).unwrap(), None);
    }

    #[test]
    fn test_routes_dropped_with_last_address() {
        let links = host();
        links
            .del_address("eth0", &"172.17.0.2/16".parse().unwrap())
            .unwrap();
        assert!(links.default_routes().is_empty());
    }

    #[test]
    fn test_route_source() {
        let links = host();
        assert_eq!(
            links.route_source("172.17.0.1".parse().unwrap()).unwrap(),
            "172.17.0.2".parse::<IpAddr>().unwrap()
        );
        assert!(links
            .route_source("2001:db8::1".parse().unwrap())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_injected_failure() {
        let links = host();
        links.fail_on("set_mac");
        assert!(links.set_mac("eth0", MacAddr::random_unicast()).is_err());
        links.clear_failure();
        assert!(links.set_mac("eth0", MacAddr::random_unicast()).is_ok());
    }
}
