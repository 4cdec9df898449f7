//! cloud-init NoCloud documents for the guest.
//!
//! The DHCP server only covers IPv4. When the container also has IPv6
//! connectivity the guest is told about it through a netplan v2
//! `network-config` document on a seed disk.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use crate::{IpCidr, MacAddr, NetworkError};

/// Interface key used in the rendered document. The guest matches by MAC,
/// so the key only has to be stable.
pub const INTERFACE_ID: &str = "net0";

/// Volume label cloud-init looks for on NoCloud seed disks.
pub const SEED_VOLUME_LABEL: &str = "cidata";

/// Contents of the `user-data` file on the seed disk.
pub const USER_DATA: &str = "#cloud-config\n";

/// Contents of the `meta-data` file on the seed disk.
pub const META_DATA: &str = "#cloud-config\ninstance-id: someid/somehost\n";

/// Network identity to describe to the guest.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// MAC address of the guest interface.
    pub mac: MacAddr,

    /// Addresses (with prefix) to assign to the interface.
    pub addresses: Vec<IpCidr>,

    /// IPv4 gateway, omitted from the document when absent.
    pub gateway4: Option<Ipv4Addr>,

    /// IPv6 gateway, omitted from the document when absent.
    pub gateway6: Option<Ipv6Addr>,
}

#[derive(Serialize)]
struct Document {
    version: u8,
    ethernets: BTreeMap<&'static str, Ethernet>,
}

#[derive(Serialize)]
struct Ethernet {
    #[serde(rename = "match")]
    matcher: Match,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway6: Option<String>,
}

#[derive(Serialize)]
struct Match {
    macaddress: String,
}

impl NetworkConfig {
    /// Render the `network-config` file, `#cloud-config` header included.
    pub fn render(&self) -> Result<String, NetworkError> {
        let ethernet = Ethernet {
            matcher: Match {
                macaddress: self.mac.to_string(),
            },
            addresses: self.addresses.iter().map(IpCidr::to_string).collect(),
            gateway4: self.gateway4.map(|gw| gw.to_string()),
            gateway6: self.gateway6.map(|gw| gw.to_string()),
        };

        let document = Document {
            version: 2,
            ethernets: BTreeMap::from([(INTERFACE_ID, ethernet)]),
        };

        let body =
            serde_yaml::to_string(&document).map_err(|e| NetworkError::Render(e.to_string()))?;
        Ok(format!("#cloud-config\n{}", body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv6_only() -> NetworkConfig {
        NetworkConfig {
            mac: "02:42:ac:11:00:02".parse().unwrap(),
            addresses: vec!["2001:db8:1::242:ac11:2/64".parse().unwrap()],
            gateway4: None,
            gateway6: Some("2001:db8:1::1".parse().unwrap()),
        }
    }

    #[test]
    fn test_render_ipv6_only() {
        let rendered = ipv6_only().render().unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(!rendered.contains("gateway4"));

        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(doc["version"].as_u64(), Some(2));

        let eth = &doc["ethernets"][INTERFACE_ID];
        assert_eq!(eth["match"]["macaddress"].as_str(), Some("02:42:ac:11:00:02"));
        assert_eq!(eth["addresses"][0].as_str(), Some("2001:db8:1::242:ac11:2/64"));
        assert_eq!(eth["gateway6"].as_str(), Some("2001:db8:1::1"));
        assert!(eth.get("gateway4").is_none());

        let ethernets = doc["ethernets"].as_mapping().unwrap();
        assert_eq!(ethernets.len(), 1);
    }

    #[test]
    fn test_render_dual_stack() {
        let mut config = ipv6_only();
        config.addresses.insert(0, "172.17.0.2/16".parse().unwrap());
        config.gateway4 = Some(Ipv4Addr::new(172, 17, 0, 1));

        let rendered = config.render().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        let eth = &doc["ethernets"][INTERFACE_ID];

        assert_eq!(eth["addresses"].as_sequence().unwrap().len(), 2);
        assert_eq!(eth["addresses"][0].as_str(), Some("172.17.0.2/16"));
        assert_eq!(eth["gateway4"].as_str(), Some("172.17.0.1"));
        assert_eq!(eth["gateway6"].as_str(), Some("2001:db8:1::1"));
    }

    #[test]
    fn test_render_without_addresses_omits_key() {
        let config = NetworkConfig {
            mac: "02:00:00:00:00:01".parse().unwrap(),
            addresses: vec![],
            gateway4: None,
            gateway6: None,
        };

        let rendered = config.render().unwrap();
        assert!(!rendered.contains("addresses"));
        assert!(!rendered.contains("gateway"));
    }
}
