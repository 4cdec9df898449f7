//! nethandoff agent
//!
//! Lets a VM running inside a container take over the container's network
//! identity. From the outside, traffic to and from the VM looks exactly like
//! traffic to and from the container.
//!
//! ## Architecture
//!
//! - **Network**: finds the default NIC, moves its MAC onto a macvtap device
//!   for the VM and restores it afterwards
//! - **DHCP**: hands the NIC's original IPv4 address to the VM
//! - **ARP**: answers the VM's off-subnet ARP requests with the gateway MAC
//! - **Hypervisor**: launches the VM attached to the macvtap device

pub mod arp;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod hypervisor;
pub mod logging;
pub mod network;

pub use error::{NetError, Result};
