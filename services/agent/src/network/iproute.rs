//! iproute2-backed link operations.
//!
//! Every mutation is one `ip` invocation so that what happens on the host
//! can be replayed by hand from the logs. Queries use `ip -j` and parse the
//! JSON output.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::Command;

use nethandoff_networking::{IpCidr, MacAddr};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{parse_device_numbers, Family, Link, LinkOps, Neighbor};
use crate::error::{NetError, Result};

/// Link operations backed by the `ip` binary and sysfs.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    ip_path: PathBuf,
    sysfs_root: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            ip_path: PathBuf::from("ip"),
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different `ip` binary.
    pub fn with_ip_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ip_path = path.into();
        self
    }

    /// Read device numbers from a different sysfs mount.
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Run an `ip` command and return its stdout.
    fn run_ip(&self, args: &[&str]) -> Result<String> {
        debug!(command = %format!("ip {}", args.join(" ")), "running");

        let output = Command::new(&self.ip_path)
            .args(args)
            .output()
            .map_err(|source| NetError::Command {
                command: format!("ip {}", args.join(" ")),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
                return Err(NetError::NotFound(stderr.to_string()));
            }
            return Err(NetError::link(format!("ip {}", args.join(" ")), stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run an `ip -j` query and decode the JSON array it prints.
    fn query<T: DeserializeOwned>(&self, args: &[&str]) -> Result<Vec<T>> {
        let stdout = self.run_ip(args)?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&stdout).map_err(|e| NetError::Parse {
            command: format!("ip {}", args.join(" ")),
            detail: e.to_string(),
        })
    }
}

/// `ip addr add` arguments. IPv4 addresses get the kernel-computed
/// broadcast unless the prefix is /31 or /32, which have none.
fn addr_add_args(name: &str, addr: &IpCidr) -> Vec<String> {
    let mut args = vec!["addr".to_string(), "add".to_string(), addr.to_string()];
    if addr.is_ipv4() && addr.prefix_len() < 31 {
        args.extend(["brd".to_string(), "+".to_string()]);
    }
    args.extend(["dev".to_string(), name.to_string()]);
    args
}

#[derive(Debug, Deserialize)]
struct LinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
}

impl From<LinkJson> for Link {
    fn from(json: LinkJson) -> Self {
        // Point-to-point links report IP-style or no hardware addresses.
        let mac = json
            .address
            .as_deref()
            .and_then(|a| a.parse().ok())
            .unwrap_or_default();
        Link {
            index: json.ifindex,
            up: json.flags.iter().any(|f| f == "UP"),
            name: json.ifname,
            mac,
            mtu: json.mtu,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddrJson {
    #[serde(default)]
    addr_info: Vec<AddrInfoJson>,
}

#[derive(Debug, Deserialize)]
struct AddrInfoJson {
    local: IpAddr,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct RouteJson {
    #[serde(default)]
    gateway: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
struct NeighJson {
    dst: IpAddr,
    #[serde(default)]
    lladdr: Option<String>,
}

fn family_flag(family: Family) -> &'static str {
    match family {
        Family::V4 => "-4",
        Family::V6 => "-6",
    }
}

impl LinkOps for IpRoute2 {
    fn link(&self, name: &str) -> Result<Link> {
        self.query::<LinkJson>(&["-j", "link", "show", "dev", name])?
            .into_iter()
            .next()
            .map(Link::from)
            .ok_or_else(|| NetError::NotFound(format!("link {}", name)))
    }

    fn links(&self) -> Result<Vec<Link>> {
        Ok(self
            .query::<LinkJson>(&["-j", "link", "show"])?
            .into_iter()
            .map(Link::from)
            .collect())
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpCidr>> {
        let mut addresses = Vec::new();
        for entry in self.query::<AddrJson>(&["-j", "addr", "show", "dev", name])? {
            for info in entry.addr_info {
                addresses.push(IpCidr::new(info.local, info.prefixlen)?);
            }
        }
        Ok(addresses)
    }

    fn add_address(&self, name: &str, addr: &IpCidr) -> Result<()> {
        let args = addr_add_args(name, addr);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_ip(&args)?;
        Ok(())
    }

    fn del_address(&self, name: &str, addr: &IpCidr) -> Result<()> {
        self.run_ip(&["addr", "del", &addr.to_string(), "dev", name])?;
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.run_ip(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn set_down(&self, name: &str) -> Result<()> {
        self.run_ip(&["link", "set", "dev", name, "down"])?;
        Ok(())
    }

    fn set_mac(&self, name: &str, mac: MacAddr) -> Result<()> {
        self.run_ip(&["link", "set", "dev", name, "address", &mac.to_string()])?;
        Ok(())
    }

    fn add_macvtap(&self, parent: &str, name: &str, mtu: u32) -> Result<()> {
        self.run_ip(&[
            "link", "add", "link", parent, "name", name, "mtu", &mtu.to_string(), "type",
            "macvtap", "mode", "bridge",
        ])?;
        Ok(())
    }

    fn add_macvlan(&self, parent: &str, name: &str, mtu: u32) -> Result<()> {
        self.run_ip(&[
            "link", "add", "link", parent, "name", name, "mtu", &mtu.to_string(), "type",
            "macvlan", "mode", "bridge",
        ])?;
        Ok(())
    }

    fn del_link(&self, name: &str) -> Result<()> {
        self.run_ip(&["link", "del", "dev", name])?;
        Ok(())
    }

    fn default_gateway(&self, family: Family) -> Result<Option<IpAddr>> {
        let routes =
            self.query::<RouteJson>(&[family_flag(family), "-j", "route", "show", "default"])?;
        Ok(routes.into_iter().find_map(|r| r.gateway))
    }

    fn add_default_route(&self, dev: &str, gateway: IpAddr) -> Result<()> {
        let (flag, dst) = match gateway {
            IpAddr::V4(_) => ("-4", "default"),
            IpAddr::V6(_) => ("-6", "::/0"),
        };
        self.run_ip(&[flag, "route", "add", dst, "via", &gateway.to_string(), "dev", dev])?;
        Ok(())
    }

    fn route_source(&self, dest: IpAddr) -> Result<IpAddr> {
        // Connecting a UDP socket sends nothing but makes the kernel pick a
        // route and a source address.
        let bind: SocketAddr = match dest {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect((dest, 80))?;
        Ok(socket.local_addr()?.ip())
    }

    fn neighbors(&self, index: u32, family: Family) -> Result<Vec<Neighbor>> {
        let link = self
            .links()?
            .into_iter()
            .find(|l| l.index == index)
            .ok_or_else(|| NetError::NotFound(format!("link with index {}", index)))?;

        let entries = self.query::<NeighJson>(&[
            family_flag(family),
            "-j",
            "neigh",
            "show",
            "dev",
            &link.name,
        ])?;

        Ok(entries
            .into_iter()
            .filter_map(|n| {
                let mac = n.lladdr?.parse().ok()?;
                Some(Neighbor { ip: n.dst, mac })
            })
            .collect())
    }

    fn tap_device_numbers(&self, tap: &str) -> Result<(u32, u32)> {
        // Network devices never show up in /dev on their own; the macvtap
        // character device is only described under sysfs.
        let dir = self.sysfs_root.join("devices/virtual/net").join(tap);
        let entries = fs::read_dir(&dir).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NetError::NotFound(dir.display().to_string()),
            _ => NetError::Io(e),
        })?;

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with("tap") {
                let dev = entry.path().join("dev");
                if dev.is_file() {
                    candidates.push(dev);
                }
            }
        }

        let [dev] = candidates.as_slice() else {
            return Err(NetError::Parse {
                command: format!("read {}", dir.display()),
                detail: format!("expected one tap*/dev entry, found {:?}", candidates),
            });
        };

        let content = fs::read_to_string(dev)?;
        parse_device_numbers(&content).ok_or_else(|| NetError::Parse {
            command: format!("read {}", dev.display()),
            detail: format!("bad device numbers {:?}", content.trim()),
        })
    }

    fn make_char_device(&self, path: &Path, major: u32, minor: u32) -> Result<()> {
        mknod(
            path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o660),
            makedev(major.into(), minor.into()),
        )?;
        Ok(())
    }

    fn remove_device_node(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
