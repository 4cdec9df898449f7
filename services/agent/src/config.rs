//! Command line and environment configuration.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use nethandoff_networking::resolv::{usable_nameservers, ResolvConf};
use tracing::debug;

use crate::network::DEFAULT_DEV_DIR;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Run a VM that takes over this container's network identity.
#[derive(Debug, Clone, Parser)]
#[command(name = "nethandoff")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Pass the host's resolv.conf nameservers and search domains to the VM.
    #[arg(
        long,
        env = "NETHANDOFF_INHERIT_RESOLV",
        default_value_t = true,
        action = ArgAction::Set,
        value_name = "BOOL"
    )]
    pub inherit_resolv: bool,

    /// Extra nameserver for the VM. May be repeated.
    #[arg(
        long = "nameserver",
        env = "NETHANDOFF_NAMESERVERS",
        value_delimiter = ',',
        value_name = "IP"
    )]
    pub nameservers: Vec<String>,

    /// resolv.conf to inherit from.
    #[arg(long, env = "NETHANDOFF_RESOLV_CONF", default_value = "/etc/resolv.conf")]
    pub resolv_conf: PathBuf,

    /// Directory for the tap character device.
    #[arg(long, env = "NETHANDOFF_DEV_DIR", default_value = DEFAULT_DEV_DIR)]
    pub dev_dir: PathBuf,

    /// Log output format.
    #[arg(long, env = "NETHANDOFF_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Hypervisor command line (after `--`).
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Nameservers and search domains handed to the VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsSettings {
    pub nameservers: Vec<String>,
    pub search_domains: Vec<String>,
}

impl Config {
    /// Collect DNS settings: inherited resolv.conf entries first, then the
    /// extra nameservers. Loopback and unparseable nameservers are dropped,
    /// since a resolver on the container's loopback is unreachable from the VM.
    pub fn dns_settings(&self) -> anyhow::Result<DnsSettings> {
        let mut resolv = ResolvConf::default();
        if self.inherit_resolv {
            let content = std::fs::read_to_string(&self.resolv_conf)
                .with_context(|| format!("failed to read {}", self.resolv_conf.display()))?;
            resolv = ResolvConf::parse(&content);
        }

        let mut candidates = resolv.nameservers;
        candidates.extend(self.nameservers.iter().cloned());
        let nameservers: Vec<String> = usable_nameservers(&candidates)
            .into_iter()
            .map(|ip| ip.to_string())
            .collect();
        debug!(?nameservers, search = ?resolv.search, "dns settings");

        Ok(DnsSettings {
            nameservers,
            search_domains: resolv.search,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["nethandoff", "--", "qemu-system-x86_64", "-m", "1G"]);
        assert!(config.inherit_resolv);
        assert!(config.nameservers.is_empty());
        assert_eq!(config.dev_dir, PathBuf::from("/dev"));
        assert_eq!(config.resolv_conf, PathBuf::from("/etc/resolv.conf"));
        assert_eq!(config.command, vec!["qemu-system-x86_64", "-m", "1G"]);
    }

    #[test]
    fn test_flags() {
        let config = parse(&[
            "nethandoff",
            "--inherit-resolv",
            "false",
            "--nameserver",
            "8.8.8.8",
            "--nameserver",
            "1.1.1.1",
            "--log-format",
            "compact",
            "--",
            "qemu",
        ]);
        assert!(!config.inherit_resolv);
        assert_eq!(config.nameservers, vec!["8.8.8.8", "1.1.1.1"]);
        assert_eq!(config.log_format, LogFormat::Compact);
    }

    #[test]
    fn test_command_required() {
        assert!(Config::try_parse_from(["nethandoff"]).is_err());
    }

    #[test]
    fn test_dns_settings_inherited() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 127.0.0.11").unwrap();
        writeln!(file, "nameserver 10.0.0.2").unwrap();
        writeln!(file, "search svc.cluster.local cluster.local").unwrap();

        let mut config = parse(&["nethandoff", "--nameserver", "8.8.8.8", "--", "qemu"]);
        config.resolv_conf = file.path().to_path_buf();

        let dns = config.dns_settings().unwrap();
        assert_eq!(dns.nameservers, vec!["10.0.0.2", "8.8.8.8"]);
        assert_eq!(dns.search_domains, vec!["svc.cluster.local", "cluster.local"]);
    }

    #[test]
    fn test_dns_settings_not_inherited() {
        let mut config = parse(&[
            "nethandoff",
            "--inherit-resolv",
            "false",
            "--nameserver",
            "not-an-ip",
            "--nameserver",
            "9.9.9.9",
            "--",
            "qemu",
        ]);
        config.resolv_conf = PathBuf::from("/nonexistent/resolv.conf");

        let dns = config.dns_settings().unwrap();
        assert_eq!(dns.nameservers, vec!["9.9.9.9"]);
        assert!(dns.search_domains.is_empty());
    }

    #[test]
    fn test_dns_settings_missing_file() {
        let mut config = parse(&["nethandoff", "--", "qemu"]);
        config.resolv_conf = PathBuf::from("/nonexistent/resolv.conf");
        assert!(config.dns_settings().is_err());
    }
}
