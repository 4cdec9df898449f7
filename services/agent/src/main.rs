//! nethandoff - run a VM with this container's network identity.
//!
//! Startup order:
//! 1. Discover the default NIC, its gateways and the IPv4 gateway's MAC
//! 2. Move the NIC's MAC onto a macvtap device (abort on failure)
//! 3. Start the DHCP server and ARP responder on the side LAN
//! 4. Run the hypervisor until it exits or a signal arrives
//! 5. Stop both services, wait for them, then restore the NIC
//!
//! SIGINT and SIGTERM are caught before the NIC is touched, so a signal at
//! any point still ends in step 5.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use nethandoff_agent::arp::{ArpResponder, ArpResponderConfig};
use nethandoff_agent::config::{Config, DnsSettings};
use nethandoff_agent::dhcp::{DhcpServer, DhcpServerConfig};
use nethandoff_agent::hypervisor::{stop_on_signals, Launch};
use nethandoff_agent::logging;
use nethandoff_agent::network::{
    discover_default_nic, BridgeConfig, BridgeState, IpRoute2, NeighborResolver, Nic,
};
use nethandoff_networking::cloudinit::NetworkConfig;
use nethandoff_networking::MacAddr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type Service = (&'static str, JoinHandle<nethandoff_agent::Result<()>>);

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    if let Err(e) = logging::init(config.log_format) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "nethandoff starting");

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "nethandoff failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    let stop = stop_on_signals()?;
    let dns = config.dns_settings()?;
    let links = IpRoute2::default();

    let nic = discover_default_nic(&links).context("failed to discover default nic")?;
    let gateway_mac = match nic.gateways.v4 {
        Some(gateway) => match NeighborResolver::default()
            .resolve(&links, nic.index, gateway)
            .await
        {
            Ok(mac) => Some(mac),
            Err(e) => {
                warn!(%gateway, error = %e, "gateway mac unknown, arp responder disabled");
                None
            }
        },
        None => None,
    };

    if *stop.borrow() {
        info!("stopped before the host network was changed");
        return Ok(ExitCode::from(1));
    }

    let bridge = BridgeConfig::new(nic.name.clone())?.with_dev_dir(&config.dev_dir);
    let state = match bridge.setup(&links) {
        Ok(state) => state,
        Err(failure) => {
            error!(error = %failure.error, reason = failure.error.reason_code(), "bridge setup failed");
            if let Some(state) = failure.state {
                if let Err(e) = state.recover(&links) {
                    error!(error = %e, "recovery after failed setup also failed, host network left modified");
                }
            }
            return Err(failure.error).context("failed to set up bridge");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let launched = match start_services(&nic, gateway_mac, &dns, &state, shutdown_rx) {
        Ok(services) => {
            let launch = Launch {
                command: config.command.clone(),
                tap_path: state.tap_device_path().to_path_buf(),
                mac: state.original_mac(),
                mtu: state.mtu(),
                cloud_init: nic.gateways.v6.map(|gateway6| NetworkConfig {
                    mac: state.original_mac(),
                    addresses: nic.addresses.clone(),
                    gateway4: nic.gateways.v4,
                    gateway6: Some(gateway6),
                }),
            };
            let status = launch.run(stop).await;
            (status, services)
        }
        Err(e) => (Err(e), Vec::new()),
    };
    let (status, services) = launched;

    // Services must be gone before their devices are torn down.
    let _ = shutdown_tx.send(true);
    for (name, handle) in services {
        match handle.await {
            Ok(Ok(())) => info!(service = name, "service stopped"),
            Ok(Err(e)) => error!(service = name, error = %e, "service failed"),
            Err(e) => error!(service = name, error = %e, "service task panicked"),
        }
    }

    info!("restoring host network");
    if let Err(e) = state.recover(&links) {
        error!(error = %e, reason = e.reason_code(), "failed to restore host network");
        return Ok(ExitCode::from(1));
    }

    let Some(status) = status? else {
        info!("stopped before the hypervisor started");
        return Ok(ExitCode::from(1));
    };
    let code = status.code().and_then(|c| u8::try_from(c).ok()).unwrap_or(1);
    Ok(ExitCode::from(code))
}

/// Build and spawn the DHCP server and, when the gateway MAC is known, the
/// ARP responder. Nothing is spawned if either fails to build.
fn start_services(
    nic: &Nic,
    gateway_mac: Option<MacAddr>,
    dns: &DnsSettings,
    state: &BridgeState,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<Service>> {
    let (Some(address), Some(router)) = (nic.ipv4_route_address(), nic.gateways.v4) else {
        info!("no ipv4 address or gateway, dhcp server and arp responder not started");
        return Ok(Vec::new());
    };

    let dhcp = DhcpServer::new(DhcpServerConfig {
        client_mac: state.original_mac(),
        client_address: address,
        router,
        router_mac: gateway_mac,
        dns_servers: dns.nameservers.clone(),
        search_domains: dns.search_domains.clone(),
        hostname: hostname(),
    })
    .context("failed to create dhcp server")?;

    let arp = gateway_mac
        .map(|gateway_mac| {
            ArpResponder::new(ArpResponderConfig {
                device: state.lan_name().to_string(),
                vm_address: address,
                vm_mac: state.original_mac(),
                gateway_mac,
            })
        })
        .transpose()
        .context("failed to create arp responder")?;

    let mut services = Vec::new();

    let lan = state.lan_name().to_string();
    let rx = shutdown.clone();
    services.push((
        "dhcp",
        tokio::spawn(async move {
            let result = dhcp.run(&lan, rx).await;
            if let Err(e) = &result {
                error!(error = %e, "dhcp server stopped");
            }
            result
        }),
    ));

    if let Some(arp) = arp {
        services.push((
            "arp",
            tokio::spawn(async move {
                let result = arp.serve(shutdown).await;
                if let Err(e) = &result {
                    error!(error = %e, "arp responder stopped");
                }
                result
            }),
        ));
    }

    Ok(services)
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default()
}
