//! Hypervisor launcher.
//!
//! Opens the macvtap character device, lets the hypervisor inherit it and
//! describes it on the command line as a virtio-net backend carrying the
//! NIC's original MAC and MTU. IPv6 settings, which DHCP cannot carry, go
//! to the guest on a cloud-init seed disk.
//!
//! SIGINT and SIGTERM are turned into a stop request so that the caller
//! always gets to restore the host network.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use anyhow::{bail, Context, Result};
use nethandoff_networking::cloudinit::{NetworkConfig, META_DATA, SEED_VOLUME_LABEL, USER_DATA};
use nethandoff_networking::{validate_mtu, MacAddr};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

/// Seed disk file names, in the order they are packed.
pub const SEED_FILES: [&str; 3] = ["network-config", "meta-data", "user-data"];

pub const SEED_ISO: &str = "seed.iso";

/// Everything needed to start the hypervisor.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Hypervisor program and its arguments.
    pub command: Vec<String>,
    /// macvtap character device.
    pub tap_path: PathBuf,
    /// Guest MAC: the NIC's original one.
    pub mac: MacAddr,
    pub mtu: u32,
    /// Guest network descriptor, written to a seed disk when set.
    pub cloud_init: Option<NetworkConfig>,
}

/// `-netdev`/`-device` arguments attaching the tap fd to a virtio-net NIC.
pub fn network_args(fd: RawFd, mac: MacAddr, mtu: u32) -> Vec<String> {
    vec![
        "-netdev".to_string(),
        format!("tap,id=net0,vhost=on,fd={}", fd),
        "-device".to_string(),
        format!("virtio-net-pci,netdev=net0,mac={},host_mtu={}", mac, mtu),
    ]
}

/// `-drive` arguments attaching a seed ISO.
pub fn seed_drive_args(iso: &Path) -> Vec<String> {
    vec![
        "-drive".to_string(),
        format!("driver=raw,file={},if=virtio", iso.display()),
    ]
}

/// Write the NoCloud seed files into `dir`.
pub fn write_seed_dir(dir: &Path, network: &NetworkConfig) -> Result<()> {
    let network_config = network
        .render()
        .context("failed to render cloud-init network config")?;

    for (name, content) in SEED_FILES
        .iter()
        .zip([network_config.as_str(), META_DATA, USER_DATA])
    {
        let path = dir.join(name);
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Pack the seed files in `dir` into an ISO with `genisoimage`.
pub async fn build_seed_iso(dir: &Path) -> Result<PathBuf> {
    let output = Command::new("genisoimage")
        .current_dir(dir)
        .args(["-output", SEED_ISO, "-volid", SEED_VOLUME_LABEL, "-joliet", "-rock"])
        .args(SEED_FILES)
        .output()
        .await
        .context("failed to run genisoimage")?;

    if !output.status.success() {
        bail!(
            "genisoimage failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(dir.join(SEED_ISO))
}

/// Let a child process inherit `file`.
fn clear_cloexec(file: &File) -> Result<()> {
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
        .context("failed to clear FD_CLOEXEC on tap device")?;
    Ok(())
}

/// Watch for SIGINT and SIGTERM from now on.
///
/// The returned receiver flips to `true` on the first of either. Once this
/// is called neither signal terminates the process any more, so link state
/// can always be restored.
pub fn stop_on_signals() -> Result<watch::Receiver<bool>> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "stop requested");
        let _ = tx.send(true);
    });

    Ok(rx)
}

impl Launch {
    /// Run the hypervisor to completion.
    ///
    /// Returns `None` when `stop` flipped before the hypervisor was started.
    /// Once it runs, a stop kills it and its exit status is returned.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<Option<ExitStatus>> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("hypervisor command is empty");
        };
        validate_mtu(self.mtu)?;

        let tap = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.tap_path)
            .with_context(|| format!("failed to open tap device {}", self.tap_path.display()))?;
        clear_cloexec(&tap)?;

        let mut argv: Vec<String> = args.to_vec();
        argv.extend(network_args(tap.as_raw_fd(), self.mac, self.mtu));

        // Kept alive until the hypervisor exits.
        let _seed_dir: Option<TempDir> = match &self.cloud_init {
            Some(network) => {
                info!("using cloud-init to configure guest ipv6");
                let dir = tempfile::Builder::new()
                    .prefix("cloud-init-")
                    .tempdir()
                    .context("failed to create seed directory")?;
                write_seed_dir(dir.path(), network)?;
                let iso = build_seed_iso(dir.path()).await?;
                argv.extend(seed_drive_args(&iso));
                Some(dir)
            }
            None => None,
        };

        if *stop.borrow() {
            info!("stop requested, hypervisor not started");
            return Ok(None);
        }

        info!(program = %program, args = %argv.join(" "), "starting hypervisor");
        let mut child = Command::new(program)
            .args(&argv)
            .spawn()
            .with_context(|| format!("failed to start {}", program))?;
        drop(tap);

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = stop.changed() => {
                info!("killing hypervisor");
                kill_and_wait(&mut child).await?
            }
        };

        info!(code = ?status.code(), "hypervisor exited");
        Ok(Some(status))
    }
}

async fn kill_and_wait(child: &mut tokio::process::Child) -> Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill hypervisor");
    }
    Ok(child.wait().await?)
}
