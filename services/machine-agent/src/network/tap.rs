//! TAP device creation and removal.
//!
//! Each machine gets one TAP device for its virtio-net interface. The host
//! end carries the link's gateway address; the guest configures the other
//! address of the /30 itself.

use std::net::Ipv4Addr;
use std::process::Command;

use kiln_id::MachineId;
use tracing::{debug, info};

use super::TapError;

/// Interface names are limited to 15 characters (IFNAMSIZ - 1).
const MAX_IFNAME_LEN: usize = 15;

/// TAP device configuration.
#[derive(Debug, Clone)]
pub struct TapConfig {
    pub name: String,
    /// Host side address of the link.
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u32,
}

impl TapConfig {
    pub fn new(machine_id: MachineId, gateway: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            name: tap_name(machine_id),
            gateway,
            prefix_len,
            mtu: 1500,
        }
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }
}

/// Device name for a machine: `kt-` plus the tail of its ULID, which is the
/// random part.
pub fn tap_name(machine_id: MachineId) -> String {
    let suffix = machine_id.suffix().to_ascii_lowercase();
    let keep = MAX_IFNAME_LEN - 3;
    let tail = &suffix[suffix.len().saturating_sub(keep)..];
    format!("kt-{tail}")
}

/// Create the device, set its MTU, assign the gateway and bring it up.
/// A partially configured device is removed again on failure.
pub fn create_tap(config: &TapConfig) -> Result<(), TapError> {
    let name = config.name.as_str();

    info!(
        tap = %name,
        gateway = %config.gateway,
        mtu = config.mtu,
        "Creating TAP device"
    );

    run_ip(&["tuntap", "add", "dev", name, "mode", "tap"]).map_err(TapError::CreateFailed)?;

    let configured = run_ip(&["link", "set", "dev", name, "mtu", &config.mtu.to_string()])
        .and_then(|()| {
            let cidr = format!("{}/{}", config.gateway, config.prefix_len);
            run_ip(&["addr", "add", &cidr, "dev", name])
        })
        .and_then(|()| run_ip(&["link", "set", "dev", name, "up"]));

    if let Err(e) = configured {
        let _ = run_ip(&["link", "delete", name]);
        return Err(TapError::ConfigFailed(e));
    }

    debug!(tap = %name, "TAP device created");
    Ok(())
}

/// Delete a device. Deleting one that does not exist succeeds.
pub fn delete_tap(name: &str) -> Result<(), TapError> {
    if !tap_exists(name) {
        debug!(tap = %name, "TAP device already gone");
        return Ok(());
    }

    info!(tap = %name, "Deleting TAP device");
    run_ip(&["link", "delete", name]).map_err(TapError::DeleteFailed)
}

pub fn tap_exists(name: &str) -> bool {
    std::path::Path::new("/sys/class/net").join(name).exists()
}

/// Run `ip` and turn a non-zero exit into its stderr.
fn run_ip(args: &[&str]) -> Result<(), String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute ip: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ip {} failed: {}", args.join(" "), stderr.trim()));
    }

    Ok(())
}
