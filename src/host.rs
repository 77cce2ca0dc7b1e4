//! Stable per-host identifier attached to every published flow.

use std::fs;
use std::path::Path;

use tracing::debug;
use uuid::Uuid;

/// Message header carrying the host identifier.
pub const HOST_ID_HEADER: &str = "host_id";

/// Where network interfaces are listed.
pub const SYSFS_NET: &str = "/sys/class/net";

const NULL_MAC: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub id: Uuid,
    /// The MAC address or hostname the id was derived from.
    pub derived_from: String,
}

impl HostIdentity {
    /// Identify this host from its first hardware address, or its hostname.
    pub fn detect() -> Self {
        Self::from_sources(Path::new(SYSFS_NET), &hostname())
    }

    pub fn from_sources(sysfs_net: &Path, hostname: &str) -> Self {
        let derived_from = primary_mac(sysfs_net).unwrap_or_else(|| hostname.to_string());
        Self {
            id: host_id_from(&derived_from),
            derived_from,
        }
    }
}

/// UUID v5 in the OID namespace.
pub fn host_id_from(seed: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
}

/// MAC address of the first non-loopback interface, by name order.
pub fn primary_mac(sysfs_net: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = fs::read_dir(sysfs_net)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    interfaces.sort();

    interfaces.into_iter().find_map(|iface| {
        if iface.file_name().is_some_and(|name| name == "lo") {
            return None;
        }
        let mac = fs::read_to_string(iface.join("address")).ok()?;
        let mac = mac.trim().to_ascii_lowercase();
        if mac.is_empty() || mac == NULL_MAC {
            return None;
        }
        debug!(interface = %iface.display(), mac = %mac, "Using interface for host identity");
        Some(mac)
    })
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
