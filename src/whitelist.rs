//! Essential system services that are always allowed out.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::net::IpAddr;

/// DNS, DHCP, NTP and chrony.
static ESSENTIAL_PORTS: Lazy<HashSet<u16>> = Lazy::new(|| [53, 67, 68, 123, 323].into_iter().collect());

static SYSTEM_PATHS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Core system
        "/usr/lib/systemd/systemd",
        "/usr/lib/systemd/systemd-resolved",
        "/usr/lib/systemd/systemd-networkd",
        "/usr/lib/systemd/systemd-timesyncd",
        "/usr/sbin/NetworkManager",
        "/usr/sbin/dhclient",
        "/usr/sbin/chronyd",
        "/usr/sbin/ntpd",
        // Package managers
        "/usr/bin/apt",
        "/usr/bin/apt-get",
        "/usr/lib/apt/apt-helper",
        "/usr/lib/apt/methods/http",
        "/usr/lib/apt/methods/https",
        "/usr/bin/snap",
        "/usr/bin/flatpak",
        "/usr/libexec/packagekitd",
    ]
    .into_iter()
    .collect()
});

fn is_trusted(app_path: &str) -> bool {
    SYSTEM_PATHS.contains(app_path) || app_path.starts_with("/usr/lib/systemd/")
}

/// Reason to allow the connection without asking, if there is one.
///
/// Essential ports and loopback are only exempt for trusted binaries, so
/// they cannot be used to tunnel past the firewall.
pub fn auto_allow_reason(app_path: &str, dst: IpAddr, dst_port: u16) -> Option<&'static str> {
    if !is_trusted(app_path) {
        return None;
    }
    if ESSENTIAL_PORTS.contains(&dst_port) {
        return Some("essential port");
    }
    if dst.is_loopback() {
        return Some("localhost");
    }
    Some("system service")
}
