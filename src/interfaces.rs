//! Local interface address enumeration.

use std::{collections::HashSet, net::IpAddr};

/// Returns every address bound to a local interface, excluding loopback.
///
/// No interface filtering beyond loopback and no ordering guarantee; deciding
/// which of these addresses is usable for a given gateway is the caller's
/// business.
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut addrs = HashSet::new();
    for iface in default_net::get_interfaces() {
        for net in iface.ipv4 {
            let ip = IpAddr::V4(net.addr);
            if !ip.is_loopback() {
                addrs.insert(ip);
            }
        }
        for net in iface.ipv6 {
            let ip = IpAddr::V6(net.addr);
            if !ip.is_loopback() {
                addrs.insert(ip);
            }
        }
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_loopback_addresses() {
        for addr in local_addresses() {
            assert!(!addr.is_loopback(), "loopback address {addr} in result");
        }
    }
}
