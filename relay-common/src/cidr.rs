//! CIDR allowlist matching for `AgentRegistry.IpAllowed`.
//!
//! IPv4-mapped IPv6 addresses are canonicalized to IPv4 before matching, so
//! an Agent configured with `10.0.0.0/8` is still matched when the listener
//! observes the connection as `::ffff:10.1.2.3`.

use ipnet::IpNet;
use std::net::IpAddr;

/// Canonicalize an IPv4-mapped IPv6 address down to its IPv4 form.
pub fn canonicalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Check `addr` against a list of CIDR strings (e.g. `["10.0.0.0/8"]`). An
/// empty allowlist means "allow all" — the spec treats an Agent with no
/// configured CIDRs as unrestricted, matching the teacher's own `allowedCIDRs`
/// wording ("set of IP ranges") rather than defaulting to deny-all.
pub fn ip_allowed(addr: IpAddr, cidrs: &[String]) -> bool {
    if cidrs.is_empty() {
        return true;
    }
    let addr = canonicalize(addr);
    cidrs.iter().any(|c| match c.parse::<IpNet>() {
        Ok(net) => net.contains(&addr),
        Err(_) => {
            tracing::warn!(cidr = %c, "malformed CIDR entry in agent config, ignoring");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn matches_address_in_range() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        assert!(ip_allowed(addr, &["10.0.0.0/8".to_string()]));
    }

    #[test]
    fn rejects_address_outside_range() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert!(!ip_allowed(addr, &["10.0.0.0/8".to_string()]));
    }

    #[test]
    fn canonicalizes_ipv4_mapped_ipv6() {
        let mapped = IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xFFFF, 0x0A01, 0x0203));
        assert!(ip_allowed(mapped, &["10.0.0.0/8".to_string()]));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));
        assert!(ip_allowed(addr, &[]));
    }
}
