//! Connection admission policy.
//!
//! Pure functions of client state, consulted under the orchestrator lock
//! for both inbound accepts and outbound dial candidates. Rejections are
//! not errors; they are counted and the stream is dropped.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use tracing::warn;

use crate::config::ClientConfig;
use crate::ip_filter::IpFilter;

pub(crate) struct AdmissionState {
    blocklist: Option<IpFilter>,
    /// Banned peer IPs; grows monotonically, cleared only at process end.
    bad_peer_ips: HashSet<IpAddr>,
    /// "host:port" strings observed to present our own peer id.
    doppelganger_addrs: HashSet<String>,
    /// Failed-handshake counter per masked source address, cleared every
    /// 15 minutes and when a torrent is added.
    accept_limiter: HashMap<String, u32>,
}

impl AdmissionState {
    pub fn new(blocklist: Option<IpFilter>) -> Self {
        Self {
            blocklist,
            bad_peer_ips: HashSet::new(),
            doppelganger_addrs: HashSet::new(),
            accept_limiter: HashMap::new(),
        }
    }

    pub fn ban_ip(&mut self, ip: IpAddr) {
        warn!("banning ip {ip}");
        self.bad_peer_ips.insert(ip);
    }

    pub fn bad_peer_ips(&self) -> Vec<IpAddr> {
        self.bad_peer_ips.iter().copied().collect()
    }

    pub fn add_doppelganger(&mut self, addr: String) {
        self.doppelganger_addrs.insert(addr);
    }

    pub fn is_doppelganger(&self, addr: &SocketAddr) -> bool {
        self.doppelganger_addrs.contains(&addr.to_string())
    }

    pub fn ip_blocked(&self, ip: IpAddr) -> bool {
        self.blocklist
            .as_ref()
            .is_some_and(|filter| filter.is_blocked(ip))
    }

    /// Whether the address is unusable as a peer in either direction:
    /// port zero, a known doppelganger, blocklisted, or banned.
    pub fn bad_peer_addr(&self, addr: SocketAddr) -> bool {
        if addr.port() == 0 {
            return true;
        }
        if self.is_doppelganger(&addr) {
            return true;
        }
        if self.ip_blocked(addr.ip()) {
            return true;
        }
        self.bad_peer_ips.contains(&addr.ip())
    }

    /// The inbound gate, evaluated before any handshake work.
    pub fn reject_accepted(&self, addr: SocketAddr, config: &ClientConfig) -> bool {
        let ip = addr.ip();
        if config.disable_ipv4_peers && ip.is_ipv4() {
            return true;
        }
        if config.disable_ipv4 && ip.is_ipv4() {
            return true;
        }
        if config.disable_ipv6 && ip.is_ipv6() {
            return true;
        }
        if self.rate_limit_accept(ip, config) {
            return true;
        }
        self.bad_peer_addr(addr)
    }

    /// A failed inbound handshake bumps the counter for the source's
    /// masked address.
    pub fn on_bad_accept(&mut self, addr: SocketAddr) {
        *self
            .accept_limiter
            .entry(mask_ip_for_accept_limiting(addr.ip()))
            .or_insert(0) += 1;
    }

    pub fn rate_limit_accept(&self, ip: IpAddr, config: &ClientConfig) -> bool {
        if config.disable_accept_rate_limiting {
            return false;
        }
        self.accept_limiter
            .get(&mask_ip_for_accept_limiting(ip))
            .is_some_and(|&count| count > 0)
    }

    pub fn clear_accept_limits(&mut self) {
        self.accept_limiter.clear();
    }
}

/// IPv4 sources are throttled per /24; IPv6 per full address.
fn mask_ip_for_accept_limiting(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}.0", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(_) => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn port_zero_is_always_bad() {
        let state = AdmissionState::new(None);
        assert!(state.bad_peer_addr(addr("1.2.3.4:0")));
        assert!(!state.bad_peer_addr(addr("1.2.3.4:6881")));
    }

    #[test]
    fn banned_and_blocked_ips_are_bad() {
        let filter = IpFilter::parse("192.0.2.0/24").unwrap();
        let mut state = AdmissionState::new(Some(filter));
        assert!(state.bad_peer_addr(addr("192.0.2.77:6881")));

        state.ban_ip("10.1.1.1".parse().unwrap());
        assert!(state.bad_peer_addr(addr("10.1.1.1:6881")));
        assert_eq!(state.bad_peer_ips().len(), 1);
    }

    #[test]
    fn doppelganger_addr_is_per_port() {
        let mut state = AdmissionState::new(None);
        state.add_doppelganger("127.0.0.1:7000".into());
        assert!(state.bad_peer_addr(addr("127.0.0.1:7000")));
        assert!(!state.bad_peer_addr(addr("127.0.0.1:7001")));
    }

    #[test]
    fn accept_limiter_masks_v4_to_slash_24() {
        let mut state = AdmissionState::new(None);
        let config = ClientConfig::default();
        state.on_bad_accept(addr("198.51.100.7:1234"));

        // Sibling host in the same /24 is throttled, a neighbouring /24
        // is not.
        assert!(state.reject_accepted(addr("198.51.100.99:5678"), &config));
        assert!(!state.reject_accepted(addr("198.51.101.7:5678"), &config));

        state.clear_accept_limits();
        assert!(!state.reject_accepted(addr("198.51.100.99:5678"), &config));
    }

    #[test]
    fn accept_limiting_can_be_disabled() {
        let mut state = AdmissionState::new(None);
        let config = ClientConfig {
            disable_accept_rate_limiting: true,
            ..ClientConfig::default()
        };
        state.on_bad_accept(addr("198.51.100.7:1234"));
        assert!(!state.reject_accepted(addr("198.51.100.7:1234"), &config));
    }

    #[test]
    fn family_gates_apply_to_accepts() {
        let state = AdmissionState::new(None);
        let config = ClientConfig {
            disable_ipv4_peers: true,
            ..ClientConfig::default()
        };
        assert!(state.reject_accepted(addr("1.2.3.4:6881"), &config));
        assert!(!state.reject_accepted(addr("[2001:db8::1]:6881"), &config));
    }
}
