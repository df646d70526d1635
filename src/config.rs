//! Client configuration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::conn_tracker::ConnTracker;
use crate::dht::DhtServer;
use crate::ip_filter::IpFilter;
use crate::peer::{PeerId, DEFAULT_BEP20_PREFIX};
use crate::rate::RateLimiter;

/// Header-obfuscation policy for peer connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    /// Try the obfuscated handshake first, fall back to plaintext.
    #[default]
    PreferEncryption,
    /// Only encrypted connections; a failed obfuscated handshake is not
    /// retried as plaintext.
    ForceEncryption,
    /// Never initiate obfuscation; inbound MSE may still select
    /// plaintext framing.
    DisableEncryption,
    /// Try plaintext first, fall back to the obfuscated handshake.
    PreferNoEncryption,
}

impl EncryptionPolicy {
    pub fn force(&self) -> bool {
        matches!(self, EncryptionPolicy::ForceEncryption)
    }

    pub fn disabled(&self) -> bool {
        matches!(self, EncryptionPolicy::DisableEncryption)
    }

    pub fn prefer_plaintext(&self) -> bool {
        matches!(
            self,
            EncryptionPolicy::DisableEncryption | EncryptionPolicy::PreferNoEncryption
        )
    }
}

/// Everything tunable about a client. `Default` gives a working
/// configuration listening on an ephemeral port.
#[derive(Clone)]
pub struct ClientConfig {
    /// Local address listeners bind to; `None` binds the unspecified
    /// address of each enabled family.
    pub listen_host: Option<IpAddr>,
    /// 0 picks an ephemeral port, shared by every transport.
    pub listen_port: u16,

    pub disable_tcp: bool,
    pub disable_utp: bool,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
    /// Keep listening on v4 but refuse v4 peers.
    pub disable_ipv4_peers: bool,

    pub encryption_policy: EncryptionPolicy,

    /// Leave ut_pex out of the extended handshake.
    pub disable_pex: bool,
    pub no_dht: bool,
    pub disable_accept_rate_limiting: bool,
    pub periodically_announce_torrents_to_dht: bool,

    pub established_conns_per_torrent: usize,
    pub half_open_conns_per_torrent: usize,

    /// Single deadline covering both the MSE and BitTorrent handshake
    /// phases.
    pub handshakes_timeout: Duration,
    /// Floor for the per-peer dial timeout under half-open pressure.
    pub min_dial_timeout: Duration,
    /// Per-peer dial timeout when the half-open table is empty.
    pub nominal_dial_timeout: Duration,

    /// Fixed peer id; wins over `bep20` when set.
    pub peer_id: Option<PeerId>,
    /// BEP-20 prefix for generated peer ids.
    pub bep20: Vec<u8>,

    /// Proxy for outbound peer connections, e.g. `socks5://host:1080`.
    /// Validated at startup; honoring it is a transport concern.
    pub proxy_url: Option<String>,

    pub ip_blocklist: Option<IpFilter>,

    pub public_ip4: Option<Ipv4Addr>,
    pub public_ip6: Option<Ipv6Addr>,

    /// Shared limiter applied to every connection's read side.
    pub download_rate_limiter: Option<Arc<RateLimiter>>,
    /// Shared concurrent-connection budget; one is created when absent.
    pub conn_tracker: Option<Arc<ConnTracker>>,

    /// The `v` field of our extended handshake.
    pub extended_handshake_client_version: String,

    /// DHT servers to adopt at startup (ignored under `no_dht`).
    pub dht_servers: Vec<Arc<dyn DhtServer>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_host: None,
            listen_port: 0,
            disable_tcp: false,
            disable_utp: false,
            disable_ipv4: false,
            disable_ipv6: false,
            disable_ipv4_peers: false,
            encryption_policy: EncryptionPolicy::default(),
            disable_pex: false,
            no_dht: false,
            disable_accept_rate_limiting: false,
            periodically_announce_torrents_to_dht: false,
            established_conns_per_torrent: 50,
            half_open_conns_per_torrent: 25,
            handshakes_timeout: Duration::from_secs(20),
            min_dial_timeout: Duration::from_secs(3),
            nominal_dial_timeout: Duration::from_secs(20),
            peer_id: None,
            bep20: DEFAULT_BEP20_PREFIX.to_vec(),
            proxy_url: None,
            ip_blocklist: None,
            public_ip4: None,
            public_ip6: None,
            download_rate_limiter: None,
            conn_tracker: None,
            extended_handshake_client_version: format!(
                "riptide {}",
                env!("CARGO_PKG_VERSION")
            ),
            dht_servers: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Startup-fatal checks; anything failing here becomes
    /// `ClientError::InvalidConfig`.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.established_conns_per_torrent == 0 {
            return Err("established_conns_per_torrent must be positive".into());
        }
        if self.half_open_conns_per_torrent == 0 {
            return Err("half_open_conns_per_torrent must be positive".into());
        }
        if self.min_dial_timeout > self.nominal_dial_timeout {
            return Err("min_dial_timeout exceeds nominal_dial_timeout".into());
        }
        if self.disable_tcp && self.disable_utp {
            return Err("all peer transports disabled".into());
        }
        if self.disable_ipv4 && self.disable_ipv6 {
            return Err("all address families disabled".into());
        }
        if let Some(url) = &self.proxy_url {
            validate_proxy_url(url)?;
        }
        Ok(())
    }
}

fn validate_proxy_url(url: &str) -> Result<(), String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| format!("proxy url {url:?} has no scheme"))?;
    if !matches!(scheme, "http" | "socks5" | "socks5h") {
        return Err(format!("unsupported proxy scheme {scheme:?}"));
    }
    let authority = rest.split('/').next().unwrap_or("");
    let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority);
    if host.is_empty() {
        return Err(format!("proxy url {url:?} has no host"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_contradictory_transport_settings() {
        let config = ClientConfig {
            disable_tcp: true,
            disable_utp: true,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn proxy_urls_are_checked() {
        let ok = ClientConfig {
            proxy_url: Some("socks5://127.0.0.1:1080".into()),
            ..ClientConfig::default()
        };
        assert!(ok.validate().is_ok());

        let bad = ClientConfig {
            proxy_url: Some("not a url".into()),
            ..ClientConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad_scheme = ClientConfig {
            proxy_url: Some("ftp://example.com:21".into()),
            ..ClientConfig::default()
        };
        assert!(bad_scheme.validate().is_err());
    }

    #[test]
    fn encryption_policy_helpers() {
        assert!(EncryptionPolicy::ForceEncryption.force());
        assert!(EncryptionPolicy::DisableEncryption.prefer_plaintext());
        assert!(EncryptionPolicy::PreferNoEncryption.prefer_plaintext());
        assert!(!EncryptionPolicy::PreferEncryption.prefer_plaintext());
    }
}
