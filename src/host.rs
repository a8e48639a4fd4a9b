//! Host identity and the environment checks admission depends on.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A peer endpoint: address plus port.
///
/// Address-only caches store hosts with port 0, so the port participates in
/// identity but may legitimately be absent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host {
    pub addr: IpAddr,
    pub port: u16,
}

impl Host {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// The same host with the port stripped, as stored in address-only caches.
    pub fn addr_only(self) -> Self {
        Self {
            addr: self.addr,
            port: 0,
        }
    }

    pub fn has_valid_port(&self) -> bool {
        self.port != 0
    }

    /// Whether the address can be reached across the open Internet.
    ///
    /// Loopback, private, link-local, multicast and unspecified addresses
    /// are not; everything else is assumed routable.
    pub fn is_routable(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => {
                !(v4.is_unspecified()
                    || v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.is_multicast())
            }
            IpAddr::V6(v6) => {
                let seg = v6.segments();
                !(v6.is_unspecified()
                    || v6.is_loopback()
                    || v6.is_multicast()
                    // unique local fc00::/7
                    || (seg[0] & 0xfe00) == 0xfc00
                    // link local fe80::/10
                    || (seg[0] & 0xffc0) == 0xfe80)
            }
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.addr, self.port))
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host({self})")
    }
}

impl FromStr for Host {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sa: SocketAddr = s.parse()?;
        Ok(Self::new(sa.ip(), sa.port()))
    }
}

impl From<SocketAddr> for Host {
    fn from(sa: SocketAddr) -> Self {
        Self::new(sa.ip(), sa.port())
    }
}

/// Environment checks the host cache consults during admission.
///
/// The connection layer, the hostile/bogus address lists and the netmask
/// configuration all live outside the core; this trait is the seam they
/// plug into. Every check defaults to the permissive answer.
pub trait HostGate: Send + Sync {
    /// Is this our own advertised address and port?
    fn is_own_address(&self, _host: &Host) -> bool {
        false
    }

    /// Are we currently connected to this host?
    fn is_connected(&self, _host: &Host) -> bool {
        false
    }

    /// Is the address inside a known-unallocated (bogus) range?
    fn is_bogus(&self, _addr: &IpAddr) -> bool {
        false
    }

    /// Is the address on the hostile list?
    fn is_hostile(&self, _addr: &IpAddr) -> bool {
        false
    }

    /// Is the address within one of our configured local networks?
    fn is_nearby(&self, _addr: &IpAddr) -> bool {
        false
    }

    /// Number of configured local networks, gating nearby lookups.
    fn local_networks(&self) -> u32 {
        0
    }
}

/// A gate with every check at its permissive default.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl HostGate for OpenGate {}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(s: &str) -> Host {
        s.parse().expect("valid host")
    }

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["1.2.3.4:6347", "8.8.8.8:0", "[2001:db8:1::1]:6346"] {
            let h = host(s);
            assert_eq!(h.to_string(), s);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-host".parse::<Host>().is_err());
        assert!("1.2.3.4".parse::<Host>().is_err());
        assert!("1.2.3.4:70000".parse::<Host>().is_err());
    }

    #[test]
    fn routability_classification() {
        assert!(host("8.8.8.8:6346").is_routable());
        assert!(host("[2600:1700::1]:6346").is_routable());

        assert!(!host("127.0.0.1:6346").is_routable());
        assert!(!host("10.1.2.3:6346").is_routable());
        assert!(!host("192.168.0.1:6346").is_routable());
        assert!(!host("169.254.1.1:6346").is_routable());
        assert!(!host("224.0.0.1:6346").is_routable());
        assert!(!host("0.0.0.0:6346").is_routable());
        assert!(!host("[::1]:6346").is_routable());
        assert!(!host("[fe80::1]:6346").is_routable());
        assert!(!host("[fc00::1]:6346").is_routable());
        assert!(!host("[fd12::1]:6346").is_routable());
    }

    #[test]
    fn addr_only_strips_port() {
        let h = host("4.5.6.7:6349");
        assert_eq!(h.addr_only(), host("4.5.6.7:0"));
        assert!(!h.addr_only().has_valid_port());
    }

    #[test]
    fn open_gate_is_permissive() {
        let gate = OpenGate;
        let h = host("8.8.8.8:6346");
        assert!(!gate.is_own_address(&h));
        assert!(!gate.is_connected(&h));
        assert!(!gate.is_bogus(&h.addr));
        assert!(!gate.is_hostile(&h.addr));
        assert!(!gate.is_nearby(&h.addr));
        assert_eq!(gate.local_networks(), 0);
    }
}
