use serde::{Deserialize, Serialize};

/// Runtime configuration for the core.
///
/// All fields have working defaults; a partial config file deserializes
/// against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cap on the regular host pool (fresh and valid halves combined).
    pub max_hosts_cached: usize,
    /// Cap on the ultrapeer host pool (fresh and valid halves combined).
    pub max_ultra_hosts_cached: usize,
    /// Cap on each of the bad-host caches (timeout, busy, unstable, alien).
    pub max_bad_hosts_cached: usize,
    /// Cap on the running GUESS cache.
    pub max_guess_hosts_cached: usize,
    /// Cap on the GUESS introduction cache.
    pub max_guess_intro_hosts_cached: usize,

    /// Minimum seconds between two queries dispatched from one search queue.
    pub search_queue_spacing: u64,
    /// Maximum queries held per search queue; the oldest are dropped beyond it.
    pub search_queue_size: usize,

    /// Globally disable host admission.
    pub stop_host_get: bool,
    /// Track unstable peers in their own bad cache.
    pub node_monitor_unstable_ip: bool,
    /// Prefer hosts within configured local networks when extracting.
    pub use_netmasks: bool,
    /// Desired number of ultrapeer connections; gates the global search queue.
    pub up_connections: u32,

    /// Chance out of 256 that a host on the legacy ports 6346-6350 is
    /// admitted anyway; 256 disables the veto. Those ports are mostly
    /// outdated servents and get filtered aggressively.
    pub legacy_port_pass_odds: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_hosts_cached: 8192,
            max_ultra_hosts_cached: 8192,
            max_bad_hosts_cached: 1024,
            max_guess_hosts_cached: 2048,
            max_guess_intro_hosts_cached: 1024,
            search_queue_spacing: 120,
            search_queue_size: 128,
            stop_host_get: false,
            node_monitor_unstable_ip: true,
            use_netmasks: false,
            up_connections: 32,
            legacy_port_pass_odds: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let s = Settings::default();
        assert!(s.max_hosts_cached >= s.max_ultra_hosts_cached / 2);
        assert!(s.search_queue_size > 0);
        assert!(!s.stop_host_get);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{"max_hosts_cached": 64, "stop_host_get": true}"#)
                .expect("deserialize");
        assert_eq!(s.max_hosts_cached, 64);
        assert!(s.stop_host_get);
        assert_eq!(s.search_queue_size, Settings::default().search_queue_size);
    }

    #[test]
    fn settings_round_trip() {
        let s = Settings {
            up_connections: 12,
            ..Settings::default()
        };
        let json = serde_json::to_string(&s).expect("serialize");
        let back: Settings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.up_connections, 12);
        assert_eq!(back.max_guess_hosts_cached, s.max_guess_hosts_cached);
    }
}
