//! VRRP data types and structures.
//!
//! Based on RFC 3768: Virtual Router Redundancy Protocol (VRRP) Version 2

use std::net::Ipv4Addr;
use std::time::Duration;

use common::{Error, Result};

/// VRRP protocol version (2 per RFC 3768)
pub const VRRP_VERSION: u8 = 2;

/// VRRP IP protocol number
pub const VRRP_PROTOCOL: u8 = 112;

/// VRRP multicast group for IPv4
pub const VRRP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// Default advertisement interval in seconds
pub const DEFAULT_ADVERT_INTERVAL: u8 = 1;

/// VRRP state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VRRPState {
    /// Initial state - not yet participating in an election
    Init,
    /// Backup state - monitoring the master for failures
    Backup,
    /// Master state - owning the virtual IPs and sending advertisements
    Master,
}

impl std::fmt::Display for VRRPState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VRRPState::Init => write!(f, "INIT"),
            VRRPState::Backup => write!(f, "BACKUP"),
            VRRPState::Master => write!(f, "MASTER"),
        }
    }
}

/// VRRP virtual router configuration
#[derive(Debug, Clone)]
pub struct VRRPConfig {
    /// Virtual Router ID (1-255)
    pub vrid: u8,

    /// Priority for this router (255 = IP address owner)
    pub priority: u8,

    /// Advertisement interval in seconds (default 1)
    pub advert_interval: u8,

    /// Network interface name
    pub interface: String,

    /// Virtual IP addresses to manage
    pub virtual_ips: Vec<Ipv4Addr>,

    /// Whether to preempt lower priority masters
    pub preempt: bool,

    /// Protocol version (only 2 is supported)
    pub version: u8,
}

impl Default for VRRPConfig {
    fn default() -> Self {
        Self {
            vrid: 1,
            priority: 100,
            advert_interval: DEFAULT_ADVERT_INTERVAL,
            interface: String::from("eth0"),
            virtual_ips: Vec::new(),
            preempt: true,
            version: VRRP_VERSION,
        }
    }
}

impl VRRPConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.vrid == 0 {
            return Err(Error::config("VRID must be between 1 and 255"));
        }

        if self.virtual_ips.is_empty() {
            return Err(Error::config("at least one virtual IP is required"));
        }

        if self.interface.is_empty() {
            return Err(Error::config("interface name is required"));
        }

        if self.advert_interval == 0 {
            return Err(Error::config(
                "advertisement interval must be at least 1 second",
            ));
        }

        if self.version != VRRP_VERSION {
            return Err(Error::config(format!(
                "unsupported VRRP version: {}",
                self.version
            )));
        }

        Ok(())
    }

    /// Advertisement interval as a [`Duration`]
    pub fn advert_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.advert_interval))
    }

    /// Skew_Time per RFC 3768 Section 6.1
    ///
    /// Skew_Time = ((256 - Priority) * Advertisement_Interval) / 256
    pub fn skew_time(&self) -> Duration {
        let advert_ms = u64::from(self.advert_interval) * 1000;
        let skew_ms = ((256 - u64::from(self.priority)) * advert_ms) / 256;
        Duration::from_millis(skew_ms)
    }

    /// Master_Down_Interval per RFC 3768 Section 6.1
    ///
    /// Master_Down_Interval = (3 * Advertisement_Interval) + Skew_Time
    pub fn master_down_interval(&self) -> Duration {
        3 * self.advert_duration() + self.skew_time()
    }
}

/// VRRP runtime statistics
#[derive(Debug, Clone, Default)]
pub struct VRRPStats {
    /// Number of transitions to Master state
    pub master_transitions: u64,

    /// Number of transitions to Backup state
    pub backup_transitions: u64,

    /// Advertisements sent (as master)
    pub adverts_sent: u64,

    /// Advertisements received for our VRID
    pub adverts_received: u64,

    /// Packets discarded because the VRID did not match
    pub packets_discarded: u64,

    /// Priority zero advertisements received
    pub priority_zero_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> VRRPConfig {
        VRRPConfig {
            vrid: 1,
            priority: 100,
            advert_interval: 1,
            interface: "lo".to_string(),
            virtual_ips: vec!["192.168.1.100".parse().unwrap()],
            ..Default::default()
        }
    }

    #[test]
    fn test_master_down_interval() {
        // skew = ((256 - 100) * 1000) / 256 = 609ms
        // total = 3000 + 609 = 3609ms
        let config = base_config();
        assert_eq!(config.skew_time(), Duration::from_millis(609));
        assert_eq!(config.master_down_interval(), Duration::from_millis(3609));

        // The address owner waits the shortest interval.
        let owner = VRRPConfig {
            priority: 255,
            ..base_config()
        };
        assert_eq!(owner.skew_time(), Duration::from_millis(3));
        assert_eq!(owner.master_down_interval(), Duration::from_millis(3003));
    }

    #[test]
    fn test_skew_shrinks_with_priority() {
        let mut prev = Duration::MAX;
        for priority in [1u8, 100, 200, 254, 255] {
            let config = VRRPConfig {
                priority,
                ..base_config()
            };
            let skew = config.skew_time();
            assert!(skew < prev, "skew should shrink as priority grows");
            prev = skew;
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = VRRPConfig::default();

        // No virtual IPs yet.
        assert!(config.validate().is_err());

        config.virtual_ips.push("192.168.1.1".parse().unwrap());
        assert!(config.validate().is_ok());

        config.vrid = 0;
        assert!(config.validate().is_err());
        config.vrid = 1;

        config.interface.clear();
        assert!(config.validate().is_err());
        config.interface = "eth0".to_string();

        config.advert_interval = 0;
        assert!(config.validate().is_err());
        config.advert_interval = 1;

        config.version = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VRRPState::Init.to_string(), "INIT");
        assert_eq!(VRRPState::Backup.to_string(), "BACKUP");
        assert_eq!(VRRPState::Master.to_string(), "MASTER");
    }
}
