//! Virtual Router Redundancy Protocol (VRRP) Version 2
//!
//! Pure Rust implementation of RFC 3768 for first-hop router failover.
//!
//! # Features
//!
//! - VRRPv2 wire format (IP protocol 112, multicast 224.0.0.18)
//! - Priority-based master election with source-IP tie-breaking
//! - Failover within 3 advertisement intervals plus skew
//! - Virtual IP installation and removal over netlink
//! - Graceful shutdown (priority 0 advertisement)
//!
//! # Example
//!
//! ```no_run
//! use vrrp::{VRRPConfig, VirtualRouter};
//!
//! # async fn example() -> common::Result<()> {
//! let mut config = VRRPConfig::default();
//! config.vrid = 10;
//! config.priority = 100;
//! config.interface = "eth0".to_string();
//! config.virtual_ips.push("192.168.1.1".parse().unwrap());
//!
//! // Requires CAP_NET_RAW and CAP_NET_ADMIN.
//! let mut router = VirtualRouter::new(config)?;
//! router.start().await?;
//! # Ok(())
//! # }
//! ```

mod ip_manager;
mod packet;
mod router;
mod socket;
mod state_machine;
mod types;

pub use ip_manager::IPManager;
pub use packet::VRRPPacket;
pub use router::VirtualRouter;
pub use socket::VRRPSocket;
pub use state_machine::{Event, StateHandle, StateMachine, StateObserver};
pub use types::{VRRPConfig, VRRPState, VRRPStats, VRRP_MULTICAST_ADDR, VRRP_PROTOCOL, VRRP_VERSION};
