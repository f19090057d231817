//! Virtual IP address management over rtnetlink.
//!
//! Installs and removes host-scoped (/32) addresses on the configured
//! interface as the state machine acquires and releases mastership. All
//! operations are idempotent: adding a present address and removing an
//! absent one both succeed.

use std::net::{IpAddr, Ipv4Addr};

use common::{Error, Result};
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla;
use netlink_packet_route::constants::{AF_INET, AF_INET6, RT_SCOPE_UNIVERSE};
use netlink_packet_route::AddressMessage;
use rtnetlink::Handle;
use tracing::debug;

/// Prefix length used for installed virtual IPs
const VIP_PREFIX_LEN: u8 = 32;

/// Manages interface addresses for a single network interface.
///
/// Holds no state of its own beyond the interface identity; the kernel's
/// address table is the source of truth.
pub struct IPManager {
    handle: Handle,
    interface: String,
    ifindex: u32,
}

impl IPManager {
    /// Create an IP manager for the given interface.
    pub fn new(handle: Handle, interface: &str) -> Result<Self> {
        let ifindex = crate::socket::interface_index(interface)?;
        Ok(Self {
            handle,
            interface: interface.to_string(),
            ifindex,
        })
    }

    /// Add an address to the interface.
    ///
    /// Returns success without touching the kernel when the address is
    /// already present.
    pub async fn add(&self, ip: Ipv4Addr) -> Result<()> {
        let messages = self.dump().await?;
        if messages.iter().any(|msg| message_ip(msg) == Some(IpAddr::V4(ip))) {
            debug!(interface = %self.interface, %ip, "address already present");
            return Ok(());
        }

        let mut request = self
            .handle
            .address()
            .add(self.ifindex, IpAddr::V4(ip), VIP_PREFIX_LEN);
        let message = request.message_mut();
        message.header.scope = RT_SCOPE_UNIVERSE;
        message.nlas.push(Nla::Label(self.interface.clone()));

        request.execute().await.map_err(|e| {
            Error::netlink(format!(
                "failed to add {} to interface {}: {}",
                ip, self.interface, e
            ))
        })
    }

    /// Remove an address from the interface.
    ///
    /// An address that is not present is treated as success.
    pub async fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        let messages = self.dump().await?;

        for msg in messages {
            if message_ip(&msg) == Some(IpAddr::V4(ip)) {
                return self.handle.address().del(msg).execute().await.map_err(|e| {
                    Error::netlink(format!(
                        "failed to delete {} from interface {}: {}",
                        ip, self.interface, e
                    ))
                });
            }
        }

        debug!(interface = %self.interface, %ip, "address not present, nothing to remove");
        Ok(())
    }

    /// List all addresses currently assigned to the interface.
    pub async fn list(&self) -> Result<Vec<IpAddr>> {
        let messages = self.dump().await?;
        Ok(messages.iter().filter_map(message_ip).collect())
    }

    /// First IPv4 address on the interface, used as the instance's
    /// source identity.
    pub async fn first_ipv4(&self) -> Result<Option<Ipv4Addr>> {
        let addrs = self.list().await?;
        Ok(addrs.into_iter().find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }))
    }

    /// Tune kernel ARP behavior for virtual IP takeover.
    ///
    /// arp_ignore=1: reply only when the target IP is configured on the
    /// receiving interface. arp_announce=2: announce the best local
    /// source. Best-effort; systems that refuse the sysctl writes keep
    /// their defaults.
    pub fn configure_arp(&self, enable: bool) {
        let (ignore, announce) = if enable { ("1", "2") } else { ("0", "0") };

        let settings = [
            (
                format!("/proc/sys/net/ipv4/conf/{}/arp_ignore", self.interface),
                ignore,
            ),
            (
                format!("/proc/sys/net/ipv4/conf/{}/arp_announce", self.interface),
                announce,
            ),
            ("/proc/sys/net/ipv4/conf/all/arp_ignore".to_string(), ignore),
            (
                "/proc/sys/net/ipv4/conf/all/arp_announce".to_string(),
                announce,
            ),
        ];

        for (path, value) in settings {
            if let Err(e) = std::fs::write(&path, value) {
                debug!(%path, error = %e, "sysctl write skipped");
            }
        }
    }

    /// Interface this manager operates on.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn dump(&self) -> Result<Vec<AddressMessage>> {
        let request = self
            .handle
            .address()
            .get()
            .set_link_index_filter(self.ifindex);

        let mut messages = Vec::new();
        let mut stream = request.execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| Error::netlink(format!("failed to list addresses: {}", e)))?
        {
            messages.push(msg);
        }

        Ok(messages)
    }
}

/// Extract the IP address carried by an RTM_NEWADDR message.
///
/// For IPv4 the kernel reports the interface address in IFA_LOCAL;
/// IFA_ADDRESS is the peer on point-to-point links.
fn message_ip(msg: &AddressMessage) -> Option<IpAddr> {
    let mut address = None;
    let mut local = None;
    for nla in &msg.nlas {
        match nla {
            Nla::Local(bytes) => local = Some(bytes),
            Nla::Address(bytes) => address = Some(bytes),
            _ => (),
        }
    }
    let bytes = local.or(address)?;

    match u16::from(msg.header.family) {
        AF_INET => {
            let octets: [u8; 4] = bytes.as_slice().try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AF_INET6 => {
            let octets: [u8; 16] = bytes.as_slice().try_into().ok()?;
            Some(IpAddr::V6(octets.into()))
        }
        _ => None,
    }
}
