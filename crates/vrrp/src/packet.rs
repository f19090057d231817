//! VRRP packet format and parsing.
//!
//! RFC 3768 Section 5.1 - VRRP Packet Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  | Virtual Rtr ID|   Priority    | Count IP Addrs|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Auth Type   |   Adver Int   |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IP Address(es)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Authentication Data (8 bytes)             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum is the 16-bit one's complement of the one's complement
//! sum of the VRRP message; version 2 does not include a pseudo-header.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use common::{Error, Result};

use crate::types::VRRP_VERSION;

/// VRRP packet type (always 1 = ADVERTISEMENT)
pub const VRRP_TYPE_ADVERTISEMENT: u8 = 1;

/// Length of the fixed VRRP header in bytes
const HEADER_LEN: usize = 8;

/// Length of the version 2 authentication data field in bytes
const AUTH_DATA_LEN: usize = 8;

/// A VRRP version 2 advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VRRPPacket {
    /// Protocol version (4 bits; 2 produced, 3 accepted on decode)
    pub version: u8,

    /// Packet type (4 bits, always 1 = ADVERTISEMENT)
    pub pkt_type: u8,

    /// Virtual Router ID (1-255)
    pub vrid: u8,

    /// Priority (0 = master shutting down, 255 = address owner)
    pub priority: u8,

    /// Count of IP addresses carried in the packet
    pub count_ip: u8,

    /// Authentication type (preserved on decode, zero on encode)
    pub auth_type: u8,

    /// Advertisement interval in seconds
    pub adv_interval: u8,

    /// Checksum over the VRRP header and payload
    pub checksum: u16,

    /// Virtual IP addresses
    pub ip_addresses: Vec<Ipv4Addr>,

    /// Trailing 8-byte authentication data, when present on the wire
    pub auth_data: Option<[u8; AUTH_DATA_LEN]>,
}

impl VRRPPacket {
    /// Create a new VRRP advertisement packet
    pub fn new(vrid: u8, priority: u8, adv_interval: u8, ips: Vec<Ipv4Addr>) -> Self {
        Self {
            version: VRRP_VERSION,
            pkt_type: VRRP_TYPE_ADVERTISEMENT,
            vrid,
            priority,
            count_ip: ips.len() as u8,
            auth_type: 0,
            adv_interval,
            checksum: 0,
            ip_addresses: ips,
            auth_data: None,
        }
    }

    /// Serialize the packet, computing and embedding the checksum.
    pub fn encode(&self) -> Result<Bytes> {
        if self.version != 2 && self.version != 3 {
            return Err(Error::packet(format!(
                "unsupported VRRP version: {}",
                self.version
            )));
        }

        let mut len = HEADER_LEN + 4 * self.ip_addresses.len();
        if self.auth_data.is_some() {
            len += AUTH_DATA_LEN;
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8((self.version << 4) | (self.pkt_type & 0x0F));
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.count_ip);
        buf.put_u8(self.auth_type);
        buf.put_u8(self.adv_interval);
        buf.put_u16(0); // checksum, filled below

        for ip in &self.ip_addresses {
            buf.put_slice(&ip.octets());
        }

        if let Some(auth) = &self.auth_data {
            buf.put_slice(auth);
        }

        let checksum = compute_checksum(&buf);
        buf[6..8].copy_from_slice(&checksum.to_be_bytes());

        Ok(buf.freeze())
    }

    /// Parse a VRRP packet from raw bytes.
    ///
    /// The checksum field is captured but not recomputed; callers that
    /// want to validate it use [`verify`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::packet(format!("packet too short: {} bytes", data.len())));
        }

        let version = data[0] >> 4;
        let pkt_type = data[0] & 0x0F;
        let vrid = data[1];
        let priority = data[2];
        let count_ip = data[3];
        let auth_type = data[4];
        let adv_interval = data[5];
        let checksum = u16::from_be_bytes([data[6], data[7]]);

        let mut ip_addresses = Vec::with_capacity(count_ip as usize);
        let mut offset = HEADER_LEN;
        for _ in 0..count_ip {
            if offset + 4 > data.len() {
                return Err(Error::packet("insufficient data for IPv4 address"));
            }
            ip_addresses.push(Ipv4Addr::new(
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ));
            offset += 4;
        }

        let mut auth_data = None;
        if version == 2 && data.len() - offset == AUTH_DATA_LEN {
            let mut auth = [0u8; AUTH_DATA_LEN];
            auth.copy_from_slice(&data[offset..offset + AUTH_DATA_LEN]);
            auth_data = Some(auth);
        }

        Ok(Self {
            version,
            pkt_type,
            vrid,
            priority,
            count_ip,
            auth_type,
            adv_interval,
            checksum,
            ip_addresses,
            auth_data,
        })
    }
}

/// Compute the RFC 1071 checksum over an encoded VRRP message, treating
/// the checksum field (bytes 6-7) as zero.
pub fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() {
        if i == 6 {
            // Checksum field counts as zero.
            i += 2;
            continue;
        }

        let word = if i + 1 < data.len() {
            u16::from_be_bytes([data[i], data[i + 1]])
        } else {
            // Odd trailing byte is the high half of a zero-padded word.
            u16::from_be_bytes([data[i], 0])
        };

        sum += u32::from(word);
        i += 2;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Verify a received buffer: summing every 16-bit word of a correctly
/// checksummed message yields 0xFFFF.
pub fn verify(data: &[u8]) -> bool {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() {
        let word = if i + 1 < data.len() {
            u16::from_be_bytes([data[i], data[i + 1]])
        } else {
            u16::from_be_bytes([data[i], 0])
        };

        sum += u32::from(word);
        i += 2;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16 == 0xFFFF
}
