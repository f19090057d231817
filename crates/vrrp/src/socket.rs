//! VRRP socket handling for multicast communication.
//!
//! Implements raw socket creation, multicast group management, and
//! send/receive operations for VRRP advertisements (RFC 3768).
//!
//! Outbound frames carry a manually assembled IPv4 header (IP_HDRINCL):
//! TOS 0xC0 (internetwork control), TTL 255, protocol 112, destination
//! 224.0.0.18. The kernel fills in the IP header checksum.

use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;

use bytes::{BufMut, BytesMut};
use common::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::packet::VRRPPacket;
use crate::types::{VRRP_MULTICAST_ADDR, VRRP_PROTOCOL};

/// Socket buffer size requested for both directions (best-effort)
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Largest frame we expect to read off the wire
const MAX_FRAME_SIZE: usize = 1500;

/// Minimum IPv4 header length in bytes
const IPV4_HEADER_LEN: usize = 20;

/// Raw socket for sending and receiving VRRP advertisements.
pub struct VRRPSocket {
    socket: Socket,
    interface: String,
    ifindex: u32,
    source_ip: Ipv4Addr,
}

impl VRRPSocket {
    /// Create a raw IPv4 socket bound to protocol 112.
    ///
    /// `source_ip` becomes the source address of every outbound frame.
    pub fn new(interface: &str, source_ip: Ipv4Addr) -> Result<Self> {
        let ifindex = interface_index(interface)?;

        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(i32::from(VRRP_PROTOCOL))),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;

        // Larger buffers ride out advertisement bursts; not fatal if refused.
        if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!(interface, error = %e, "failed to set receive buffer size");
        }
        if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!(interface, error = %e, "failed to set send buffer size");
        }

        let fd = socket.as_raw_fd();

        // We assemble the IPv4 header ourselves.
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_HDRINCL, 1)?;

        // RFC 3768 requires TTL 255 on advertisements.
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, 255)?;

        // Pin outgoing multicast to the configured interface.
        let mreqn = libc::ip_mreqn {
            imr_multiaddr: libc::in_addr { s_addr: 0 },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: ifindex as i32,
        };
        unsafe {
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_IF,
                &mreqn as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
        }

        Ok(Self {
            socket,
            interface: interface.to_string(),
            ifindex,
            source_ip,
        })
    }

    /// Join the VRRP multicast group on the configured interface.
    pub fn join_multicast(&self) -> Result<()> {
        let mreqn = libc::ip_mreqn {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_be_bytes(VRRP_MULTICAST_ADDR.octets()).to_be(),
            },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: self.ifindex as i32,
        };

        unsafe {
            if libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_ADD_MEMBERSHIP,
                &mreqn as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
        }

        Ok(())
    }

    /// Leave the VRRP multicast group.
    pub fn leave_multicast(&self) -> Result<()> {
        let mreqn = libc::ip_mreqn {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_be_bytes(VRRP_MULTICAST_ADDR.octets()).to_be(),
            },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: self.ifindex as i32,
        };

        unsafe {
            if libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_DROP_MEMBERSHIP,
                &mreqn as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
        }

        Ok(())
    }

    /// Marshal and send a VRRP advertisement to 224.0.0.18.
    pub fn send(&self, packet: &VRRPPacket) -> Result<usize> {
        let payload = packet.encode()?;
        let total_len = IPV4_HEADER_LEN + payload.len();

        let mut frame = BytesMut::with_capacity(total_len);
        frame.put_u8(0x45); // version 4, IHL 5
        frame.put_u8(0xC0); // TOS: internetwork control
        frame.put_u16(total_len as u16);
        frame.put_u16(0); // identification
        frame.put_u16(0); // flags + fragment offset
        frame.put_u8(255); // TTL
        frame.put_u8(VRRP_PROTOCOL);
        frame.put_u16(0); // header checksum, computed by the kernel
        frame.put_slice(&self.source_ip.octets());
        frame.put_slice(&VRRP_MULTICAST_ADDR.octets());
        frame.put_slice(&payload);

        let dst = SocketAddrV4::new(VRRP_MULTICAST_ADDR, 0);
        let sent = self.socket.send_to(&frame, &dst.into())?;
        Ok(sent)
    }

    /// Try to receive one VRRP advertisement without blocking.
    ///
    /// Returns `Ok(None)` when no frame is pending or the frame is not
    /// protocol 112; decode failures surface as errors so the caller can
    /// log and drop.
    pub fn try_recv(&self) -> Result<Option<(VRRPPacket, Ipv4Addr)>> {
        let mut buf = [MaybeUninit::<u8>::uninit(); MAX_FRAME_SIZE];

        let len = match self.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // recv() initialized the first `len` bytes.
        let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if data.len() < IPV4_HEADER_LEN {
            return Err(Error::network(format!("frame too short: {} bytes", data.len())));
        }

        if data[0] >> 4 != 4 {
            return Err(Error::network("not an IPv4 frame"));
        }

        let header_len = usize::from(data[0] & 0x0F) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > data.len() {
            return Err(Error::network("invalid IPv4 header length"));
        }

        if data[9] != VRRP_PROTOCOL {
            return Ok(None);
        }

        let source = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let packet = VRRPPacket::decode(&data[header_len..])?;

        Ok(Some((packet, source)))
    }

    /// Name of the interface this socket is attached to.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Source address used for outbound frames.
    pub fn source_ip(&self) -> Ipv4Addr {
        self.source_ip
    }
}

impl Drop for VRRPSocket {
    fn drop(&mut self) {
        // Best effort to leave the multicast group on cleanup.
        let _ = self.leave_multicast();
    }
}

fn setsockopt_int(fd: i32, level: i32, option: i32, value: i32) -> io::Result<()> {
    let value: libc::c_int = value;
    unsafe {
        if libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Resolve an interface name to its kernel index.
pub(crate) fn interface_index(name: &str) -> Result<u32> {
    use std::ffi::CString;

    let c_name =
        CString::new(name).map_err(|_| Error::network("interface name contains NUL byte"))?;

    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        Err(Error::network(format!("interface {} not found", name)))
    } else {
        Ok(index)
    }
}
