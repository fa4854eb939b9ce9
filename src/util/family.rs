/*
   Copyright 2020 Ilya Grishkov

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

//! Everything that differs between IPv4 and IPv6 tracing lives here.

use crate::util::errqueue::Origin;
use pnet::packet::icmp::time_exceeded::IcmpCodes;
use pnet::packet::icmp::IcmpTypes;
use pnet::packet::icmpv6::Icmpv6Types;
use socket2::{Domain, Socket};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::AsRawFd;

/// `SOL_IP` / `IP_RECVERR`: the socket option and the control message tag
pub(crate) const SOL_IP: i32 = 0;
pub(crate) const IP_RECVERR: i32 = 11;
/// `SOL_IPV6` / `IPV6_RECVERR`
pub(crate) const SOL_IPV6: i32 = 41;
pub(crate) const IPV6_RECVERR: i32 = 25;

/// ICMPv6 code 0 of Time Exceeded: hop limit exceeded in transit
const ICMPV6_EXC_HOPLIMIT: u8 = 0;

// Offsets into the error-queue payload, past the 16-byte extended error header
const PORT_OFFSET: usize = 18;
const V4_ADDR_OFFSET: usize = 20;
const V6_FLOW_OFFSET: usize = 20;
const V6_ADDR_OFFSET: usize = 24;
const V6_SCOPE_OFFSET: usize = 40;

/// Address family of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    /// Finds the family whose error queue uses this control message tag
    pub fn from_cmsg(level: i32, kind: i32) -> Option<Self> {
        match (level, kind) {
            (SOL_IP, IP_RECVERR) => Some(Family::V4),
            (SOL_IPV6, IPV6_RECVERR) => Some(Family::V6),
            _ => None,
        }
    }

    pub(crate) fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }

    /// Level and name of the error queue option, also used as the cmsg tag
    pub fn recverr_tag(self) -> (i32, i32) {
        match self {
            Family::V4 => (SOL_IP, IP_RECVERR),
            Family::V6 => (SOL_IPV6, IPV6_RECVERR),
        }
    }

    /// Minimum payload length that carries a sender address
    pub(crate) fn payload_len(self) -> usize {
        match self {
            Family::V4 => V4_ADDR_OFFSET + 4,
            Family::V6 => V6_SCOPE_OFFSET + 4,
        }
    }

    /// Turns on extended error reporting for the socket.
    pub(crate) fn enable_recverr(self, socket: &Socket) -> io::Result<()> {
        let (level, name) = self.recverr_tag();
        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sets `IP_TTL` or `IPV6_UNICAST_HOPS`.
    pub(crate) fn set_hop_limit(self, socket: &Socket, ttl: u8) -> io::Result<()> {
        match self {
            Family::V4 => socket.set_ttl(ttl as u32),
            Family::V6 => socket.set_unicast_hops_v6(ttl as u32),
        }
    }

    /// Destination of a probe: the resolved address with the port offset added.
    /// IPv6 flow info and scope id are carried over unchanged.
    pub fn probe_addr(self, destination: &SocketAddr, port_offset: u16) -> SocketAddr {
        let port = destination.port().wrapping_add(port_offset);
        match destination {
            SocketAddr::V4(addr) => SocketAddr::V4(SocketAddrV4::new(*addr.ip(), port)),
            SocketAddr::V6(addr) => SocketAddr::V6(SocketAddrV6::new(
                *addr.ip(),
                port,
                addr.flowinfo(),
                addr.scope_id(),
            )),
        }
    }

    /// Reads the offending sender out of an error-queue payload.
    /// Returns `None` if the payload is too short.
    pub fn decode_sender(self, payload: &[u8]) -> Option<SocketAddr> {
        if payload.len() < self.payload_len() {
            return None;
        }
        let port = u16::from_be_bytes([payload[PORT_OFFSET], payload[PORT_OFFSET + 1]]);
        match self {
            Family::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&payload[V4_ADDR_OFFSET..V4_ADDR_OFFSET + 4]);
                Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            Family::V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[V6_ADDR_OFFSET..V6_ADDR_OFFSET + 16]);
                let flow = be_u32(payload, V6_FLOW_OFFSET);
                let scope = be_u32(payload, V6_SCOPE_OFFSET);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flow,
                    scope,
                )))
            }
        }
    }

    /// True for an ICMP(v6) time / hop limit exceeded in transit
    pub fn is_time_exceeded(self, origin: Origin, icmp_type: u8, icmp_code: u8) -> bool {
        match (self, origin) {
            (Family::V4, Origin::Icmp) => {
                icmp_type == IcmpTypes::TimeExceeded.0
                    && icmp_code == IcmpCodes::TimeToLiveExceededInTransit.0
            }
            (Family::V6, Origin::Icmp6) => {
                icmp_type == Icmpv6Types::TimeExceeded.0 && icmp_code == ICMPV6_EXC_HOPLIMIT
            }
            _ => false,
        }
    }

    /// Final destination match. Ports are never compared.
    pub fn same_endpoint(self, destination: &SocketAddr, peer: &SocketAddr) -> bool {
        match (self, destination, peer) {
            (Family::V4, SocketAddr::V4(dest), SocketAddr::V4(peer)) => dest.ip() == peer.ip(),
            (Family::V6, SocketAddr::V6(dest), SocketAddr::V6(peer)) => {
                dest.ip() == peer.ip()
                    && dest.flowinfo() == peer.flowinfo()
                    && dest.scope_id() == peer.scope_id()
            }
            _ => false,
        }
    }
}

fn be_u32(payload: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ])
}
