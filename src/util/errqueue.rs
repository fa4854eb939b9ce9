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

//! Decoding of the kernel's socket error queue.
//!
//! With `IP_RECVERR` / `IPV6_RECVERR` enabled, ICMP errors caused by our probes
//! are queued on the socket and handed out by `recvmsg(MSG_ERRQUEUE)` as a
//! control message holding a `struct sock_extended_err` followed by the
//! address of the node that sent the error.

use crate::util::family::Family;
use socket2::Socket;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use tracing::trace;

/// Size of the fixed extended error header
const HEADER_LEN: usize = 16;

const BUFFER_SIZE: usize = 128;
const ANCDATA_SIZE: usize = 512;

/// Where an extended error was generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// `SO_EE_ORIGIN_NONE`
    Unspecified,
    /// Local network stack
    Local,
    /// Remote ICMPv4 message
    Icmp,
    /// Remote ICMPv6 message
    Icmp6,
    Other(u8),
}

impl From<u8> for Origin {
    fn from(value: u8) -> Self {
        match value {
            0 => Origin::Unspecified,
            1 => Origin::Local,
            2 => Origin::Icmp,
            3 => Origin::Icmp6,
            other => Origin::Other(other),
        }
    }
}

impl From<Origin> for u8 {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Unspecified => 0,
            Origin::Local => 1,
            Origin::Icmp => 2,
            Origin::Icmp6 => 3,
            Origin::Other(other) => other,
        }
    }
}

/// One decoded entry of the socket error queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedError {
    /// Error number reported by the kernel
    pub errno: i32,
    pub origin: Origin,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub info: u32,
    pub data: u32,
    /// Node that sent the error. For IPv6 the scope id slot carries the raw
    /// 32-bit field found after the address.
    pub sender: SocketAddr,
    family: Family,
}

impl ExtendedError {
    pub fn family(&self) -> Family {
        self.family
    }

    /// Sender address, or `None` when the kernel did not report one
    pub fn offender(&self) -> Option<SocketAddr> {
        if self.sender.ip().is_unspecified() {
            None
        } else {
            Some(self.sender)
        }
    }

    pub fn is_time_exceeded(&self) -> bool {
        self.family
            .is_time_exceeded(self.origin, self.icmp_type, self.icmp_code)
    }
}

/// Decodes one control message.
///
/// Returns `None` for control messages that are not extended errors, and for
/// payloads too short to hold one.
pub fn decode(level: i32, kind: i32, payload: &[u8]) -> Option<ExtendedError> {
    let family = Family::from_cmsg(level, kind)?;
    if payload.len() < HEADER_LEN {
        return None;
    }
    let sender = family.decode_sender(payload)?;

    let errno = u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let info = u32::from_ne_bytes([payload[8], payload[9], payload[10], payload[11]]);
    let data = u32::from_ne_bytes([payload[12], payload[13], payload[14], payload[15]]);

    Some(ExtendedError {
        errno: errno as i32,
        origin: Origin::from(payload[4]),
        icmp_type: payload[5],
        icmp_code: payload[6],
        info,
        data,
        sender,
        family,
    })
}

/// What an extended error tells us about the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Says nothing about this hop; look at the next queued error
    Inconclusive,
    /// A router dropped the probe because its TTL ran out
    TimeExceeded,
    /// Host or network unreachable
    Unreachable,
    /// Blocked locally; the trace should stop
    PermissionDenied,
    /// The destination rejected the probe
    Refused,
    /// Any other error
    Other,
}

impl Classification {
    /// Whether the probe produced usable path information.
    ///
    /// Unlisted errors count as a discovered hop unless `strict` is set,
    /// since most destination unreachable codes come from the last hop.
    pub fn is_success(self, strict: bool) -> bool {
        match self {
            Classification::TimeExceeded | Classification::Refused => true,
            Classification::Other => !strict,
            Classification::Inconclusive
            | Classification::Unreachable
            | Classification::PermissionDenied => false,
        }
    }
}

pub fn classify(error: &ExtendedError) -> Classification {
    match error.errno {
        libc::ETIMEDOUT | libc::EMSGSIZE => Classification::Inconclusive,
        libc::EHOSTUNREACH if error.is_time_exceeded() => Classification::TimeExceeded,
        libc::EHOSTUNREACH | libc::ENETUNREACH => Classification::Unreachable,
        libc::EACCES => Classification::PermissionDenied,
        libc::ECONNREFUSED => Classification::Refused,
        _ => Classification::Other,
    }
}

/// Reads one entry from the socket error queue without blocking.
///
/// `Ok(None)` means an entry was read but none of its control messages
/// decoded. An empty queue surfaces as `WouldBlock`.
pub(crate) fn recv_queued_error(socket: &Socket) -> io::Result<Option<ExtendedError>> {
    let mut buf = [0u8; BUFFER_SIZE];
    // u64 storage keeps the control buffer aligned for cmsghdr
    let mut control = [0u64; ANCDATA_SIZE / 8];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let rc = unsafe {
        libc::recvmsg(
            socket.as_raw_fd(),
            &mut msg,
            libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        trace!("control data truncated");
    }

    let header_len = unsafe { libc::CMSG_LEN(0) } as usize;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let (level, kind, payload) = unsafe {
            let header = &*cmsg;
            let len = (header.cmsg_len as usize).saturating_sub(header_len);
            (
                header.cmsg_level,
                header.cmsg_type,
                std::slice::from_raw_parts(libc::CMSG_DATA(cmsg) as *const u8, len),
            )
        };
        trace!(cmsg_level = level, cmsg_type = kind, len = payload.len(), "control message");
        if let Some(error) = decode(level, kind, payload) {
            return Ok(Some(error));
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }
    Ok(None)
}
