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

pub mod errqueue;
pub mod family;

use crate::error::{Result, TracepathError};
use crate::resolve::Destination;
use crate::Config;
use errqueue::{classify, recv_queued_error, Classification, ExtendedError};
use family::Family;
use rand::Rng;
use socket2::{Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Attempts at sending a single probe
pub const MAX_SENDTO_TRIES: usize = 3;
/// Upper bound on error queue reads per probe
pub const MAX_QUEUED_ERRORS: usize = 32;

const BUFFER_SIZE: usize = 128;

/// How a probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The destination answered with data
    Delivered,
    /// An entry was read from the socket error queue
    QueuedError,
    /// Nothing arrived in time
    TimedOut,
}

/// Everything a single probe found out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub outcome: ProbeOutcome,
    /// Whether the probe produced usable path information
    pub success: bool,
    /// Node that answered
    pub peer: Option<SocketAddr>,
    /// Time from sending until the answer was read
    pub latency: Option<Duration>,
    /// Last error number observed, 0 if none
    pub errno: i32,
}

impl ProbeReport {
    /// Nothing came back: no peer, no latency
    pub fn timed_out(errno: i32) -> Self {
        ProbeReport {
            outcome: ProbeOutcome::TimedOut,
            success: false,
            peer: None,
            latency: None,
            errno,
        }
    }
}

/// Sends one probe per TTL and reports what came back
pub trait Prober {
    fn probe(&mut self, ttl: u8) -> ProbeReport;
}

/// UDP socket probing a single destination
pub struct Channel {
    socket: Socket,
    destination: SocketAddr,
    family: Family,
    port: u16,
    timeout: Duration,
    strict: bool,
}

impl Channel {
    /// Opens a UDP socket for the destination's family with the error queue enabled
    pub fn open(destination: &Destination, config: &Config) -> Result<Self> {
        config.validate()?;
        let family = destination.family();
        let socket = Socket::new(family.domain(), Type::DGRAM, Some(Protocol::UDP))
            .map_err(TracepathError::SocketCreation)?;
        family
            .enable_recverr(&socket)
            .map_err(|source| TracepathError::SocketOption {
                option: match family {
                    Family::V4 => "IP_RECVERR",
                    Family::V6 => "IPV6_RECVERR",
                },
                source,
            })?;

        let port = rand::thread_rng().gen_range(config.port_range.clone());
        debug!(destination = %destination.addr(), port, "opened probe socket");

        Ok(Channel {
            socket,
            destination: destination.addr(),
            family,
            port,
            timeout: config.timeout,
            strict: config.strict_errors,
        })
    }

    /// Port offset the next probe will use
    pub fn port(&self) -> u16 {
        self.port
    }

    fn send(&mut self) -> io::Result<()> {
        let target = SockAddr::from(self.family.probe_addr(&self.destination, self.port));
        let mut last_error = None;
        for attempt in 1..=MAX_SENDTO_TRIES {
            match self.socket.send_to(&[], &target) {
                Ok(_) => {
                    self.port = self.port.wrapping_add(1);
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "sendto failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::Other)))
    }

    /// Waits for the socket to become readable. Pending errors count as readable.
    fn wait_readable(&self) -> bool {
        let fd = self.socket.as_raw_fd();
        wait_until_ready(self.timeout, |timeout| {
            let mut fds = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds, 1, timeout) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(rc > 0)
        })
    }

    fn recv_direct(&self) -> io::Result<usize> {
        let mut buf = [MaybeUninit::<u8>::uninit(); BUFFER_SIZE];
        self.socket.recv_with_flags(&mut buf, libc::MSG_DONTWAIT)
    }

    /// Drains the error queue until an entry says something about this hop.
    fn recv_error(&self, start: Instant) -> ProbeReport {
        trace!("checking socket error queue");
        drain_error_queue(|| recv_queued_error(&self.socket), start, self.strict)
    }
}

/// Runs `poll` until it reports readiness or `timeout` has passed.
/// Interrupted waits resume with whatever time is left.
fn wait_until_ready<F>(timeout: Duration, mut poll: F) -> bool
where
    F: FnMut(libc::c_int) -> io::Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        match poll(millis) {
            Ok(ready) => return ready,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("poll interrupted");
            }
            Err(e) => {
                debug!(error = %e, "poll failed");
                return false;
            }
        }
    }
}

/// Reads queued errors from `next` until one is conclusive, the queue is
/// empty, or `MAX_QUEUED_ERRORS` entries have been skipped.
fn drain_error_queue<F>(mut next: F, start: Instant, strict: bool) -> ProbeReport
where
    F: FnMut() -> io::Result<Option<ExtendedError>>,
{
    for _ in 0..MAX_QUEUED_ERRORS {
        let error = match next() {
            Ok(Some(error)) => error,
            Ok(None) => {
                debug!("no extended error information");
                return ProbeReport {
                    outcome: ProbeOutcome::QueuedError,
                    success: false,
                    peer: None,
                    latency: Some(start.elapsed()),
                    errno: 0,
                };
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("error queue empty");
                return ProbeReport::timed_out(libc::EAGAIN);
            }
            Err(e) => {
                debug!(error = %e, "recvmsg failed");
                return ProbeReport {
                    outcome: ProbeOutcome::QueuedError,
                    success: false,
                    peer: None,
                    latency: None,
                    errno: e.raw_os_error().unwrap_or(0),
                };
            }
        };
        let latency = start.elapsed();

        let classification = classify(&error);
        debug!(
            errno = error.errno,
            origin = u8::from(error.origin),
            icmp_type = error.icmp_type,
            icmp_code = error.icmp_code,
            sender = %error.sender,
            ?classification,
            "extended error"
        );
        if classification == Classification::Inconclusive {
            continue;
        }

        return ProbeReport {
            outcome: ProbeOutcome::QueuedError,
            success: classification.is_success(strict),
            peer: error.offender(),
            latency: Some(latency),
            errno: error.errno,
        };
    }
    debug!(reads = MAX_QUEUED_ERRORS, "error queue did not drain");
    ProbeReport::timed_out(0)
}

impl Prober for Channel {
    fn probe(&mut self, ttl: u8) -> ProbeReport {
        debug!(destination = %self.destination, ttl, port = self.port, "probing");
        if let Err(e) = self.family.set_hop_limit(&self.socket, ttl) {
            warn!(ttl, error = %e, "failed to set hop limit");
            return ProbeReport::timed_out(e.raw_os_error().unwrap_or(0));
        }

        let start = Instant::now();
        if let Err(send_error) = self.send() {
            debug!(tries = MAX_SENDTO_TRIES, error = %send_error, "giving up on sendto");
            // The failure may have left ICMP details on the error queue
            let mut report = self.recv_error(start);
            if !report.success && report.peer.is_none() {
                report.errno = send_error.raw_os_error().unwrap_or(report.errno);
            }
            return report;
        }

        if !self.wait_readable() {
            debug!(ttl, "timed out");
            return ProbeReport::timed_out(0);
        }

        match self.recv_direct() {
            Ok(len) if len > 0 => {
                debug!(len, "data received");
                ProbeReport {
                    outcome: ProbeOutcome::Delivered,
                    success: true,
                    peer: Some(self.destination),
                    latency: Some(start.elapsed()),
                    errno: 0,
                }
            }
            Ok(_) => self.recv_error(start),
            Err(e) => {
                trace!(error = %e, "recv failed");
                self.recv_error(start)
            }
        }
    }
}
