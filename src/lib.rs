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

//! # tracepath
//! `tracepath` discovers the path to a host and measures per-hop latency
//! without raw sockets or elevated privileges.
//!
//! ## How it works
//! Empty UDP datagrams are sent with an increasing TTL (hop limit for IPv6).
//! Routers that drop a probe answer with ICMP Time Exceeded, and the kernel
//! queues those errors on the sending socket (`IP_RECVERR` / `IPV6_RECVERR`).
//! Reading the error queue tells us who answered and why, so a plain
//! `SOCK_DGRAM` socket is enough. This makes the library Linux-only.
//!
//! The library allows to configure the following parameters:
//! - Address family (auto, IPv4, IPv6)
//! - Maximum number of hops
//! - Maximum number of consecutive failed hops
//! - Timeout per probe (in _ms_)
//! - Range the first destination port is drawn from
//! - Strict error classification
//!
//! ## Example
//!
//! ### Tracepath with default configuration:
//!
//! ```rust,no_run
//! use tracepath::{Config, Tracepath};
//!
//! let tracepath = Tracepath::new("example.com", Config::default()).unwrap();
//!
//! for hop in tracepath {
//!     match (hop.peer, hop.latency) {
//!         (Some(peer), Some(latency)) => println!("{} \t{} \t{:?}", hop.ttl, peer.ip(), latency),
//!         (Some(peer), None) => println!("{} \t{} \t[{}]", hop.ttl, peer.ip(), hop.errno),
//!         _ => println!("{} \t*", hop.ttl),
//!     }
//! }
//! ```
//!
//! ### Tracepath with custom configuration:
//!
//! ```rust,no_run
//! use tracepath::{Config, FamilyPreference, TraceOutcome, Tracepath};
//!
//! let mut tracepath = Tracepath::new("example.com", Config::default()
//!     .with_family(FamilyPreference::V6)
//!     .with_max_hops(20)
//!     .with_max_continuous_fails(5)
//!     .with_timeout(500)).unwrap();
//!
//! // Hops are handed to the sink as soon as they are probed
//! let outcome = tracepath.run(|hop| println!("{:?}", hop));
//!
//! if outcome == TraceOutcome::Reached {
//!     let last = tracepath.farthest_point().unwrap();
//!     println!("reached in {} hops", last.ttl);
//! }
//! ```

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("tracepath relies on the Linux socket error queue");

pub mod error;
pub mod resolve;
/// Probe socket, error queue decoding and per-family details
pub mod util;

pub use crate::error::{Result, TracepathError};
pub use crate::resolve::{resolve, Destination, FamilyPreference};
pub use crate::util::{Channel, ProbeOutcome, ProbeReport, Prober};

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::ops::Range;
use std::time::Duration;
use tracing::debug;

/// Default maximum number of hops
pub const MAX_HOPS: u8 = 30;
/// Destination port offsets start somewhere in this range
pub const PORT_RANGE: Range<u16> = 35000..40000;

/// Tracepath configurations
#[derive(Debug, Clone)]
pub struct Config {
    family: FamilyPreference,
    max_hops: u8,
    max_continuous_fails: Option<u32>,
    pub(crate) timeout: Duration,
    pub(crate) port_range: Range<u16>,
    pub(crate) strict_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            family: FamilyPreference::Auto,
            max_hops: MAX_HOPS,
            max_continuous_fails: None,
            timeout: Duration::from_secs(1),
            port_range: PORT_RANGE,
            strict_errors: false,
        }
    }
}

impl Config {
    /// Builder: Address family to resolve the destination to
    pub fn with_family(mut self, family: FamilyPreference) -> Self {
        self.family = family;
        self
    }

    /// Builder: Maximum number of hops
    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Builder: Stop after this many failed hops in a row. Defaults to the maximum number of hops
    pub fn with_max_continuous_fails(mut self, max_continuous_fails: u32) -> Self {
        self.max_continuous_fails = Some(max_continuous_fails);
        self
    }

    /// Builder: Timeout per probe (in ms)
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Duration::from_millis(timeout);
        self
    }

    /// Builder: Range the first destination port offset is drawn from.
    /// The offset grows by one with every probe sent
    pub fn with_port_range(mut self, port_range: Range<u16>) -> Self {
        self.port_range = port_range;
        self
    }

    /// Builder: Treat unrecognised errors from the error queue as failed hops
    pub fn with_strict_errors(mut self, strict_errors: bool) -> Self {
        self.strict_errors = strict_errors;
        self
    }

    pub fn family(&self) -> FamilyPreference {
        self.family
    }

    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }

    pub fn max_continuous_fails(&self) -> u32 {
        self.max_continuous_fails.unwrap_or(self.max_hops as u32)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_hops == 0 {
            return Err(TracepathError::InvalidConfig("maximum number of hops must be at least 1".into()));
        }
        if self.max_continuous_fails() == 0 {
            return Err(TracepathError::InvalidConfig(
                "maximum number of continuous fails must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TracepathError::InvalidConfig("timeout must not be zero".into()));
        }
        if self.port_range.is_empty() {
            return Err(TracepathError::InvalidConfig(format!("empty port range {:?}", self.port_range)));
        }
        // Every probe of the trace needs its own port offset
        if self.port_range.end as u32 + self.max_hops as u32 > u16::MAX as u32 + 1 {
            return Err(TracepathError::InvalidConfig(format!(
                "port range {:?} leaves no room for {} probes",
                self.port_range, self.max_hops
            )));
        }
        Ok(())
    }
}

/// Result of probing a single TTL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HopRecord {
    /// Time-To-Live of the probe, starting at 1
    pub ttl: u8,
    /// Node that answered, `None` if nobody did
    pub peer: Option<SocketAddr>,
    /// Round-Trip Time, only present for hops that told us something
    #[serde(rename = "latency_ns", serialize_with = "serialize_nanos")]
    pub latency: Option<Duration>,
    /// Last error number observed, 0 if none
    pub errno: i32,
}

impl HopRecord {
    /// Round-Trip Time in nanoseconds
    pub fn latency_nanos(&self) -> Option<u128> {
        self.latency.map(|latency| latency.as_nanos())
    }
}

fn serialize_nanos<S: Serializer>(latency: &Option<Duration>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match latency {
        Some(latency) => serializer.serialize_u64(latency.as_nanos() as u64),
        None => serializer.serialize_none(),
    }
}

/// Why a trace stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    /// A hop answered from the destination address
    Reached,
    /// Too many hops in a row failed
    FailureCeiling,
    /// Probing was blocked locally
    PermissionDenied,
    /// Ran out of hops
    MaxHopsExhausted,
}

impl fmt::Display for TraceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceOutcome::Reached => write!(f, "reached"),
            TraceOutcome::FailureCeiling => write!(f, "too many consecutive failures"),
            TraceOutcome::PermissionDenied => write!(f, "permission denied"),
            TraceOutcome::MaxHopsExhausted => write!(f, "maximum number of hops reached"),
        }
    }
}

/// Complete hop history of a finished trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trace {
    pub history: Vec<HopRecord>,
    pub outcome: TraceOutcome,
}

/// Tracepath instance containing destination address and configurations
pub struct Tracepath<P = Channel> {
    destination: Destination,
    config: Config,
    prober: P,
    history: Vec<HopRecord>,
    fail_count: u32,
    latency: Option<Duration>,
    outcome: Option<TraceOutcome>,
}

impl Tracepath<Channel> {
    /// Resolves the destination and opens the probe socket.
    /// Nothing is sent until the first hop is requested
    pub fn new(host: &str, config: Config) -> Result<Self> {
        config.validate()?;
        let destination = resolve(host, config.family)?;
        let channel = Channel::open(&destination, &config)?;
        Ok(Tracepath::with_prober(destination, config, channel))
    }
}

impl<P: Prober> Tracepath<P> {
    /// Creates a Tracepath driving a custom prober
    pub fn with_prober(destination: Destination, config: Config, prober: P) -> Self {
        Tracepath {
            destination,
            config,
            prober,
            history: Vec::new(),
            fail_count: 0,
            latency: None,
            outcome: None,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Hops probed so far, in TTL order
    pub fn history(&self) -> &[HopRecord] {
        &self.history
    }

    /// Why the trace stopped, `None` while it is still running
    pub fn outcome(&self) -> Option<TraceOutcome> {
        self.outcome
    }

    /// Latency of the most recent hop that told us something
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Last hop somebody answered from
    pub fn farthest_point(&self) -> Option<&HopRecord> {
        self.history.iter().rev().find(|hop| hop.peer.is_some())
    }

    /// Probes every remaining hop, handing each one to `sink` as it completes
    pub fn run<F: FnMut(&HopRecord)>(&mut self, mut sink: F) -> TraceOutcome {
        while let Some(hop) = self.next() {
            sink(&hop);
        }
        // next() only returns None once an outcome is set
        self.outcome.unwrap_or(TraceOutcome::MaxHopsExhausted)
    }

    /// Returns the complete trace
    pub fn perform_tracepath(&mut self) -> Trace {
        let outcome = self.run(|_| {});
        Trace {
            history: self.history.clone(),
            outcome,
        }
    }

    /// Probes the next TTL and records the hop
    fn probe_next_hop(&mut self) -> HopRecord {
        let ttl = self.history.len() as u8 + 1;
        let report = self.prober.probe(ttl);

        let latency = if report.success {
            self.fail_count = 0;
            self.latency = report.latency;
            report.latency
        } else {
            self.fail_count += 1;
            None
        };

        let hop = HopRecord {
            ttl,
            peer: report.peer,
            latency,
            errno: report.errno,
        };
        self.history.push(hop.clone());
        self.outcome = self.check_stop(&hop);
        hop
    }

    fn check_stop(&self, hop: &HopRecord) -> Option<TraceOutcome> {
        if self.fail_count >= self.config.max_continuous_fails() {
            debug!(fails = self.fail_count, "continuous failure");
            return Some(TraceOutcome::FailureCeiling);
        }
        if hop.peer.map_or(false, |peer| self.destination.is_reached_by(&peer)) {
            debug!(ttl = hop.ttl, "reached");
            return Some(TraceOutcome::Reached);
        }
        if hop.errno == libc::EACCES {
            debug!(ttl = hop.ttl, "permission denied");
            return Some(TraceOutcome::PermissionDenied);
        }
        if hop.ttl >= self.config.max_hops {
            debug!(ttl = hop.ttl, "maximum number of hops reached");
            return Some(TraceOutcome::MaxHopsExhausted);
        }
        None
    }
}

impl<P: Prober> Iterator for Tracepath<P> {
    type Item = HopRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outcome.is_some() {
            return None;
        }
        Some(self.probe_next_hop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};

    /// Replays canned reports and remembers the TTLs it was asked for
    struct ScriptedProber {
        reports: VecDeque<ProbeReport>,
        ttls: Vec<u8>,
    }

    impl ScriptedProber {
        fn new(reports: Vec<ProbeReport>) -> Self {
            ScriptedProber {
                reports: reports.into(),
                ttls: Vec::new(),
            }
        }
    }

    impl Prober for ScriptedProber {
        fn probe(&mut self, ttl: u8) -> ProbeReport {
            self.ttls.push(ttl);
            self.reports.pop_front().unwrap_or_else(|| ProbeReport::timed_out(0))
        }
    }

    fn hop(peer: SocketAddr, latency_ms: u64, errno: i32) -> ProbeReport {
        ProbeReport {
            outcome: ProbeOutcome::QueuedError,
            success: true,
            peer: Some(peer),
            latency: Some(Duration::from_millis(latency_ms)),
            errno,
        }
    }

    fn failed(peer: Option<SocketAddr>, errno: i32) -> ProbeReport {
        ProbeReport {
            outcome: ProbeOutcome::QueuedError,
            success: false,
            peer,
            latency: Some(Duration::from_millis(3)),
            errno,
        }
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(a, b, c, d), 0))
    }

    fn destination() -> Destination {
        Destination::new("target", v4(192, 0, 2, 1))
    }

    fn tracepath(config: Config, reports: Vec<ProbeReport>) -> Tracepath<ScriptedProber> {
        Tracepath::with_prober(destination(), config, ScriptedProber::new(reports))
    }

    #[test]
    fn test_reaches_destination() {
        let mut tracepath = tracepath(
            Config::default(),
            vec![
                hop(v4(10, 0, 0, 1), 1, libc::EHOSTUNREACH),
                hop(v4(10, 0, 1, 1), 5, libc::EHOSTUNREACH),
                hop(v4(192, 0, 2, 1), 9, libc::ECONNREFUSED),
            ],
        );

        let mut seen = Vec::new();
        let outcome = tracepath.run(|hop| seen.push(hop.clone()));

        assert_eq!(outcome, TraceOutcome::Reached);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen, tracepath.history());
        assert_eq!(tracepath.prober.ttls, vec![1, 2, 3]);

        let last = &tracepath.history()[2];
        assert_eq!(last.peer, Some(v4(192, 0, 2, 1)));
        assert_eq!(last.errno, libc::ECONNREFUSED);
        assert_eq!(last.latency, Some(Duration::from_millis(9)));
        assert_ne!(tracepath.history()[0].peer, tracepath.history()[1].peer);
        assert_eq!(tracepath.latency(), Some(Duration::from_millis(9)));
        assert_eq!(tracepath.farthest_point(), Some(last));
    }

    #[test]
    fn test_stops_at_failure_ceiling() {
        let mut tracepath = tracepath(Config::default().with_max_continuous_fails(5), Vec::new());
        let trace = tracepath.perform_tracepath();

        assert_eq!(trace.outcome, TraceOutcome::FailureCeiling);
        assert_eq!(trace.history.len(), 5);
        for (i, hop) in trace.history.iter().enumerate() {
            assert_eq!(hop.ttl as usize, i + 1);
            assert_eq!(hop.peer, None);
            assert_eq!(hop.latency, None);
        }
        assert_eq!(tracepath.farthest_point(), None);
    }

    #[test]
    fn test_failure_ceiling_defaults_to_max_hops() {
        let config = Config::default().with_max_hops(7);
        assert_eq!(config.max_continuous_fails(), 7);
        let trace = tracepath(config, Vec::new()).perform_tracepath();
        assert_eq!(trace.history.len(), 7);
        assert_eq!(trace.outcome, TraceOutcome::FailureCeiling);
    }

    #[test]
    fn test_success_resets_fail_count() {
        let config = Config::default().with_max_continuous_fails(2);
        let trace = tracepath(
            config,
            vec![
                failed(None, 0),
                hop(v4(10, 0, 0, 2), 2, libc::EHOSTUNREACH),
                failed(None, 0),
                hop(v4(10, 0, 0, 4), 4, libc::EHOSTUNREACH),
                failed(None, 0),
                failed(None, 0),
            ],
        )
        .perform_tracepath();

        assert_eq!(trace.history.len(), 6);
        assert_eq!(trace.outcome, TraceOutcome::FailureCeiling);
        assert_eq!(trace.history[3].peer, Some(v4(10, 0, 0, 4)));
    }

    #[test]
    fn test_permission_denied_stops() {
        let trace = tracepath(Config::default(), vec![failed(Some(v4(10, 0, 0, 1)), libc::EACCES)])
            .perform_tracepath();

        assert_eq!(trace.outcome, TraceOutcome::PermissionDenied);
        assert_eq!(trace.history.len(), 1);
        assert_eq!(trace.history[0].errno, libc::EACCES);
        assert_eq!(trace.history[0].latency, None);
    }

    #[test]
    fn test_max_hops_exhausted() {
        let reports = (1..=10).map(|i| hop(v4(10, 0, 0, i), i as u64, libc::EHOSTUNREACH)).collect();
        let mut tracepath = tracepath(Config::default().with_max_hops(4), reports);
        let trace = tracepath.perform_tracepath();

        assert_eq!(trace.outcome, TraceOutcome::MaxHopsExhausted);
        let ttls: Vec<u8> = trace.history.iter().map(|hop| hop.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3, 4]);
        assert_eq!(tracepath.next(), None);
        assert_eq!(tracepath.prober.ttls.len(), 4);
    }

    #[test]
    fn test_failed_hop_from_destination_still_completes() {
        // An unreachable reported by the destination itself ends the trace
        let trace = tracepath(Config::default(), vec![failed(Some(v4(192, 0, 2, 1)), libc::EHOSTUNREACH)])
            .perform_tracepath();
        assert_eq!(trace.outcome, TraceOutcome::Reached);
        assert_eq!(trace.history[0].latency, None);
    }

    #[test]
    fn test_refused_from_other_address_does_not_complete() {
        let trace = tracepath(
            Config::default().with_max_hops(3),
            vec![
                hop(v4(192, 0, 2, 2), 1, libc::ECONNREFUSED),
                hop(v4(192, 0, 2, 2), 1, libc::ECONNREFUSED),
                hop(v4(192, 0, 2, 2), 1, libc::ECONNREFUSED),
            ],
        )
        .perform_tracepath();
        assert_eq!(trace.outcome, TraceOutcome::MaxHopsExhausted);
        assert_eq!(trace.history.len(), 3);
    }

    #[test]
    fn test_v6_destination_requires_exact_match() {
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let destination = Destination::new("v6", SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 0)));
        let reports = vec![
            hop(SocketAddr::V6(SocketAddrV6::new(ip, 0, 1, 0)), 1, libc::ECONNREFUSED),
            hop(SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 5)), 1, libc::ECONNREFUSED),
            hop(SocketAddr::V6(SocketAddrV6::new(ip, 40000, 0, 0)), 1, libc::ECONNREFUSED),
        ];
        let mut tracepath = Tracepath::with_prober(destination, Config::default(), ScriptedProber::new(reports));
        let trace = tracepath.perform_tracepath();

        assert_eq!(trace.outcome, TraceOutcome::Reached);
        assert_eq!(trace.history.len(), 3);
    }

    #[test]
    fn test_iterator_yields_hops_lazily() {
        let mut tracepath = tracepath(
            Config::default(),
            vec![hop(v4(10, 0, 0, 1), 1, libc::EHOSTUNREACH), hop(v4(192, 0, 2, 1), 2, libc::ECONNREFUSED)],
        );
        let first = tracepath.next().unwrap();
        assert_eq!(first.ttl, 1);
        assert_eq!(tracepath.outcome(), None);
        assert_eq!(tracepath.prober.ttls, vec![1]);

        let rest: Vec<HopRecord> = tracepath.by_ref().collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(tracepath.outcome(), Some(TraceOutcome::Reached));
    }

    #[test]
    fn test_unresolvable_destination_never_probes() {
        let err = Tracepath::new("no-such-host.invalid", Config::default()).err().unwrap();
        assert!(err.is_resolution_failure());
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::default().with_max_hops(0).validate().is_err());
        assert!(Config::default().with_max_continuous_fails(0).validate().is_err());
        assert!(Config::default().with_timeout(0).validate().is_err());
        assert!(Config::default().with_port_range(100..100).validate().is_err());
        assert!(Config::default().with_port_range(65500..65530).validate().is_err());
        assert!(Config::default().with_port_range(65000..65500).validate().is_ok());

        let err = Tracepath::new("127.0.0.1", Config::default().with_max_hops(0)).err().unwrap();
        assert!(matches!(err, TracepathError::InvalidConfig(_)));
    }

    #[test]
    fn test_hop_record_json() {
        let record = HopRecord {
            ttl: 2,
            peer: Some("10.0.0.1:0".parse().unwrap()),
            latency: Some(Duration::from_micros(1500)),
            errno: libc::EHOSTUNREACH,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ttl"], 2);
        assert_eq!(json["peer"], "10.0.0.1:0");
        assert_eq!(json["latency_ns"], 1_500_000);
        assert_eq!(record.latency_nanos(), Some(1_500_000));

        let json = serde_json::to_value(&TraceOutcome::FailureCeiling).unwrap();
        assert_eq!(json, "failure_ceiling");
    }
}
