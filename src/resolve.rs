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

use crate::error::{Result, TracepathError};
use crate::util::family::Family;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::debug;

/// Address family to trace over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyPreference {
    /// Whatever the resolver returns first
    #[default]
    Auto,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

impl FamilyPreference {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            FamilyPreference::Auto => true,
            FamilyPreference::V4 => addr.is_ipv4(),
            FamilyPreference::V6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for FamilyPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyPreference::Auto => write!(f, "IP"),
            FamilyPreference::V4 => write!(f, "IPv4"),
            FamilyPreference::V6 => write!(f, "IPv6"),
        }
    }
}

/// Resolved trace destination. Probes go to `addr` with the port offset added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    host: String,
    addr: SocketAddr,
}

impl Destination {
    /// Builds a destination from an already known socket address
    pub fn new(host: impl Into<String>, addr: SocketAddr) -> Self {
        Destination { host: host.into(), addr }
    }

    /// Host as given by the caller
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Concrete socket address, including flow info and scope id for IPv6
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// Checks whether `peer` is this destination.
    ///
    /// IPv4 compares the address only. IPv6 also requires flow info and
    /// scope id to match.
    pub fn is_reached_by(&self, peer: &SocketAddr) -> bool {
        self.family().same_endpoint(&self.addr, peer)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host, self.addr.ip())
    }
}

/// Resolves a hostname or address literal with the system resolver.
pub fn resolve(host: &str, preference: FamilyPreference) -> Result<Destination> {
    let host = host.trim();
    if host.is_empty() {
        return Err(TracepathError::EmptyHost);
    }

    let candidates = (host, 0)
        .to_socket_addrs()
        .map_err(|source| TracepathError::Resolve {
            host: host.to_string(),
            source,
        })?;

    let addr = candidates
        .into_iter()
        .find(|addr| preference.accepts(addr))
        .ok_or_else(|| TracepathError::NoAddress {
            host: host.to_string(),
            family: preference,
        })?;

    debug!(host, %addr, "resolved destination");
    Ok(Destination::new(host, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};

    #[test]
    fn test_resolve_literals() {
        let dest = resolve("192.0.2.7", FamilyPreference::Auto).unwrap();
        assert_eq!(dest.addr(), "192.0.2.7:0".parse::<SocketAddr>().unwrap());
        assert_eq!(dest.family(), Family::V4);
        assert_eq!(dest.host(), "192.0.2.7");

        let dest = resolve("2001:db8::1", FamilyPreference::V6).unwrap();
        assert_eq!(dest.addr().ip(), "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dest.family(), Family::V6);
    }

    #[test]
    fn test_resolve_family_mismatch() {
        let err = resolve("192.0.2.7", FamilyPreference::V6).unwrap_err();
        assert!(matches!(err, TracepathError::NoAddress { family: FamilyPreference::V6, .. }));

        let err = resolve("2001:db8::1", FamilyPreference::V4).unwrap_err();
        assert!(matches!(err, TracepathError::NoAddress { family: FamilyPreference::V4, .. }));
    }

    #[test]
    fn test_resolve_empty() {
        assert!(matches!(
            resolve("  ", FamilyPreference::Auto),
            Err(TracepathError::EmptyHost)
        ));
    }

    #[test]
    fn test_resolve_unresolvable() {
        // .invalid is reserved and never resolves
        let err = resolve("no-such-host.invalid", FamilyPreference::Auto).unwrap_err();
        assert!(err.is_resolution_failure());
    }

    #[test]
    fn test_is_reached_by_v4_ignores_port() {
        let dest = Destination::new("a", SocketAddr::from((Ipv4Addr::new(192, 0, 2, 7), 0)));
        assert!(dest.is_reached_by(&SocketAddr::from((Ipv4Addr::new(192, 0, 2, 7), 35001))));
        assert!(!dest.is_reached_by(&SocketAddr::from((Ipv4Addr::new(192, 0, 2, 8), 0))));
    }

    #[test]
    fn test_is_reached_by_v6_requires_flow_and_scope() {
        let ip: Ipv6Addr = "fe80::1".parse().unwrap();
        let dest = Destination::new("b", SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 2)));

        assert!(dest.is_reached_by(&SocketAddr::V6(SocketAddrV6::new(ip, 40000, 0, 2))));
        assert!(!dest.is_reached_by(&SocketAddr::V6(SocketAddrV6::new(ip, 0, 7, 2))));
        assert!(!dest.is_reached_by(&SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 3))));
        assert!(!dest.is_reached_by(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0))));
    }
}
