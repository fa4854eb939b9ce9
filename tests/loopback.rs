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

use std::net::{IpAddr, Ipv4Addr};
use tracepath::{Config, FamilyPreference, TraceOutcome, Tracepath, TracepathError};

#[test]
fn test_trace_to_loopback_reaches_in_one_hop() {
    let mut tracepath = Tracepath::new(
        "127.0.0.1",
        Config::default().with_family(FamilyPreference::V4).with_max_hops(5),
    )
    .unwrap();

    let mut streamed = Vec::new();
    let outcome = tracepath.run(|hop| streamed.push(hop.clone()));

    assert_eq!(outcome, TraceOutcome::Reached);
    assert_eq!(streamed.len(), 1);
    let hop = &streamed[0];
    assert_eq!(hop.ttl, 1);
    assert_eq!(hop.peer.map(|peer| peer.ip()), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert_eq!(hop.errno, libc::ECONNREFUSED);
    assert!(hop.latency.is_some());
    assert_eq!(tracepath.farthest_point(), Some(hop));
}

#[test]
fn test_setup_error_is_not_a_hop() {
    match Tracepath::new("no-such-host.invalid", Config::default()) {
        Err(err) => assert!(err.is_resolution_failure(), "unexpected error {}", err),
        Ok(_) => panic!("resolution should fail"),
    }
    match Tracepath::new("", Config::default()) {
        Err(TracepathError::EmptyHost) => {}
        other => panic!("unexpected result {:?}", other.err()),
    }
}
