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

use clap::Parser;
use std::process::ExitCode;
use tracepath::{Config, FamilyPreference, HopRecord, TraceOutcome, Tracepath, MAX_HOPS};
use tracing_subscriber::EnvFilter;

/// Trace the path to a host with plain UDP sockets.
#[derive(Parser, Debug)]
#[command(name = "tracepath", version)]
struct Args {
    /// Target hostname or IP address.
    hostname: String,

    /// Use IPv4.
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Use IPv6.
    #[arg(short = '6')]
    ipv6: bool,

    /// Maximum number of hops (TTL).
    #[arg(short = 'm', default_value_t = MAX_HOPS)]
    max_hops: u8,

    /// Maximum number of repeated probe fails. Defaults to the maximum number of hops.
    #[arg(short = 'M')]
    max_continuous_fails: Option<u32>,

    /// Timeout per probe in milliseconds.
    #[arg(short = 'w', default_value_t = 1000)]
    timeout: u64,

    /// Count unrecognised errors as failed hops.
    #[arg(long)]
    strict: bool,

    /// Print the trace as JSON once it is done.
    #[arg(long)]
    json: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn to_config(&self) -> Config {
        let family = if self.ipv4 {
            FamilyPreference::V4
        } else if self.ipv6 {
            FamilyPreference::V6
        } else {
            FamilyPreference::Auto
        };
        let mut config = Config::default()
            .with_family(family)
            .with_max_hops(self.max_hops)
            .with_timeout(self.timeout)
            .with_strict_errors(self.strict);
        if let Some(fails) = self.max_continuous_fails {
            config = config.with_max_continuous_fails(fails);
        }
        config
    }
}

fn display_hop(hop: &HopRecord) {
    let peer = hop
        .peer
        .map(|peer| peer.ip().to_string())
        .unwrap_or_else(|| "*".to_string());
    let latency = hop
        .latency
        .map(|latency| format!("{:.3}", latency.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| "*".to_string());
    println!("{:3}: {:30}: {:>10} ms: [{}]", hop.ttl, peer, latency, hop.errno);
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut tracepath = match Tracepath::new(&args.hostname, args.to_config()) {
        Ok(tracepath) => tracepath,
        Err(e) => {
            eprintln!("tracepath: {}", e);
            return ExitCode::from(2);
        }
    };
    tracing::info!(destination = %tracepath.destination(), "starting trace");

    let outcome = if args.json {
        let trace = tracepath.perform_tracepath();
        match serde_json::to_string_pretty(&trace) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("tracepath: failed to serialize trace: {}", e);
                return ExitCode::FAILURE;
            }
        }
        trace.outcome
    } else {
        let outcome = tracepath.run(display_hop);
        println!("{}: {}", tracepath.destination(), outcome);
        outcome
    };

    if outcome == TraceOutcome::Reached {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
