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

//! Errors raised while setting up a trace.
//!
//! Everything that goes wrong *during* a trace is folded into the hop records;
//! only failures that prevent the first probe from being sent end up here.

use crate::resolve::FamilyPreference;
use thiserror::Error;

/// Setup error: the trace never started.
#[derive(Error, Debug)]
pub enum TracepathError {
    #[error("Destination must not be empty")]
    EmptyHost,

    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No {family} address found for {host}")]
    NoAddress {
        host: String,
        family: FamilyPreference,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to create socket: {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("Failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl TracepathError {
    /// Returns true if the destination could not be turned into an address.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            Self::EmptyHost | Self::Resolve { .. } | Self::NoAddress { .. }
        )
    }
}

/// Result type alias for setup operations.
pub type Result<T> = std::result::Result<T, TracepathError>;
