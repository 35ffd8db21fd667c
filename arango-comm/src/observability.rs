//! Metrics recorded by this crate.
//!
//! No recorder is installed here, the application decides where metrics go.

use crate::config::ArangoProtocol;
use crate::host::HostDescription;
use metrics::{counter, histogram, Counter, Histogram};

pub(crate) fn request_latency(protocol: ArangoProtocol) -> Histogram {
    match protocol {
        ArangoProtocol::Vst => histogram!("arango_comm_request_latency_seconds", "protocol" => "vst"),
        ArangoProtocol::Http => {
            histogram!("arango_comm_request_latency_seconds", "protocol" => "http")
        }
    }
}

pub(crate) fn failed_requests(host: &HostDescription) -> Counter {
    counter!("arango_comm_failed_requests_count", "host" => host.to_string())
}

pub(crate) fn reconnections(host: &HostDescription) -> Counter {
    counter!("arango_comm_reconnections_count", "host" => host.to_string())
}

pub(crate) fn leader_changes() -> Counter {
    counter!("arango_comm_leader_changes_count")
}
