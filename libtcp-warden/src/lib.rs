//! Passive detection of in-band TCP attacks.
//!
//! Watches captured traffic and tracks every TCP connection through a
//! small finite state machine, reporting handshake hijack attempts
//! (duplicate SYN+ACK racing the expected acknowledgement) and data
//! injection (segments whose bytes contradict the recently observed
//! stream history of the opposite direction).

#[macro_use]
extern crate log;

mod analyzer;
mod connection;
mod flow;
mod manifest;
mod pcap_log;
mod reassembly;
mod report;
mod seq;
mod tracker;

pub use analyzer::TcpWarden;
pub use connection::{Connection, TcpState};
pub use flow::TcpFlow;
pub use manifest::PacketManifest;
pub use pcap_log::PcapLogger;
pub use reassembly::{Segment, SegmentRing};
pub use report::{AttackReport, AttackReporter, JsonReportLogger};
pub use seq::Seq;
pub use tracker::{ConnectionRef, ConnectionTracker};

/// Depth of each per-direction segment ring.
pub const MAX_CONN_PACKETS: usize = 40;

/// Packet-count window during which late duplicate SYN+ACK detection
/// still runs after a connection enters data transfer.
pub const FIRST_FEW_PACKETS: u64 = 12;
