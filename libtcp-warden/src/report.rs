use crate::flow::TcpFlow;
use crate::seq::Seq;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Sink for attack observations.
///
/// The state machine only decides *that* something is reported; the
/// sink owns the output format and its resources.
pub trait AttackReporter {
    /// An adversary raced a duplicate SYN+ACK at the expected
    /// acknowledgement point.
    fn report_hijack(&mut self, instant: OffsetDateTime, flow: &TcpFlow);

    /// A segment overlapped previously observed stream bytes with
    /// different content. `attempt` is the full incoming payload,
    /// `overlap` the contradicted bytes from history, and
    /// `overlap_start`/`overlap_end` the offsets of the compared region
    /// inside `attempt`.
    #[allow(clippy::too_many_arguments)]
    fn report_injection(
        &mut self,
        instant: OffsetDateTime,
        flow: &TcpFlow,
        attempt: &[u8],
        overlap: &[u8],
        start: Seq,
        end: Seq,
        overlap_start: usize,
        overlap_end: usize,
    );

    /// Flush and release output resources. Safe to call more than once.
    fn close(&mut self) -> io::Result<()>;
}

/// One serialized attack observation.
#[derive(Debug, Serialize)]
pub struct AttackReport {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub flow: String,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap_end: Option<usize>,
}

/// Writes line-delimited JSON attack reports to
/// `<flow>.attackreport.json` in the output directory.
///
/// Byte blobs are base64-encoded here; the state machine hands over raw
/// bytes.
pub struct JsonReportLogger {
    w: BufWriter<std::fs::File>,
}

impl JsonReportLogger {
    pub fn create(dir: &str, flow: &TcpFlow) -> io::Result<Self> {
        let mut path = PathBuf::from(dir);
        path.push(format!("{}.attackreport.json", flow));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonReportLogger {
            w: BufWriter::new(file),
        })
    }

    fn publish(&mut self, report: &AttackReport) -> io::Result<()> {
        debug!("publishing TCP attack report for flow {}", report.flow);
        serde_json::to_writer(&mut self.w, report)?;
        self.w.write_all(b"\n")
    }

    fn format_instant(instant: OffsetDateTime) -> String {
        instant
            .format(&Rfc3339)
            .unwrap_or_else(|_| instant.unix_timestamp().to_string())
    }
}

impl AttackReporter for JsonReportLogger {
    fn report_hijack(&mut self, instant: OffsetDateTime, flow: &TcpFlow) {
        let report = AttackReport {
            kind: "hijack",
            flow: flow.to_string(),
            time: Self::format_instant(instant),
            payload: None,
            overlap: None,
            start_sequence: None,
            end_sequence: None,
            overlap_start: None,
            overlap_end: None,
        };
        if let Err(e) = self.publish(&report) {
            warn!("failed to write hijack report for {}: {}", flow, e);
        }
    }

    fn report_injection(
        &mut self,
        instant: OffsetDateTime,
        flow: &TcpFlow,
        attempt: &[u8],
        overlap: &[u8],
        start: Seq,
        end: Seq,
        overlap_start: usize,
        overlap_end: usize,
    ) {
        let report = AttackReport {
            kind: "injection",
            flow: flow.to_string(),
            time: Self::format_instant(instant),
            payload: Some(base64::encode(attempt)),
            overlap: Some(base64::encode(overlap)),
            start_sequence: Some(start.0),
            end_sequence: Some(end.0),
            overlap_start: Some(overlap_start),
            overlap_end: Some(overlap_end),
        };
        if let Err(e) = self.publish(&report) {
            warn!("failed to write injection report for {}: {}", flow, e);
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}
