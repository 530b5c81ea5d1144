use crate::flow::TcpFlow;
use crate::manifest::PacketManifest;
use crate::pcap_log::PcapLogger;
use crate::reassembly::{Segment, SegmentRing};
use crate::report::AttackReporter;
use crate::seq::Seq;
use crate::FIRST_FEW_PACKETS;
use libwarden_tools::Duration;
use time::OffsetDateTime;

/// Connection-level TCP states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TcpState {
    Listen,
    ConnectionRequest,
    ConnectionEstablished,
    DataTransfer,
    ConnectionClosing,
    Closed,
}

impl Default for TcpState {
    fn default() -> Self {
        TcpState::Listen
    }
}

/// Close-handshake sub-state, tracked per packet direction while the
/// connection is in `ConnectionClosing`.
///
/// The slot for a direction selects the handler for the next packet
/// arriving from that direction: the side that sent the FIN progresses
/// through the passive machine (`CloseWait` then `LastAck`), the other
/// side through the active machine (`FinWait1`, then `FinWait2` or
/// `Closing`, then `TimeWait`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CloseState {
    FinWait1,
    FinWait2,
    TimeWait,
    Closing,
    CloseWait,
    LastAck,
}

impl Default for CloseState {
    fn default() -> Self {
        CloseState::CloseWait
    }
}

/// Tracks client and server halves of one TCP connection through a
/// small finite state machine, watching for handshake hijack and for
/// segments whose bytes contradict already-observed stream history.
pub struct Connection {
    state: TcpState,
    client_flow: TcpFlow,
    server_flow: TcpFlow,
    /// Direction that initiated the close (carried the first FIN)
    closing_flow: TcpFlow,
    client_close_state: CloseState,
    server_close_state: CloseState,
    /// Next expected sequence number from the client
    client_next_seq: Seq,
    /// Next expected sequence number from the server
    server_next_seq: Seq,
    /// Acknowledgement value a legitimate SYN+ACK must carry; a
    /// duplicate match signals handshake hijack
    hijack_next_ack: Seq,
    packet_count: u64,
    /// Segments sent by the server
    client_ring: SegmentRing,
    /// Segments sent by the client
    server_ring: SegmentRing,
    anomalies: u64,
    reporter: Box<dyn AttackReporter>,
    packet_log: Option<PcapLogger>,
}

impl Connection {
    pub fn new(reporter: Box<dyn AttackReporter>, packet_log: Option<PcapLogger>) -> Self {
        Connection {
            state: TcpState::Listen,
            client_flow: TcpFlow::default(),
            server_flow: TcpFlow::default(),
            closing_flow: TcpFlow::default(),
            client_close_state: CloseState::default(),
            server_close_state: CloseState::default(),
            client_next_seq: Seq(0),
            server_next_seq: Seq(0),
            hijack_next_ack: Seq(0),
            packet_count: 0,
            client_ring: SegmentRing::new(),
            server_ring: SegmentRing::new(),
            anomalies: 0,
            reporter,
            packet_log,
        }
    }

    #[inline]
    pub fn state(&self) -> TcpState {
        self.state
    }

    #[inline]
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    #[inline]
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    #[inline]
    pub fn client_next_seq(&self) -> Seq {
        self.client_next_seq
    }

    #[inline]
    pub fn server_next_seq(&self) -> Seq {
        self.server_next_seq
    }

    /// Ring of segments sent by the server
    #[inline]
    pub fn client_ring(&self) -> &SegmentRing {
        &self.client_ring
    }

    /// Ring of segments sent by the client
    #[inline]
    pub fn server_ring(&self) -> &SegmentRing {
        &self.server_ring
    }

    /// Append the raw captured frame to this connection's packet log,
    /// if one is attached. A write failure disables further logging for
    /// this connection only.
    pub fn log_packet(&mut self, ts: Duration, frame: &[u8]) {
        if let Some(log) = &mut self.packet_log {
            if let Err(e) = log.write_packet(ts, frame) {
                warn!("packet log write failed for {}: {}", self.client_flow, e);
                self.packet_log = None;
            }
        }
    }

    /// Run the state machine over one parsed packet.
    pub fn receive(&mut self, p: &PacketManifest, flow: TcpFlow) {
        self.packet_count += 1;
        match self.state {
            TcpState::Listen => self.state_listen(p, flow),
            TcpState::ConnectionRequest => self.state_connection_request(p, flow),
            TcpState::ConnectionEstablished => self.state_connection_established(p, flow),
            TcpState::DataTransfer => self.state_data_transfer(p, flow),
            TcpState::ConnectionClosing => self.state_connection_closing(p, flow),
            TcpState::Closed => {
                self.anomaly("packet received on a closed connection");
            }
        }
    }

    /// Release reporter and packet log resources. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        if let Err(e) = self.reporter.close() {
            warn!("error closing attack reporter for {}: {}", self.client_flow, e);
        }
        if let Some(mut log) = self.packet_log.take() {
            if let Err(e) = log.close() {
                warn!("error closing packet log for {}: {}", self.client_flow, e);
            }
        }
    }

    fn anomaly(&mut self, desc: &str) {
        self.anomalies += 1;
        debug!("{}: protocol anomaly: {}", self.client_flow, desc);
    }

    /// Check for a duplicate SYN+ACK racing the handshake and report a
    /// hijack attempt on match.
    fn detect_hijack(&mut self, p: &PacketManifest, flow: TcpFlow) {
        if flow != self.server_flow {
            return;
        }
        if p.syn() && p.ack_flag() && p.ack.difference(self.hijack_next_ack) == 0 {
            self.reporter
                .report_hijack(OffsetDateTime::now_utc(), &flow);
        }
    }

    /// Check an out-of-window segment against the opposite direction's
    /// reassembly history and report an injection on byte mismatch.
    fn detect_injection(&mut self, p: &PacketManifest, flow: TcpFlow) {
        let ring = if flow == self.client_flow {
            &self.server_ring
        } else {
            &self.client_ring
        };
        let start = p.seq;
        let end = start.add(p.payload.len() as i32 - 1);
        let (head, tail) = match ring.find_overlap(start, end) {
            Some(range) => range,
            None => {
                debug!(
                    "suspected injection on flow {}: no ring segments with relevant data, \
                     no retrospective analysis possible",
                    flow
                );
                return;
            }
        };
        let (overlap, start_slice, end_slice) = ring.overlap_bytes(head, tail, start, end);
        if overlap != p.payload[start_slice..end_slice] {
            self.reporter.report_injection(
                OffsetDateTime::now_utc(),
                &flow,
                p.payload,
                &overlap,
                start,
                end,
                start_slice,
                end_slice,
            );
        } else {
            trace!("{}: segment retransmission matches history", flow);
        }
    }

    fn state_listen(&mut self, p: &PacketManifest, flow: TcpFlow) {
        if p.syn() && !p.ack_flag() {
            self.client_flow = flow;
            self.server_flow = flow.reverse();
            // a SYN may carry payload; the next expected sequence number
            // accounts for it plus the SYN itself
            self.client_next_seq = p.seq.add(p.payload.len() as i32 + 1);
            self.hijack_next_ack = self.client_next_seq;
            self.state = TcpState::ConnectionRequest;
        } else {
            self.anomaly("LISTEN: first packet is not a SYN");
        }
    }

    fn state_connection_request(&mut self, p: &PacketManifest, flow: TcpFlow) {
        if flow != self.server_flow {
            self.anomaly("SYN+ACK expected from the server side");
            return;
        }
        if !(p.syn() && p.ack_flag()) {
            self.anomaly("handshake reply without SYN+ACK");
            return;
        }
        if self.client_next_seq.difference(p.ack) != 0 {
            self.anomaly("SYN+ACK with wrong acknowledgement");
            return;
        }
        self.server_next_seq = p.seq.add(p.payload.len() as i32 + 1);
        self.state = TcpState::ConnectionEstablished;
    }

    fn state_connection_established(&mut self, p: &PacketManifest, flow: TcpFlow) {
        self.detect_hijack(p, flow);
        if flow != self.client_flow {
            self.anomaly("final handshake ACK expected from the client side");
            return;
        }
        if !p.ack_flag() || p.syn() {
            self.anomaly("final handshake packet is not a plain ACK");
            return;
        }
        if p.seq.difference(self.client_next_seq) != 0 {
            self.anomaly("final handshake ACK with wrong sequence");
            return;
        }
        if p.ack.difference(self.server_next_seq) != 0 {
            self.anomaly("final handshake ACK with wrong acknowledgement");
            return;
        }
        self.state = TcpState::DataTransfer;
    }

    fn state_data_transfer(&mut self, p: &PacketManifest, flow: TcpFlow) {
        if self.packet_count < FIRST_FEW_PACKETS {
            // a hijack attempt may still race the handshake shortly
            // after establishment
            self.detect_hijack(p, flow);
        }
        let to_server = flow == self.client_flow;
        let next_seq = if to_server {
            self.client_next_seq
        } else {
            self.server_next_seq
        };
        let diff = p.seq.difference(next_seq);
        if diff > 0 {
            // segment sits inside or before already-seen territory
            self.detect_injection(p, flow);
        } else if diff == 0 {
            // contiguous
            if p.fin() {
                self.closing_flow = flow;
                let bumped = next_seq.add(1);
                if to_server {
                    self.client_next_seq = bumped;
                    self.client_close_state = CloseState::CloseWait;
                    self.server_close_state = CloseState::FinWait1;
                } else {
                    self.server_next_seq = bumped;
                    self.server_close_state = CloseState::CloseWait;
                    self.client_close_state = CloseState::FinWait1;
                }
                self.state = TcpState::ConnectionClosing;
                return;
            }
            if p.rst() {
                self.state = TcpState::Closed;
                self.close();
                return;
            }
            if !p.payload.is_empty() {
                let segment = Segment::new(p.seq, p.payload.to_vec());
                let advanced = p.seq.add(p.payload.len() as i32);
                if to_server {
                    self.server_ring.push(segment);
                    self.client_next_seq = advanced;
                } else {
                    self.client_ring.push(segment);
                    self.server_next_seq = advanced;
                }
            }
        } else {
            // future out-of-order segment, dropped from analysis
            trace!(
                "{}: out of order segment {} (expected {})",
                flow,
                p.seq,
                next_seq
            );
        }
    }

    fn state_connection_closing(&mut self, p: &PacketManifest, flow: TcpFlow) {
        let to_server = flow == self.client_flow;
        let handler = if to_server {
            self.client_close_state
        } else {
            self.server_close_state
        };
        if flow == self.closing_flow {
            match handler {
                CloseState::CloseWait => {
                    self.anomaly("CLOSE-WAIT: unexpected packet from the closing side")
                }
                CloseState::LastAck => self.state_last_ack(p, to_server),
                other => {
                    warn!(
                        "{}: unhandled closing transition from {:?} on the closing side",
                        flow, other
                    );
                    self.anomalies += 1;
                }
            }
        } else {
            match handler {
                CloseState::FinWait1 => self.state_fin_wait1(p, to_server),
                CloseState::FinWait2 => self.state_fin_wait2(p, to_server),
                CloseState::TimeWait => self.anomaly("TIME-WAIT: unexpected packet"),
                CloseState::Closing => self.anomaly("CLOSING: unexpected packet"),
                other => {
                    warn!(
                        "{}: unhandled closing transition from {:?}",
                        flow, other
                    );
                    self.anomalies += 1;
                }
            }
        }
    }

    fn state_fin_wait1(&mut self, p: &PacketManifest, to_server: bool) {
        let next_seq = if to_server {
            self.client_next_seq
        } else {
            self.server_next_seq
        };
        let expected_ack = if to_server {
            self.server_next_seq
        } else {
            self.client_next_seq
        };
        if p.seq.difference(next_seq) != 0 {
            warn!(
                "FIN-WAIT-1: out of order packet: sequence {} != expected {}",
                p.seq, next_seq
            );
            self.anomalies += 1;
            return;
        }
        if !p.ack_flag() {
            warn!("FIN-WAIT-1: packet without ACK");
            self.anomalies += 1;
            return;
        }
        if p.ack.difference(expected_ack) != 0 {
            warn!(
                "FIN-WAIT-1: unexpected ack: got {} expected {}",
                p.ack, expected_ack
            );
            self.anomalies += 1;
            return;
        }
        if p.fin() {
            let bumped = p.seq.add(p.payload.len() as i32 + 1);
            if to_server {
                self.client_close_state = CloseState::Closing;
                self.server_close_state = CloseState::LastAck;
                self.client_next_seq = bumped;
            } else {
                self.server_close_state = CloseState::Closing;
                self.client_close_state = CloseState::LastAck;
                self.server_next_seq = bumped;
            }
        } else if to_server {
            self.client_close_state = CloseState::FinWait2;
        } else {
            self.server_close_state = CloseState::FinWait2;
        }
    }

    fn state_fin_wait2(&mut self, p: &PacketManifest, to_server: bool) {
        let next_seq = if to_server {
            self.client_next_seq
        } else {
            self.server_next_seq
        };
        let expected_ack = if to_server {
            self.server_next_seq
        } else {
            self.client_next_seq
        };
        if p.seq.difference(next_seq) != 0 {
            warn!("FIN-WAIT-2: out of order packet received");
            self.anomalies += 1;
            return;
        }
        if !(p.ack_flag() && p.fin()) {
            self.anomaly("FIN-WAIT-2: expected FIN+ACK");
            return;
        }
        if p.ack.difference(expected_ack) != 0 {
            warn!("FIN-WAIT-2: out of order ack received");
            self.anomalies += 1;
            return;
        }
        if to_server {
            self.client_next_seq = self.client_next_seq.add(1);
            self.client_close_state = CloseState::TimeWait;
        } else {
            self.server_next_seq = self.server_next_seq.add(1);
            self.server_close_state = CloseState::TimeWait;
        }
    }

    fn state_last_ack(&mut self, p: &PacketManifest, to_server: bool) {
        let next_seq = if to_server {
            self.client_next_seq
        } else {
            self.server_next_seq
        };
        let expected_ack = if to_server {
            self.server_next_seq
        } else {
            self.client_next_seq
        };
        if p.seq.difference(next_seq) != 0 {
            warn!(
                "LAST-ACK: out of order packet: sequence {} != expected {}",
                p.seq, next_seq
            );
            self.anomalies += 1;
            return;
        }
        if !p.ack_flag() || p.fin() || p.syn() {
            self.anomaly("LAST-ACK: expected a plain ACK");
            return;
        }
        if p.ack.difference(expected_ack) != 0 {
            warn!(
                "LAST-ACK: unexpected ack: got {} expected {}",
                p.ack, expected_ack
            );
            self.anomalies += 1;
            return;
        }
        self.state = TcpState::Closed;
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::{CollectedReport, TestReporter};
    use pnet_packet::tcp::TcpFlags;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::rc::Rc;

    fn client_flow() -> TcpFlow {
        TcpFlow::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        )
    }

    fn packet(flags: u16, seq: u32, ack: u32, payload: &'static [u8]) -> PacketManifest<'static> {
        PacketManifest {
            ts: Duration::default(),
            flags,
            seq: Seq(seq),
            ack: Seq(ack),
            payload,
        }
    }

    fn new_connection() -> (Connection, Rc<RefCell<Vec<CollectedReport>>>) {
        let reports = Rc::new(RefCell::new(Vec::new()));
        let conn = Connection::new(Box::new(TestReporter::new(reports.clone())), None);
        (conn, reports)
    }

    #[test]
    fn listen_ignores_non_syn() {
        let (mut conn, _) = new_connection();
        conn.receive(&packet(TcpFlags::ACK, 42, 7, b""), client_flow());
        assert_eq!(conn.state(), TcpState::Listen);
        assert_eq!(conn.anomalies(), 1);
    }

    #[test]
    fn handshake_rejects_wrong_ack() {
        let (mut conn, _) = new_connection();
        conn.receive(&packet(TcpFlags::SYN, 1000, 0, b""), client_flow());
        assert_eq!(conn.state(), TcpState::ConnectionRequest);
        // SYN+ACK acknowledging the wrong sequence is ignored
        conn.receive(
            &packet(TcpFlags::SYN | TcpFlags::ACK, 5000, 1717, b""),
            client_flow().reverse(),
        );
        assert_eq!(conn.state(), TcpState::ConnectionRequest);
        assert_eq!(conn.anomalies(), 1);
    }

    #[test]
    fn hijack_window_closes_after_first_few_packets() {
        let (mut conn, reports) = new_connection();
        let cf = client_flow();
        let sf = cf.reverse();
        conn.receive(&packet(TcpFlags::SYN, 1000, 0, b""), cf);
        conn.receive(&packet(TcpFlags::SYN | TcpFlags::ACK, 5000, 1001, b""), sf);
        conn.receive(&packet(TcpFlags::ACK, 1001, 5001, b""), cf);
        assert_eq!(conn.state(), TcpState::DataTransfer);
        // push the packet count past the detection window
        let mut seq = 1001u32;
        for _ in 0..12 {
            conn.receive(
                &packet(TcpFlags::ACK | TcpFlags::PSH, seq, 5001, b"x"),
                cf,
            );
            seq += 1;
        }
        conn.receive(&packet(TcpFlags::SYN | TcpFlags::ACK, 9999, 1001, b""), sf);
        assert!(reports.borrow().is_empty());
    }
}
