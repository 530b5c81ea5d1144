use crate::connection::{Connection, TcpState};
use crate::flow::TcpFlow;
use crate::manifest::PacketManifest;
use crate::pcap_log::PcapLogger;
use crate::report::JsonReportLogger;
use crate::seq::Seq;
use crate::tracker::ConnectionTracker;
use libwarden_tools::{Config, Error, Packet, ParseContext, PcapAnalyzer};
use pcap_parser::data::PacketData;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;
use std::cell::RefCell;
use std::cmp::min;
use std::net::IpAddr;
use std::rc::Rc;

/// Packet pump: parses captured packets down to TCP and feeds them to
/// the per-connection state machines.
///
/// Only IPv4/TCP traffic is inspected; everything else is skipped.
pub struct TcpWarden {
    tracker: ConnectionTracker,
    output_dir: String,
    log_packets: bool,
}

impl TcpWarden {
    pub fn new(config: &Config) -> Self {
        TcpWarden {
            tracker: ConnectionTracker::new(),
            output_dir: config.get("output_dir").unwrap_or(".").to_owned(),
            log_packets: config.get_bool("log_packets").unwrap_or(false),
        }
    }

    /// Number of currently tracked connections
    pub fn connection_count(&self) -> usize {
        self.tracker.len()
    }

    fn handle_l2(&mut self, packet: &Packet, data: &[u8]) -> Result<(), Error> {
        // resize slice to remove padding
        let datalen = min(packet.caplen as usize, data.len());
        let data = &data[..datalen];

        let eth = match EthernetPacket::new(data) {
            Some(eth) => eth,
            None => {
                warn!("short ethernet frame (pcap index {})", packet.pcap_index);
                return Ok(());
            }
        };
        if eth.get_ethertype() != EtherTypes::Ipv4 {
            trace!("skipping non-IPv4 ethertype {}", eth.get_ethertype().0);
            return Ok(());
        }
        if data.len() <= 14 {
            return Ok(());
        }
        self.handle_l3(packet, data, &data[14..])
    }

    fn handle_l3(&mut self, packet: &Packet, frame: &[u8], data: &[u8]) -> Result<(), Error> {
        let ipv4 = match Ipv4Packet::new(data) {
            Some(p) => p,
            None => return Ok(()),
        };
        if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
            trace!("skipping L4 protocol {}", ipv4.get_next_level_protocol().0);
            return Ok(());
        }
        // remove trailing padding
        let data = if (ipv4.get_total_length() as usize) < data.len() {
            &data[..ipv4.get_total_length() as usize]
        } else {
            data
        };
        let ihl = ipv4.get_header_length() as usize * 4;
        if ihl >= data.len() {
            return Ok(());
        }
        let l4_data = &data[ihl..];

        let tcp = match TcpPacket::new(l4_data) {
            Some(p) => p,
            None => {
                warn!("short TCP header (pcap index {})", packet.pcap_index);
                return Ok(());
            }
        };
        // header length depends on options
        let data_offset = tcp.get_data_offset() as usize * 4;
        if data_offset > l4_data.len() {
            warn!("TCP data offset beyond segment (pcap index {})", packet.pcap_index);
            return Ok(());
        }
        let payload = &l4_data[data_offset..];

        let flow = TcpFlow::new(
            IpAddr::V4(ipv4.get_source()),
            tcp.get_source(),
            IpAddr::V4(ipv4.get_destination()),
            tcp.get_destination(),
        );
        let manifest = PacketManifest {
            ts: packet.ts,
            flags: tcp.get_flags(),
            seq: Seq(tcp.get_sequence()),
            ack: Seq(tcp.get_acknowledgement()),
            payload,
        };
        trace!(
            "flow {} seq {} ack {} plen {}",
            flow,
            manifest.seq,
            manifest.ack,
            payload.len()
        );
        self.dispatch(flow, &manifest, frame)
    }

    /// Route the packet to its connection, creating one for unseen
    /// bidirectional flows, and reap connections that reached `Closed`.
    fn dispatch(
        &mut self,
        flow: TcpFlow,
        manifest: &PacketManifest,
        frame: &[u8],
    ) -> Result<(), Error> {
        if !self.tracker.has(&flow) {
            debug!("tracking new connection {}", flow);
            let conn = self.build_connection(&flow)?;
            self.tracker.put(flow, Rc::new(RefCell::new(conn)));
        }
        let conn = self
            .tracker
            .get(&flow)
            .ok_or(Error::Generic("untracked flow"))?;
        let closed = {
            let mut conn = conn.borrow_mut();
            conn.log_packet(manifest.ts, frame);
            conn.receive(manifest, flow);
            conn.state() == TcpState::Closed
        };
        if closed {
            debug!("connection {} closed, dropping state", flow);
            self.tracker.remove(&flow);
        }
        Ok(())
    }

    fn build_connection(&self, flow: &TcpFlow) -> Result<Connection, Error> {
        let reporter = JsonReportLogger::create(&self.output_dir, flow)?;
        let packet_log = if self.log_packets {
            Some(PcapLogger::create(&self.output_dir, flow)?)
        } else {
            None
        };
        Ok(Connection::new(Box::new(reporter), packet_log))
    }
}

impl PcapAnalyzer for TcpWarden {
    fn handle_packet(&mut self, packet: &Packet, _ctx: &ParseContext) -> Result<(), Error> {
        match packet.data {
            PacketData::L2(data) => self.handle_l2(packet, data),
            PacketData::L3(ethertype, data) if ethertype == EtherTypes::Ipv4.0 => {
                self.handle_l3(packet, data, data)
            }
            _ => Ok(()),
        }
    }

    fn teardown(&mut self) {
        debug!(
            "expiring {} remaining connections",
            self.tracker.len()
        );
        self.tracker.close_all();
    }
}
