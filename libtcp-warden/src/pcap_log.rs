use crate::flow::TcpFlow;
use libwarden_tools::Duration;
use pcap_parser::{LegacyPcapBlock, Linktype, PcapHeader, ToVec};
use std::fs::File;
use std::io::{self, BufWriter, Error, ErrorKind, Write};
use std::path::PathBuf;

const SNAPLEN: u32 = 65535;

/// Writes the raw packets of one connection to `<flow>.pcap` in the
/// output directory, legacy pcap format.
pub struct PcapLogger {
    w: BufWriter<File>,
}

impl PcapLogger {
    pub fn create(dir: &str, flow: &TcpFlow) -> io::Result<Self> {
        let mut path = PathBuf::from(dir);
        path.push(format!("{}.pcap", flow));
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        let mut hdr = PcapHeader::new();
        hdr.snaplen = SNAPLEN;
        hdr.network = Linktype::ETHERNET;
        let s = hdr
            .to_vec()
            .map_err(|_| Error::new(ErrorKind::Other, "pcap header serialization failed"))?;
        w.write_all(&s)?;
        Ok(PcapLogger { w })
    }

    pub fn write_packet(&mut self, ts: Duration, data: &[u8]) -> io::Result<()> {
        let record = LegacyPcapBlock {
            ts_sec: ts.secs,
            ts_usec: ts.micros,
            caplen: data.len() as u32,
            origlen: data.len() as u32,
            data,
        };
        let v = record
            .to_vec_raw()
            .map_err(|_| Error::new(ErrorKind::Other, "pcap block serialization failed"))?;
        self.w.write_all(&v)
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}
