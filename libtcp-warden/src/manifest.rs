use crate::seq::Seq;
use libwarden_tools::Duration;
use pnet_packet::tcp::TcpFlags;

/// Parsed view of one captured TCP segment: header fields of interest
/// plus a borrowed payload. Addressing lives in the accompanying
/// [`TcpFlow`](crate::TcpFlow).
#[derive(Debug, Clone)]
pub struct PacketManifest<'p> {
    /// Capture timestamp
    pub ts: Duration,
    /// TCP flags word
    pub flags: u16,
    /// Sequence number
    pub seq: Seq,
    /// Acknowledgement number
    pub ack: Seq,
    /// TCP payload
    pub payload: &'p [u8],
}

impl<'p> PacketManifest<'p> {
    #[inline]
    pub fn syn(&self) -> bool {
        self.flags & TcpFlags::SYN != 0
    }
    #[inline]
    pub fn ack_flag(&self) -> bool {
        self.flags & TcpFlags::ACK != 0
    }
    #[inline]
    pub fn fin(&self) -> bool {
        self.flags & TcpFlags::FIN != 0
    }
    #[inline]
    pub fn rst(&self) -> bool {
        self.flags & TcpFlags::RST != 0
    }
}
