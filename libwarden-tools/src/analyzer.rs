use crate::context::ParseContext;
use crate::error::Error;
use crate::packet::Packet;

/// Common trait for pcap/pcap-ng packet consumers
pub trait PcapAnalyzer {
    /// Initialization function, called before reading pcap data (optional)
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Callback function for every pcap Packet read
    fn handle_packet(&mut self, packet: &Packet, ctx: &ParseContext) -> Result<(), Error>;

    /// Teardown function, called after reading pcap data (optional)
    fn teardown(&mut self) {}
}
