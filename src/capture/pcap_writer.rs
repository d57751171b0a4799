//! Records captured game traffic to a classic pcap file so a problem
//! session can be replayed later with `--input`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::protocol::LinkType;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;

/// Little-endian libpcap 2.4 writer.
pub struct PcapWriter<W: Write> {
    writer: W,
    snaplen: u32,
    packets: u64,
}

impl PcapWriter<BufWriter<File>> {
    pub fn create(path: &Path, link_type: LinkType, snaplen: u32) -> io::Result<Self> {
        let file = File::create(path)?;
        PcapWriter::new(BufWriter::new(file), link_type, snaplen)
    }
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut writer: W, link_type: LinkType, snaplen: u32) -> io::Result<Self> {
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&snaplen.to_le_bytes());
        header.extend_from_slice(&link_type.pcap_link_type().to_le_bytes());
        writer.write_all(&header)?;
        Ok(PcapWriter {
            writer,
            snaplen,
            packets: 0,
        })
    }

    pub fn write_packet(&mut self, data: &[u8], timestamp: SystemTime) -> io::Result<()> {
        let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
        // ts_sec is 32 bits in this format.
        let ts_sec = since_epoch.as_secs() as u32;
        let ts_usec = since_epoch.subsec_micros();
        let orig_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let incl_len = orig_len.min(self.snaplen);

        let mut record = Vec::with_capacity(16 + incl_len as usize);
        record.extend_from_slice(&ts_sec.to_le_bytes());
        record.extend_from_slice(&ts_usec.to_le_bytes());
        record.extend_from_slice(&incl_len.to_le_bytes());
        record.extend_from_slice(&orig_len.to_le_bytes());
        record.extend_from_slice(&data[..incl_len as usize]);
        self.writer.write_all(&record)?;
        self.packets += 1;
        Ok(())
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }
}

impl<W: Write> Drop for PcapWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "failed to flush pcap recording");
        }
    }
}
