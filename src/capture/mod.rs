pub mod pcap_writer;
pub mod privilege;

use pcap::{Capture, Device};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::config::CaptureSettings;
use crate::error::{CaptureError, DriverError};
use crate::protocol::LinkType;

/// One captured frame, copied out of the pcap buffer so it can outlive the
/// next read.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

pub enum PacketSource {
    Live(Capture<pcap::Active>, LinkType),
    File(Capture<pcap::Offline>, LinkType),
}

/// BPF expression limiting capture to TCP on the game ports. Only
/// server-to-client traffic carries chat, so outbound is opt-in.
pub fn build_filter(ports: &[u16], include_outbound: bool) -> String {
    let dir = if include_outbound { "" } else { "src " };
    let ports: Vec<String> = ports
        .iter()
        .map(|p| format!("{}port {}", dir, p))
        .collect();
    if ports.is_empty() {
        return "tcp".to_string();
    }
    format!("tcp and ({})", ports.join(" or "))
}

fn effective_filter(settings: &CaptureSettings) -> String {
    settings
        .filter
        .clone()
        .unwrap_or_else(|| build_filter(&settings.ports, settings.include_outbound))
}

impl PacketSource {
    pub fn link_type(&self) -> LinkType {
        match self {
            PacketSource::Live(_, lt) | PacketSource::File(_, lt) => *lt,
        }
    }

    /// Open a live capture after the privilege pre-check.
    pub fn open(settings: &CaptureSettings) -> Result<Self, DriverError> {
        privilege::check()?;

        let device = match settings.interface.as_deref() {
            Some(name) => Device::list()
                .map_err(map_open_error)?
                .into_iter()
                .find(|d| d.name == name)
                .ok_or_else(|| DriverError::DriverNotFound {
                    name: name.to_string(),
                })?,
            None => Device::lookup()
                .map_err(map_open_error)?
                .ok_or_else(|| DriverError::DriverNotFound {
                    name: "default".to_string(),
                })?,
        };
        let name = device.name.clone();

        let mut cap = Capture::from_device(device)
            .map_err(map_open_error)?
            .snaplen(settings.snaplen)
            .promisc(settings.promisc)
            .timeout(settings.read_timeout_ms)
            .open()
            .map_err(map_open_error)?;

        let filter = effective_filter(settings);
        cap.filter(&filter, true)
            .map_err(|source| DriverError::InvalidFilter {
                filter: filter.clone(),
                source,
            })?;

        let lt = verify_link_type(cap.get_datalink())?;
        info!(device = %name, filter = %filter, link = ?lt, "capture opened");
        Ok(PacketSource::Live(cap, lt))
    }

    /// Replay a pcap/pcapng file through the same path as a live capture.
    pub fn from_file(path: &Path, filter: Option<&str>) -> Result<Self, DriverError> {
        let mut cap = Capture::from_file(path).map_err(|source| DriverError::File {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(filter) = filter {
            cap.filter(filter, true)
                .map_err(|source| DriverError::InvalidFilter {
                    filter: filter.to_string(),
                    source,
                })?;
        }

        let lt = verify_link_type(cap.get_datalink())?;
        info!(file = %path.display(), link = ?lt, "replaying capture file");
        Ok(PacketSource::File(cap, lt))
    }

    pub fn open_with(settings: &CaptureSettings, input: Option<&Path>) -> Result<Self, DriverError> {
        match input {
            Some(path) => {
                let filter = effective_filter(settings);
                Self::from_file(path, Some(&filter))
            }
            None => Self::open(settings),
        }
    }

    /// Read the next packet. `Ok(None)` means the read timeout elapsed with
    /// nothing captured.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        let raw = match self {
            PacketSource::Live(cap, _) => cap.next_packet(),
            PacketSource::File(cap, _) => cap.next_packet(),
        };

        match raw {
            Ok(packet) => {
                let tv = packet.header.ts;
                let secs = (tv.tv_sec as i64).max(0) as u64;
                // Malformed files can carry out-of-range microseconds.
                let usec = (tv.tv_usec as i64).clamp(0, 999_999) as u32;
                Ok(Some(RawPacket {
                    data: packet.data.to_vec(),
                    timestamp: UNIX_EPOCH + Duration::new(secs, usec * 1000),
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::HandleClosed),
            Err(e) => Err(CaptureError::Read(e)),
        }
    }
}

/// The decoder only understands a handful of link layers. Anything else
/// means the driver is not handing us what it claims to.
fn verify_link_type(dl: pcap::Linktype) -> Result<LinkType, DriverError> {
    LinkType::from_dlt(dl.0).ok_or_else(|| DriverError::IntegrityCheckFailed {
        reason: format!(
            "unsupported link type {} ({})",
            dl.get_name().unwrap_or_default(),
            dl.0
        ),
    })
}

fn map_open_error(e: pcap::Error) -> DriverError {
    let message = e.to_string();
    debug!(error = %message, "capture open failed");
    if message.contains("ermission") || message.contains("Operation not permitted") {
        DriverError::AccessDenied { reason: message }
    } else if message.contains("No such device") || message.contains("doesn't exist") {
        DriverError::DriverNotFound { name: message }
    } else {
        DriverError::Open(e)
    }
}

/// Print capture devices, one per line.
pub fn list_interfaces() -> Result<Vec<String>, DriverError> {
    let devices = Device::list().map_err(map_open_error)?;
    Ok(devices
        .into_iter()
        .map(|dev| {
            let desc = dev.desc.as_deref().unwrap_or("");
            let addrs: Vec<String> = dev.addresses.iter().map(|a| a.addr.to_string()).collect();
            format!("{:<16} {}  [{}]", dev.name, desc, addrs.join(", "))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_inbound_only() {
        assert_eq!(build_filter(&[5003], false), "tcp and (src port 5003)");
    }

    #[test]
    fn filter_both_directions() {
        assert_eq!(
            build_filter(&[5003, 5004], true),
            "tcp and (port 5003 or port 5004)"
        );
    }

    #[test]
    fn filter_without_ports() {
        assert_eq!(build_filter(&[], false), "tcp");
    }

    #[test]
    fn explicit_filter_wins() {
        let settings = CaptureSettings {
            filter: Some("tcp port 9999".into()),
            ..CaptureSettings::default()
        };
        assert_eq!(effective_filter(&settings), "tcp port 9999");
    }

    #[test]
    fn open_errors_are_classified() {
        let denied = map_open_error(pcap::Error::PcapError(
            "socket: Operation not permitted".into(),
        ));
        assert!(matches!(denied, DriverError::AccessDenied { .. }));

        let missing = map_open_error(pcap::Error::PcapError("eth9: No such device exists".into()));
        assert!(matches!(missing, DriverError::DriverNotFound { .. }));

        let other = map_open_error(pcap::Error::PcapError("something else".into()));
        assert!(matches!(other, DriverError::Open(_)));
    }

    #[test]
    fn unsupported_link_type_fails_integrity() {
        let err = verify_link_type(pcap::Linktype(105)).unwrap_err();
        assert!(matches!(err, DriverError::IntegrityCheckFailed { .. }));
        assert_eq!(verify_link_type(pcap::Linktype(1)).unwrap(), LinkType::Ethernet);
    }

    #[test]
    fn missing_file_is_file_error() {
        let err = PacketSource::from_file(Path::new("/nonexistent/capture.pcap"), None)
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::File { .. }));
    }
}
