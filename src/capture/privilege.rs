//! Pre-capture privilege check, so a missing capability is reported up
//! front instead of as an obscure failure from inside libpcap.

use crate::error::DriverError;

const CAP_NET_RAW: u32 = 13;

#[cfg(target_os = "linux")]
pub fn check() -> Result<(), DriverError> {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) if has_capture_privilege(&status) => Ok(()),
        Ok(_) => Err(DriverError::AccessDenied {
            reason: "process is not root and lacks CAP_NET_RAW".to_string(),
        }),
        Err(e) => {
            // Unusual sandbox; let the open itself decide.
            tracing::debug!(error = %e, "cannot read /proc/self/status, skipping privilege check");
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn check() -> Result<(), DriverError> {
    Ok(())
}

/// True when a `/proc/<pid>/status` dump shows effective uid 0 or
/// `CAP_NET_RAW` in the effective capability set.
pub fn has_capture_privilege(status: &str) -> bool {
    let mut euid_root = false;
    let mut net_raw = false;

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            // real, effective, saved, fs
            euid_root = rest.split_whitespace().nth(1) == Some("0");
        } else if let Some(rest) = line.strip_prefix("CapEff:") {
            net_raw = u64::from_str_radix(rest.trim(), 16)
                .map(|caps| caps & (1 << CAP_NET_RAW) != 0)
                .unwrap_or(false);
        }
    }

    euid_root || net_raw
}
