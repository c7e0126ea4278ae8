//! Ambient configuration: pool sizing, timeouts, the `HDD_LEAVE_SPACE_DEFAULT`
//! size grammar, and the per-disk HDD config line grammar from the external
//! interfaces section of the protocol spec.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CoreError;

/// Wire-dialect packet-type range split (§4.4 / §6).
///
/// Legacy (`MFS`) packet types occupy `[0, kMaxOldPacketType]`; current
/// (`SAU_`) packet types occupy `[kMinSauPacketType, kMaxSauPacketType]`.
/// No collaborator depends on the literal values, only on the ranges being
/// disjoint and ordered this way, so these are an internal convention.
pub mod protocol_ranges {
    pub const MAX_OLD_PACKET_TYPE: u32 = 59_999;
    pub const MIN_SAU_PACKET_TYPE: u32 = 60_000;
    pub const MAX_SAU_PACKET_TYPE: u32 = 65_535;

    /// Minimum downstream-peer version advertising XOR-aware chain encoding.
    pub const FIRST_XOR_VERSION: u32 = 0x001_0900;
    /// Minimum downstream-peer version advertising EC-aware chain encoding.
    pub const FIRST_EC_VERSION: u32 = 0x001_0A00;
}

/// Sizing and timeout knobs for the chunkserver network-protocol core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// `NETWORK_WORKERS` - number of `NetworkWorkerThread`s.
    pub network_workers: usize,
    /// `HDD_WORKERS_PER_NETWORK_WORKER` - job-pool threads per worker.
    pub hdd_workers_per_network_worker: usize,
    /// `MAX_BG_JOBS_PER_NETWORK_WORKER` - bounded job-queue depth.
    pub max_bg_jobs_per_network_worker: usize,
    /// `HDD_LEAVE_SPACE_DEFAULT` in bytes, subtracted from each disk's free space.
    pub hdd_leave_space_default: u64,
    pub master_host: String,
    pub master_port: u16,
    pub bind_host: String,
    /// `MASTER_TIMEOUT`, clamped to `[10, 65535]` seconds.
    pub master_timeout: Duration,
    pub master_reconnection_delay: Duration,
    /// CS-to-CS idle timeout (`CSSERV_TIMEOUT`).
    pub csserv_timeout: Duration,
    /// Idle timeout applied to client connections (§4.6, §5).
    pub client_idle_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            network_workers: 4,
            hdd_workers_per_network_worker: 16,
            max_bg_jobs_per_network_worker: 1000,
            hdd_leave_space_default: 4 * 1024 * 1024 * 1024,
            master_host: String::new(),
            master_port: 9420,
            bind_host: String::from("*"),
            master_timeout: Duration::from_secs(10),
            master_reconnection_delay: Duration::from_secs(5),
            csserv_timeout: Duration::from_secs(10),
            client_idle_timeout: Duration::from_secs(10),
        }
    }
}

impl CoreConfig {
    /// Clamps `MASTER_TIMEOUT` into its documented `10..=65535` second range.
    pub fn with_master_timeout_secs(mut self, secs: u64) -> Self {
        self.master_timeout = Duration::from_secs(secs.clamp(10, 65535));
        self
    }
}

/// Parses a byte-count literal in the `HDD_LEAVE_SPACE_DEFAULT` grammar:
/// an integer or decimal literal, optional internal spaces, and an
/// optional case-insensitive suffix - `Ki/Mi/Gi/Ti/Pi/Ei` (binary, `*1024^n`)
/// or `k/m/g/t/p/e` (decimal, `*1000^n`); a bare suffix letter is accepted
/// for the decimal form (`4G` == `4000000000`).
pub fn parse_size(literal: &str) -> Result<u64, CoreError> {
    let cleaned: String = literal.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(CoreError::InvalidSize {
            literal: literal.to_string(),
            reason: "empty literal",
        });
    }

    let lower = cleaned.to_ascii_lowercase();
    let split_at = lower
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(lower.len());
    let (number_part, suffix) = lower.split_at(split_at);

    let number: f64 = number_part.parse().map_err(|_| CoreError::InvalidSize {
        literal: literal.to_string(),
        reason: "not a number",
    })?;
    if number < 0.0 {
        return Err(CoreError::InvalidSize {
            literal: literal.to_string(),
            reason: "negative size",
        });
    }

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "b" => 1.0,
        "k" => 1_000.0,
        "ki" | "kib" => 1024.0,
        "m" => 1_000_000.0,
        "mi" | "mib" => 1024.0 * 1024.0,
        "g" => 1_000_000_000.0,
        "gi" | "gib" => 1024f64.powi(3),
        "t" => 1_000_000_000_000.0,
        "ti" | "tib" => 1024f64.powi(4),
        "p" => 1_000_000_000_000_000.0,
        "pi" | "pib" => 1024f64.powi(5),
        "e" => 1_000_000_000_000_000_000.0,
        "ei" | "eib" => 1024f64.powi(6),
        _ => {
            return Err(CoreError::InvalidSize {
                literal: literal.to_string(),
                reason: "unknown suffix",
            })
        }
    };

    Ok((number * multiplier).round() as u64)
}

/// A single parsed line from the per-disk HDD configuration file:
/// `[*][zonefs:]<metaPath>[ | <dataPath>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HddConfigLine {
    /// `*` prefix - folder is marked for removal (drain, don't accept new chunks).
    pub marked_for_removal: bool,
    /// `zonefs:` prefix - a zoned device, always carries a split data path.
    pub zoned: bool,
    pub meta_path: PathBuf,
    pub data_path: Option<PathBuf>,
}

impl HddConfigLine {
    /// Parses one line. Returns `Ok(None)` for blank lines and `#`-comments
    /// (both are silently ignored by the original config reader, not errors).
    pub fn parse(line: &str) -> Result<Option<HddConfigLine>, CoreError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let mut rest = trimmed;
        let marked_for_removal = if let Some(stripped) = rest.strip_prefix('*') {
            rest = stripped;
            true
        } else {
            false
        };

        let zoned = if let Some(stripped) = rest.strip_prefix("zonefs:") {
            rest = stripped;
            true
        } else {
            false
        };

        let (meta_raw, data_raw) = if let Some(idx) = rest.find(" | ") {
            let (meta, data) = rest.split_at(idx);
            (meta, Some(&data[" | ".len()..]))
        } else {
            (rest, None)
        };

        if zoned && data_raw.is_none() {
            return Err(CoreError::InvalidHddLine {
                line: line.to_string(),
                reason: "zonefs device requires a ' | ' separated data path",
            });
        }

        let meta_path = normalize_dir(meta_raw.trim());
        if meta_path.as_os_str().is_empty() {
            return Err(CoreError::InvalidHddLine {
                line: line.to_string(),
                reason: "empty meta path",
            });
        }
        let data_path = data_raw.map(|d| normalize_dir(d.trim()));

        Ok(Some(HddConfigLine {
            marked_for_removal,
            zoned,
            meta_path,
            data_path,
        }))
    }
}

fn normalize_dir(path: &str) -> PathBuf {
    if path.is_empty() || path.ends_with('/') {
        PathBuf::from(path)
    } else {
        PathBuf::from(format!("{path}/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_decimal_and_binary_suffixes() {
        assert_eq!(parse_size("4GiB").unwrap(), 4u64 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("4Gi").unwrap(), 4u64 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("4G").unwrap(), 4_000_000_000);
        assert_eq!(parse_size("  512  Mi ").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1.5k").unwrap(), 1500);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("4Xi").is_err());
        assert!(parse_size("-4G").is_err());
    }

    #[test]
    fn hdd_line_ignores_blank_and_comment() {
        assert_eq!(HddConfigLine::parse("").unwrap(), None);
        assert_eq!(HddConfigLine::parse("   ").unwrap(), None);
        assert_eq!(HddConfigLine::parse("# a comment").unwrap(), None);
    }

    #[test]
    fn hdd_line_plain_path() {
        let parsed = HddConfigLine::parse("/mnt/hdd1").unwrap().unwrap();
        assert!(!parsed.marked_for_removal);
        assert!(!parsed.zoned);
        assert_eq!(parsed.meta_path, PathBuf::from("/mnt/hdd1/"));
        assert_eq!(parsed.data_path, None);
    }

    #[test]
    fn hdd_line_marked_for_removal() {
        let parsed = HddConfigLine::parse("*/mnt/hdd1").unwrap().unwrap();
        assert!(parsed.marked_for_removal);
        assert_eq!(parsed.meta_path, PathBuf::from("/mnt/hdd1/"));
    }

    #[test]
    fn hdd_line_zonefs_split_paths() {
        let parsed = HddConfigLine::parse("zonefs:/mnt/meta | /mnt/data")
            .unwrap()
            .unwrap();
        assert!(parsed.zoned);
        assert_eq!(parsed.meta_path, PathBuf::from("/mnt/meta/"));
        assert_eq!(parsed.data_path, Some(PathBuf::from("/mnt/data/")));
    }

    #[test]
    fn hdd_line_zonefs_without_data_path_is_error() {
        assert!(HddConfigLine::parse("zonefs:/mnt/meta").is_err());
    }
}
