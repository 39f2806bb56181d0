//! Shard File Naming
//!
//! ```text
//! {prefix}.{yyyyMMddHHmmssSSS}.blob     current names (UTC, milliseconds)
//! {yyyyMMddHHmmss}*.blob                legacy names, migrated at open
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// Extension of shard files
pub const BLOB_EXT: &str = "blob";

/// Extension of temp files left by interrupted writes
pub const TEMP_EXT: &str = "tmp";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const TIMESTAMP_LEN: usize = 17;
const LEGACY_LEN: usize = 14;

/// `yyyyMMddHHmmssSSS` in UTC
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a 17-digit timestamp
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != TIMESTAMP_LEN {
        return None;
    }
    let millis = s.get(14..17)?.parse::<u32>().ok()?;
    parse_digits(&s[..LEGACY_LEN], millis)
}

/// Parse a 14-digit legacy timestamp (second precision)
pub fn parse_legacy_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != LEGACY_LEN {
        return None;
    }
    parse_digits(s, 0)
}

fn parse_digits(s: &str, millis: u32) -> Option<DateTime<Utc>> {
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| s.get(range)?.parse::<u32>().ok();
    let year = field(0..4)? as i32;
    let naive = NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)?
        .and_hms_milli_opt(field(8..10)?, field(10..12)?, field(12..14)?, millis)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// File name of a shard created at `created`
pub fn shard_file_name(prefix: &str, created: DateTime<Utc>) -> String {
    format!("{}.{}.{}", prefix, format_timestamp(created), BLOB_EXT)
}

/// Creation time encoded in a current-style shard name
pub fn parse_shard_name(prefix: &str, name: &str) -> Option<DateTime<Utc>> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('.')?;
    let stamp = rest.strip_suffix(BLOB_EXT)?.strip_suffix('.')?;
    parse_timestamp(stamp)
}

/// Creation time encoded in a legacy shard name
pub fn parse_legacy_name(name: &str) -> Option<DateTime<Utc>> {
    if name.len() < LEGACY_LEN + 5 || !name.ends_with(".blob") {
        return None;
    }
    parse_legacy_timestamp(name.get(..LEGACY_LEN)?)
}

/// Shard path for `created`, moved forward one millisecond at a time until
/// no file of that name exists
pub fn unique_shard_path(dir: &Path, prefix: &str, created: DateTime<Utc>) -> (PathBuf, DateTime<Utc>) {
    let mut t = created;
    loop {
        let path = dir.join(shard_file_name(prefix, t));
        if !path.exists() {
            return (path, t);
        }
        t += Duration::milliseconds(1);
    }
}
