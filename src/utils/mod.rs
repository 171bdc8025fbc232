pub mod databases;
pub mod fs_helper;
pub mod logging;
pub mod pattern;

use std::fs;
use std::path::Path;
use std::time::Duration;

const DAY: u64 = 60 * 60 * 24;
const YEAR: u64 = 365 * DAY;

/// Formats a duration for log output: `1.234s` below a day, `1y2d3h4m5s` above.
pub fn humanize_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < DAY {
        return format!("{:.3}s", d.as_secs_f64());
    }
    let mut out = String::new();
    let mut rest = secs;
    if rest >= YEAR {
        out.push_str(&format!("{}y", rest / YEAR));
        rest %= YEAR;
    }
    out.push_str(&format!("{}d", rest / DAY));
    rest %= DAY;
    out.push_str(&format!("{}h{}m{}s", rest / 3600, (rest % 3600) / 60, rest % 60));
    out
}

/// Escapes a database or table name the way ClickHouse names its directories:
/// ASCII alphanumerics and `_` are kept, every other byte becomes `%XX`.
pub fn table_path_encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&hex::encode_upper([b]));
        }
    }
    out
}

/// Inverse of [`table_path_encode`]. Malformed escapes are kept verbatim.
pub fn table_path_decode(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(decoded) = hex::decode(&bytes[i + 1..i + 3]) {
                out.extend_from_slice(&decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Strips characters that cannot be part of a backup directory name.
pub fn clean_backup_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Backups produced by v0.0.1 stored the raw `FREEZE` increments under
/// `shadow/<N>/...`; those cannot be restored anymore.
pub fn is_clickhouse_shadow(shadow_path: &Path) -> bool {
    let Ok(entries) = fs::read_dir(shadow_path) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry.file_type().is_ok_and(|t| t.is_dir())
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}
