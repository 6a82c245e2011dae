//! `backup.control`: flat `key = value` text describing one backup.

use super::backup::{Backup, BackupId, BackupMode, BackupStatus};
use crate::config::CompressAlg;
use crate::fs::write_atomic;
use crate::pg::Lsn;
use crate::utils::errors::{ControlError, EngineError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

pub const CONTROL_FILE: &str = "backup.control";

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render a backup as control file text.
pub fn render(backup: &Backup) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = writeln!(out, "#Configuration");
    let _ = writeln!(out, "backup-id = {}", backup.id);
    let _ = writeln!(out, "backup-mode = {}", backup.mode);
    let _ = writeln!(out, "compress-alg = {}", backup.compress_alg.as_str());
    let _ = writeln!(out, "compress-level = {}", backup.compress_level);
    let _ = writeln!(out, "#Compatibility");
    let _ = writeln!(out, "block-size = {}", backup.block_size);
    let _ = writeln!(out, "wal-segment-size = {}", backup.wal_segment_size);
    let _ = writeln!(out, "program-version = {}", backup.program_version);
    if let Some(version) = &backup.server_version {
        let _ = writeln!(out, "server-version = {}", version);
    }
    let _ = writeln!(out, "system-identifier = {}", backup.system_identifier);
    let _ = writeln!(out, "#Result backup info");
    let _ = writeln!(out, "timeline = {}", backup.tli);
    let _ = writeln!(out, "start-lsn = {}", backup.start_lsn);
    let _ = writeln!(out, "stop-lsn = {}", backup.stop_lsn);
    let _ = writeln!(out, "start-time = '{}'", format_time(backup.start_time));
    if let Some(end) = backup.end_time {
        let _ = writeln!(out, "end-time = '{}'", format_time(end));
    }
    if let Some(time) = backup.recovery_time {
        let _ = writeln!(out, "recovery-time = '{}'", format_time(time));
    }
    if let Some(xid) = backup.recovery_xid {
        let _ = writeln!(out, "recovery-xid = {}", xid);
    }
    let _ = writeln!(out, "data-bytes = {}", backup.data_bytes);
    let _ = writeln!(out, "uncompressed-bytes = {}", backup.uncompressed_bytes);
    let _ = writeln!(out, "status = {}", backup.status);
    if let Some(parent) = backup.parent_id {
        let _ = writeln!(out, "parent-backup-id = '{}'", parent);
    }
    if let Some(crc) = backup.content_crc {
        let _ = writeln!(out, "content-crc = {}", crc);
    }
    if let Some(note) = &backup.note {
        let _ = writeln!(out, "note = '{}'", note.replace('\n', " "));
    }
    out
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(raw)
}

fn value<T: FromStr>(path: &Path, key: &str, raw: &str) -> std::result::Result<T, ControlError> {
    raw.parse().map_err(|_| ControlError::InvalidOption {
        path: path.display().to_string(),
        key: key.to_string(),
    })
}

fn time_value(path: &Path, key: &str, raw: &str) -> std::result::Result<DateTime<Utc>, ControlError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ControlError::InvalidOption {
            path: path.display().to_string(),
            key: key.to_string(),
        })
}

/// Parse control file text. `id` comes from the backup directory name and
/// wins over any `backup-id` line.
pub fn parse(path: &Path, content: &str, id: BackupId) -> std::result::Result<Backup, ControlError> {
    if content.trim().is_empty() {
        return Err(ControlError::Empty(path.display().to_string()));
    }

    let mut mode = None;
    let mut status = None;
    let mut start_time = None;
    let mut backup = Backup::new(id, BackupMode::Full, DateTime::<Utc>::UNIX_EPOCH);
    backup.program_version.clear();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = line.split_once('=') else {
            return Err(ControlError::InvalidOption {
                path: path.display().to_string(),
                key: line.to_string(),
            });
        };
        let key = key.trim();
        let raw = unquote(raw);

        match key {
            "backup-id" => {}
            "backup-mode" => mode = Some(value::<BackupMode>(path, key, raw)?),
            "status" => status = Some(value::<BackupStatus>(path, key, raw)?),
            "parent-backup-id" => backup.parent_id = Some(value(path, key, raw)?),
            "timeline" => backup.tli = value(path, key, raw)?,
            "start-lsn" => backup.start_lsn = value::<Lsn>(path, key, raw)?,
            "stop-lsn" => backup.stop_lsn = value::<Lsn>(path, key, raw)?,
            "start-time" => start_time = Some(time_value(path, key, raw)?),
            "end-time" => backup.end_time = Some(time_value(path, key, raw)?),
            "recovery-time" => backup.recovery_time = Some(time_value(path, key, raw)?),
            "recovery-xid" => backup.recovery_xid = Some(value(path, key, raw)?),
            "system-identifier" => backup.system_identifier = value(path, key, raw)?,
            "data-bytes" => backup.data_bytes = value(path, key, raw)?,
            "uncompressed-bytes" => backup.uncompressed_bytes = value(path, key, raw)?,
            "wal-segment-size" => backup.wal_segment_size = value(path, key, raw)?,
            "block-size" => backup.block_size = value(path, key, raw)?,
            "compress-alg" => {
                backup.compress_alg =
                    CompressAlg::parse(raw).ok_or_else(|| ControlError::InvalidOption {
                        path: path.display().to_string(),
                        key: key.to_string(),
                    })?
            }
            "compress-level" => backup.compress_level = value(path, key, raw)?,
            "program-version" => backup.program_version = raw.to_string(),
            "server-version" => backup.server_version = Some(raw.to_string()),
            "content-crc" => backup.content_crc = Some(value(path, key, raw)?),
            "note" => backup.note = Some(raw.to_string()),
            other => warn!(
                "Control file \"{}\" has unknown option \"{}\", ignoring it",
                path.display(),
                other
            ),
        }
    }

    let missing = |key: &str| ControlError::InvalidOption {
        path: path.display().to_string(),
        key: key.to_string(),
    };
    backup.mode = mode.ok_or_else(|| missing("backup-mode"))?;
    backup.status = status.ok_or_else(|| missing("status"))?;
    backup.start_time = start_time.ok_or_else(|| missing("start-time"))?;
    Ok(backup)
}

/// Read `backup.control` from a backup directory.
pub fn read(dir: &Path, id: BackupId) -> Result<Backup> {
    let path = dir.join(CONTROL_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ControlError::Missing(path.display().to_string()).into())
        }
        Err(e) => return Err(EngineError::file("read", &path, e)),
    };
    Ok(parse(&path, &content, id)?)
}

/// Replace `backup.control` atomically.
pub fn write(dir: &Path, backup: &Backup) -> Result<()> {
    write_atomic(&dir.join(CONTROL_FILE), render(backup).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample() -> Backup {
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap();
        let mut backup = Backup::new(BackupId::from_time(start), BackupMode::Page, start);
        backup.parent_id = Some(BackupId(1000));
        backup.status = BackupStatus::Ok;
        backup.tli = 2;
        backup.start_lsn = Lsn(0x3000028);
        backup.stop_lsn = Lsn(0x3000100);
        backup.end_time = Some(start + chrono::Duration::seconds(12));
        backup.recovery_time = Some(start + chrono::Duration::seconds(10));
        backup.recovery_xid = Some(742);
        backup.system_identifier = 7_301_234_567_890_123_456;
        backup.data_bytes = 8192;
        backup.uncompressed_bytes = 16384;
        backup.compress_alg = CompressAlg::Zstd;
        backup.compress_level = 3;
        backup.content_crc = Some(0xDEADBEEF);
        backup
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let backup = sample();
        write(dir.path(), &backup).unwrap();
        let text = std::fs::read_to_string(dir.path().join(CONTROL_FILE)).unwrap();
        assert!(text.contains("status = OK"));
        assert!(text.contains("start-lsn = 0/3000028"));
        assert!(text.contains("parent-backup-id = 'RS'"));
        assert_eq!(read(dir.path(), backup.id).unwrap(), backup);
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let mut text = render(&sample());
        text.push_str("from-replica = false\n");
        let parsed = parse(Path::new("backup.control"), &text, sample().id).unwrap();
        assert_eq!(parsed.mode, BackupMode::Page);
    }

    #[test]
    fn test_distinct_failures() {
        let dir = TempDir::new().unwrap();
        let err = read(dir.path(), BackupId(1)).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));

        std::fs::write(dir.path().join(CONTROL_FILE), "").unwrap();
        let err = read(dir.path(), BackupId(1)).unwrap_err();
        assert!(err.to_string().contains("is empty"));

        let text = render(&sample()).replace("start-lsn = 0/3000028", "start-lsn = banana");
        std::fs::write(dir.path().join(CONTROL_FILE), text).unwrap();
        let err = read(dir.path(), BackupId(1)).unwrap_err();
        assert!(err.to_string().contains("contains invalid option \"start-lsn\""));
    }
}
