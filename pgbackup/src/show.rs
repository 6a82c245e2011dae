//! `show`: list the backups of one or all instances.

use crate::catalog::{control, Backup, BackupId, CatalogContext};
use crate::executor::progress::{format_bytes, format_duration};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShowFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for ShowFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plain" => Ok(ShowFormat::Plain),
            "json" => Ok(ShowFormat::Json),
            _ => Err(format!("Invalid show format \"{}\"", s)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct BackupView {
    id: String,
    parent_backup_id: Option<String>,
    backup_mode: String,
    status: String,
    timeline: u32,
    start_lsn: String,
    stop_lsn: String,
    start_time: String,
    end_time: Option<String>,
    recovery_time: Option<String>,
    recovery_xid: Option<u64>,
    data_bytes: u64,
    uncompressed_bytes: u64,
    compress_alg: String,
    compress_level: i32,
    program_version: String,
    server_version: Option<String>,
    note: Option<String>,
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl From<&Backup> for BackupView {
    fn from(b: &Backup) -> Self {
        Self {
            id: b.id.to_string(),
            parent_backup_id: b.parent_id.map(|p| p.to_string()),
            backup_mode: b.mode.to_string(),
            status: b.status.to_string(),
            timeline: b.tli,
            start_lsn: b.start_lsn.to_string(),
            stop_lsn: b.stop_lsn.to_string(),
            start_time: rfc3339(b.start_time),
            end_time: b.end_time.map(rfc3339),
            recovery_time: b.recovery_time.map(rfc3339),
            recovery_xid: b.recovery_xid,
            data_bytes: b.data_bytes,
            uncompressed_bytes: b.uncompressed_bytes,
            compress_alg: b.compress_alg.as_str().to_string(),
            compress_level: b.compress_level,
            program_version: b.program_version.clone(),
            server_version: b.server_version.clone(),
            note: b.note.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct InstanceView {
    instance: String,
    backups: Vec<BackupView>,
}

const COLUMNS: [&str; 11] = [
    "Instance",
    "Version",
    "ID",
    "Recovery Time",
    "Mode",
    "TLI",
    "Duration",
    "Data",
    "Start LSN",
    "Stop LSN",
    "Status",
];

fn table_row(instance: &str, b: &Backup) -> Vec<String> {
    let duration = b
        .end_time
        .map(|end| format_duration((end - b.start_time).num_seconds().max(0) as u64))
        .unwrap_or_else(|| "----".to_string());
    vec![
        instance.to_string(),
        b.server_version.clone().unwrap_or_else(|| "----".to_string()),
        b.id.to_string(),
        b.recovery_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S+00").to_string())
            .unwrap_or_else(|| "----".to_string()),
        b.mode.to_string(),
        b.tli.to_string(),
        duration,
        format_bytes(b.data_bytes),
        b.start_lsn.to_string(),
        b.stop_lsn.to_string(),
        b.status.to_string(),
    ]
}

fn format_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, w)| format!(" {:<w$} ", cell, w = *w))
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn render_table(rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = COLUMNS.iter().map(|c| c.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    let mut out = String::new();
    let _ = writeln!(out, "{}", format_line(COLUMNS.iter().copied(), &widths));
    let _ = writeln!(out, "{}", "=".repeat(widths.iter().map(|w| w + 2).sum()));
    for row in rows {
        let _ = writeln!(out, "{}", format_line(row.iter().map(String::as_str), &widths));
    }
    out
}

/// Render the backup list of `instance`, or of every instance.
pub fn show(ctx: &CatalogContext, instance: Option<&str>, format: ShowFormat) -> Result<String> {
    let instances = match instance {
        Some(name) => vec![name.to_string()],
        None => ctx.instances()?,
    };
    let mut views = Vec::with_capacity(instances.len());
    let mut rows = Vec::new();
    for name in instances {
        let catalog = ctx.open_instance(&name)?;
        let backups = catalog.list();
        rows.extend(backups.iter().map(|b| table_row(&name, b)));
        views.push(InstanceView {
            backups: backups.into_iter().map(BackupView::from).collect(),
            instance: name,
        });
    }
    match format {
        ShowFormat::Plain => Ok(render_table(&rows)),
        ShowFormat::Json => Ok(serde_json::to_string_pretty(&views)?),
    }
}

/// Details of one backup: its control file, or its JSON form.
pub fn show_backup(ctx: &CatalogContext, instance: &str, id: BackupId, format: ShowFormat) -> Result<String> {
    let catalog = ctx.open_instance(instance)?;
    let backup = catalog.get(id)?;
    match format {
        ShowFormat::Plain => Ok(control::render(backup)),
        ShowFormat::Json => serde_json::to_string_pretty(&BackupView::from(backup)).map_err(EngineError::from),
    }
}
