//! Timeline history: which timeline owned which LSN range.
//!
//! A history file for timeline N lists every ancestor timeline together
//! with the LSN at which the cluster switched away from it. The entries are
//! kept oldest first; the last entry is N itself and is open-ended.

use crate::pg::{Lsn, TimeLineId};
use crate::utils::errors::{EngineError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub tli: TimeLineId,
    pub begin: Lsn,
    /// Switch point to the next timeline; `None` for the newest timeline.
    pub end: Option<Lsn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistory {
    entries: Vec<TimelineEntry>,
}

impl TimelineHistory {
    /// History of a timeline without ancestors.
    pub fn single(tli: TimeLineId) -> Self {
        Self {
            entries: vec![TimelineEntry {
                tli,
                begin: Lsn::INVALID,
                end: None,
            }],
        }
    }

    /// Parse the content of `<tli>.history`.
    pub fn parse(tli: TimeLineId, content: &str) -> std::result::Result<Self, String> {
        let mut entries: Vec<TimelineEntry> = Vec::new();
        let mut begin = Lsn::INVALID;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parent: TimeLineId = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| format!("syntax error in history file at line {}", lineno + 1))?;
            let switch: Lsn = fields
                .next()
                .ok_or_else(|| format!("missing switch point at line {}", lineno + 1))?
                .parse()?;

            if let Some(prev) = entries.last() {
                if parent <= prev.tli {
                    return Err(format!(
                        "timeline IDs must be in increasing sequence (line {})",
                        lineno + 1
                    ));
                }
            }
            if switch < begin {
                return Err(format!(
                    "switch point {} goes backwards (line {})",
                    switch,
                    lineno + 1
                ));
            }
            if parent >= tli {
                return Err(format!(
                    "timeline {} in history file is not older than {}",
                    parent, tli
                ));
            }

            entries.push(TimelineEntry {
                tli: parent,
                begin,
                end: Some(switch),
            });
            begin = switch;
        }

        entries.push(TimelineEntry {
            tli,
            begin,
            end: None,
        });
        Ok(Self { entries })
    }

    /// Render in history file format.
    pub fn to_history_file(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            if let Some(end) = entry.end {
                out.push_str(&format!("{}\t{}\tno recovery target specified\n", entry.tli, end));
            }
        }
        out
    }

    pub fn current(&self) -> TimeLineId {
        self.entries.last().map(|e| e.tli).unwrap_or(1)
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn contains_timeline(&self, tli: TimeLineId) -> bool {
        self.entries.iter().any(|e| e.tli == tli)
    }

    /// Timeline that owned `lsn`.
    pub fn tli_for_lsn(&self, lsn: Lsn) -> TimeLineId {
        self.entries
            .iter()
            .find(|e| e.end.map_or(true, |end| lsn < end))
            .map(|e| e.tli)
            .unwrap_or_else(|| self.current())
    }

    /// Whether a position reached on `tli` lies on this history's path.
    pub fn contains_point(&self, tli: TimeLineId, lsn: Lsn) -> bool {
        self.entries
            .iter()
            .any(|e| e.tli == tli && e.end.map_or(true, |end| lsn <= end))
    }

    /// Timelines that may hold segment `segno`, newest first.
    pub fn segment_candidates(&self, segno: u64, seg_size: u32) -> Vec<TimeLineId> {
        self.entries
            .iter()
            .rev()
            .filter(|e| {
                e.begin.segment_number(seg_size) <= segno
                    && e.end.map_or(true, |end| segno <= end.segment_number(seg_size))
            })
            .map(|e| e.tli)
            .collect()
    }
}

impl fmt::Display for TimelineHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| match e.end {
                Some(end) => format!("{}@{}", e.tli, end),
                None => e.tli.to_string(),
            })
            .collect();
        f.write_str(&parts.join(" -> "))
    }
}

/// Cross-check a catchup destination position against the source history.
///
/// The destination may only be advanced incrementally when its current
/// timeline is an ancestor of (or equal to) the source's and the point it
/// reached lies on the source's path.
pub fn check_catchup_timelines(
    source: &TimelineHistory,
    dest_tli: TimeLineId,
    dest_lsn: Lsn,
) -> Result<()> {
    if source.current() < dest_tli {
        return Err(EngineError::Chain(format!(
            "Source is behind destination in timeline history (source timeline {}, destination timeline {})",
            source.current(),
            dest_tli
        )));
    }
    if !source.contains_point(dest_tli, dest_lsn) {
        return Err(EngineError::Chain(format!(
            "Destination is not in source timeline history: destination position {} on timeline {} is not reachable from source history {}",
            dest_lsn, dest_tli, source
        )));
    }
    Ok(())
}
