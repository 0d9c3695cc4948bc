//! Log segments
//!
//! A segment is one persisted unit of transaction log: an Oracle redo/archive
//! log file or a PostgreSQL WAL segment file.

use crate::common::PositionToken;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage tier of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentKind {
    /// Copied to archive storage
    Archived,
    /// Live log (online redo group, WAL directory file)
    Online,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archived => "ARCHIVED",
            Self::Online => "ONLINE",
        }
    }
}

/// Identity used to detect the same log content stored in two tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    /// Redo thread (Oracle) or timeline (PostgreSQL)
    pub thread: u32,
    /// Log sequence within the thread
    pub sequence: u64,
}

/// One unit of persisted log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSegment {
    /// File path or segment name
    pub name: String,
    /// First position contained in the segment
    pub first_position: PositionToken,
    /// Exclusive upper bound; `Max` while the segment is still being written
    pub next_position: PositionToken,
    /// Monotonic sequence number within the thread
    pub sequence: u64,
    /// Redo thread / timeline
    pub thread: u32,
    /// Storage tier
    pub kind: SegmentKind,
    /// Whether this is the segment currently being written (online only)
    pub current: bool,
}

impl LogSegment {
    /// Archived segment.
    pub fn archived(
        name: impl Into<String>,
        thread: u32,
        sequence: u64,
        first_position: PositionToken,
        next_position: PositionToken,
    ) -> Self {
        Self {
            name: name.into(),
            first_position,
            next_position,
            sequence,
            thread,
            kind: SegmentKind::Archived,
            current: false,
        }
    }

    /// Online segment.
    pub fn online(
        name: impl Into<String>,
        thread: u32,
        sequence: u64,
        first_position: PositionToken,
        next_position: PositionToken,
        current: bool,
    ) -> Self {
        Self {
            name: name.into(),
            first_position,
            next_position,
            sequence,
            thread,
            kind: SegmentKind::Online,
            current,
        }
    }

    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            thread: self.thread,
            sequence: self.sequence,
        }
    }

    pub fn is_online(&self) -> bool {
        self.kind == SegmentKind::Online
    }

    /// Whether the segment can hold positions at or above `from`.
    ///
    /// The current segment always qualifies; a `Null` lower bound admits
    /// everything.
    pub fn reaches(&self, from: &PositionToken) -> bool {
        self.current || from.is_null() || self.next_position > *from
    }
}

impl fmt::Display for LogSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}..{}) seq={} thread={} {}{}",
            self.name,
            self.first_position,
            self.next_position,
            self.sequence,
            self.thread,
            self.kind.as_str(),
            if self.current { " CURRENT" } else { "" }
        )
    }
}
