//! Log segment discovery and reconciliation
//!
//! Backends report the live log tier and the archive tier separately, and a
//! segment that was just archived shows up in both. [`reconcile`] keeps the
//! ONLINE copy and drops the ARCHIVED duplicate, since only the online entry
//! reflects the live tail.

use crate::common::{CdcError, LogMiningBackend, LogSegment, PositionToken, Result, SqlConnection};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Merge online and archived segments.
///
/// Output is archived segments then online segments, each ascending by
/// `(thread, sequence)`. No two returned segments share a
/// [`SegmentKey`](crate::common::SegmentKey).
pub fn reconcile(online: Vec<LogSegment>, archived: Vec<LogSegment>) -> Vec<LogSegment> {
    let mut online = dedup_by_key(online);
    let online_keys: HashSet<_> = online.iter().map(LogSegment::key).collect();

    let mut archived: Vec<LogSegment> = dedup_by_key(archived)
        .into_iter()
        .filter(|s| {
            let redundant = online_keys.contains(&s.key());
            if redundant {
                trace!("Dropping archived copy of online segment {}", s);
            }
            !redundant
        })
        .collect();

    archived.sort_by_key(|s| (s.sequence, s.thread));
    online.sort_by_key(|s| (s.sequence, s.thread));

    archived.extend(online);
    archived
}

fn dedup_by_key(segments: Vec<LogSegment>) -> Vec<LogSegment> {
    let mut seen = HashSet::with_capacity(segments.len());
    segments
        .into_iter()
        .filter(|s| seen.insert(s.key()))
        .collect()
}

/// Discovers minable segments through a backend.
pub struct LogSegmentCatalog {
    backend: Arc<dyn LogMiningBackend>,
    retention_hours: u32,
}

impl LogSegmentCatalog {
    pub fn new(backend: Arc<dyn LogMiningBackend>) -> Self {
        Self {
            backend,
            retention_hours: 0,
        }
    }

    /// Only mine archived segments younger than `hours` (0 = no limit).
    pub fn with_retention_hours(mut self, hours: u32) -> Self {
        self.retention_hours = hours;
        self
    }

    /// Segments whose range can hold positions at or after `from`.
    ///
    /// An empty result is not an error. Metadata failures surface as
    /// [`CdcError::NoCatalogAccess`].
    pub async fn discover(
        &self,
        conn: &dyn SqlConnection,
        from: &PositionToken,
    ) -> Result<Vec<LogSegment>> {
        let online = self
            .backend
            .online_segments(conn)
            .await
            .map_err(|e| e.into_backend_error(CdcError::NoCatalogAccess))?;
        let archived = self
            .backend
            .archived_segments(conn, from, self.retention_hours)
            .await
            .map_err(|e| e.into_backend_error(CdcError::NoCatalogAccess))?;

        let (online_count, archived_count) = (online.len(), archived.len());
        let online: Vec<LogSegment> = online.into_iter().filter(|s| s.reaches(from)).collect();
        let archived: Vec<LogSegment> = archived.into_iter().filter(|s| s.reaches(from)).collect();

        let segments = reconcile(online, archived);
        debug!(
            "Discovered {} segments from {} ({} online, {} archived reported)",
            segments.len(),
            from,
            online_count,
            archived_count
        );
        Ok(segments)
    }

    /// Earliest position still minable on `thread`, used on cold start.
    pub async fn earliest_minable_position(
        &self,
        conn: &dyn SqlConnection,
        thread: u32,
    ) -> Result<PositionToken> {
        self.backend
            .earliest_position(conn, thread)
            .await
            .map_err(|e| e.into_backend_error(CdcError::NoCatalogAccess))
    }

    /// Earliest minable position on the thread this instance writes.
    pub async fn earliest_minable_position_current_thread(
        &self,
        conn: &dyn SqlConnection,
    ) -> Result<PositionToken> {
        let thread = self
            .backend
            .current_thread(conn)
            .await
            .map_err(|e| e.into_backend_error(CdcError::NoCatalogAccess))?;
        self.earliest_minable_position(conn, thread).await
    }
}
