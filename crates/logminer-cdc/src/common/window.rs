//! Mining window scheduling
//!
//! A mining window is one bounded session over `[lower, upper)`. The
//! scheduler owns the window for its whole life and drives it through:
//!
//! ```text
//!   Idle ──register──▶ SegmentsRegistered ──open──▶ SessionActive
//!    ▲                                                  │ pull (empty)
//!    │                                                  ▼
//!  reset ◀── Recovering ◀── (connection loss)        Draining
//!    ▲                                                  │ close
//!    └──────────────────── Closed ◀─────────────────────┘
//! ```
//!
//! `Closed` ends one window; registering segments again starts the next.

use crate::common::{
    CdcError, LogMiningBackend, LogSegment, MiningPredicate, PositionToken, RawRecord, Result,
    SqlConnection,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default window size in position units.
pub const DEFAULT_WINDOW_INCREMENT: u64 = 10_000_000;

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    Idle,
    SegmentsRegistered,
    SessionActive,
    Draining,
    Closed,
    Recovering,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::SegmentsRegistered => "SEGMENTS_REGISTERED",
            Self::SessionActive => "SESSION_ACTIVE",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
            Self::Recovering => "RECOVERING",
        };
        f.write_str(s)
    }
}

/// One bounded mining session.
#[derive(Debug, Clone)]
pub struct MiningWindow {
    /// Monotonic window number within one scheduler
    pub id: u64,
    /// Inclusive lower bound
    pub lower: PositionToken,
    /// Exclusive upper bound
    pub upper: PositionToken,
    /// Segments registered for the session, ascending
    pub segments: Vec<LogSegment>,
    /// Number of pulls issued
    pub pulls: u64,
    /// Raw records returned so far
    pub records: u64,
    exhausted: bool,
    closed: bool,
    opened_at: Instant,
}

impl MiningWindow {
    #[cfg(test)]
    pub(crate) fn for_range(lower: PositionToken, upper: PositionToken) -> Self {
        Self {
            id: 1,
            lower,
            upper,
            segments: Vec::new(),
            pulls: 0,
            records: 0,
            exhausted: false,
            closed: false,
            opened_at: Instant::now(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn elapsed(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Whether `position` lies inside the window range.
    pub fn contains(&self, position: &PositionToken) -> bool {
        self.lower <= *position && *position < self.upper
    }
}

/// Drives registration, session start, pulls and close for one source.
pub struct MiningWindowScheduler {
    backend: Arc<dyn LogMiningBackend>,
    state: SchedulerState,
    registered: Vec<LogSegment>,
    window: Option<MiningWindow>,
    next_window_id: u64,
}

impl MiningWindowScheduler {
    pub fn new(backend: Arc<dyn LogMiningBackend>) -> Self {
        Self {
            backend,
            state: SchedulerState::Idle,
            registered: Vec::new(),
            window: None,
            next_window_id: 1,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn window(&self) -> Option<&MiningWindow> {
        self.window.as_ref()
    }

    pub fn registered_segments(&self) -> &[LogSegment] {
        &self.registered
    }

    fn expect_state(&self, allowed: &[SchedulerState], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CdcError::invalid_state(format!(
                "cannot {} while scheduler is {}",
                op, self.state
            )))
        }
    }

    /// Register segments with the backend in ascending order.
    ///
    /// The first accepted segment opens a new registration set; the rest
    /// append to it. A rejected segment is dropped and registration goes on.
    /// If the drops leave a gap in the covered range, or nothing covers
    /// `from`, registration fails.
    pub async fn register_segments(
        &mut self,
        conn: &dyn SqlConnection,
        segments: &[LogSegment],
        from: &PositionToken,
    ) -> Result<Vec<LogSegment>> {
        self.expect_state(
            &[SchedulerState::Idle, SchedulerState::Closed],
            "register segments",
        )?;
        if segments.is_empty() {
            return Err(CdcError::segment_registration(format!(
                "no log segments available from {}",
                from
            )));
        }

        let mut ordered = segments.to_vec();
        ordered.sort_by(|a, b| {
            (a.first_position, a.thread, a.sequence).cmp(&(b.first_position, b.thread, b.sequence))
        });

        let mut accepted: Vec<LogSegment> = Vec::with_capacity(ordered.len());
        let mut rejected = 0usize;
        for segment in ordered {
            let new_set = accepted.is_empty();
            match self
                .backend
                .register_segment(conn, &segment, new_set)
                .await
            {
                Ok(()) => accepted.push(segment),
                Err(e) => {
                    warn!("Segment {} rejected: {}", segment, e);
                    rejected += 1;
                }
            }
        }

        if accepted.is_empty() {
            return Err(CdcError::segment_registration(format!(
                "all {} segments were rejected",
                rejected
            )));
        }
        if rejected > 0 {
            if let Some(gap) = find_gap(&accepted, from) {
                return Err(CdcError::segment_registration(format!(
                    "dropping {} rejected segments leaves a gap: {}",
                    rejected, gap
                )));
            }
        }

        debug!(
            "Registered {} segments ({} rejected) from {}",
            accepted.len(),
            rejected,
            from
        );
        self.registered = accepted.clone();
        self.state = SchedulerState::SegmentsRegistered;
        Ok(accepted)
    }

    /// Open a session over `[lower, min(lower + increment, highest))`.
    ///
    /// `Max` and `Null` for `highest` mean the tail is unknown; the upper
    /// bound then comes from the increment alone.
    pub async fn open_window(
        &mut self,
        conn: &dyn SqlConnection,
        lower: PositionToken,
        increment: u64,
        highest: PositionToken,
    ) -> Result<MiningWindow> {
        self.expect_state(&[SchedulerState::SegmentsRegistered], "open a window")?;
        if lower.is_null() || lower.is_max() {
            return Err(CdcError::session_start(format!(
                "window lower bound must be a concrete position, got {}",
                lower
            )));
        }

        let upper = window_upper_bound(lower, increment, highest);
        if upper <= lower {
            return Err(CdcError::session_start(format!(
                "empty window [{}, {})",
                lower, upper
            )));
        }

        let window = MiningWindow {
            id: self.next_window_id,
            lower,
            upper,
            segments: self.registered.clone(),
            pulls: 0,
            records: 0,
            exhausted: false,
            closed: false,
            opened_at: Instant::now(),
        };

        self.backend
            .open_session(conn, &window)
            .await
            .map_err(|e| e.into_backend_error(CdcError::SessionStart))?;

        info!(
            "Opened mining window #{} [{}, {}) over {} segments",
            window.id,
            lower,
            upper,
            window.segments.len()
        );
        self.next_window_id += 1;
        self.state = SchedulerState::SessionActive;
        self.window = Some(window.clone());
        Ok(window)
    }

    /// Pull the next batch of raw records. An empty result means the window
    /// is drained.
    pub async fn pull(
        &mut self,
        conn: &dyn SqlConnection,
        predicate: &MiningPredicate,
    ) -> Result<Vec<RawRecord>> {
        if self.state == SchedulerState::Draining {
            return Ok(Vec::new());
        }
        self.expect_state(&[SchedulerState::SessionActive], "pull")?;
        let window = self
            .window
            .as_mut()
            .ok_or_else(|| CdcError::invalid_state("session active without a window"))?;

        if window.exhausted {
            self.state = SchedulerState::Draining;
            return Ok(Vec::new());
        }

        let batch = self.backend.pull_raw(conn, window, predicate).await?;
        window.pulls += 1;
        window.records += batch.records.len() as u64;
        window.exhausted = batch.exhausted;
        if batch.records.is_empty() {
            self.state = SchedulerState::Draining;
        }
        Ok(batch.records)
    }

    /// Stop the session. Closing an already closed (or never opened) window
    /// does nothing.
    pub async fn close_window(&mut self, conn: &dyn SqlConnection) -> Result<()> {
        let Some(window) = self.window.as_mut() else {
            return Ok(());
        };
        if window.closed {
            return Ok(());
        }
        window.closed = true;
        self.state = SchedulerState::Closed;
        debug!(
            "Closing mining window #{} after {} pulls, {} records, {:?}",
            window.id,
            window.pulls,
            window.records,
            window.elapsed()
        );
        self.backend.close_session(conn).await
    }

    /// Mark the scheduler as recovering after a connection loss.
    pub fn mark_recovering(&mut self) {
        if self.state != SchedulerState::Idle {
            self.state = SchedulerState::Recovering;
        }
    }

    /// Forget the window and registered segments and return to `Idle`.
    pub fn reset(&mut self) {
        self.window = None;
        self.registered.clear();
        self.state = SchedulerState::Idle;
    }
}

/// `min(lower + increment, highest)`, ignoring `highest` when it is not a
/// concrete position.
pub fn window_upper_bound(lower: PositionToken, increment: u64, highest: PositionToken) -> PositionToken {
    let candidate = lower + PositionToken::new(increment);
    match highest {
        PositionToken::Value(_) => candidate.min_of(highest),
        PositionToken::Null | PositionToken::Max => candidate,
    }
}

/// Describe the first gap in the position coverage of `segments`, per
/// thread, or a missing start at `from`.
fn find_gap(segments: &[LogSegment], from: &PositionToken) -> Option<String> {
    let mut by_thread: BTreeMap<u32, Vec<&LogSegment>> = BTreeMap::new();
    for segment in segments {
        by_thread.entry(segment.thread).or_default().push(segment);
    }

    let earliest = segments.iter().map(|s| s.first_position).min()?;
    if !from.is_null() && earliest > *from {
        return Some(format!("nothing covers {} (earliest is {})", from, earliest));
    }

    for (thread, mut list) in by_thread {
        list.sort_by_key(|s| s.first_position);
        for pair in list.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if next.first_position > prev.next_position {
                return Some(format!(
                    "thread {} has no log between {} and {}",
                    thread, prev.next_position, next.first_position
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::scripted::ScriptedConnection;
    use crate::common::{CompiledFilter, Dialect, MiningRow, RawBatch};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend that rejects chosen sequences and replays scripted batches.
    #[derive(Default)]
    struct StubBackend {
        rejected: Vec<u64>,
        registrations: Mutex<Vec<(u64, bool)>>,
        batches: Mutex<VecDeque<RawBatch>>,
        opens: Mutex<Vec<(PositionToken, PositionToken)>>,
        closes: Mutex<usize>,
    }

    impl StubBackend {
        fn rejecting(sequences: &[u64]) -> Self {
            Self {
                rejected: sequences.to_vec(),
                ..Self::default()
            }
        }

        fn with_batches(self, batches: Vec<RawBatch>) -> Self {
            *self.batches.lock().unwrap() = batches.into();
            self
        }

        fn registrations(&self) -> Vec<(u64, bool)> {
            self.registrations.lock().unwrap().clone()
        }

        fn closes(&self) -> usize {
            *self.closes.lock().unwrap()
        }
    }

    #[async_trait]
    impl LogMiningBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn dialect(&self) -> Dialect {
            Dialect::Oracle
        }

        async fn current_thread(&self, _conn: &dyn SqlConnection) -> Result<u32> {
            Ok(1)
        }

        async fn online_segments(&self, _conn: &dyn SqlConnection) -> Result<Vec<LogSegment>> {
            Ok(Vec::new())
        }

        async fn archived_segments(
            &self,
            _conn: &dyn SqlConnection,
            _from: &PositionToken,
            _retention_hours: u32,
        ) -> Result<Vec<LogSegment>> {
            Ok(Vec::new())
        }

        async fn earliest_position(
            &self,
            _conn: &dyn SqlConnection,
            _thread: u32,
        ) -> Result<PositionToken> {
            Ok(PositionToken::Null)
        }

        async fn highest_position(&self, _conn: &dyn SqlConnection) -> Result<PositionToken> {
            Ok(PositionToken::Null)
        }

        async fn resolve_object_ids(
            &self,
            _conn: &dyn SqlConnection,
            _filter: &CompiledFilter,
        ) -> Result<Vec<i64>> {
            Ok(Vec::new())
        }

        async fn register_segment(
            &self,
            _conn: &dyn SqlConnection,
            segment: &LogSegment,
            new_set: bool,
        ) -> Result<()> {
            if self.rejected.contains(&segment.sequence) {
                return Err(CdcError::database("ORA-01284: file cannot be opened"));
            }
            self.registrations
                .lock()
                .unwrap()
                .push((segment.sequence, new_set));
            Ok(())
        }

        async fn open_session(
            &self,
            _conn: &dyn SqlConnection,
            window: &MiningWindow,
        ) -> Result<()> {
            self.opens.lock().unwrap().push((window.lower, window.upper));
            Ok(())
        }

        async fn pull_raw(
            &self,
            _conn: &dyn SqlConnection,
            _window: &MiningWindow,
            _predicate: &MiningPredicate,
        ) -> Result<RawBatch> {
            Ok(self
                .batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| RawBatch::last(Vec::new())))
        }

        async fn close_session(&self, _conn: &dyn SqlConnection) -> Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn record(at: u64) -> RawRecord {
        RawRecord::Mining(MiningRow::new(PositionToken::new(at), 1, "insert"))
    }

    fn contiguous() -> Vec<LogSegment> {
        vec![seg(1, 100, 200), seg(2, 200, 300), seg(3, 300, 400)]
    }

    #[tokio::test]
    async fn test_rejected_segment_is_dropped_when_coverage_holds() {
        let conn = ScriptedConnection::new();
        let backend = Arc::new(StubBackend::rejecting(&[1]));
        let mut scheduler = MiningWindowScheduler::new(backend.clone());

        // seq 1 ends before the start position; losing it leaves no hole
        let accepted = scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(250))
            .await
            .unwrap();
        let sequences: Vec<_> = accepted.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
        // the first accepted segment opens the set
        assert_eq!(backend.registrations(), vec![(2, true), (3, false)]);
        assert_eq!(scheduler.state(), SchedulerState::SegmentsRegistered);
        assert_eq!(scheduler.registered_segments().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_segment_leaving_gap_fails_registration() {
        let conn = ScriptedConnection::new();
        let mut scheduler = MiningWindowScheduler::new(Arc::new(StubBackend::rejecting(&[2])));

        let err = scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(150))
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::SegmentRegistration(_)));
        assert!(err.to_string().contains("between 200 and 300"));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_all_segments_rejected_fails_registration() {
        let conn = ScriptedConnection::new();
        let mut scheduler =
            MiningWindowScheduler::new(Arc::new(StubBackend::rejecting(&[1, 2, 3])));

        let err = scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(150))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all 3 segments were rejected"));

        let err = scheduler
            .register_segments(&conn, &[], &PositionToken::new(150))
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::SegmentRegistration(_)));
    }

    #[tokio::test]
    async fn test_window_lifecycle() {
        let conn = ScriptedConnection::new();
        let backend = Arc::new(StubBackend::default().with_batches(vec![
            RawBatch::partial(vec![record(110), record(120)]),
            RawBatch::last(vec![record(130)]),
        ]));
        let mut scheduler = MiningWindowScheduler::new(backend.clone());
        let predicate = MiningPredicate::unrestricted();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(100))
            .await
            .unwrap();
        let window = scheduler
            .open_window(&conn, PositionToken::new(100), 1_000, PositionToken::new(350))
            .await
            .unwrap();
        assert_eq!(window.id, 1);
        assert_eq!(window.upper, PositionToken::new(350));
        assert_eq!(window.segments.len(), 3);
        assert_eq!(scheduler.state(), SchedulerState::SessionActive);

        assert_eq!(scheduler.pull(&conn, &predicate).await.unwrap().len(), 2);
        assert_eq!(scheduler.pull(&conn, &predicate).await.unwrap().len(), 1);
        assert_eq!(scheduler.state(), SchedulerState::SessionActive);
        assert!(scheduler.pull(&conn, &predicate).await.unwrap().is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Draining);
        assert!(scheduler.pull(&conn, &predicate).await.unwrap().is_empty());

        let current = scheduler.window().unwrap();
        assert!(current.is_exhausted());
        assert_eq!((current.pulls, current.records), (2, 3));

        scheduler.close_window(&conn).await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Closed);
        assert!(scheduler.window().unwrap().is_closed());
        scheduler.close_window(&conn).await.unwrap();
        assert_eq!(backend.closes(), 1);

        // the next window starts from Closed
        scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(350))
            .await
            .unwrap();
        let next = scheduler
            .open_window(&conn, PositionToken::new(350), 1_000, PositionToken::Max)
            .await
            .unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(next.upper, PositionToken::new(1_350));
    }

    #[tokio::test]
    async fn test_out_of_order_calls_are_invalid_state() {
        let conn = ScriptedConnection::new();
        let backend = Arc::new(StubBackend::default());
        let mut scheduler = MiningWindowScheduler::new(backend.clone());
        let predicate = MiningPredicate::unrestricted();

        let err = scheduler
            .open_window(&conn, PositionToken::new(100), 10, PositionToken::Max)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::InvalidState(_)));
        assert!(matches!(
            scheduler.pull(&conn, &predicate).await,
            Err(CdcError::InvalidState(_))
        ));
        // nothing opened, nothing to close
        scheduler.close_window(&conn).await.unwrap();
        assert_eq!(backend.closes(), 0);

        scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(100))
            .await
            .unwrap();
        scheduler
            .open_window(&conn, PositionToken::new(100), 10, PositionToken::Max)
            .await
            .unwrap();
        let err = scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("while scheduler is SESSION_ACTIVE"));
    }

    #[tokio::test]
    async fn test_empty_window_is_not_opened() {
        let conn = ScriptedConnection::new();
        let backend = Arc::new(StubBackend::default());
        let mut scheduler = MiningWindowScheduler::new(backend.clone());
        scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(300))
            .await
            .unwrap();

        let err = scheduler
            .open_window(&conn, PositionToken::new(300), 1_000, PositionToken::new(300))
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::SessionStart(_)));
        assert!(matches!(
            scheduler
                .open_window(&conn, PositionToken::Null, 1_000, PositionToken::Max)
                .await,
            Err(CdcError::SessionStart(_))
        ));
        assert_eq!(scheduler.state(), SchedulerState::SegmentsRegistered);
        assert!(backend.opens.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovering_requires_reset() {
        let conn = ScriptedConnection::new();
        let mut scheduler = MiningWindowScheduler::new(Arc::new(StubBackend::default()));
        scheduler.mark_recovering();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler
            .register_segments(&conn, &contiguous(), &PositionToken::new(100))
            .await
            .unwrap();
        scheduler.mark_recovering();
        assert_eq!(scheduler.state(), SchedulerState::Recovering);
        assert!(matches!(
            scheduler
                .register_segments(&conn, &contiguous(), &PositionToken::new(100))
                .await,
            Err(CdcError::InvalidState(_))
        ));

        scheduler.reset();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.registered_segments().is_empty());
        assert!(scheduler.window().is_none());
    }

    fn seg(seq: u64, first: u64, next: u64) -> LogSegment {
        LogSegment::archived(
            format!("arch_{}.log", seq),
            1,
            seq,
            PositionToken::new(first),
            PositionToken::new(next),
        )
    }

    #[test]
    fn test_upper_bound_capped_by_highest() {
        assert_eq!(
            window_upper_bound(PositionToken::new(100), 1000, PositionToken::new(600)),
            PositionToken::new(600)
        );
        assert_eq!(
            window_upper_bound(PositionToken::new(100), 1000, PositionToken::new(5000)),
            PositionToken::new(1100)
        );
    }

    #[test]
    fn test_max_never_inflates_upper_bound() {
        assert_eq!(
            window_upper_bound(PositionToken::new(100), 1000, PositionToken::Max),
            PositionToken::new(1100)
        );
        assert_eq!(
            window_upper_bound(PositionToken::new(100), 1000, PositionToken::Null),
            PositionToken::new(1100)
        );
    }

    #[test]
    fn test_find_gap() {
        let contiguous = vec![seg(1, 100, 200), seg(2, 200, 300)];
        assert_eq!(find_gap(&contiguous, &PositionToken::new(150)), None);

        let gapped = vec![seg(1, 100, 200), seg(3, 300, 400)];
        assert!(find_gap(&gapped, &PositionToken::new(150))
            .unwrap()
            .contains("between 200 and 300"));

        let late_start = vec![seg(2, 200, 300)];
        assert!(find_gap(&late_start, &PositionToken::new(150))
            .unwrap()
            .contains("nothing covers 150"));
        assert_eq!(find_gap(&late_start, &PositionToken::Null), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SchedulerState::SessionActive.to_string(), "SESSION_ACTIVE");
    }
}
