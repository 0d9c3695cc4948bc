//! Shared fixtures: an in-memory log with a scripted backend over it.

#![allow(dead_code)]

use async_trait::async_trait;
use logminer_cdc::common::{
    CompiledFilter, ConnectionSupplier, Dialect, LogMiningBackend, LogSegment, MiningPredicate,
    MiningRow, MiningWindow, RawBatch, RawRecord, SqlConnection, SqlRow, SqlValue,
};
use logminer_cdc::{CdcError, PositionToken, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("logminer_cdc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn pos(v: u64) -> PositionToken {
    PositionToken::new(v)
}

/// Insert row for `schema.table` (object id `object_id`) at `at`, outside
/// any transaction.
pub fn insert(at: u64, object_id: i64, schema: &str, table: &str) -> MiningRow {
    MiningRow::new(
        pos(at),
        1,
        format!("insert into \"{}\".\"{}\" values ({});", schema, table, at),
    )
    .with_object(object_id, schema, table)
}

/// Insert row of transaction `xid` at `at`.
pub fn insert_in(xid: &str, at: u64, object_id: i64, schema: &str, table: &str) -> MiningRow {
    insert(at, object_id, schema, table).with_transaction(xid)
}

/// Commit row for a transaction nothing else belongs to.
pub fn commit(at: u64) -> MiningRow {
    commit_of(&format!("tx{}", at), at)
}

pub fn commit_of(xid: &str, at: u64) -> MiningRow {
    MiningRow::new(pos(at), 7, "commit;").with_transaction(xid)
}

pub fn rollback_of(xid: &str, at: u64) -> MiningRow {
    MiningRow::new(pos(at), 36, "rollback;").with_transaction(xid)
}

#[derive(Default)]
struct LogState {
    earliest: PositionToken,
    highest: PositionToken,
    online: Vec<LogSegment>,
    archived: Vec<LogSegment>,
    rows: Vec<MiningRow>,
    objects: Vec<(String, String, i64)>,
    open_failures: Vec<String>,
    windows: Vec<(PositionToken, PositionToken)>,
    feedback: Vec<PositionToken>,
}

/// Backend over an in-memory log.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<LogState>,
    prepares: AtomicUsize,
    registrations: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeBackend {
    /// Log with one current ONLINE segment covering `[earliest, Max)`.
    pub fn new(earliest: u64, highest: u64) -> Self {
        let backend = Self::default();
        {
            let mut state = backend.state.lock().unwrap();
            state.earliest = pos(earliest);
            state.highest = pos(highest);
            state.online = vec![LogSegment::online(
                "redo01.log",
                1,
                1,
                pos(earliest),
                PositionToken::Max,
                true,
            )];
        }
        backend
    }

    pub fn with_rows(self, rows: Vec<MiningRow>) -> Self {
        self.state.lock().unwrap().rows = rows;
        self
    }

    pub fn with_object(self, schema: &str, table: &str, id: i64) -> Self {
        self.state
            .lock()
            .unwrap()
            .objects
            .push((schema.to_string(), table.to_string(), id));
        self
    }

    pub fn with_archived(self, segment: LogSegment) -> Self {
        self.state.lock().unwrap().archived.push(segment);
        self
    }

    /// Fail the next `open_session` calls with these messages, in order.
    pub fn fail_next_open(self, message: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .open_failures
            .push(message.to_string());
        self
    }

    pub fn set_highest(&self, highest: u64) {
        self.state.lock().unwrap().highest = pos(highest);
    }

    pub fn append(&self, rows: Vec<MiningRow>) {
        self.state.lock().unwrap().rows.extend(rows);
    }

    pub fn windows(&self) -> Vec<(PositionToken, PositionToken)> {
        self.state.lock().unwrap().windows.clone()
    }

    pub fn feedback(&self) -> Vec<PositionToken> {
        self.state.lock().unwrap().feedback.clone()
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogMiningBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    async fn prepare(&self, _conn: &dyn SqlConnection) -> Result<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn current_thread(&self, _conn: &dyn SqlConnection) -> Result<u32> {
        Ok(1)
    }

    async fn online_segments(&self, _conn: &dyn SqlConnection) -> Result<Vec<LogSegment>> {
        Ok(self.state.lock().unwrap().online.clone())
    }

    async fn archived_segments(
        &self,
        _conn: &dyn SqlConnection,
        _from: &PositionToken,
        _retention_hours: u32,
    ) -> Result<Vec<LogSegment>> {
        Ok(self.state.lock().unwrap().archived.clone())
    }

    async fn earliest_position(
        &self,
        _conn: &dyn SqlConnection,
        _thread: u32,
    ) -> Result<PositionToken> {
        Ok(self.state.lock().unwrap().earliest)
    }

    async fn highest_position(&self, _conn: &dyn SqlConnection) -> Result<PositionToken> {
        Ok(self.state.lock().unwrap().highest)
    }

    async fn resolve_object_ids(
        &self,
        _conn: &dyn SqlConnection,
        filter: &CompiledFilter,
    ) -> Result<Vec<i64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(schema, table, _)| filter.matches(schema, table))
            .map(|(_, _, id)| *id)
            .collect())
    }

    async fn register_segment(
        &self,
        _conn: &dyn SqlConnection,
        _segment: &LogSegment,
        _new_set: bool,
    ) -> Result<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_session(&self, _conn: &dyn SqlConnection, window: &MiningWindow) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open_failures.is_empty() {
            let message = state.open_failures.remove(0);
            return Err(CdcError::database(message));
        }
        state.windows.push((window.lower, window.upper));
        Ok(())
    }

    async fn pull_raw(
        &self,
        _conn: &dyn SqlConnection,
        window: &MiningWindow,
        _predicate: &MiningPredicate,
    ) -> Result<RawBatch> {
        let state = self.state.lock().unwrap();
        let records = state
            .rows
            .iter()
            .filter(|row| window.contains(&row.position))
            .cloned()
            .map(RawRecord::Mining)
            .collect();
        Ok(RawBatch::last(records))
    }

    async fn close_session(&self, _conn: &dyn SqlConnection) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_feedback(&self, _conn: &dyn SqlConnection, position: &PositionToken) -> Result<()> {
        self.state.lock().unwrap().feedback.push(*position);
        Ok(())
    }
}

/// Connection that answers nothing; the fake backend ignores it.
pub struct NullConnection;

#[async_trait]
impl SqlConnection for NullConnection {
    async fn query(&self, _sql: &str, _params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        Ok(Vec::new())
    }

    async fn execute(&self, _sql: &str, _params: &[SqlValue]) -> Result<u64> {
        Ok(0)
    }
}

/// Supplier counting acquire/release pairs.
#[derive(Default)]
pub struct CountingSupplier {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl CountingSupplier {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionSupplier for CountingSupplier {
    type Connection = NullConnection;

    async fn acquire(&self) -> Result<NullConnection> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(NullConnection)
    }

    async fn release(&self, _conn: NullConnection) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
