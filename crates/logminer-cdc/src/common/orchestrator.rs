//! Resumable mining loop
//!
//! [`StreamOrchestrator::start`] spawns one mining worker per source and,
//! optionally, a feedback worker:
//!
//! ```text
//!            ┌──────────── recovery (backoff, fresh connection) ◀──────────┐
//!            ▼                                                             │ retriable
//!   acquire ─▶ prepare ─▶ resume position ─▶ compile filter ─┐             │ error
//!                                                            ▼             │
//!      ┌──▶ discover ─▶ register ─▶ open window ─▶ pull/decode/deliver ────┤
//!      └────────────── next window at previous upper bound ◀── close ──────┘
//! ```
//!
//! Decoded row changes pass through a [`TransactionBuffer`] and reach the
//! consumer in commit order, one whole transaction at a time. The
//! checkpoint is the buffer's low-water mark: it never passes the first
//! record of a transaction that is still open or only partly delivered, so
//! a restart re-reads such transactions in full.
//!
//! Only the mining worker writes the checkpoint, and only forward. The
//! feedback worker reads the latest written position from a watch channel
//! and reports it to the database on a fixed interval.

use crate::common::{
    AckPolicy, CdcError, ChangeEvent, ChangeEventDecoder, CheckpointStore, ConnectionSupplier,
    EventConsumer, ExponentialBackoff, FilterCompiler, LogMiningBackend, LogSegment, LogSegmentCatalog,
    MetricsSnapshot, MinerConfig, MinerMetrics, MiningPredicate,
    MiningWindowScheduler, PositionToken, Result, SqlConnection, TransactionBatch,
    TransactionBuffer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Entry point for running a mining loop.
pub struct StreamOrchestrator;

impl StreamOrchestrator {
    /// Validate `config` and spawn the mining loop (and the feedback worker
    /// when enabled). Must be called from within a Tokio runtime.
    pub async fn start<B, S>(
        config: MinerConfig,
        backend: Arc<B>,
        supplier: Arc<S>,
        checkpoint: Arc<dyn CheckpointStore>,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<MinerHandle>
    where
        B: LogMiningBackend + 'static,
        S: ConnectionSupplier + 'static,
    {
        config.validate()?;
        let backend: Arc<dyn LogMiningBackend> = backend;
        let source = config
            .source_name
            .clone()
            .unwrap_or_else(|| backend.name().to_string());

        info!(
            "Starting log mining for {} (increment {}, ack {:?}, {} include / {} exclude patterns)",
            source,
            config.window_increment,
            config.ack_policy,
            config.include_list.len(),
            config.exclude_list.len()
        );

        let metrics = Arc::new(MinerMetrics::new(source.clone()));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (position_tx, position_rx) = watch::channel(PositionToken::Null);

        let feedback = config.feedback_interval().map(|interval| {
            tokio::spawn(run_feedback(
                backend.clone(),
                supplier.clone(),
                position_rx.clone(),
                cancel_rx.clone(),
                interval,
                metrics.clone(),
            ))
        });

        let worker = MiningLoop {
            config,
            backend,
            supplier,
            checkpoint,
            consumer,
            metrics: metrics.clone(),
            cancel: cancel_rx,
            cancel_tx: cancel_tx.clone(),
            position: position_tx,
            source,
        };
        metrics.set_running(true);
        let task = tokio::spawn(worker.run());

        Ok(MinerHandle {
            cancel: cancel_tx,
            position: position_rx,
            metrics,
            task: Some(task),
            feedback,
        })
    }
}

/// Handle to a running mining loop.
pub struct MinerHandle {
    cancel: Arc<watch::Sender<bool>>,
    position: watch::Receiver<PositionToken>,
    metrics: Arc<MinerMetrics>,
    task: Option<JoinHandle<Result<()>>>,
    feedback: Option<JoinHandle<()>>,
}

impl MinerHandle {
    /// Request a graceful stop. The current window is closed and the
    /// connection released before the loop returns.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }

    /// Last position written to the checkpoint store.
    pub fn current_position(&self) -> PositionToken {
        *self.position.borrow()
    }

    /// Subscribe to checkpoint updates.
    pub fn subscribe_position(&self) -> watch::Receiver<PositionToken> {
        self.position.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait for the loop to finish. Returns the terminal error, if any.
    pub async fn join(mut self) -> Result<()> {
        let result = match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(CdcError::other(format!("mining task failed: {}", e))),
            },
            None => Ok(()),
        };
        self.cancel.send_replace(true);
        if let Some(feedback) = self.feedback.take() {
            let _ = feedback.await;
        }
        result
    }

    /// Stop and wait.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join().await
    }
}

struct MiningLoop<S: ConnectionSupplier> {
    config: MinerConfig,
    backend: Arc<dyn LogMiningBackend>,
    supplier: Arc<S>,
    checkpoint: Arc<dyn CheckpointStore>,
    consumer: Arc<dyn EventConsumer>,
    metrics: Arc<MinerMetrics>,
    cancel: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
    position: watch::Sender<PositionToken>,
    source: String,
}

impl<S: ConnectionSupplier + 'static> MiningLoop<S> {
    async fn run(self) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(
            self.config.recovery_backoff_base(),
            self.config.recovery_backoff_max(),
        );

        let result = loop {
            if self.is_cancelled() {
                break Ok(());
            }

            let outcome = match self.supplier.acquire().await {
                Ok(conn) => {
                    let mut scheduler = MiningWindowScheduler::new(self.backend.clone());
                    let outcome = self.run_attempt(&conn, &mut scheduler, &mut backoff).await;
                    if outcome.is_err() {
                        scheduler.mark_recovering();
                    }
                    if let Err(e) = scheduler.close_window(&conn).await {
                        warn!("Failed to close mining window for {}: {}", self.source, e);
                    }
                    self.supplier.release(conn).await;
                    outcome
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) | Err(CdcError::Cancelled) => break Ok(()),
                Err(e) if e.is_retriable() => {
                    let delay = backoff.next_backoff();
                    warn!(
                        "Mining attempt {} for {} failed [{}], restarting from checkpoint in {:?}: {}",
                        backoff.attempt(),
                        self.source,
                        e.error_code(),
                        delay,
                        e
                    );
                    self.metrics.record_recovery(e.error_code());
                    self.metrics.set_last_error(e.to_string());
                    if !self.sleep(delay).await {
                        break Ok(());
                    }
                }
                Err(e) => {
                    error!("Mining for {} stopped on terminal error: {}", self.source, e);
                    self.metrics.set_last_error(e.to_string());
                    break Err(e);
                }
            }
        };

        self.metrics.set_running(false);
        self.cancel_tx.send_replace(true);
        info!("Log mining for {} stopped", self.source);
        result
    }

    /// One connection's worth of mining. Returns `Ok` only on cancellation.
    async fn run_attempt(
        &self,
        conn: &S::Connection,
        scheduler: &mut MiningWindowScheduler,
        backoff: &mut ExponentialBackoff,
    ) -> Result<()> {
        let conn: &dyn SqlConnection = conn;
        self.backend.prepare(conn).await?;

        let catalog = LogSegmentCatalog::new(self.backend.clone())
            .with_retention_hours(self.config.retention_hours);
        let mut lower = self.resume_position(conn, &catalog).await?;

        let predicate = FilterCompiler::new(self.backend.dialect())
            .mining_predicate(
                self.backend.as_ref(),
                conn,
                self.config.filter_mode,
                self.config.include_list.as_slice(),
                self.config.exclude_list.as_slice(),
            )
            .await
            .map_err(|e| e.into_backend_error(CdcError::NoCatalogAccess))?;
        debug!("Mining predicate for {}: {}", self.source, predicate.to_sql());

        let mut decoder = ChangeEventDecoder::new(self.source.clone());
        let mut transactions = TransactionBuffer::new(lower);
        loop {
            if self.is_cancelled() {
                return Ok(());
            }

            let highest = self
                .backend
                .highest_position(conn)
                .await
                .map_err(|e| e.into_backend_error(CdcError::NoCatalogAccess))?;
            if !highest.is_max() && highest <= lower {
                trace!("No new log beyond {}, sleeping", lower);
                if !self.sleep(self.config.poll_interval()).await {
                    return Ok(());
                }
                continue;
            }

            let segments = self.discover(&catalog, conn, &lower).await?;
            scheduler
                .register_segments(conn, &segments, &lower)
                .await?;
            let window = scheduler
                .open_window(conn, lower, self.config.window_increment, highest)
                .await?;
            self.metrics.record_window_opened();

            let drained = self
                .drain_window(conn, scheduler, &mut decoder, &mut transactions, &predicate)
                .await?;

            scheduler.close_window(conn).await?;
            self.metrics.record_window_closed(window.elapsed());
            decoder.reset_window();

            if !drained {
                return Ok(());
            }
            backoff.reset();
            lower = window.upper;
            transactions.observe(lower);
            if transactions.open_transactions() > 0 {
                debug!(
                    "{} transactions ({} events) still open after window [{}, {}), checkpoint held at {}",
                    transactions.open_transactions(),
                    transactions.buffered_events(),
                    window.lower,
                    window.upper,
                    transactions.low_water()
                );
            }
            if self.config.ack_policy == AckPolicy::PerWindow {
                self.acknowledge(transactions.low_water()).await?;
            }
        }
    }

    async fn discover(
        &self,
        catalog: &LogSegmentCatalog,
        conn: &dyn SqlConnection,
        from: &PositionToken,
    ) -> Result<Vec<LogSegment>> {
        let segments = catalog.discover(conn, from).await?;
        if segments.is_empty() {
            return Err(CdcError::segment_registration(format!(
                "no log segments cover {}",
                from
            )));
        }
        Ok(segments)
    }

    /// Starting position: the checkpoint, else the earliest minable
    /// position, else the current tail.
    async fn resume_position(
        &self,
        conn: &dyn SqlConnection,
        catalog: &LogSegmentCatalog,
    ) -> Result<PositionToken> {
        let saved = self.checkpoint.load().await?;
        if !saved.is_null() {
            info!("Resuming {} from checkpoint {}", self.source, saved);
            self.position.send_if_modified(|current| {
                if saved > *current {
                    *current = saved;
                    true
                } else {
                    false
                }
            });
            return Ok(saved);
        }

        let earliest = catalog
            .earliest_minable_position_current_thread(conn)
            .await?;
        if !earliest.is_null() && !earliest.is_max() {
            info!(
                "Cold start for {} at earliest minable position {}",
                self.source, earliest
            );
            return Ok(earliest);
        }

        let highest = self
            .backend
            .highest_position(conn)
            .await
            .map_err(|e| e.into_backend_error(CdcError::NoCatalogAccess))?;
        if highest.is_null() || highest.is_max() {
            return Err(CdcError::no_catalog_access(
                "no minable position reported by the database",
            ));
        }
        info!(
            "Cold start for {} at current position {} (nothing archived)",
            self.source, highest
        );
        Ok(highest)
    }

    /// Pull and deliver everything in the window. Returns `false` when
    /// cancelled before the window was exhausted.
    async fn drain_window(
        &self,
        conn: &dyn SqlConnection,
        scheduler: &mut MiningWindowScheduler,
        decoder: &mut ChangeEventDecoder,
        transactions: &mut TransactionBuffer,
        predicate: &MiningPredicate,
    ) -> Result<bool> {
        loop {
            if !decoder.has_pending() && self.is_cancelled() {
                return Ok(false);
            }
            let records = scheduler.pull(conn, predicate).await?;
            if records.is_empty() {
                return Ok(true);
            }

            for raw in records {
                if !decoder.has_pending() && self.is_cancelled() {
                    return Ok(false);
                }

                transactions.observe(raw.position());
                let skipped_before = decoder.stats().skipped;
                let decoded = decoder.decode(raw)?;
                self.metrics
                    .record_payloads_skipped(decoder.stats().skipped - skipped_before);

                let Some(event) = decoded else {
                    continue;
                };
                if event.is_boundary() {
                    self.metrics.record_boundary_skipped();
                } else if !predicate.admits(event.object_id) {
                    self.metrics.record_filtered();
                    continue;
                }

                let before = transactions.stats();
                let ready = transactions.push(event);
                let after = transactions.stats();
                self.metrics.record_transactions(
                    after.committed - before.committed,
                    after.rolled_back - before.rolled_back,
                );

                if let Some(batch) = ready {
                    if !self.deliver_batch(&batch, transactions).await? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Deliver a released batch in order. Under per-event acknowledgement
    /// the checkpoint stays at or below the batch start until its last
    /// event is accepted.
    async fn deliver_batch(
        &self,
        batch: &TransactionBatch,
        transactions: &TransactionBuffer,
    ) -> Result<bool> {
        let per_event = self.config.ack_policy == AckPolicy::PerEvent;
        for event in &batch.events {
            if self.is_cancelled() {
                return Ok(false);
            }
            self.deliver(event).await?;
            if per_event {
                self.acknowledge(transactions.low_water().min_of(batch.start))
                    .await?;
            }
        }
        if per_event {
            self.acknowledge(transactions.low_water()).await?;
        }
        Ok(true)
    }

    /// Offer `event` until the consumer accepts it.
    async fn deliver(&self, event: &ChangeEvent) -> Result<()> {
        loop {
            match self.consumer.accept(event).await {
                Ok(()) => {
                    self.metrics.record_delivered(event.op, event.position);
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.record_consumer_rejection();
                    debug!(
                        "Consumer rejected {} at {}, retrying: {}",
                        event.op.as_str(),
                        event.position,
                        e
                    );
                    if !self.sleep(self.config.consumer_retry_delay()).await {
                        return Err(CdcError::Cancelled);
                    }
                }
            }
        }
    }

    /// Persist `position` if it moves the checkpoint forward.
    async fn acknowledge(&self, position: PositionToken) -> Result<()> {
        if position <= *self.position.borrow() {
            return Ok(());
        }
        self.checkpoint.save(position).await?;
        self.position.send_replace(position);
        trace!("Checkpoint for {} advanced to {}", self.source, position);
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleep for `duration`; `false` if cancelled first.
    async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut cancel = self.cancel.clone();
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = cancel.changed() => true,
        };
        !interrupted && !self.is_cancelled()
    }
}

/// Periodically report the checkpointed position to the database.
async fn run_feedback<S: ConnectionSupplier>(
    backend: Arc<dyn LogMiningBackend>,
    supplier: Arc<S>,
    position: watch::Receiver<PositionToken>,
    mut cancel: watch::Receiver<bool>,
    interval: Duration,
    metrics: Arc<MinerMetrics>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut last_sent = PositionToken::Null;
    loop {
        if *cancel.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
        }

        let current = *position.borrow();
        if current.is_null() || current <= last_sent {
            continue;
        }

        let result = match supplier.acquire().await {
            Ok(conn) => {
                let result = backend.send_feedback(&conn, &current).await;
                supplier.release(conn).await;
                result
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("Sent feedback for {} at {}", backend.name(), current);
                metrics.record_feedback(true);
                last_sent = current;
            }
            Err(e) => {
                warn!("Feedback for {} at {} failed: {}", backend.name(), current, e);
                metrics.record_feedback(false);
            }
        }
    }
    trace!("Feedback worker for {} stopped", backend.name());
}
