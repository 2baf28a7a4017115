//! Bounded chunk buffer with batched, retryable flushes
//!
//! Chunks are appended synchronously from the capture side and released in
//! batches of `batch_size` to a [`BatchHandler`]. A batch's chunks are marked
//! processed before the handler runs and removed when it succeeds. When it
//! fails they are unmarked for the next flush, unless the failure has no
//! recovery path (validation, manual intervention), in which case the batch
//! is dropped.
//!
//! # Memory Budget
//!
//! With the default 100 chunks of 100ms PCM16 at 24kHz (4,800 bytes each) the
//! buffer holds at most ~480 KB.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{AudioChunk, BatchHandler, BufferError, BufferedChunk};
use crate::config::{BufferConfig, BUFFER_COLLABORATOR};
use crate::resilience::{
    EnhancedError, ErrorContext, ErrorHandler, RawError, RecoveryPlan, RecoveryStrategy,
};

/// Receives every error the buffer reports
pub type ErrorCallback = Arc<dyn Fn(&EnhancedError) + Send + Sync>;

/// Result of one [`ChunkBuffer::flush`] call
#[derive(Debug, Clone)]
pub enum FlushOutcome {
    /// Nothing unprocessed
    Empty,
    /// Another flush is running; this call did nothing
    AlreadyFlushing,
    Delivered { chunks: usize },
    /// The handler failed; the chunks stay buffered for the next flush
    Failed {
        chunks: usize,
        error: Box<EnhancedError>,
    },
    /// The handler failed in a way retrying cannot fix; the chunks are gone
    Dropped {
        chunks: usize,
        error: Box<EnhancedError>,
    },
    Disposed,
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    /// Chunks currently buffered
    pub total_chunks: usize,
    /// Buffered chunks that belong to the batch in flight
    pub processed_chunks: usize,
    /// Buffered chunks waiting for a flush
    pub pending_chunks: usize,
    pub oldest_chunk_age_ms: Option<u64>,
    pub buffer_utilization_pct: f64,
    /// A flush is running
    pub is_processing: bool,
    pub total_added: u64,
    pub total_delivered: u64,
    /// Removed by overflow
    pub total_evicted: u64,
    /// Chunks that never entered the buffer
    pub total_rejected: u64,
    /// Buffered chunks discarded with an unrecoverable batch
    pub total_dropped: u64,
    pub batches_delivered: u64,
    pub batches_failed: u64,
}

#[derive(Default)]
struct State {
    chunks: VecDeque<BufferedChunk>,
    next_id: u64,
    flushing: bool,
    disposed: bool,
    total_added: u64,
    total_delivered: u64,
    total_evicted: u64,
    total_rejected: u64,
    total_dropped: u64,
    batches_delivered: u64,
    batches_failed: u64,
}

impl State {
    fn unprocessed(&self) -> impl Iterator<Item = &BufferedChunk> {
        self.chunks.iter().filter(|c| !c.processed)
    }

    /// Drop up to `count` of the oldest unprocessed chunks
    fn evict_oldest(&mut self, count: usize) -> usize {
        let mut remaining = count;
        self.chunks.retain(|c| {
            if remaining > 0 && !c.processed {
                remaining -= 1;
                false
            } else {
                true
            }
        });
        let evicted = count - remaining;
        self.total_evicted += evicted as u64;
        evicted
    }

    /// Mark the oldest `batch_size` unprocessed chunks and return copies
    fn take_batch(&mut self, batch_size: usize) -> Vec<BufferedChunk> {
        let mut batch = Vec::with_capacity(batch_size);
        for chunk in self.chunks.iter_mut() {
            if batch.len() == batch_size {
                break;
            }
            if !chunk.processed {
                chunk.processed = true;
                batch.push(chunk.clone());
            }
        }
        batch
    }

    fn unmark(&mut self, ids: &[u64]) {
        for chunk in self.chunks.iter_mut().filter(|c| ids.contains(&c.id)) {
            chunk.processed = false;
        }
    }

    /// Remove the given chunks; returns how many were still buffered
    fn remove(&mut self, ids: &[u64]) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|c| !ids.contains(&c.id));
        before - self.chunks.len()
    }
}

/// What happens to a batch's chunks once the handler has answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Delivered,
    Retry,
    Drop,
}

impl Settlement {
    /// Failures with no recovery path would fail the same way on every flush
    fn after_failure(plan: &RecoveryPlan) -> Self {
        match plan.strategy {
            RecoveryStrategy::None | RecoveryStrategy::ManualIntervention => Settlement::Drop,
            _ => Settlement::Retry,
        }
    }
}

/// Oldest ~20% of the capacity, at least one chunk
fn eviction_count(capacity: usize) -> usize {
    capacity.div_ceil(5).max(1)
}

struct Inner {
    config: BufferConfig,
    handler: BatchHandler,
    errors: Arc<ErrorHandler>,
    on_error: Mutex<Option<ErrorCallback>>,
    state: Mutex<State>,
    flush_done: Notify,
    shutdown: CancellationToken,
    runtime: Handle,
}

/// Resets the flushing flag when a flush ends, including when its future is
/// dropped mid-batch
struct FlushGuard<'a> {
    inner: &'a Inner,
    ids: Vec<u64>,
    settled: bool,
}

impl FlushGuard<'_> {
    fn settle(&mut self, settlement: Settlement) {
        {
            let mut state = self.inner.lock_state();
            match settlement {
                Settlement::Delivered => {
                    let removed = state.remove(&self.ids);
                    state.total_delivered += removed as u64;
                    state.batches_delivered += 1;
                }
                Settlement::Retry => {
                    state.unmark(&self.ids);
                    state.batches_failed += 1;
                }
                Settlement::Drop => {
                    let removed = state.remove(&self.ids);
                    state.total_dropped += removed as u64;
                    state.batches_failed += 1;
                }
            }
            state.flushing = false;
        }
        self.settled = true;
        self.inner.flush_done.notify_waiters();
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut state = self.inner.lock_state();
            state.unmark(&self.ids);
            state.flushing = false;
        }
        self.inner.flush_done.notify_waiters();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn validate(&self, chunk: &AudioChunk) -> Result<(), BufferError> {
        if chunk.is_empty() {
            return Err(BufferError::InvalidChunk(format!(
                "chunk {} has no data",
                chunk.sequence
            )));
        }
        if chunk.len() % self.config.sample_width_bytes.max(1) != 0 {
            return Err(BufferError::InvalidChunk(format!(
                "chunk {} is {} bytes, not a multiple of the {}-byte sample width",
                chunk.sequence,
                chunk.len(),
                self.config.sample_width_bytes
            )));
        }
        if chunk.len() > self.config.max_chunk_bytes {
            return Err(BufferError::InvalidChunk(format!(
                "chunk {} is {} bytes, above the {}-byte limit",
                chunk.sequence,
                chunk.len(),
                self.config.max_chunk_bytes
            )));
        }
        Ok(())
    }

    fn report(&self, raw: &RawError, context: &ErrorContext) -> (EnhancedError, RecoveryPlan) {
        let (error, plan) = self.errors.handle(raw, BUFFER_COLLABORATOR, context);
        let callback = self
            .on_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&error);
        }
        (error, plan)
    }

    async fn flush(&self) -> FlushOutcome {
        let batch = {
            let mut state = self.lock_state();
            if state.disposed {
                return FlushOutcome::Disposed;
            }
            if state.flushing {
                return FlushOutcome::AlreadyFlushing;
            }
            let batch = state.take_batch(self.config.batch_size.max(1));
            if batch.is_empty() {
                return FlushOutcome::Empty;
            }
            state.flushing = true;
            batch
        };

        let count = batch.len();
        let mut guard = FlushGuard {
            inner: self,
            ids: batch.iter().map(|c| c.id).collect(),
            settled: false,
        };
        let first_sequence = batch[0].chunk.sequence;

        match (self.handler)(batch).await {
            Ok(()) => {
                guard.settle(Settlement::Delivered);
                log::debug!(
                    "ChunkBuffer: delivered batch of {} chunk(s) from sequence {}",
                    count,
                    first_sequence
                );
                FlushOutcome::Delivered { chunks: count }
            }
            Err(e) => {
                if self.lock_state().disposed {
                    guard.settle(Settlement::Retry);
                    return FlushOutcome::Disposed;
                }
                let mut context = ErrorContext::new();
                context.insert("chunks".to_string(), count.into());
                context.insert("firstSequence".to_string(), first_sequence.into());
                let (error, plan) = self.report(&RawError::from(&e), &context);

                let settlement = Settlement::after_failure(&plan);
                guard.settle(settlement);
                let error = Box::new(error);
                if settlement == Settlement::Drop {
                    log::warn!(
                        "ChunkBuffer: dropped batch of {} chunk(s) from sequence {} ({})",
                        count,
                        first_sequence,
                        error.code()
                    );
                    FlushOutcome::Dropped {
                        chunks: count,
                        error,
                    }
                } else {
                    FlushOutcome::Failed {
                        chunks: count,
                        error,
                    }
                }
            }
        }
    }
}

fn spawn_flush_timer(
    runtime: &Handle,
    inner: Weak<Inner>,
    every: Duration,
    shutdown: CancellationToken,
) {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    if let FlushOutcome::Delivered { chunks } = inner.flush().await {
                        log::trace!("ChunkBuffer: timer flushed {} chunk(s)", chunks);
                    }
                }
            }
        }
        log::debug!("ChunkBuffer: flush timer stopped");
    });
}

/// Bounded, batching audio chunk buffer
///
/// Must be created inside a tokio runtime; `add_chunk` may then be called
/// from any thread. Dropping the buffer disposes it.
pub struct ChunkBuffer {
    inner: Arc<Inner>,
}

impl ChunkBuffer {
    pub fn new(config: &BufferConfig, handler: BatchHandler, errors: Arc<ErrorHandler>) -> Self {
        let runtime = Handle::current();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            config: config.clone(),
            handler,
            errors,
            on_error: Mutex::new(None),
            state: Mutex::new(State::default()),
            flush_done: Notify::new(),
            shutdown: shutdown.clone(),
            runtime: runtime.clone(),
        });

        let every = config.flush_interval().max(Duration::from_millis(1));
        spawn_flush_timer(&runtime, Arc::downgrade(&inner), every, shutdown);

        log::info!(
            "ChunkBuffer: initialized (capacity {}, batch {}, flush every {:?}, max age {:?})",
            config.max_buffer_size,
            config.batch_size,
            every,
            config.max_chunk_age()
        );

        Self { inner }
    }

    /// Install the error callback, replacing any previous one
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&EnhancedError) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(callback));
    }

    /// Append a chunk; returns its buffer ID
    ///
    /// Invalid chunks are rejected. When the buffer is full the oldest ~20%
    /// of unprocessed chunks are evicted first and the overflow is reported,
    /// but the new chunk is kept. Every error is also passed to the error
    /// callback. May start a flush in the background.
    pub fn add_chunk(&self, chunk: AudioChunk) -> Result<u64, BufferError> {
        let mut context = ErrorContext::new();
        context.insert("sequence".to_string(), chunk.sequence.into());

        if let Err(e) = self.inner.validate(&chunk) {
            let disposed = {
                let mut state = self.inner.lock_state();
                state.total_rejected += 1;
                state.disposed
            };
            if !disposed {
                self.inner.report(&RawError::from(&e), &context);
            }
            return Err(e);
        }

        let capacity = self.inner.config.max_buffer_size.max(1);
        let (outcome, should_flush) = {
            let mut state = self.inner.lock_state();
            if state.disposed {
                return Err(BufferError::Disposed);
            }

            let mut overflow = None;
            if state.chunks.len() >= capacity {
                let evicted = state.evict_oldest(eviction_count(capacity));
                overflow = Some(BufferError::Overflow { evicted, capacity });
            }

            let outcome = if state.chunks.len() >= capacity {
                // Everything left is in flight
                state.total_rejected += 1;
                Err(overflow.unwrap_or(BufferError::Overflow {
                    evicted: 0,
                    capacity,
                }))
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.total_added += 1;
                state.chunks.push_back(BufferedChunk::new(id, chunk));
                Ok((id, overflow))
            };

            let should_flush = !state.flushing && {
                let unprocessed = state.unprocessed().count();
                let oldest_age = state.unprocessed().next().map(|c| c.age());
                unprocessed >= self.inner.config.batch_size.max(1)
                    || oldest_age.is_some_and(|age| age >= self.inner.config.max_chunk_age())
            };
            (outcome, should_flush)
        };

        let result = match outcome {
            Ok((id, overflow)) => {
                if let Some(overflow) = overflow {
                    log::warn!("ChunkBuffer: {}", overflow);
                    context.insert("capacity".to_string(), capacity.into());
                    self.inner.report(&RawError::from(&overflow), &context);
                }
                Ok(id)
            }
            Err(e) => {
                log::warn!("ChunkBuffer: rejected chunk: {}", e);
                self.inner.report(&RawError::from(&e), &context);
                Err(e)
            }
        };

        if should_flush {
            let inner = self.inner.clone();
            self.inner.runtime.spawn(async move {
                inner.flush().await;
            });
        }

        result
    }

    /// Emit the oldest `batch_size` unprocessed chunks
    ///
    /// A call made while another flush is running returns
    /// [`FlushOutcome::AlreadyFlushing`] without waiting.
    pub async fn flush(&self) -> FlushOutcome {
        self.inner.flush().await
    }

    /// Flush batch after batch until nothing is left or a batch fails;
    /// returns the number of chunks delivered
    pub async fn flush_all(&self) -> usize {
        let mut delivered = 0;
        loop {
            let notified = self.inner.flush_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.flush().await {
                FlushOutcome::Delivered { chunks } => delivered += chunks,
                FlushOutcome::AlreadyFlushing => notified.await,
                // Keep going past a dropped batch; the rest may be fine
                FlushOutcome::Dropped { .. } => {}
                FlushOutcome::Empty | FlushOutcome::Disposed | FlushOutcome::Failed { .. } => {
                    break
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.inner.lock_state();
        let pending = state.unprocessed().count();
        let oldest = state.chunks.front().map(|c| c.age().as_millis() as u64);
        let capacity = self.inner.config.max_buffer_size.max(1);
        let stats = BufferStats {
            total_chunks: state.chunks.len(),
            processed_chunks: state.chunks.len() - pending,
            pending_chunks: pending,
            oldest_chunk_age_ms: oldest,
            buffer_utilization_pct: state.chunks.len() as f64 * 100.0 / capacity as f64,
            is_processing: state.flushing,
            total_added: state.total_added,
            total_delivered: state.total_delivered,
            total_evicted: state.total_evicted,
            total_rejected: state.total_rejected,
            total_dropped: state.total_dropped,
            batches_delivered: state.batches_delivered,
            batches_failed: state.batches_failed,
        };
        stats
    }

    /// Stop the flush timer and discard everything still buffered
    pub fn dispose(&self) {
        let discarded = {
            let mut state = self.inner.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let discarded = state.chunks.len();
            state.chunks.clear();
            discarded
        };
        self.inner.shutdown.cancel();
        self.inner.flush_done.notify_waiters();

        if discarded > 0 {
            log::info!(
                "ChunkBuffer: disposed, discarded {} unflushed chunk(s)",
                discarded
            );
        } else {
            log::debug!("ChunkBuffer: disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock_state().disposed
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}
