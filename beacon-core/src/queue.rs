//! In-memory batching queue
//!
//! The queue decides *when* a batch leaves memory:
//! - immediately when it holds `batch_size` events
//! - after `flush_interval` once the first event of a batch arrives
//! - on an explicit [`Queue::flush`]
//!
//! Taking a batch swaps the buffer out under the lock, so events enqueued
//! while a batch is in flight land in the next batch and concurrent flush
//! triggers never see the same events twice. If the [`BatchSink`] fails, the
//! batch goes back to the head of the queue and the timer is re-armed. The
//! queue itself never backs off; that is the transport's job.
//!
//! Every batch taken out of the buffer counts as in flight until the sink
//! returns. [`Queue::wait_idle`] lets shutdown wait for background
//! deliveries before the runtime goes away.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::event::SerializedEvent;

/// Receives batches taken out of the queue
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Deliver or persist `batch`; an error hands the batch back to the queue
    async fn on_flush(&self, batch: &[SerializedEvent]) -> Result<()>;
}

/// Cloneable handle to a shared batching queue
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<QueueState>,
    batch_size: usize,
    flush_interval: Duration,
    sink: Arc<dyn BatchSink>,
    runtime: Handle,
    in_flight: watch::Sender<usize>,
}

#[derive(Default)]
struct QueueState {
    events: Vec<SerializedEvent>,
    timer: Option<FlushTimer>,
    next_timer_id: u64,
}

struct FlushTimer {
    id: u64,
    handle: JoinHandle<()>,
}

/// Counts one batch as in flight for as long as it is alive
struct InFlight {
    shared: Arc<Shared>,
}

impl InFlight {
    fn start(shared: &Arc<Shared>) -> Self {
        shared.in_flight.send_modify(|n| *n += 1);
        Self {
            shared: shared.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared
            .in_flight
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl QueueState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

impl Queue {
    /// Create a queue whose timers and size-triggered flushes run on `runtime`
    pub fn new(
        batch_size: usize,
        flush_interval: Duration,
        sink: Arc<dyn BatchSink>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                batch_size: batch_size.max(1),
                flush_interval,
                sink,
                runtime,
                in_flight: watch::channel(0).0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent even if a holder panicked
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event to the tail
    ///
    /// Reaching `batch_size` takes the batch and delivers it in the
    /// background; otherwise the flush timer is armed if it is not running.
    pub fn enqueue(&self, event: SerializedEvent) {
        let mut state = self.lock();
        state.events.push(event);

        if state.events.len() >= self.inner.batch_size {
            state.cancel_timer();
            let batch = std::mem::take(&mut state.events);
            let in_flight = InFlight::start(&self.inner);
            drop(state);

            tracing::debug!(events = batch.len(), "Batch size reached, flushing");
            let queue = self.clone();
            self.inner.runtime.spawn(async move {
                let _ = queue.deliver(batch, in_flight).await;
            });
        } else {
            self.arm_timer(&mut state);
        }
    }

    /// Take the current batch and hand it to the sink
    ///
    /// Returns the number of events handed off; an empty queue is a no-op.
    /// On sink failure the batch is back in the queue when this returns.
    pub async fn flush(&self) -> Result<usize> {
        let (batch, in_flight) = {
            let mut state = self.lock();
            if state.events.is_empty() {
                return Ok(0);
            }
            state.cancel_timer();
            (std::mem::take(&mut state.events), InFlight::start(&self.inner))
        };

        self.deliver(batch, in_flight).await
    }

    /// Wait until no batch is being handed to the sink
    ///
    /// Batches the sink rejected are back in the queue when this returns.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Batches currently being handed to the sink
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    async fn deliver(&self, batch: Vec<SerializedEvent>, _in_flight: InFlight) -> Result<usize> {
        match self.inner.sink.on_flush(&batch).await {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                tracing::warn!(error = %e, events = batch.len(), "Flush failed, requeueing batch");
                self.requeue(batch);
                Err(e)
            }
        }
    }

    /// Put a failed batch back in front of anything enqueued since
    fn requeue(&self, mut batch: Vec<SerializedEvent>) {
        let mut state = self.lock();
        batch.append(&mut state.events);
        state.events = batch;
        self.arm_timer(&mut state);
    }

    fn arm_timer(&self, state: &mut QueueState) {
        if state.timer.is_some() {
            return;
        }

        let id = state.next_timer_id;
        state.next_timer_id += 1;

        let queue = self.clone();
        let interval = self.inner.flush_interval;
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            queue.on_timer(id).await;
        });
        state.timer = Some(FlushTimer { id, handle });
    }

    async fn on_timer(&self, id: u64) {
        let (batch, in_flight) = {
            let mut state = self.lock();
            match &state.timer {
                // Detach before flushing so flush() cannot abort this task
                Some(timer) if timer.id == id => state.timer = None,
                _ => return,
            }
            if state.events.is_empty() {
                return;
            }
            (std::mem::take(&mut state.events), InFlight::start(&self.inner))
        };

        tracing::debug!(events = batch.len(), "Flush interval elapsed");
        let _ = self.deliver(batch, in_flight).await;
    }

    /// Number of events waiting in memory
    pub fn size(&self) -> usize {
        self.lock().events.len()
    }

    pub fn has_events(&self) -> bool {
        !self.lock().events.is_empty()
    }

    /// Whether a flush timer is armed
    pub fn timer_armed(&self) -> bool {
        self.lock().timer.is_some()
    }

    /// Drop pending events and cancel the timer
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.events.len();
        state.events.clear();
        state.cancel_timer();
        if dropped > 0 {
            tracing::warn!(events = dropped, "Queue cleared with pending events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every batch; fails the first `failures` calls
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<i64>>>,
        failures: AtomicUsize,
        delay: Duration,
    }

    impl RecordingSink {
        fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<i64>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn on_flush(&self, batch: &[SerializedEvent]) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Http("connection refused".to_string()));
            }
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|e| e.timestamp).collect());
            Ok(())
        }
    }

    fn event(n: i64) -> SerializedEvent {
        SerializedEvent {
            event_type: "page_viewed".to_string(),
            data: serde_json::json!({}),
            timestamp: n,
            sdk_version: "test".to_string(),
            latency: None,
        }
    }

    fn queue(batch_size: usize, sink: Arc<RecordingSink>) -> Queue {
        Queue::new(
            batch_size,
            Duration::from_millis(2000),
            sink,
            Handle::current(),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let queue = queue(2, sink.clone());

        queue.enqueue(event(1));
        assert_eq!(queue.size(), 1);
        assert!(queue.timer_armed());
        settle().await;
        assert!(sink.batches().is_empty());

        queue.enqueue(event(2));
        assert_eq!(queue.size(), 0);
        assert!(!queue.timer_armed());
        settle().await;

        assert_eq!(sink.batches(), vec![vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_one_flushes_every_event() {
        let sink = Arc::new(RecordingSink::default());
        let queue = queue(1, sink.clone());

        queue.enqueue(event(1));
        queue.enqueue(event(2));
        queue.enqueue(event(3));
        assert_eq!(queue.size(), 0);
        settle().await;

        let mut batches = sink.batches();
        batches.sort();
        assert_eq!(batches, vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch() {
        let sink = Arc::new(RecordingSink::default());
        let queue = queue(10, sink.clone());

        queue.enqueue(event(1));
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(sink.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(sink.batches(), vec![vec![1]]);
        assert!(!queue.has_events());
        assert!(!queue.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_not_restarted_by_later_events() {
        let sink = Arc::new(RecordingSink::default());
        let queue = queue(10, sink.clone());

        queue.enqueue(event(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        queue.enqueue(event(2));
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;

        assert_eq!(sink.batches(), vec![vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_empty_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let queue = queue(10, sink.clone());

        assert_eq!(queue.flush().await.unwrap(), 0);
        assert_eq!(queue.flush().await.unwrap(), 0);
        assert!(sink.batches().is_empty());
        assert!(!queue.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_cancels_timer() {
        let sink = Arc::new(RecordingSink::default());
        let queue = queue(10, sink.clone());

        queue.enqueue(event(1));
        assert_eq!(queue.flush().await.unwrap(), 1);
        assert!(!queue.timer_armed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(sink.batches(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_returns_to_head() {
        let sink = Arc::new(RecordingSink::failing(1));
        let queue = queue(10, sink.clone());

        queue.enqueue(event(1));
        queue.enqueue(event(2));
        assert!(queue.flush().await.is_err());

        queue.enqueue(event(3));
        assert_eq!(queue.size(), 3);
        assert!(queue.timer_armed());

        tokio::time::sleep(Duration::from_millis(2001)).await;
        settle().await;
        assert_eq!(sink.batches(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_events_and_timer() {
        let sink = Arc::new(RecordingSink::default());
        let queue = queue(10, sink.clone());

        queue.enqueue(event(1));
        queue.clear();
        assert!(!queue.has_events());
        assert!(!queue.timer_armed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert!(sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_covers_background_deliveries() {
        let sink = Arc::new(RecordingSink::slow(Duration::from_secs(3)));
        let queue = queue(1, sink.clone());

        queue.enqueue(event(1));
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.in_flight(), 1);
        assert!(sink.batches().is_empty());

        queue.wait_idle().await;
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(sink.batches(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_returns_after_requeue() {
        let sink = Arc::new(RecordingSink::failing(1));
        let queue = queue(2, sink.clone());

        queue.enqueue(event(1));
        queue.enqueue(event(2));
        queue.wait_idle().await;

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.size(), 2);
        assert!(sink.batches().is_empty());
    }
}
