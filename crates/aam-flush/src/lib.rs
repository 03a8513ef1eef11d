#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-flush** – Hybrid size/time flush strategy (C4) for the
//! ApplicationAccess sharded event pipeline.
//!
//! Replaces the original worker-thread + `AutoResetEvent` + `Thread.Sleep`
//! loop (`spec.md` §9) with two `tokio` tasks selecting over a shared
//! `tokio::sync::Notify` and a `watch` channel for cooperative cancellation,
//! matching `toka-bus-core`'s preference for channel-based signaling over
//! external cancellation types.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use aam_persister::BulkPersister;
use aam_types::event::Event;

/// Supplies the write buffer's (C5) pending events to the flush worker,
/// which takes an atomic snapshot — "exchange with empty container"
/// per `spec.md` §4.4 — via [`BufferSource::drain`].
pub trait BufferSource: Send + Sync {
    /// Atomically swaps out and returns the buffered events, leaving the
    /// source empty.
    fn drain(&self) -> Vec<Event>;
}

/// Shared size-trigger counter and flush notification. A clone of this is
/// handed to the write buffer (C5) so every accepted event can trip the
/// signal without C5 depending on the flush worker's task handles.
pub struct FlushSignal {
    notify: Notify,
    done: Notify,
    count: AtomicUsize,
    buffer_size_limit: usize,
}

impl FlushSignal {
    fn new(buffer_size_limit: usize) -> Self {
        Self { notify: Notify::new(), done: Notify::new(), count: AtomicUsize::new(0), buffer_size_limit }
    }

    /// Builds a signal with no worker/timer tasks attached yet. The write
    /// buffer (C5) needs its `Arc<FlushSignal>` at construction time, before
    /// [`FlushStrategy::spawn_with_signal`] exists to hand one back — this
    /// is the shared entry point both production wiring and unit tests use
    /// to break that ordering.
    pub fn new_shared(buffer_size_limit: usize) -> Arc<Self> {
        Arc::new(Self::new(buffer_size_limit))
    }

    /// Alias for [`Self::new_shared`], kept for call sites that only need a
    /// signal with no running flush loop attached.
    pub fn for_testing(buffer_size_limit: usize) -> Arc<Self> {
        Self::new_shared(buffer_size_limit)
    }

    /// Called by C5 after appending one event to its buffer. Trips the
    /// flush signal once the running count reaches `buffer_size_limit`.
    pub fn record_event(&self) {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.buffer_size_limit {
            self.notify.notify_one();
        }
    }

    fn reset_count(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    fn trip(&self) {
        self.notify.notify_one();
    }
}

async fn do_flush(
    signal: &FlushSignal,
    source: &dyn BufferSource,
    persister: &BulkPersister,
    flush_in_progress: &AtomicBool,
    last_flush_complete: &Mutex<Instant>,
) {
    flush_in_progress.store(true, Ordering::SeqCst);
    let batch = source.drain();
    if let Err(err) = persister.persist(batch).await {
        warn!(error = %err, "flush failed");
    }
    signal.reset_count();
    *last_flush_complete.lock() = Instant::now();
    flush_in_progress.store(false, Ordering::SeqCst);
    signal.done.notify_waiters();
}

async fn run_worker(
    signal: Arc<FlushSignal>,
    source: Arc<dyn BufferSource>,
    persister: Arc<BulkPersister>,
    flush_in_progress: Arc<AtomicBool>,
    last_flush_complete: Arc<Mutex<Instant>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = signal.notify.notified() => {}
            _ = stop_rx.changed() => {}
        }
        do_flush(&signal, source.as_ref(), &persister, &flush_in_progress, &last_flush_complete).await;
        if *stop_rx.borrow() {
            break;
        }
    }
}

async fn run_timer(
    signal: Arc<FlushSignal>,
    last_flush_complete: Arc<Mutex<Instant>>,
    flush_loop_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut previous_wake = Instant::now();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(flush_loop_interval) => {}
            _ = stop_rx.changed() => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let last = *last_flush_complete.lock();
        if last <= previous_wake {
            // No flush completed since the previous wake: trip the signal.
            signal.trip();
            previous_wake = Instant::now();
            continue;
        }

        // A flush already happened since the previous wake — sleep until
        // last_flush_complete + flush_loop_interval instead of firing again
        // immediately.
        let target = last + flush_loop_interval;
        let now = Instant::now();
        if target > now {
            tokio::select! {
                _ = tokio::time::sleep_until(target) => {}
                _ = stop_rx.changed() => {}
            }
            if *stop_rx.borrow() {
                break;
            }
        }
        signal.trip();
        previous_wake = Instant::now();
    }
}

/// The hybrid size/time flush strategy (C4): owns the worker and timer
/// tasks coordinating C5 → C2.
pub struct FlushStrategy {
    signal: Arc<FlushSignal>,
    stop_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl FlushStrategy {
    /// Starts the worker and timer tasks. `source` supplies buffer
    /// snapshots (C5); `persister` commits them (C2); `buffer_size_limit`/
    /// `flush_loop_interval` are the two trigger parameters (`spec.md` §4.4).
    pub fn spawn(
        source: Arc<dyn BufferSource>,
        persister: Arc<BulkPersister>,
        buffer_size_limit: usize,
        flush_loop_interval: Duration,
    ) -> Self {
        Self::spawn_with_signal(FlushSignal::new_shared(buffer_size_limit), source, persister, flush_loop_interval)
    }

    /// As [`Self::spawn`], over a signal the caller already constructed —
    /// needed when `source` (the write buffer, C5) must hold the very same
    /// `Arc<FlushSignal>` this strategy's tasks select on, which requires
    /// building the signal before either `source` or this strategy exists.
    pub fn spawn_with_signal(
        signal: Arc<FlushSignal>,
        source: Arc<dyn BufferSource>,
        persister: Arc<BulkPersister>,
        flush_loop_interval: Duration,
    ) -> Self {
        let flush_in_progress = Arc::new(AtomicBool::new(false));
        let last_flush_complete = Arc::new(Mutex::new(Instant::now()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = tokio::spawn(run_worker(
            Arc::clone(&signal),
            source,
            persister,
            flush_in_progress,
            Arc::clone(&last_flush_complete),
            stop_rx.clone(),
        ));
        let timer = tokio::spawn(run_timer(Arc::clone(&signal), last_flush_complete, flush_loop_interval, stop_rx));

        Self { signal, stop_tx, worker: Some(worker), timer: Some(timer) }
    }

    /// A handle C5 calls on every accepted event to drive the size trigger.
    pub fn signal(&self) -> Arc<FlushSignal> {
        Arc::clone(&self.signal)
    }

    /// Forces an out-of-band flush cycle and waits for it to complete,
    /// independent of the size/time triggers. Used by the splitter/merger
    /// (C7/C8) to force a source's write buffer out before the final drain
    /// pass (`spec.md` §4.7 step 4c / §4.8 step 4).
    pub async fn flush_now(&self) {
        let done = self.signal.done.notified();
        self.signal.trip();
        done.await;
    }

    /// Cooperative shutdown (`spec.md` §4.4 "Shutdown"): signals both
    /// background tasks, wakes them, and waits for the worker to flush any
    /// events accepted before this call before returning.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        self.signal.trip();
        if let Some(timer) = self.timer.take() {
            let _ = timer.await;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}
