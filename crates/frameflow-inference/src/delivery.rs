// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Ordered asynchronous result delivery.

Each thread-local inference context owns one [`DeliveryQueue`]: a bounded
FIFO of `(frame, handle)` pairs plus a background worker that waits on the
oldest handle, forwards the frame onward, then moves to the next pair.
Because the worker only ever waits on the head, per-thread output order
equals submission order no matter when individual batches complete; later
frames' handles simply sit resolved in the queue until they reach the
head. Inference latency overlaps with new frames being batched.
*/

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use frameflow_core::Frame;
use frameflow_observability::PerfSampler;

use crate::completion::{CompletionHandle, InferOutcome};

/// The module's outward transmission path, injected by the enclosing
/// pipeline.
pub type TransmitFn = Arc<dyn Fn(Arc<Frame>) + Send + Sync>;

/// Depth of the per-context pending queue; submission blocks past this,
/// which backpressures the feeding thread.
const QUEUE_DEPTH: usize = 64;

/// How often the worker re-checks the shutdown flag while waiting.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// FIFO-preserving hand-off from inference completion to downstream
/// transmission. One background worker per instance.
pub struct DeliveryQueue {
    tx: Sender<(Arc<Frame>, CompletionHandle)>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    /// Spawns the delivery worker.
    ///
    /// # Arguments
    /// * `label` - Names the worker thread, e.g. the context's thread tag.
    /// * `transmit` - Outward transmission path frames are released to.
    /// * `sampler` - Optional `(sampler, thread_tag)`; records a
    ///   `delivered` milestone per forwarded data frame.
    pub fn start(
        label: &str,
        transmit: TransmitFn,
        sampler: Option<(Arc<PerfSampler>, String)>,
    ) -> Self {
        let (tx, rx) = bounded::<(Arc<Frame>, CompletionHandle)>(QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::clone(&shutdown);
        let thread_name = format!("deliver-{label}");

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || Self::run(rx, worker_shutdown, transmit, sampler))
            .map_err(|e| warn!(thread = %thread_name, "failed to spawn delivery worker: {e}"))
            .ok();

        Self {
            tx,
            shutdown,
            handle: Mutex::new(handle),
        }
    }

    fn run(
        rx: Receiver<(Arc<Frame>, CompletionHandle)>,
        shutdown: Arc<AtomicBool>,
        transmit: TransmitFn,
        sampler: Option<(Arc<PerfSampler>, String)>,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            let (frame, handle) = match rx.recv_timeout(WAIT_SLICE) {
                Ok(pair) => pair,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            // Wait on the head pair only; everything behind it keeps its
            // place regardless of completion order.
            loop {
                match handle.wait_timeout(WAIT_SLICE) {
                    Some(InferOutcome::Completed) => {
                        Self::record_delivered(&sampler, &frame);
                        transmit(Arc::clone(&frame));
                        break;
                    }
                    Some(InferOutcome::Failed(reason)) => {
                        warn!(
                            stream = frame.stream_id(),
                            pts = frame.pts(),
                            "forwarding frame whose inference failed: {reason}"
                        );
                        Self::record_delivered(&sampler, &frame);
                        transmit(Arc::clone(&frame));
                        break;
                    }
                    Some(InferOutcome::Abandoned) => {
                        debug!(
                            stream = frame.stream_id(),
                            pts = frame.pts(),
                            "dropping frame abandoned at shutdown"
                        );
                        break;
                    }
                    None => {
                        if shutdown.load(Ordering::Relaxed) {
                            debug!(
                                stream = frame.stream_id(),
                                pts = frame.pts(),
                                "dropping undelivered frame at shutdown"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    fn record_delivered(sampler: &Option<(Arc<PerfSampler>, String)>, frame: &Frame) {
        if let Some((sampler, tag)) = sampler {
            if !frame.is_eos() {
                sampler.record_now(tag, "delivered");
            }
        }
    }

    /// Enqueues one pair in submission order. Blocks when the queue is
    /// full. Returns false once the queue has shut down.
    pub fn submit(&self, frame: Arc<Frame>, handle: CompletionHandle) -> bool {
        if self.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        self.tx.send((frame, handle)).is_ok()
    }

    /// Pairs queued and not yet picked up by the worker.
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }

    /// Signals the worker and joins it. Pending pairs are dropped, which
    /// is the accepted data-loss-on-shutdown semantic.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("delivery worker panicked before join");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
