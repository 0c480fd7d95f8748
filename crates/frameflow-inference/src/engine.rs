// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Per-thread dynamic batching.

One engine belongs to one caller thread's inference context. `feed`
appends frames to the open batch and dispatches synchronously the moment
the batch fills; a background flusher dispatches a partial batch once its
age exceeds the configured timeout. Cross-thread overlap comes from each
thread owning its own engine, not from concurrency inside one engine: a
dispatch gate keeps at most one batch in flight per engine.

EOS frames and frames claimed by the drop-interval policy never enter a
batch; they get an already-resolved handle and pass straight through to
delivery.

On a runner failure every pending handle in the batch is resolved with a
failure marker and the error hook fires once; a handle left unresolved
would deadlock the delivery queue, so no path leaves one behind.
*/

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, warn};

use frameflow_core::Frame;
use frameflow_observability::PerfSampler;

use crate::completion::{CompletionHandle, CompletionNotifier, InferOutcome};
use crate::plugins::{
    ObjectFilter, ObjectPostprocessor, ObjectPreprocessor, Postprocessor, Preprocessor,
    ScalingPolicy,
};
use crate::runner::{ModelRunner, TensorInput};

/// Invoked once per failed batch with the failure message; the inference
/// stage uses it to post an error event.
pub type EngineErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Milestones the engine stamps per frame when sampling is enabled.
pub const MILESTONES: [&str; 6] = [
    "batch_ready",
    "preprocess_start",
    "preprocess_end",
    "infer_start",
    "infer_end",
    "delivered",
];

/// Batching configuration for one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Frames per dispatched batch, at least 1.
    pub batch_size: usize,
    /// Maximum age of an open batch before a partial dispatch.
    pub batching_timeout: Duration,
    /// Drop every `interval`-th frame from inference (0 disables).
    pub infer_interval: usize,
    pub scaling: ScalingPolicy,
    pub object_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            batching_timeout: Duration::from_millis(3000),
            infer_interval: 0,
            scaling: ScalingPolicy::default(),
            object_mode: false,
        }
    }
}

/// The plugin set resolved at `open`; which slots are populated depends
/// on frame versus object mode.
#[derive(Default, Clone)]
pub struct EnginePlugins {
    pub preprocessor: Option<Arc<dyn Preprocessor>>,
    pub postprocessor: Option<Arc<dyn Postprocessor>>,
    pub object_preprocessor: Option<Arc<dyn ObjectPreprocessor>>,
    pub object_postprocessor: Option<Arc<dyn ObjectPostprocessor>>,
    pub object_filter: Option<Arc<dyn ObjectFilter>>,
}

#[derive(Default)]
struct OpenBatch {
    entries: Vec<(Arc<Frame>, CompletionNotifier)>,
    opened_at: Option<Instant>,
}

struct EngineInner {
    config: EngineConfig,
    runner: Arc<dyn ModelRunner>,
    plugins: EnginePlugins,
    batch: Mutex<OpenBatch>,
    /// At most one batch in flight per engine.
    dispatch_gate: Mutex<()>,
    /// Per-context frame counter for the drop policy; only the feeding
    /// thread writes it.
    drop_count: AtomicUsize,
    error_hook: EngineErrorHook,
    sampler: Option<(Arc<PerfSampler>, String)>,
}

impl EngineInner {
    fn stamp_all(&self, entries: &[(Arc<Frame>, CompletionNotifier)], milestone: &str) {
        if let Some((sampler, tag)) = &self.sampler {
            for _ in entries {
                sampler.record_now(tag, milestone);
            }
        }
    }

    fn input_for_frame(&self, frame: &Frame) -> Result<TensorInput, String> {
        match &self.plugins.preprocessor {
            Some(pre) => pre
                .transform(frame, &self.config.scaling)
                .map_err(|e| e.to_string()),
            None => frame
                .buffer()
                .cloned()
                .ok_or_else(|| format!("frame {} has no buffer", frame.pts())),
        }
    }

    fn run_frames(&self, entries: &[(Arc<Frame>, CompletionNotifier)]) -> Result<(), String> {
        self.stamp_all(entries, "preprocess_start");
        let mut inputs = Vec::with_capacity(entries.len());
        for (frame, _) in entries {
            inputs.push(self.input_for_frame(frame)?);
        }
        self.stamp_all(entries, "preprocess_end");

        self.stamp_all(entries, "infer_start");
        let outputs = self.runner.run(&inputs).map_err(|e| e.to_string())?;
        self.stamp_all(entries, "infer_end");
        if outputs.len() != inputs.len() {
            return Err(format!(
                "runner returned {} outputs for {} inputs",
                outputs.len(),
                inputs.len()
            ));
        }

        let post = self
            .plugins
            .postprocessor
            .as_ref()
            .ok_or_else(|| "no postprocessor configured".to_string())?;
        for ((frame, _), output) in entries.iter().zip(&outputs) {
            post.decode(output, frame).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn run_objects(&self, entries: &[(Arc<Frame>, CompletionNotifier)]) -> Result<(), String> {
        self.stamp_all(entries, "preprocess_start");
        let mut inputs = Vec::new();
        let mut owners = Vec::new();
        for (idx, (frame, _)) in entries.iter().enumerate() {
            for object in frame.objects() {
                if let Some(filter) = &self.plugins.object_filter {
                    if !filter.keep(&object) {
                        continue;
                    }
                }
                let tensor = match &self.plugins.object_preprocessor {
                    Some(pre) => pre
                        .transform(frame, &object, &self.config.scaling)
                        .map_err(|e| e.to_string())?,
                    None => frame
                        .buffer()
                        .cloned()
                        .ok_or_else(|| format!("frame {} has no buffer", frame.pts()))?,
                };
                inputs.push(tensor);
                owners.push((idx, object));
            }
        }
        self.stamp_all(entries, "preprocess_end");

        // A batch whose frames carry no eligible objects completes
        // without touching the accelerator.
        if inputs.is_empty() {
            return Ok(());
        }

        self.stamp_all(entries, "infer_start");
        let outputs = self.runner.run(&inputs).map_err(|e| e.to_string())?;
        self.stamp_all(entries, "infer_end");
        if outputs.len() != inputs.len() {
            return Err(format!(
                "runner returned {} outputs for {} object inputs",
                outputs.len(),
                inputs.len()
            ));
        }

        let post = self
            .plugins
            .object_postprocessor
            .as_ref()
            .ok_or_else(|| "no object postprocessor configured".to_string())?;
        for ((idx, object), output) in owners.iter().zip(&outputs) {
            post.decode(output, &entries[*idx].0, object)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Runs one taken batch to completion and resolves every handle.
    fn dispatch(&self, entries: Vec<(Arc<Frame>, CompletionNotifier)>) {
        if entries.is_empty() {
            return;
        }
        let _in_flight = self.dispatch_gate.lock();
        self.stamp_all(&entries, "batch_ready");

        let result = if self.config.object_mode {
            self.run_objects(&entries)
        } else {
            self.run_frames(&entries)
        };

        match result {
            Ok(()) => {
                for (_, notifier) in entries {
                    notifier.resolve(InferOutcome::Completed);
                }
            }
            Err(message) => {
                error!("batch dispatch failed: {message}");
                (self.error_hook)(&message);
                for (frame, notifier) in entries {
                    frame.set_infer_error(message.as_str());
                    notifier.resolve(InferOutcome::Failed(message.clone()));
                }
            }
        }
    }

    fn flush_expired(&self) {
        let ready = {
            let mut batch = self.batch.lock();
            let expired = batch.opened_at.map_or(false, |opened| {
                opened.elapsed() >= self.config.batching_timeout
            });
            if expired && !batch.entries.is_empty() {
                Some(std::mem::take(&mut *batch))
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.dispatch(batch.entries);
        }
    }
}

/// One caller thread's batching state machine.
pub struct BatchingEngine {
    inner: Arc<EngineInner>,
    stop: Arc<AtomicBool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingEngine {
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn ModelRunner>,
        plugins: EnginePlugins,
        error_hook: EngineErrorHook,
        sampler: Option<(Arc<PerfSampler>, String)>,
    ) -> Self {
        let mut config = config;
        if config.batch_size == 0 {
            warn!("batch_size 0 clamped to 1");
            config.batch_size = 1;
        }
        let poll = (config.batching_timeout / 4)
            .clamp(Duration::from_millis(1), Duration::from_millis(100));

        let inner = Arc::new(EngineInner {
            config,
            runner,
            plugins,
            batch: Mutex::new(OpenBatch::default()),
            dispatch_gate: Mutex::new(()),
            drop_count: AtomicUsize::new(0),
            error_hook,
            sampler,
        });

        let stop = Arc::new(AtomicBool::new(false));
        let flusher_inner = Arc::clone(&inner);
        let flusher_stop = Arc::clone(&stop);
        let flusher = thread::Builder::new()
            .name("batch-flusher".to_string())
            .spawn(move || {
                while !flusher_stop.load(Ordering::Relaxed) {
                    flusher_inner.flush_expired();
                    thread::sleep(poll);
                }
            })
            .map_err(|e| warn!("failed to spawn batch flusher: {e}"))
            .ok();

        Self {
            inner,
            stop,
            flusher: Mutex::new(flusher),
        }
    }

    /// Accepts one frame and returns its completion handle immediately.
    ///
    /// EOS frames and dropped frames get a pre-resolved handle. The drop
    /// counter advances for every fed frame while an interval is set, and
    /// wraps modulo the interval on the drop branch; with an interval of
    /// `n` the 0-indexed positions `0, n, 2n, ...` are dropped.
    pub fn feed(&self, frame: Arc<Frame>) -> CompletionHandle {
        let inner = &self.inner;
        let eos = frame.is_eos();

        let mut dropped = false;
        let interval = inner.config.infer_interval;
        if interval > 0 {
            let count = inner.drop_count.load(Ordering::Relaxed);
            inner.drop_count.store(count + 1, Ordering::Relaxed);
            if count % interval == 0 {
                dropped = true;
                inner.drop_count.store((count + 1) % interval, Ordering::Relaxed);
            }
        }

        if eos || dropped {
            return CompletionHandle::resolved(InferOutcome::Completed);
        }

        let (notifier, handle) = CompletionHandle::pair();
        let ready = {
            let mut batch = inner.batch.lock();
            if batch.entries.is_empty() {
                batch.opened_at = Some(Instant::now());
            }
            batch.entries.push((frame, notifier));

            let full = batch.entries.len() >= inner.config.batch_size;
            let expired = batch.opened_at.map_or(false, |opened| {
                opened.elapsed() >= inner.config.batching_timeout
            });
            if full || expired {
                Some(std::mem::take(&mut *batch))
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            inner.dispatch(batch.entries);
        }
        handle
    }

    /// Frames sitting in the open, undispatched batch.
    pub fn pending(&self) -> usize {
        self.inner.batch.lock().entries.len()
    }

    /// Stops the flusher and abandons the open batch. Abandoned handles
    /// resolve as [`InferOutcome::Abandoned`] on the waiting side.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                warn!("batch flusher panicked before join");
            }
        }
        self.inner.batch.lock().entries.clear();
    }
}

impl Drop for BatchingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
