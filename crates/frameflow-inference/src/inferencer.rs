// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
The inference stage.

`Inferencer` is a self-transmitting module: `process` hands each frame to
the calling thread's batching engine and delivery queue, returns the
handled-asynchronously code immediately, and the delivery worker releases
the frame downstream once its batch completes. Each caller thread gets its
own lazily-created context, so feeding never takes a cross-thread lock in
steady state.
*/

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use frameflow_core::{
    CoreResult, EventKind, Frame, Module, ModuleBase, ModuleIdPool, ModuleParams, ProcessVerdict,
};
use frameflow_observability::{PerfSampler, ReportLoop, ReportSection};

use crate::delivery::{DeliveryQueue, TransmitFn};
use crate::engine::{BatchingEngine, EngineConfig, EngineErrorHook, EnginePlugins, MILESTONES};
use crate::plugins::{PluginRegistries, ScalingPolicy};
use crate::runner::{DataLayout, ModelLoader, PassthroughLoader, ModelRunner, RunnerConfig};

/// Cadence of the statistics report loop.
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// One caller thread's inference state: its batching engine and its
/// ordered delivery queue. The drop counter lives inside the engine.
struct InferContext {
    engine: BatchingEngine,
    delivery: DeliveryQueue,
}

/// Everything a successful `open` resolved.
struct OpenState {
    runner: Arc<dyn ModelRunner>,
    plugins: EnginePlugins,
    engine_config: EngineConfig,
    device_id: i32,
    error_hook: EngineErrorHook,
    contexts: RwLock<AHashMap<ThreadId, Arc<InferContext>>>,
    context_seq: AtomicUsize,
    sampler: Option<Arc<PerfSampler>>,
    report_loop: Mutex<Option<ReportLoop>>,
}

/// Hardware-accelerated batched inference stage.
pub struct Inferencer {
    base: ModuleBase,
    loader: Arc<dyn ModelLoader>,
    registries: Arc<PluginRegistries>,
    transmit: RwLock<Option<TransmitFn>>,
    transmitted: Arc<AtomicU64>,
    state: Option<OpenState>,
}

impl Inferencer {
    /// An inferencer backed by the reference passthrough loader and the
    /// default plugin registries.
    pub fn new(pool: &Arc<ModuleIdPool>, name: impl Into<String>) -> CoreResult<Self> {
        Self::with_collaborators(
            pool,
            name,
            Arc::new(PassthroughLoader::new()),
            PluginRegistries::with_defaults(),
        )
    }

    /// An inferencer wired to an explicit model loader and plugin
    /// registries, the constructor real deployments use.
    pub fn with_collaborators(
        pool: &Arc<ModuleIdPool>,
        name: impl Into<String>,
        loader: Arc<dyn ModelLoader>,
        registries: Arc<PluginRegistries>,
    ) -> CoreResult<Self> {
        let mut base = ModuleBase::new_transmitting(pool, name)?;
        let register = base.param_register_mut();
        register.set_module_desc(
            "Runs offline model inference with per-thread dynamic batching, \
             plus configurable pre/postprocessing.",
        );
        register.register("model_path", "Path of the offline model file.");
        register.register("function_name", "Model function to load, usually 'subnet0'.");
        register.register("preprocessor_name", "Preprocessing plugin name.");
        register.register("postprocessor_name", "Postprocessing plugin name.");
        register.register("device_id", "Accelerator device to run on, 0 when there is only one.");
        register.register("batch_size", "Frames fed to the model in one invocation.");
        register.register(
            "batching_timeout",
            "Milliseconds to wait for a full batch before dispatching a partial one.",
        );
        register.register(
            "infer_interval",
            "Drop every Nth frame from inference while still passing it through.",
        );
        register.register("data_layout", "Tensor layout, 'NCHW' or 'NHWC'.");
        register.register("use_accelerated_scaling", "Scale inputs on the device.");
        register.register("threshold", "Result threshold forwarded to postprocessing.");
        register.register("object_mode", "Infer per detected object instead of per frame.");
        register.register("object_filter_name", "Object filter plugin name (object mode).");
        register.register("keep_aspect_ratio", "Preserve aspect ratio when scaling on device.");
        register.register("enable_stats", "Collect and report performance statistics.");
        register.register("stats_label", "Label for the statistics report, required with enable_stats.");

        Ok(Self {
            base,
            loader,
            registries,
            transmit: RwLock::new(None),
            transmitted: Arc::new(AtomicU64::new(0)),
            state: None,
        })
    }

    /// Injects the outward transmission path. Without one, delivered
    /// frames are counted and logged at debug level.
    pub fn set_transmit(&self, transmit: TransmitFn) {
        *self.transmit.write() = Some(transmit);
    }

    /// Frames released through the default transmission path.
    pub fn transmitted_count(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    /// Live thread contexts; zero before `open` and after `close`.
    pub fn active_contexts(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |state| state.contexts.read().len())
    }

    fn transmit_fn(&self) -> TransmitFn {
        if let Some(transmit) = self.transmit.read().clone() {
            return transmit;
        }
        let counter = Arc::clone(&self.transmitted);
        Arc::new(move |frame: Arc<Frame>| {
            counter.fetch_add(1, Ordering::Relaxed);
            debug!(
                stream = frame.stream_id(),
                pts = frame.pts(),
                "frame delivered with no transmission path attached"
            );
        })
    }

    fn context_for_current_thread(&self, state: &OpenState) -> Arc<InferContext> {
        let tid = thread::current().id();
        if let Some(ctx) = state.contexts.read().get(&tid) {
            return Arc::clone(ctx);
        }

        let mut contexts = state.contexts.write();
        if let Some(ctx) = contexts.get(&tid) {
            return Arc::clone(ctx);
        }

        let seq = state.context_seq.fetch_add(1, Ordering::Relaxed);
        let tag = format!("th_{seq}");
        let sampling = state.sampler.as_ref().map(|sampler| {
            sampler.register_milestones(&tag, "pts", &MILESTONES);
            (Arc::clone(sampler), tag.clone())
        });

        let engine = BatchingEngine::new(
            state.engine_config.clone(),
            Arc::clone(&state.runner),
            state.plugins.clone(),
            Arc::clone(&state.error_hook),
            sampling.clone(),
        );
        let delivery = DeliveryQueue::start(&tag, self.transmit_fn(), sampling);
        let ctx = Arc::new(InferContext { engine, delivery });
        contexts.insert(tid, Arc::clone(&ctx));
        debug!(module = self.base.name(), tag, "created inference context");
        ctx
    }

    fn build_state(&self, params: &ModuleParams) -> Result<OpenState, String> {
        let model_path = params.require("model_path").map_err(|e| e.to_string())?;
        let function_name = params.require("function_name").map_err(|e| e.to_string())?;
        params.require("postprocessor_name").map_err(|e| e.to_string())?;

        let device_id = params.get_i64("device_id", 0).map_err(|e| e.to_string())? as i32;
        let batch_size = params.get_i64("batch_size", 1).map_err(|e| e.to_string())?;
        if batch_size < 1 {
            return Err(format!("batch_size must be at least 1, got {batch_size}"));
        }
        let timeout_ms = params
            .get_f64("batching_timeout", 3000.0)
            .map_err(|e| e.to_string())?;
        if !timeout_ms.is_finite() || timeout_ms < 0.0 {
            return Err(format!("batching_timeout must be non-negative, got {timeout_ms}"));
        }
        let infer_interval = params.get_i64("infer_interval", 0).map_err(|e| e.to_string())?;
        if infer_interval < 0 {
            return Err(format!("infer_interval must be non-negative, got {infer_interval}"));
        }
        let data_layout = match params.get("data_layout") {
            Some(raw) => raw.parse::<DataLayout>()?,
            None => DataLayout::default(),
        };
        let scaling = ScalingPolicy {
            use_accelerated_scaling: params
                .get_bool("use_accelerated_scaling", false)
                .map_err(|e| e.to_string())?,
            keep_aspect_ratio: params
                .get_bool("keep_aspect_ratio", false)
                .map_err(|e| e.to_string())?,
        };
        let object_mode = params.get_bool("object_mode", false).map_err(|e| e.to_string())?;
        let threshold = params.get_parsed::<f32>("threshold").map_err(|e| e.to_string())?;

        let runner_config = RunnerConfig {
            model_path: PathBuf::from(model_path),
            function_name: function_name.to_string(),
            device_id,
            data_layout,
        };
        let runner = self
            .loader
            .load(&runner_config)
            .map_err(|e| e.to_string())?;

        let plugins = self.resolve_plugins(params, object_mode, threshold)?;

        let sampler = if params.get_bool("enable_stats", false).map_err(|e| e.to_string())? {
            let label = params
                .require("stats_label")
                .map_err(|_| "stats_label is required when enable_stats is set".to_string())?;
            Some((PerfSampler::new(), label.to_string()))
        } else {
            None
        };

        let events = self.base.event_sender();
        let module_name = self.base.name().to_string();
        let error_hook: EngineErrorHook = Arc::new(move |message: &str| {
            let posted = events
                .as_ref()
                .map_or(false, |events| events.post(EventKind::Error, message));
            if !posted {
                warn!(module = %module_name, "error event not delivered: {message}");
            }
        });

        let report_loop = sampler.as_ref().map(|(sampler, label)| {
            ReportLoop::start(
                label.clone(),
                Arc::clone(sampler),
                REPORT_INTERVAL,
                vec![
                    ReportSection::new("preprocess", "preprocess_start", "preprocess_end"),
                    ReportSection::new("inference", "infer_start", "infer_end"),
                    ReportSection::new("module", "batch_ready", "delivered"),
                ],
            )
        });

        info!(
            module = self.base.name(),
            batch_size,
            timeout_ms,
            infer_interval,
            device_id,
            object_mode,
            "inferencer opened"
        );

        Ok(OpenState {
            runner,
            plugins,
            engine_config: EngineConfig {
                batch_size: batch_size as usize,
                batching_timeout: Duration::from_secs_f64(timeout_ms / 1000.0),
                infer_interval: infer_interval as usize,
                scaling,
                object_mode,
            },
            device_id,
            error_hook,
            contexts: RwLock::new(AHashMap::new()),
            context_seq: AtomicUsize::new(0),
            sampler: sampler.map(|(sampler, _)| sampler),
            report_loop: Mutex::new(report_loop),
        })
    }

    fn resolve_plugins(
        &self,
        params: &ModuleParams,
        object_mode: bool,
        threshold: Option<f32>,
    ) -> Result<EnginePlugins, String> {
        let mut plugins = EnginePlugins::default();
        let postproc_name = params.require("postprocessor_name").map_err(|e| e.to_string())?;

        if object_mode {
            info!(module = self.base.name(), "inference mode: per object");
            if let Some(name) = params.get("preprocessor_name") {
                plugins.object_preprocessor = Some(
                    self.registries
                        .object_preprocessors
                        .create(name)
                        .ok_or_else(|| format!("unknown object preprocessor '{name}'"))?,
                );
            }
            let postproc = self
                .registries
                .object_postprocessors
                .create(postproc_name)
                .ok_or_else(|| format!("unknown object postprocessor '{postproc_name}'"))?;
            if let Some(threshold) = threshold {
                postproc.set_threshold(threshold);
            }
            plugins.object_postprocessor = Some(postproc);
            if let Some(name) = params.get("object_filter_name") {
                plugins.object_filter = Some(
                    self.registries
                        .object_filters
                        .create(name)
                        .ok_or_else(|| format!("unknown object filter '{name}'"))?,
                );
            }
        } else {
            info!(module = self.base.name(), "inference mode: per frame");
            if let Some(name) = params.get("preprocessor_name") {
                plugins.preprocessor = Some(
                    self.registries
                        .preprocessors
                        .create(name)
                        .ok_or_else(|| format!("unknown preprocessor '{name}'"))?,
                );
            }
            let postproc = self
                .registries
                .postprocessors
                .create(postproc_name)
                .ok_or_else(|| format!("unknown postprocessor '{postproc_name}'"))?;
            if let Some(threshold) = threshold {
                postproc.set_threshold(threshold);
            }
            plugins.postprocessor = Some(postproc);
        }
        Ok(plugins)
    }

    fn close_state(state: OpenState) {
        if let Some(mut report) = state.report_loop.lock().take() {
            report.stop();
        }
        let mut contexts = state.contexts.write();
        for (_, ctx) in contexts.drain() {
            ctx.engine.stop();
            ctx.delivery.stop();
        }
    }
}

impl Module for Inferencer {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn open(&mut self, params: &ModuleParams) -> bool {
        if !self.check_params(params) {
            return false;
        }
        if let Some(previous) = self.state.take() {
            warn!(module = self.base.name(), "open called twice, closing previous state");
            Self::close_state(previous);
        }
        match self.build_state(params) {
            Ok(state) => {
                self.state = Some(state);
                true
            }
            Err(message) => {
                error!(module = self.base.name(), "open failed: {message}");
                false
            }
        }
    }

    fn process(&self, frame: Arc<Frame>) -> ProcessVerdict {
        let Some(state) = &self.state else {
            error!(module = self.base.name(), "process called before a successful open");
            return ProcessVerdict::Failure(-1);
        };

        let ctx = self.context_for_current_thread(state);
        if !frame.is_eos() {
            frame.ensure_on_device(state.device_id);
        }

        // The engine resolves EOS and dropped frames immediately; real
        // frames resolve when their batch completes. Either way the pair
        // enters the delivery queue in submission order.
        let handle = ctx.engine.feed(Arc::clone(&frame));
        if !ctx.delivery.submit(frame, handle) {
            warn!(module = self.base.name(), "delivery queue rejected frame during shutdown");
        }
        ProcessVerdict::HandledSelf
    }

    fn close(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        Self::close_state(state);
        info!(module = self.base.name(), "inferencer closed");
    }

    fn check_params(&self, params: &ModuleParams) -> bool {
        for key in params.keys() {
            if !self.base.param_register().is_registered(key) {
                warn!(module = self.base.name(), key, "unknown parameter");
            }
        }
        for required in ["model_path", "function_name", "postprocessor_name"] {
            if !params.contains(required) {
                warn!(
                    module = self.base.name(),
                    "inferencer must specify [model_path], [function_name], [postprocessor_name]"
                );
                return false;
            }
        }
        for numeric in ["device_id", "batch_size", "infer_interval"] {
            if params.get_i64(numeric, 0).is_err() {
                error!(module = self.base.name(), key = numeric, "parameter is not an integer");
                return false;
            }
        }
        for numeric in ["batching_timeout", "threshold"] {
            if params.get_f64(numeric, 0.0).is_err() {
                error!(module = self.base.name(), key = numeric, "parameter is not a number");
                return false;
            }
        }
        true
    }
}

impl Drop for Inferencer {
    fn drop(&mut self) {
        self.close();
    }
}
