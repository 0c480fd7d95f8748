// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Frameflow - streaming pipeline framework with batched inference
//!
//! Frameflow wires independent processing stages ("modules") into a
//! directed graph and streams frames of media/tensor data through them.
//! The inference stage accumulates frames arriving from arbitrary caller
//! threads into fixed-size batches, dispatches them to an accelerator,
//! and hands per-frame results back downstream in original order without
//! blocking producers.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! frameflow = "0.1"
//! ```
//!
//! ```rust,no_run
//! use frameflow::prelude::*;
//! use std::sync::Arc;
//!
//! frameflow::observability::init_logging("info")?;
//!
//! // Process-scoped state: the 64-slot identity pool and the registries.
//! let pool = ModuleIdPool::new();
//! let registry = ModuleRegistry::new();
//! registry.register("Inferencer", |pool, name| {
//!     Ok(Box::new(Inferencer::new(pool, name)?) as Box<dyn Module>)
//! })?;
//!
//! // Configuration-driven construction, then the module lifecycle.
//! let mut module = registry
//!     .create("Inferencer", "detector0", &pool)
//!     .expect("registered")?;
//! let params: ModuleParams = [
//!     ("model_path", "models/detector.bin"),
//!     ("function_name", "subnet0"),
//!     ("postprocessor_name", "detection"),
//!     ("batch_size", "4"),
//!     ("batching_timeout", "100"),
//! ]
//! .into_iter()
//! .collect();
//! assert!(module.open(&params));
//!
//! // Frames flow in from pipeline worker threads.
//! let frame = Arc::new(Frame::eos(0, 0));
//! module.process(frame);
//! module.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Crates
//!
//! - [`core`](frameflow_core): module trait and identity model, registry,
//!   events, frames, parameters.
//! - [`inference`](frameflow_inference): completion handles, batching
//!   engine, ordered delivery, plugin contracts, the `Inferencer` stage.
//! - [`observability`](frameflow_observability): logging initialization
//!   and the opt-in performance sampler.

pub use frameflow_core as core;
pub use frameflow_inference as inference;
pub use frameflow_observability as observability;

pub mod prelude {
    pub use frameflow_core::{
        CoreError, CoreResult, Event, EventBus, EventKind, Frame, Module, ModuleBase, ModuleIdPool,
        ModuleParams, ModuleRegistry, ProcessVerdict, MODULE_CAPACITY,
    };
    pub use frameflow_inference::{
        CompletionHandle, InferOutcome, Inferencer, ModelLoader, ModelRunner, PluginRegistries,
        TransmitFn,
    };
    pub use frameflow_observability::{init_logging, PerfSampler, PerfStats};
}
