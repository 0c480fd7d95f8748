// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dynamic-batching inference for frameflow.
//!
//! The [`Inferencer`] module accumulates frames arriving from arbitrary
//! caller threads into fixed-size batches (flushing early on a timeout),
//! dispatches them to an opaque accelerator behind the
//! [`runner::ModelRunner`] seam, and releases per-frame results downstream
//! in original per-thread order through the [`delivery::DeliveryQueue`].

pub mod completion;
pub mod delivery;
pub mod engine;
pub mod inferencer;
pub mod plugins;
pub mod runner;

pub use completion::{CompletionHandle, CompletionNotifier, InferOutcome};
pub use delivery::{DeliveryQueue, TransmitFn};
pub use engine::{BatchingEngine, EngineConfig, EngineErrorHook, EnginePlugins, MILESTONES};
pub use inferencer::Inferencer;
pub use plugins::{
    ObjectFilter, ObjectPostprocessor, ObjectPreprocessor, PluginError, PluginRegistries,
    PluginRegistry, Postprocessor, Preprocessor, ScalingPolicy,
};
pub use runner::{
    DataLayout, ModelLoader, ModelRunner, PassthroughLoader, PassthroughRunner, RunnerConfig,
    RunnerError, TensorInput, TensorOutput,
};
