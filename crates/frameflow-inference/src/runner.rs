// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
The accelerator boundary.

What the accelerator does with a loaded model is out of scope; the engine
only needs "run a batch of input tensors, get one output tensor per
input". [`ModelLoader`] and [`ModelRunner`] are the trait seam the real
runtime plugs into; [`PassthroughLoader`] is the in-process reference
backend used by the test suite.
*/

use ndarray::ArrayD;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Tensor handed to the accelerator for one frame or object.
pub type TensorInput = ArrayD<f32>;
/// Tensor the accelerator produced for one input.
pub type TensorOutput = ArrayD<f32>;

/// Memory ordering of tensor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataLayout {
    /// NCHW.
    #[default]
    ChannelFirst,
    /// NHWC.
    ChannelLast,
}

impl FromStr for DataLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NCHW" | "channel_first" => Ok(DataLayout::ChannelFirst),
            "NHWC" | "channel_last" => Ok(DataLayout::ChannelLast),
            other => Err(format!("unknown data layout '{other}'")),
        }
    }
}

/// Everything needed to load one model function onto one device.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub model_path: PathBuf,
    pub function_name: String,
    pub device_id: i32,
    pub data_layout: DataLayout,
}

/// Failures at the accelerator boundary.
#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    /// The model file could not be loaded; a resource error reported as a
    /// boolean failure from `open`.
    #[error("failed to load model '{path}': {reason}")]
    ModelLoad { path: String, reason: String },

    /// A batch invocation failed at runtime.
    #[error("model execution failed: {0}")]
    Execution(String),
}

/// An opaque loaded model: runs one ordered batch, returns one output per
/// input, in the same order.
pub trait ModelRunner: Send + Sync {
    fn run(&self, batch: &[TensorInput]) -> Result<Vec<TensorOutput>, RunnerError>;
}

/// Loads a model for a device; load failures are resource errors.
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &RunnerConfig) -> Result<Arc<dyn ModelRunner>, RunnerError>;
}

/// Reference backend: echoes each input tensor as its output. Stands in
/// for a real accelerator in tests and local development.
pub struct PassthroughRunner;

impl ModelRunner for PassthroughRunner {
    fn run(&self, batch: &[TensorInput]) -> Result<Vec<TensorOutput>, RunnerError> {
        Ok(batch.to_vec())
    }
}

/// Loader for [`PassthroughRunner`]. Still validates that the configured
/// model path exists, so resource-error handling stays honest.
#[derive(Default)]
pub struct PassthroughLoader {
    /// Skip the path-existence check; used by tests that have no model
    /// file to point at.
    pub skip_path_check: bool,
}

impl PassthroughLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lenient() -> Self {
        Self { skip_path_check: true }
    }
}

impl ModelLoader for PassthroughLoader {
    fn load(&self, config: &RunnerConfig) -> Result<Arc<dyn ModelRunner>, RunnerError> {
        if !self.skip_path_check && !Path::new(&config.model_path).exists() {
            return Err(RunnerError::ModelLoad {
                path: config.model_path.display().to_string(),
                reason: "file does not exist".to_string(),
            });
        }
        Ok(Arc::new(PassthroughRunner))
    }
}
