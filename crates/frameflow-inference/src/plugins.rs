// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Pre/post-processing plugin contracts.

The numeric algorithms themselves live outside this crate; what matters
here is the seam. Plugins are looked up by configured name through
[`PluginRegistry`] instances, the same shape as the module registry: an
unresolvable name is a configuration error at `open`, never a runtime
surprise. Frame mode transforms whole frames; object mode transforms each
detection a frame carries.
*/

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;

use frameflow_core::{DetectedObject, Frame};

use crate::runner::{TensorInput, TensorOutput};

#[derive(Error, Debug, Clone)]
pub enum PluginError {
    #[error("plugin name already registered: {0}")]
    DuplicateName(String),

    #[error("preprocessing failed: {0}")]
    Transform(String),

    #[error("postprocessing failed: {0}")]
    Decode(String),
}

/// Scaling flags forwarded into preprocessing. With accelerated scaling
/// the resize runs on the device as part of the model invocation, so the
/// host-side transform leaves geometry alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalingPolicy {
    pub use_accelerated_scaling: bool,
    pub keep_aspect_ratio: bool,
}

/// Turns one frame into an accelerator-ready input tensor.
pub trait Preprocessor: Send + Sync {
    fn transform(&self, frame: &Frame, scaling: &ScalingPolicy) -> Result<TensorInput, PluginError>;
}

/// Decodes one frame's output tensor into structured results attached to
/// the frame.
pub trait Postprocessor: Send + Sync {
    fn set_threshold(&self, threshold: f32);
    fn decode(&self, output: &TensorOutput, frame: &Frame) -> Result<(), PluginError>;
}

/// Object-mode preprocessing: one tensor per detected object.
pub trait ObjectPreprocessor: Send + Sync {
    fn transform(
        &self,
        frame: &Frame,
        object: &DetectedObject,
        scaling: &ScalingPolicy,
    ) -> Result<TensorInput, PluginError>;
}

/// Object-mode postprocessing: decodes one object's output back onto the
/// frame.
pub trait ObjectPostprocessor: Send + Sync {
    fn set_threshold(&self, threshold: f32);
    fn decode(
        &self,
        output: &TensorOutput,
        frame: &Frame,
        object: &DetectedObject,
    ) -> Result<(), PluginError>;
}

/// Selects which detections object-mode inference runs on.
pub trait ObjectFilter: Send + Sync {
    fn keep(&self, object: &DetectedObject) -> bool;
}

/// Name-to-factory registry for one plugin trait.
pub struct PluginRegistry<T: ?Sized + Send + Sync> {
    factories: RwLock<AHashMap<String, Arc<dyn Fn() -> Arc<T> + Send + Sync>>>,
}

impl<T: ?Sized + Send + Sync> PluginRegistry<T> {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(AHashMap::new()),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<(), PluginError>
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&name) {
            return Err(PluginError::DuplicateName(name));
        }
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// `None` when the name was never registered.
    pub fn create(&self, name: &str) -> Option<Arc<T>> {
        self.factories.read().get(name).map(|f| f())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

impl<T: ?Sized + Send + Sync> Default for PluginRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-scoped plugin registries an inference stage resolves its
/// configured names against.
pub struct PluginRegistries {
    pub preprocessors: PluginRegistry<dyn Preprocessor>,
    pub postprocessors: PluginRegistry<dyn Postprocessor>,
    pub object_preprocessors: PluginRegistry<dyn ObjectPreprocessor>,
    pub object_postprocessors: PluginRegistry<dyn ObjectPostprocessor>,
    pub object_filters: PluginRegistry<dyn ObjectFilter>,
}

impl PluginRegistries {
    pub fn new() -> Self {
        Self {
            preprocessors: PluginRegistry::new(),
            postprocessors: PluginRegistry::new(),
            object_preprocessors: PluginRegistry::new(),
            object_postprocessors: PluginRegistry::new(),
            object_filters: PluginRegistry::new(),
        }
    }

    /// Registries pre-loaded with the reference implementations.
    pub fn with_defaults() -> Arc<Self> {
        let registries = Self::new();
        registries
            .preprocessors
            .register("tensor", || Arc::new(FrameTensorPreprocessor))
            .ok();
        registries
            .postprocessors
            .register("detection", || Arc::new(DetectionPostprocessor::new(0.0)))
            .ok();
        registries
            .object_preprocessors
            .register("object_tensor", || Arc::new(ObjectCropPreprocessor))
            .ok();
        registries
            .object_postprocessors
            .register("object_classify", || {
                Arc::new(ObjectClassifyPostprocessor::new(0.0))
            })
            .ok();
        registries
            .object_filters
            .register("score_filter", || Arc::new(MinScoreObjectFilter::new(0.5)))
            .ok();
        Arc::new(registries)
    }
}

impl Default for PluginRegistries {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Reference implementations
// ---------------------------------------------------------------------------

/// Hands the frame's tensor buffer to the model as-is.
pub struct FrameTensorPreprocessor;

impl Preprocessor for FrameTensorPreprocessor {
    fn transform(&self, frame: &Frame, _scaling: &ScalingPolicy) -> Result<TensorInput, PluginError> {
        frame
            .buffer()
            .cloned()
            .ok_or_else(|| PluginError::Transform(format!("frame {} has no buffer", frame.pts())))
    }
}

/// Decodes rows of `[label, score, x, y, w, h]` into detections, keeping
/// those at or above the configured threshold.
pub struct DetectionPostprocessor {
    threshold: Mutex<f32>,
}

impl DetectionPostprocessor {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: Mutex::new(threshold),
        }
    }
}

impl Postprocessor for DetectionPostprocessor {
    fn set_threshold(&self, threshold: f32) {
        *self.threshold.lock() = threshold;
    }

    fn decode(&self, output: &TensorOutput, frame: &Frame) -> Result<(), PluginError> {
        let values: Vec<f32> = output.iter().copied().collect();
        if values.len() % 6 != 0 {
            return Err(PluginError::Decode(format!(
                "detection output length {} is not a multiple of 6",
                values.len()
            )));
        }
        let threshold = *self.threshold.lock();
        for row in values.chunks_exact(6) {
            let score = row[1];
            if score >= threshold {
                frame.push_object(DetectedObject {
                    label: row[0] as i64,
                    score,
                    bbox: [row[2], row[3], row[4], row[5]],
                });
            }
        }
        Ok(())
    }
}

/// Object-mode input: the frame buffer scoped to one detection. The crop
/// itself belongs to the scaling path; host side forwards the buffer.
pub struct ObjectCropPreprocessor;

impl ObjectPreprocessor for ObjectCropPreprocessor {
    fn transform(
        &self,
        frame: &Frame,
        _object: &DetectedObject,
        _scaling: &ScalingPolicy,
    ) -> Result<TensorInput, PluginError> {
        frame
            .buffer()
            .cloned()
            .ok_or_else(|| PluginError::Transform(format!("frame {} has no buffer", frame.pts())))
    }
}

/// Secondary classification per object: argmax over the output vector,
/// re-attached to the frame as a refined detection.
pub struct ObjectClassifyPostprocessor {
    threshold: Mutex<f32>,
}

impl ObjectClassifyPostprocessor {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: Mutex::new(threshold),
        }
    }
}

impl ObjectPostprocessor for ObjectClassifyPostprocessor {
    fn set_threshold(&self, threshold: f32) {
        *self.threshold.lock() = threshold;
    }

    fn decode(
        &self,
        output: &TensorOutput,
        frame: &Frame,
        object: &DetectedObject,
    ) -> Result<(), PluginError> {
        let mut best = (0usize, f32::MIN);
        for (i, &v) in output.iter().enumerate() {
            if v > best.1 {
                best = (i, v);
            }
        }
        if best.1 >= *self.threshold.lock() {
            frame.push_object(DetectedObject {
                label: best.0 as i64,
                score: best.1,
                bbox: object.bbox,
            });
        }
        Ok(())
    }
}

/// Keeps detections whose score clears a floor.
pub struct MinScoreObjectFilter {
    min_score: f32,
}

impl MinScoreObjectFilter {
    pub fn new(min_score: f32) -> Self {
        Self { min_score }
    }
}

impl ObjectFilter for MinScoreObjectFilter {
    fn keep(&self, object: &DetectedObject) -> bool {
        object.score >= self.min_score
    }
}
