// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Frame payloads flowing through the module graph.

A [`Frame`] is shared between stages as `Arc<Frame>`. The tensor buffer and
stream bookkeeping are immutable after construction; detection results and
device residency are the two pieces stages mutate through shared references,
so they sit behind their own locks.
*/

use ndarray::ArrayD;
use parking_lot::Mutex;
use tracing::debug;

/// Where a frame's buffer currently resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLocation {
    /// Host memory.
    Host,
    /// Accelerator memory on the given device.
    Device(i32),
}

/// One structured detection attached to a frame by postprocessing.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub label: i64,
    pub score: f32,
    /// Normalized `[x, y, w, h]`.
    pub bbox: [f32; 4],
}

/// One unit of media/tensor data flowing through the pipeline.
#[derive(Debug)]
pub struct Frame {
    stream_id: u32,
    /// Per-stream presentation sequence number.
    pts: u64,
    eos: bool,
    buffer: Option<ArrayD<f32>>,
    device: Mutex<DeviceLocation>,
    objects: Mutex<Vec<DetectedObject>>,
    infer_error: Mutex<Option<String>>,
}

impl Frame {
    /// A data frame carrying a tensor buffer in host memory.
    pub fn new(stream_id: u32, pts: u64, buffer: ArrayD<f32>) -> Self {
        Self {
            stream_id,
            pts,
            eos: false,
            buffer: Some(buffer),
            device: Mutex::new(DeviceLocation::Host),
            objects: Mutex::new(Vec::new()),
            infer_error: Mutex::new(None),
        }
    }

    /// The end-of-stream marker for one stream. Carries no buffer and is
    /// never fed to inference.
    pub fn eos(stream_id: u32, pts: u64) -> Self {
        Self {
            stream_id,
            pts,
            eos: true,
            buffer: None,
            device: Mutex::new(DeviceLocation::Host),
            objects: Mutex::new(Vec::new()),
            infer_error: Mutex::new(None),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn pts(&self) -> u64 {
        self.pts
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn buffer(&self) -> Option<&ArrayD<f32>> {
        self.buffer.as_ref()
    }

    pub fn device(&self) -> DeviceLocation {
        *self.device.lock()
    }

    /// Marks the buffer as resident on `device_id`, migrating it if it
    /// currently lives elsewhere. The actual transfer belongs to the
    /// accelerator runtime behind the module boundary; this only tracks
    /// residency so a module never feeds a buffer from the wrong device.
    pub fn ensure_on_device(&self, device_id: i32) {
        if self.eos {
            return;
        }
        let mut device = self.device.lock();
        if *device != DeviceLocation::Device(device_id) {
            debug!(
                stream = self.stream_id,
                pts = self.pts,
                from = ?*device,
                to = device_id,
                "migrating frame buffer"
            );
            *device = DeviceLocation::Device(device_id);
        }
    }

    /// Appends one detection produced by postprocessing.
    pub fn push_object(&self, object: DetectedObject) {
        self.objects.lock().push(object);
    }

    pub fn objects(&self) -> Vec<DetectedObject> {
        self.objects.lock().clone()
    }

    /// Replaces the attached detections, used by object filters.
    pub fn set_objects(&self, objects: Vec<DetectedObject>) {
        *self.objects.lock() = objects;
    }

    /// Marks this frame's inference as failed. The frame still travels
    /// downstream; consumers check [`Frame::infer_error`].
    pub fn set_infer_error(&self, message: impl Into<String>) {
        *self.infer_error.lock() = Some(message.into());
    }

    pub fn infer_error(&self) -> Option<String> {
        self.infer_error.lock().clone()
    }
}
