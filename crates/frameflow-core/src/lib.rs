// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Module graph, identity model and frame data types for the frameflow
//! pipeline framework.
//!
//! Processing stages implement the [`Module`] trait, embed a
//! [`ModuleBase`] for identity and upstream linkage, and are constructed
//! by name through the [`ModuleRegistry`]. Frames travel between stages as
//! [`Arc<Frame>`](Frame); stages report back to the enclosing pipeline
//! through the [`event`] channel.

pub mod error;
pub mod event;
pub mod frame;
pub mod module;
pub mod params;
pub mod registry;

pub use error::{CoreError, CoreResult};
pub use event::{Event, EventBus, EventKind, EventSender};
pub use frame::{DetectedObject, DeviceLocation, Frame};
pub use module::{
    Module, ModuleBase, ModuleId, ModuleIdPool, ParamRegister, ProcessVerdict, MODULE_CAPACITY,
};
pub use params::ModuleParams;
pub use registry::{ModuleFactory, ModuleRegistry};
