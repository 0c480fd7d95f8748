// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
The module base contract: identity, upstream linkage and lifecycle.

Every processing stage implements [`Module`] and embeds a [`ModuleBase`].
The base owns a small-integer identity drawn from a process-scoped
[`ModuleIdPool`] of 64 slots; the pool is passed explicitly to module
constructors rather than living in a global, so its lifetime is visible to
the graph builder that owns it.
*/

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::event::{EventKind, EventSender};
use crate::frame::Frame;
use crate::params::ModuleParams;

/// Hard cap on concurrently-live modules. Upstream linkage is addressed
/// through a 64-bit mask, so the cap is part of the wire-level contract,
/// not a tunable.
pub const MODULE_CAPACITY: usize = 64;

/// Process-scoped allocator of module identities.
///
/// Hands out the lowest free id in `[0, 64)`. Ids are recycled when the
/// owning [`ModuleId`] drops. Allocating beyond capacity is a loud
/// configuration error, never a silent wrap-around.
#[derive(Debug, Default)]
pub struct ModuleIdPool {
    occupied: Mutex<u64>,
}

impl ModuleIdPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the lowest free id.
    pub fn acquire(self: &Arc<Self>) -> CoreResult<ModuleId> {
        let mut occupied = self.occupied.lock();
        let free = !*occupied;
        if free == 0 {
            return Err(CoreError::ModuleCapacityExceeded(MODULE_CAPACITY));
        }
        let id = free.trailing_zeros() as usize;
        *occupied |= 1u64 << id;
        Ok(ModuleId {
            id,
            pool: Arc::clone(self),
        })
    }

    /// Number of ids currently handed out.
    pub fn live_count(&self) -> usize {
        self.occupied.lock().count_ones() as usize
    }

    fn release(&self, id: usize) {
        let mut occupied = self.occupied.lock();
        *occupied &= !(1u64 << id);
    }
}

/// An owned module identity; releases its slot back to the pool on drop.
#[derive(Debug)]
pub struct ModuleId {
    id: usize,
    pool: Arc<ModuleIdPool>,
}

impl ModuleId {
    pub fn value(&self) -> usize {
        self.id
    }
}

impl Drop for ModuleId {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// Outcome of one [`Module::process`] call.
///
/// The numeric codes are the contract with the enclosing pipeline:
/// `0` transmit-by-framework, `1` module-transmits-itself, `>1`
/// transmit-immediately, `<0` stage failure (the pipeline posts an error
/// event carrying the code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessVerdict {
    /// Handled; the framework transmits the frame onward.
    Transmit,
    /// Handled; this module transmits asynchronously by itself.
    /// Only valid for modules with `transmits_self` set.
    HandledSelf,
    /// Handled; transmit immediately with the given positive code.
    TransmitNow(i32),
    /// Stage-level failure with a negative code.
    Failure(i32),
}

impl ProcessVerdict {
    pub fn code(&self) -> i32 {
        match *self {
            ProcessVerdict::Transmit => 0,
            ProcessVerdict::HandledSelf => 1,
            ProcessVerdict::TransmitNow(code) => code,
            ProcessVerdict::Failure(code) => code,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ProcessVerdict::Failure(_))
    }
}

impl From<i32> for ProcessVerdict {
    fn from(code: i32) -> Self {
        match code {
            0 => ProcessVerdict::Transmit,
            1 => ProcessVerdict::HandledSelf,
            c if c > 1 => ProcessVerdict::TransmitNow(c),
            c => ProcessVerdict::Failure(c),
        }
    }
}

/// Names and documents the parameters a module accepts, so configuration
/// with unknown keys can be flagged before `open`.
#[derive(Debug, Default, Clone)]
pub struct ParamRegister {
    module_desc: String,
    entries: Vec<(String, String)>,
}

impl ParamRegister {
    pub fn set_module_desc(&mut self, desc: impl Into<String>) {
        self.module_desc = desc.into();
    }

    pub fn module_desc(&self) -> &str {
        &self.module_desc
    }

    pub fn register(&mut self, key: impl Into<String>, desc: impl Into<String>) {
        self.entries.push((key.into(), desc.into()));
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, d)| (k.as_str(), d.as_str()))
    }
}

/// State every module embeds: identity, upstream links, transmit flag and
/// the event attachment to the enclosing pipeline.
#[derive(Debug)]
pub struct ModuleBase {
    id: ModuleId,
    name: String,
    upstream_ids: Vec<usize>,
    upstream_mask: u64,
    transmits_self: bool,
    events: Option<EventSender>,
    param_register: ParamRegister,
}

impl ModuleBase {
    /// A module the framework transmits for (`transmits_self = false`).
    pub fn new(pool: &Arc<ModuleIdPool>, name: impl Into<String>) -> CoreResult<Self> {
        Self::with_transmit(pool, name, false)
    }

    /// A module that transmits frames onward by itself, the way
    /// asynchronous stages do.
    pub fn new_transmitting(pool: &Arc<ModuleIdPool>, name: impl Into<String>) -> CoreResult<Self> {
        Self::with_transmit(pool, name, true)
    }

    fn with_transmit(
        pool: &Arc<ModuleIdPool>,
        name: impl Into<String>,
        transmits_self: bool,
    ) -> CoreResult<Self> {
        let id = pool.acquire()?;
        Ok(Self {
            id,
            name: name.into(),
            upstream_ids: Vec::new(),
            upstream_mask: 0,
            transmits_self,
            events: None,
            param_register: ParamRegister::default(),
        })
    }

    pub fn id(&self) -> usize {
        self.id.value()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transmits_self(&self) -> bool {
        self.transmits_self
    }

    pub fn upstream_ids(&self) -> &[usize] {
        &self.upstream_ids
    }

    pub fn upstream_mask(&self) -> u64 {
        self.upstream_mask
    }

    /// Records a direct upstream link. Link structure is build-time only;
    /// there is no removal.
    pub fn add_upstream(&mut self, id: usize) {
        self.upstream_ids.push(id);
        self.upstream_mask = 0;
        for &upstream in &self.upstream_ids {
            self.upstream_mask |= 1u64 << upstream;
        }
    }

    /// Attaches this module to an enclosing pipeline's event bus.
    pub fn attach_events(&mut self, sender: EventSender) {
        self.events = Some(sender);
    }

    /// Posts an event to the enclosing pipeline. Returns false when the
    /// module is not attached to one.
    pub fn post_event(&self, kind: EventKind, message: impl Into<String>) -> bool {
        match &self.events {
            Some(sender) => sender.post(kind, message),
            None => false,
        }
    }

    /// Clone of the event attachment, for worker threads that outlive a
    /// single `process` call.
    pub fn event_sender(&self) -> Option<EventSender> {
        self.events.clone()
    }

    pub fn param_register(&self) -> &ParamRegister {
        &self.param_register
    }

    pub fn param_register_mut(&mut self) -> &mut ParamRegister {
        &mut self.param_register
    }
}

/// The lifecycle contract every processing stage satisfies.
///
/// `open` is called once before any `process`; `close` is idempotent and
/// safe even when `open` never succeeded. Multiple pipeline worker threads
/// may call `process` concurrently.
pub trait Module: Send + Sync {
    fn base(&self) -> &ModuleBase;

    fn base_mut(&mut self) -> &mut ModuleBase;

    /// Validates and applies configuration, allocating resources.
    /// A false return leaves the module unusable; the failure is reported,
    /// not propagated as a panic.
    fn open(&mut self, params: &ModuleParams) -> bool;

    /// Handles one frame. See [`ProcessVerdict`] for the code contract.
    fn process(&self, frame: Arc<Frame>) -> ProcessVerdict;

    /// Releases resources. Idempotent.
    fn close(&mut self);

    /// Pre-open configuration validation. The default flags unknown keys
    /// against the module's [`ParamRegister`] and accepts everything else.
    fn check_params(&self, params: &ModuleParams) -> bool {
        for key in params.keys() {
            if !self.base().param_register().is_registered(key) {
                warn!(module = self.base().name(), key, "unknown parameter");
            }
        }
        true
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn id(&self) -> usize {
        self.base().id()
    }
}
