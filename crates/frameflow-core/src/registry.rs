// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Configuration-driven module construction.

The registry maps an explicit type-name string to a factory closure, so
graph-builder code can instantiate stages it has no compile-time reference
to. Registration happens during startup; `create` is safe under concurrent
read access afterwards.
*/

use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::module::{Module, ModuleIdPool};

/// Factory producing one module instance from the shared id pool and an
/// instance name. Construction can fail (id pool exhausted), and that
/// failure must not be swallowed.
pub type ModuleFactory =
    Arc<dyn Fn(&Arc<ModuleIdPool>, &str) -> CoreResult<Box<dyn Module>> + Send + Sync>;

/// String-keyed module factory registry.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: RwLock<AHashMap<String, ModuleFactory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `type_name`. Fails when the name is
    /// already taken.
    pub fn register<F>(&self, type_name: impl Into<String>, factory: F) -> CoreResult<()>
    where
        F: Fn(&Arc<ModuleIdPool>, &str) -> CoreResult<Box<dyn Module>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&type_name) {
            return Err(CoreError::DuplicateModuleType(type_name));
        }
        debug!(type_name, "module type registered");
        factories.insert(type_name, Arc::new(factory));
        Ok(())
    }

    /// Instantiates a module of the given registered type. `None` when the
    /// type name is unknown; the inner result carries construction
    /// failures such as an exhausted id pool.
    pub fn create(
        &self,
        type_name: &str,
        instance_name: &str,
        pool: &Arc<ModuleIdPool>,
    ) -> Option<CoreResult<Box<dyn Module>>> {
        let factory = self.factories.read().get(type_name).cloned()?;
        Some(factory(pool, instance_name))
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::module::{ModuleBase, ProcessVerdict};
    use crate::params::ModuleParams;

    struct Counter {
        base: ModuleBase,
    }

    impl Module for Counter {
        fn base(&self) -> &ModuleBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }
        fn open(&mut self, _params: &ModuleParams) -> bool {
            true
        }
        fn process(&self, _frame: Arc<Frame>) -> ProcessVerdict {
            ProcessVerdict::Transmit
        }
        fn close(&mut self) {}
    }

    fn register_counter(registry: &ModuleRegistry) -> CoreResult<()> {
        registry.register("Counter", |pool, name| {
            Ok(Box::new(Counter {
                base: ModuleBase::new(pool, name)?,
            }) as Box<dyn Module>)
        })
    }

    #[test]
    fn create_by_registered_name() {
        let registry = ModuleRegistry::new();
        let pool = ModuleIdPool::new();
        register_counter(&registry).unwrap();

        let module = registry
            .create("Counter", "counter0", &pool)
            .expect("registered")
            .expect("constructed");
        assert_eq!(module.name(), "counter0");
        assert!(registry.is_registered("Counter"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ModuleRegistry::new();
        register_counter(&registry).unwrap();
        assert!(matches!(
            register_counter(&registry),
            Err(CoreError::DuplicateModuleType(_))
        ));
    }

    #[test]
    fn unknown_type_name_yields_none() {
        let registry = ModuleRegistry::new();
        let pool = ModuleIdPool::new();
        assert!(registry.create("Ghost", "g0", &pool).is_none());
    }

    #[test]
    fn construction_failure_is_surfaced_not_swallowed() {
        let registry = ModuleRegistry::new();
        let pool = ModuleIdPool::new();
        register_counter(&registry).unwrap();

        let _hold: Vec<_> = (0..crate::module::MODULE_CAPACITY)
            .map(|_| pool.acquire().unwrap())
            .collect();
        let result = registry.create("Counter", "overflow", &pool).unwrap();
        assert!(matches!(result, Err(CoreError::ModuleCapacityExceeded(_))));
    }
}
