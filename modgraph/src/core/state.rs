//! In-memory predictor snapshots and graph copies.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tracing::debug;

use crate::core::component::{Component, PredictorState};
use crate::core::module::{Module, ModuleRef};
use crate::core::traversal::set_by_path;
use crate::error::{ProgramError, Result};

impl Module {
    /// Snapshot every predictor's configuration, keyed by dotted path.
    pub fn dump_state(&self) -> Result<Value> {
        let mut entries = Map::new();
        for (path, predictor) in self.named_predictors() {
            let state = serde_json::to_value(predictor.state())
                .map_err(|err| mismatch(&path, err.to_string()))?;
            entries.insert(path, state);
        }
        Ok(Value::Object(entries))
    }

    /// Restore predictor configuration from [`Module::dump_state`] output.
    ///
    /// Every current predictor must have an entry. Nothing is written unless
    /// all entries parse.
    pub fn load_state(&mut self, state: &Value) -> Result<&mut Self> {
        let entries = state
            .as_object()
            .ok_or_else(|| mismatch("", "expected an object keyed by predictor path"))?;

        let mut parsed: Vec<(String, PredictorState)> = Vec::new();
        for (path, _) in self.named_predictors() {
            let entry = entries
                .get(&path)
                .ok_or_else(|| mismatch(&path, "missing entry"))?;
            let predictor_state: PredictorState = serde_json::from_value(entry.clone())
                .map_err(|err| mismatch(&path, err.to_string()))?;
            parsed.push((path, predictor_state));
        }

        for (path, predictor_state) in parsed {
            let mut predictor = self.predictor(&path)?;
            predictor.apply_state(predictor_state);
            set_by_path(self, &path, Component::Predictor(predictor))?;
        }
        debug!(entries = entries.len(), "loaded predictor state");
        Ok(self)
    }
}

fn mismatch(path: &str, reason: impl Into<String>) -> ProgramError {
    ProgramError::StateMismatch {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Copy a module graph. Aliased sub-modules stay aliased in the copy and
/// cycles are reproduced; nothing is shared with the source except LM handles
/// and `forward` implementations.
pub fn deep_copy(root: &ModuleRef) -> Result<ModuleRef> {
    Copier::new(false).copy_module(root)
}

/// [`deep_copy`], then reset every predictor (LM unset, demos and hints cleared).
pub fn reset_copy(root: &ModuleRef) -> Result<ModuleRef> {
    Copier::new(true).copy_module(root)
}

struct Copier {
    reset: bool,
    memo: HashMap<*const Module, ModuleRef>,
}

impl Copier {
    fn new(reset: bool) -> Self {
        Self {
            reset,
            memo: HashMap::new(),
        }
    }

    fn copy_module(&mut self, source: &ModuleRef) -> Result<ModuleRef> {
        let key = source.as_ptr() as *const Module;
        if let Some(existing) = self.memo.get(&key) {
            return Ok(existing.clone());
        }
        let copy = Module::new().into_shared();
        self.memo.insert(key, copy.clone());

        let inner = source.try_borrow().map_err(|_| ProgramError::StateMismatch {
            path: String::new(),
            reason: "cannot copy a module that is mutably borrowed".to_string(),
        })?;
        let mut attrs = Vec::with_capacity(inner.attrs.len());
        for (name, value) in &inner.attrs {
            attrs.push((name.clone(), self.copy_component(value)?));
        }

        let mut target = copy.borrow_mut();
        target.compiled = inner.compiled;
        target.attrs = attrs;
        target.forward = inner.forward.clone();
        target.assertions = inner.assertions.clone();
        drop(target);
        Ok(copy)
    }

    fn copy_component(&mut self, value: &Component) -> Result<Component> {
        Ok(match value {
            Component::Predictor(predictor) => {
                let mut copy = predictor.clone();
                if self.reset {
                    copy.reset();
                }
                Component::Predictor(copy)
            }
            Component::Module(module) => Component::Module(self.copy_module(module)?),
            Component::List(items) => Component::List(
                items
                    .iter()
                    .map(|item| self.copy_component(item))
                    .collect::<Result<_>>()?,
            ),
            Component::Map(items) => {
                let mut copy = BTreeMap::new();
                for (key, item) in items {
                    copy.insert(key.clone(), self.copy_component(item)?);
                }
                Component::Map(copy)
            }
            Component::Opaque(value) => Component::Opaque(value.clone()),
        })
    }
}
