//! Composite program node and its predictor-level operations.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::assertions::{AssertionTransform, CallContext, run_with_retries};
use crate::core::component::{Component, LmHandle, Predictor};
use crate::core::gate::FeatureGate;
use crate::core::path::Segment;
use crate::core::traversal::{
    Addressable, TraversalOptions, enumerate_components, enumerate_with, get_by_path, set_by_path,
};
use crate::error::{ProgramError, Result};

/// Shared handle to a sub-module. Sharing is what allows aliasing and cycles.
pub type ModuleRef = Rc<RefCell<Module>>;

/// Output of a `forward` call.
pub type Prediction = Value;

/// Positional inputs plus keyword configuration for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub inputs: Vec<Value>,
    pub config: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, value: impl Into<Value>) -> Self {
        self.inputs.push(value.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn input(&self, index: usize) -> Option<&Value> {
        self.inputs.get(index)
    }
}

/// User-supplied execution logic of a module.
///
/// Implementations may fail with [`ProgramError::Assertion`] to signal a
/// constraint violation that an installed retry transform can recover from.
pub trait Forward {
    fn forward(&self, module: &Module, ctx: &mut CallContext, args: &Args) -> Result<Prediction>;
}

impl<F> Forward for F
where
    F: Fn(&Module, &mut CallContext, &Args) -> Result<Prediction>,
{
    fn forward(&self, module: &Module, ctx: &mut CallContext, args: &Args) -> Result<Prediction> {
        self(module, ctx, args)
    }
}

/// A composite node: an ordered attribute table plus optional behavior.
#[derive(Default)]
pub struct Module {
    pub compiled: bool,
    pub(crate) attrs: Vec<(String, Component)>,
    pub(crate) forward: Option<Rc<dyn Forward>>,
    pub(crate) assertions: Option<AssertionTransform>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forward<F: Forward + 'static>(mut self, forward: F) -> Self {
        self.set_forward(forward);
        self
    }

    pub fn set_forward<F: Forward + 'static>(&mut self, forward: F) {
        self.forward = Some(Rc::new(forward));
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Component>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Insert or replace an attribute. Replacing keeps the original position.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<Component>) -> Option<Component> {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.attrs.push((name, value));
                None
            }
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Component> {
        self.attrs
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<Component> {
        let index = self.attrs.iter().position(|(existing, _)| existing == name)?;
        Some(self.attrs.remove(index).1)
    }

    /// Attributes in declaration order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &Component)> {
        self.attrs.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn into_shared(self) -> ModuleRef {
        Rc::new(RefCell::new(self))
    }

    /// Every reachable predictor and sub-module, keyed by dotted path.
    pub fn named_components(&self) -> Vec<(String, Component)> {
        enumerate_components(self)
    }

    pub fn named_predictors(&self) -> Vec<(String, Predictor)> {
        enumerate_components(self)
            .into_iter()
            .filter_map(|(path, component)| component.into_predictor().map(|p| (path, p)))
            .collect()
    }

    pub fn predictors(&self) -> Vec<Predictor> {
        self.named_predictors()
            .into_iter()
            .map(|(_, predictor)| predictor)
            .collect()
    }

    /// Sub-modules below this one. With `skip_compiled`, compiled sub-modules
    /// are listed but their contents are not.
    pub fn named_sub_modules(&self, skip_compiled: bool) -> Vec<(String, ModuleRef)> {
        enumerate_with(self, TraversalOptions { skip_compiled })
            .into_iter()
            .filter_map(|(path, component)| match component {
                Component::Module(module) => Some((path, module)),
                _ => None,
            })
            .collect()
    }

    /// The predictor at `path`.
    pub fn predictor(&self, path: &str) -> Result<Predictor> {
        match get_by_path(self, path)? {
            Component::Predictor(predictor) => Ok(predictor),
            other => Err(ProgramError::unresolved(
                path,
                format!("expected a predictor, found {}", other.kind()),
            )),
        }
    }

    /// Replace every predictor with `transform(predictor)`, in place.
    ///
    /// Precondition: the graph does not change shape between enumeration and
    /// the writes. If it does, the first broken path fails with
    /// [`ProgramError::PathResolution`] and earlier writes stay applied.
    pub fn map_named_predictors<F>(&mut self, mut transform: F) -> Result<&mut Self>
    where
        F: FnMut(Predictor) -> Predictor,
    {
        for (path, predictor) in self.named_predictors() {
            let next = transform(predictor);
            set_by_path(self, &path, Component::Predictor(next))?;
        }
        Ok(self)
    }

    /// The single LM shared by all predictors (`None` if they are all unset,
    /// or if there are no predictors).
    pub fn get_lm<G: FeatureGate + ?Sized>(&self, gate: &G) -> Result<Option<LmHandle>> {
        require_experimental(gate, "get_lm")?;

        let mut distinct: Vec<Option<LmHandle>> = Vec::new();
        for predictor in self.predictors() {
            if !distinct.contains(&predictor.lm) {
                distinct.push(predictor.lm);
            }
        }
        match distinct.len() {
            0 | 1 => Ok(distinct.pop().flatten()),
            count => Err(ProgramError::InconsistentLm { distinct: count }),
        }
    }

    /// Point every predictor at `lm`.
    pub fn set_lm<G: FeatureGate + ?Sized>(&mut self, gate: &G, lm: LmHandle) -> Result<()> {
        require_experimental(gate, "set_lm")?;

        let mut updated = 0usize;
        self.map_named_predictors(|mut predictor| {
            predictor.lm = Some(lm.clone());
            updated += 1;
            predictor
        })?;
        debug!(model = %lm.config().model, updated, "set lm on predictors");
        Ok(())
    }

    /// Run this module as a new top-level invocation.
    pub fn invoke(&mut self, args: &Args) -> Result<Prediction> {
        let mut ctx = CallContext::new();
        self.invoke_within(&mut ctx, args)
    }

    /// Run this module inside an existing invocation.
    ///
    /// An installed assertion transform only opens a retry loop when `ctx`
    /// has none active; otherwise failures propagate to the enclosing loop.
    pub fn invoke_within(&mut self, ctx: &mut CallContext, args: &Args) -> Result<Prediction> {
        match self.assertions.clone() {
            Some(transform) if !ctx.retry_active() => run_with_retries(self, &transform, ctx, args),
            _ => self.call_forward(ctx, args),
        }
    }

    /// Invoke the sub-module stored in attribute `name` within `ctx`.
    ///
    /// Assertion targets reported by the child are re-rooted under `name` so
    /// they stay valid paths relative to this module.
    pub fn invoke_child(&self, name: &str, ctx: &mut CallContext, args: &Args) -> Result<Prediction> {
        let child = match self.attr(name) {
            Some(Component::Module(child)) => child.clone(),
            Some(other) => {
                return Err(ProgramError::unresolved(
                    name,
                    format!("expected a module, found {}", other.kind()),
                ));
            }
            None => return Err(ProgramError::unresolved(name, "no such attribute")),
        };
        let mut inner = child
            .try_borrow_mut()
            .map_err(|_| ProgramError::unresolved(name, "module is already borrowed"))?;
        inner.invoke_within(ctx, args).map_err(|err| match err {
            ProgramError::Assertion(failure) => ProgramError::Assertion(failure.nested_under(name)),
            other => other,
        })
    }

    pub(crate) fn call_forward(&self, ctx: &mut CallContext, args: &Args) -> Result<Prediction> {
        let forward = self.forward.clone().ok_or(ProgramError::MissingForward)?;
        forward.forward(self, ctx, args)
    }
}

fn require_experimental<G: FeatureGate + ?Sized>(gate: &G, operation: &'static str) -> Result<()> {
    if gate.experimental_enabled() {
        return Ok(());
    }
    warn!(operation, "refusing experimental operation");
    Err(ProgramError::FeatureGated { operation })
}

impl Addressable for Module {
    fn child(&self, segment: &Segment) -> Result<&Component, String> {
        match segment {
            Segment::Attr(name) => self.attr(name).ok_or_else(|| format!("no attribute '{}'", name)),
            Segment::Item(key) => Err(format!("modules have attributes, not items: [{}]", key)),
        }
    }

    fn child_mut(&mut self, segment: &Segment) -> Result<&mut Component, String> {
        match segment {
            Segment::Attr(name) => self
                .attrs
                .iter_mut()
                .find(|(existing, _)| existing == name)
                .map(|(_, value)| value)
                .ok_or_else(|| format!("no attribute '{}'", name)),
            Segment::Item(key) => Err(format!("modules have attributes, not items: [{}]", key)),
        }
    }

    fn set_child(&mut self, segment: &Segment, value: Component) -> Result<(), String> {
        let slot = self.child_mut(segment)?;
        *slot = value;
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .named_predictors()
            .into_iter()
            .map(|(path, predictor)| format!("{} = {}", path, predictor))
            .collect();
        f.write_str(&lines.join("\n"))
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("compiled", &self.compiled)
            .field("attrs", &self.attrs)
            .field("forward", &self.forward.is_some())
            .field("assertions", &self.assertions.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{list, predictor, sample_program};
    use serde_json::json;

    #[test]
    fn set_attr_replaces_in_place() {
        let mut module = Module::new()
            .with_attr("a", predictor("a"))
            .with_attr("b", predictor("b"));
        let previous = module.set_attr("a", predictor("a2"));

        assert!(previous.is_some());
        let names: Vec<_> = module.attrs().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn named_predictors_skips_modules_and_opaque_values() {
        let root = sample_program();
        let names: Vec<_> = root
            .named_predictors()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(names, vec!["retrieve", "qa.generate", "qa.critics[0]", "qa.critics[1]"]);
        assert_eq!(root.predictors().len(), 4);
    }

    #[test]
    fn display_lists_predictors_one_per_line() {
        let root = Module::new()
            .with_attr("a", predictor("q -> a"))
            .with_attr("b", Module::new().with_attr("c", predictor("a -> b")));
        assert_eq!(root.to_string(), "a = Predict(q -> a)\nb.c = Predict(a -> b)");
    }

    #[test]
    fn get_lm_checks_gate_before_handles() {
        let root = Module::new()
            .with_attr("a", Predictor::new("x").with_lm(LmHandle::model("one")))
            .with_attr("b", Predictor::new("y").with_lm(LmHandle::model("two")));
        let err = root.get_lm(&false).expect_err("gated");
        assert!(matches!(err, ProgramError::FeatureGated { operation: "get_lm" }));
    }

    #[test]
    fn get_lm_treats_unset_as_distinct() {
        let root = Module::new()
            .with_attr("a", Predictor::new("x").with_lm(LmHandle::model("one")))
            .with_attr("b", predictor("y"));
        let err = root.get_lm(&true).expect_err("mixed");
        assert!(matches!(err, ProgramError::InconsistentLm { distinct: 2 }));
    }

    #[test]
    fn get_lm_on_empty_module_is_none() {
        let root = Module::new().with_attr("limit", json!(3));
        assert_eq!(root.get_lm(&true).expect("get"), None);
    }

    #[test]
    fn set_lm_without_predictors_is_noop() {
        let mut root = Module::new().with_attr("steps", list(Vec::new()));
        root.set_lm(&true, LmHandle::model("m")).expect("set");
        assert!(root.predictors().is_empty());
    }

    #[test]
    fn invoke_without_forward_fails() {
        let mut root = Module::new();
        let err = root.invoke(&Args::new()).expect_err("no forward");
        assert!(matches!(err, ProgramError::MissingForward));
    }

    #[test]
    fn invoke_delegates_to_forward() {
        let mut root = Module::new()
            .with_attr("generate", predictor("q -> a"))
            .with_forward(|module: &Module, _: &mut CallContext, args: &Args| -> Result<Prediction> {
                let signature = module.predictor("generate")?.signature;
                Ok(json!({ "signature": signature, "question": args.input(0).cloned() }))
            });

        let out = root
            .invoke(&Args::new().with_input("why?"))
            .expect("invoke");
        assert_eq!(out, json!({ "signature": "q -> a", "question": "why?" }));
    }

    #[test]
    fn predictor_lookup_rejects_non_predictors() {
        let root = sample_program();
        let err = root.predictor("qa").expect_err("module");
        assert!(matches!(err, ProgramError::PathResolution { .. }));
    }
}
