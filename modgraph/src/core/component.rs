//! Node types that make up a program graph.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::core::module::{Module, ModuleRef};

/// Provider configuration an [`LmHandle`] points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl LmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            params: BTreeMap::new(),
        }
    }
}

/// Opaque, shared reference to a language-model configuration.
///
/// Cloning shares the same configuration. Two handles are equal when they are
/// the same handle or point at equal configurations.
#[derive(Clone)]
pub struct LmHandle(Rc<LmConfig>);

impl LmHandle {
    pub fn new(config: LmConfig) -> Self {
        Self(Rc::new(config))
    }

    pub fn model(model: impl Into<String>) -> Self {
        Self::new(LmConfig::new(model))
    }

    pub fn config(&self) -> &LmConfig {
        &self.0
    }

    /// True if both handles are the same allocation.
    pub fn same_handle(&self, other: &LmHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for LmHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_handle(other) || self.0 == other.0
    }
}

impl Eq for LmHandle {}

impl fmt::Debug for LmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LmHandle({})", self.0.model)
    }
}

impl Serialize for LmHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LmHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        LmConfig::deserialize(deserializer).map(LmHandle::new)
    }
}

/// Leaf component that issues LM calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictor {
    pub signature: String,
    pub instructions: String,
    pub demos: Vec<Value>,
    /// Correction hints appended by backtracking, oldest first.
    pub hints: Vec<String>,
    pub lm: Option<LmHandle>,
    pub compiled: bool,
}

impl Predictor {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            instructions: String::new(),
            demos: Vec::new(),
            hints: Vec::new(),
            lm: None,
            compiled: false,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_lm(mut self, lm: LmHandle) -> Self {
        self.lm = Some(lm);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    /// Drop learned and per-run state: LM, demos and hints.
    pub fn reset(&mut self) {
        self.lm = None;
        self.demos.clear();
        self.hints.clear();
        self.compiled = false;
    }

    pub fn state(&self) -> PredictorState {
        PredictorState {
            signature: self.signature.clone(),
            instructions: self.instructions.clone(),
            demos: self.demos.clone(),
            hints: self.hints.clone(),
        }
    }

    pub fn apply_state(&mut self, state: PredictorState) {
        self.signature = state.signature;
        self.instructions = state.instructions;
        self.demos = state.demos;
        self.hints = state.hints;
    }
}

impl fmt::Display for Predictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predict({})", self.signature)?;
        if !self.instructions.is_empty() {
            write!(f, " \"{}\"", self.instructions)?;
        }
        Ok(())
    }
}

/// Serializable snapshot of a predictor's own configuration.
///
/// The LM handle is not part of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorState {
    pub signature: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub demos: Vec<Value>,
    #[serde(default)]
    pub hints: Vec<String>,
}

/// Any value held in a module's attribute table.
#[derive(Clone)]
pub enum Component {
    Predictor(Predictor),
    Module(ModuleRef),
    List(Vec<Component>),
    Map(BTreeMap<String, Component>),
    /// Scalar or opaque data; never traversed.
    Opaque(Value),
}

impl Component {
    pub fn kind(&self) -> &'static str {
        match self {
            Component::Predictor(_) => "predictor",
            Component::Module(_) => "module",
            Component::List(_) => "list",
            Component::Map(_) => "map",
            Component::Opaque(_) => "opaque value",
        }
    }

    pub fn as_predictor(&self) -> Option<&Predictor> {
        match self {
            Component::Predictor(predictor) => Some(predictor),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&ModuleRef> {
        match self {
            Component::Module(module) => Some(module),
            _ => None,
        }
    }

    pub fn into_predictor(self) -> Option<Predictor> {
        match self {
            Component::Predictor(predictor) => Some(predictor),
            _ => None,
        }
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Component::Predictor(a), Component::Predictor(b)) => a == b,
            (Component::Module(a), Component::Module(b)) => Rc::ptr_eq(a, b),
            (Component::List(a), Component::List(b)) => a == b,
            (Component::Map(a), Component::Map(b)) => a == b,
            (Component::Opaque(a), Component::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

// Modules print by identity so that cyclic graphs stay printable.
impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Predictor(predictor) => f.debug_tuple("Predictor").field(predictor).finish(),
            Component::Module(module) => f.debug_tuple("Module").field(&module.as_ptr()).finish(),
            Component::List(items) => f.debug_tuple("List").field(items).finish(),
            Component::Map(items) => f.debug_tuple("Map").field(items).finish(),
            Component::Opaque(value) => f.debug_tuple("Opaque").field(value).finish(),
        }
    }
}

impl From<Predictor> for Component {
    fn from(predictor: Predictor) -> Self {
        Component::Predictor(predictor)
    }
}

impl From<ModuleRef> for Component {
    fn from(module: ModuleRef) -> Self {
        Component::Module(module)
    }
}

impl From<Module> for Component {
    fn from(module: Module) -> Self {
        Component::Module(Rc::new(RefCell::new(module)))
    }
}

impl From<Vec<Component>> for Component {
    fn from(items: Vec<Component>) -> Self {
        Component::List(items)
    }
}

impl From<BTreeMap<String, Component>> for Component {
    fn from(items: BTreeMap<String, Component>) -> Self {
        Component::Map(items)
    }
}

impl From<Value> for Component {
    fn from(value: Value) -> Self {
        Component::Opaque(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lm_handles_compare_by_identity_or_config() {
        let a = LmHandle::model("gpt-4o-mini");
        let shared = a.clone();
        let lookalike = LmHandle::model("gpt-4o-mini");
        let other = LmHandle::model("llama-3");

        assert!(a.same_handle(&shared));
        assert!(!a.same_handle(&lookalike));
        assert_eq!(a, lookalike);
        assert_ne!(a, other);
    }

    #[test]
    fn reset_clears_runtime_state_but_keeps_signature() {
        let mut predictor = Predictor::new("question -> answer")
            .with_lm(LmHandle::model("m"))
            .with_hint("be brief");
        predictor.demos.push(serde_json::json!({"question": "q", "answer": "a"}));
        predictor.compiled = true;

        predictor.reset();

        assert_eq!(predictor, Predictor::new("question -> answer"));
    }

    #[test]
    fn display_includes_instructions_when_present() {
        let predictor = Predictor::new("q -> a").with_instructions("Answer tersely.");
        assert_eq!(predictor.to_string(), "Predict(q -> a) \"Answer tersely.\"");
        assert_eq!(Predictor::new("q -> a").to_string(), "Predict(q -> a)");
    }
}
