//! JSON description of a program graph, for tooling and fixtures.
//!
//! ```json
//! {
//!   "attrs": [
//!     { "name": "retrieve", "value": { "kind": "predictor", "signature": "q -> passages" } },
//!     { "name": "qa", "value": { "kind": "module", "attrs": [] } }
//!   ]
//! }
//! ```
//!
//! Attributes are a list so that declaration order survives parsing. Modules
//! built from a description have no `forward`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::component::{Component, LmConfig, LmHandle, Predictor};
use crate::core::module::Module;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    #[serde(default)]
    pub compiled: bool,
    #[serde(default)]
    pub attrs: Vec<AttrSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrSpec {
    pub name: String,
    pub value: ComponentSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentSpec {
    Predictor {
        signature: String,
        #[serde(default)]
        instructions: String,
        #[serde(default)]
        demos: Vec<Value>,
        #[serde(default)]
        lm: Option<LmConfig>,
    },
    Module(ModuleSpec),
    List {
        items: Vec<ComponentSpec>,
    },
    Map {
        entries: BTreeMap<String, ComponentSpec>,
    },
    Value {
        value: Value,
    },
}

/// Build a module from its description.
///
/// Predictors with equal LM configurations share a single handle.
pub fn build_module(spec: &ModuleSpec) -> Module {
    Builder::default().module(spec)
}

/// Read and build a graph description from disk.
pub fn load_graph(path: &Path) -> Result<Module> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read graph {}", path.display()))?;
    let spec: ModuleSpec = serde_json::from_str(&contents)
        .with_context(|| format!("parse graph {}", path.display()))?;
    let module = build_module(&spec);
    debug!(path = %path.display(), attrs = spec.attrs.len(), "loaded graph");
    Ok(module)
}

#[derive(Default)]
struct Builder {
    handles: Vec<LmHandle>,
}

impl Builder {
    fn module(&mut self, spec: &ModuleSpec) -> Module {
        let mut module = Module::new();
        module.compiled = spec.compiled;
        for attr in &spec.attrs {
            let value = self.component(&attr.value);
            module.set_attr(attr.name.clone(), value);
        }
        module
    }

    fn component(&mut self, spec: &ComponentSpec) -> Component {
        match spec {
            ComponentSpec::Predictor {
                signature,
                instructions,
                demos,
                lm,
            } => {
                let mut predictor = Predictor::new(signature.clone()).with_instructions(instructions.clone());
                predictor.demos = demos.clone();
                predictor.lm = lm.as_ref().map(|config| self.handle(config));
                Component::Predictor(predictor)
            }
            ComponentSpec::Module(module) => Component::from(self.module(module)),
            ComponentSpec::List { items } => {
                Component::List(items.iter().map(|item| self.component(item)).collect())
            }
            ComponentSpec::Map { entries } => Component::Map(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), self.component(item)))
                    .collect(),
            ),
            ComponentSpec::Value { value } => Component::Opaque(value.clone()),
        }
    }

    fn handle(&mut self, config: &LmConfig) -> LmHandle {
        if let Some(existing) = self.handles.iter().find(|handle| handle.config() == config) {
            return existing.clone();
        }
        let handle = LmHandle::new(config.clone());
        self.handles.push(handle.clone());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ModuleSpec {
        serde_json::from_value(json!({
            "attrs": [
                { "name": "retrieve", "value": {
                    "kind": "predictor", "signature": "q -> passages",
                    "lm": { "model": "small" } } },
                { "name": "qa", "value": { "kind": "module", "compiled": true, "attrs": [
                    { "name": "generate", "value": {
                        "kind": "predictor", "signature": "q, passages -> a",
                        "lm": { "model": "small" } } }
                ] } },
                { "name": "k", "value": { "kind": "value", "value": 3 } }
            ]
        }))
        .expect("spec")
    }

    #[test]
    fn builds_graph_in_declaration_order() {
        let module = build_module(&spec());
        let names: Vec<_> = module.attrs().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["retrieve", "qa", "k"]);
        let paths: Vec<_> = module
            .named_predictors()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(paths, vec!["retrieve", "qa.generate"]);
        assert_eq!(module.named_sub_modules(true).len(), 1);
    }

    #[test]
    fn equal_lm_configs_share_a_handle() {
        let module = build_module(&spec());
        let predictors = module.predictors();
        let first = predictors[0].lm.as_ref().expect("lm");
        let second = predictors[1].lm.as_ref().expect("lm");
        assert!(first.same_handle(second));
    }

    #[test]
    fn load_graph_reports_parse_errors_with_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("graph.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_graph(&path).expect_err("invalid");
        assert!(format!("{:#}", err).contains("parse graph"));
    }
}
