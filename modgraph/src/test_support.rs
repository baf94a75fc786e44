//! Test-only helpers for constructing program graphs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::component::{Component, Predictor};
use crate::core::module::{Module, ModuleRef};

/// A predictor component with the given signature and default fields.
pub fn predictor(signature: &str) -> Component {
    Component::Predictor(Predictor::new(signature))
}

pub fn list(items: Vec<Component>) -> Component {
    Component::List(items)
}

pub fn map(entries: Vec<(&str, Component)>) -> Component {
    Component::Map(
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub fn shared(module: Module) -> ModuleRef {
    module.into_shared()
}

/// Deterministic two-level program:
///
/// ```text
/// retrieve            predictor
/// qa                  module
///   generate          predictor
///   critics[0..2]     predictors
///   temperature       opaque
/// name                opaque
/// ```
pub fn sample_program() -> Module {
    let qa = Module::new()
        .with_attr("generate", predictor("question, passages -> answer"))
        .with_attr(
            "critics",
            list(vec![predictor("answer -> faithful"), predictor("answer -> concise")]),
        )
        .with_attr("temperature", json!(0.2));
    Module::new()
        .with_attr("retrieve", predictor("question -> passages"))
        .with_attr("qa", qa)
        .with_attr("name", json!("rag"))
}

/// Temporary directory holding a graph description and optional settings.
pub struct TempGraph {
    dir: TempDir,
    pub graph_path: PathBuf,
    pub settings_path: PathBuf,
}

impl TempGraph {
    pub fn new(graph: &Value) -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let graph_path = dir.path().join("graph.json");
        let settings_path = dir.path().join("modgraph.toml");
        let mut buf = serde_json::to_string_pretty(graph)?;
        buf.push('\n');
        fs::write(&graph_path, buf)
            .with_context(|| format!("write {}", graph_path.display()))?;
        Ok(Self {
            dir,
            graph_path,
            settings_path,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_settings(&self, contents: &str) -> Result<()> {
        fs::write(&self.settings_path, contents)
            .with_context(|| format!("write {}", self.settings_path.display()))
    }
}

/// Graph description with predictors at `a` and `b.c`, each bound to the
/// model of the same index in `models` (`None` leaves the LM unset).
pub fn two_predictor_graph(models: [Option<&str>; 2]) -> Value {
    let leaf = |signature: &str, model: Option<&str>| match model {
        Some(model) => json!({ "kind": "predictor", "signature": signature, "lm": { "model": model } }),
        None => json!({ "kind": "predictor", "signature": signature }),
    };
    json!({
        "attrs": [
            { "name": "a", "value": leaf("q -> a", models[0]) },
            { "name": "b", "value": { "kind": "module", "attrs": [
                { "name": "c", "value": leaf("a -> c", models[1]) }
            ] } }
        ]
    })
}
