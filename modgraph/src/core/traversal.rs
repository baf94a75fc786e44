//! Depth-first discovery of components and path-addressed reads/writes.
//!
//! Ordering contract: attributes in insertion order, list elements by index,
//! mapping entries by key. A module is visited at most once per traversal
//! (identity of its `RefCell`), so cyclic graphs terminate.

use std::collections::HashSet;

use tracing::{debug, instrument, warn};

use crate::core::component::Component;
use crate::core::module::Module;
use crate::core::path::{self, Segment, is_addressable_attr, join_attr, join_item};
use crate::error::{ProgramError, Result};

/// Path-level access to the children of a composite.
///
/// Errors are human-readable reasons; callers attach the full path.
pub trait Addressable {
    fn child(&self, segment: &Segment) -> Result<&Component, String>;
    fn child_mut(&mut self, segment: &Segment) -> Result<&mut Component, String>;
    fn set_child(&mut self, segment: &Segment, value: Component) -> Result<(), String>;
}

impl Addressable for Component {
    fn child(&self, segment: &Segment) -> Result<&Component, String> {
        match (self, segment) {
            (Component::List(items), Segment::Item(key)) => {
                let index = list_index(key)?;
                items
                    .get(index)
                    .ok_or_else(|| out_of_range(index, items.len()))
            }
            (Component::Map(items), Segment::Item(key)) => {
                items.get(key).ok_or_else(|| format!("no key '{}'", key))
            }
            (Component::List(_) | Component::Map(_), Segment::Attr(name)) => Err(format!(
                "container elements are addressed as [key], not '.{}'",
                name
            )),
            (other, _) => Err(format!("cannot address into {}", other.kind())),
        }
    }

    fn child_mut(&mut self, segment: &Segment) -> Result<&mut Component, String> {
        match (self, segment) {
            (Component::List(items), Segment::Item(key)) => {
                let index = list_index(key)?;
                let len = items.len();
                items.get_mut(index).ok_or_else(|| out_of_range(index, len))
            }
            (Component::Map(items), Segment::Item(key)) => items
                .get_mut(key)
                .ok_or_else(|| format!("no key '{}'", key)),
            (Component::List(_) | Component::Map(_), Segment::Attr(name)) => Err(format!(
                "container elements are addressed as [key], not '.{}'",
                name
            )),
            (other, _) => Err(format!("cannot address into {}", other.kind())),
        }
    }

    fn set_child(&mut self, segment: &Segment, value: Component) -> Result<(), String> {
        let slot = self.child_mut(segment)?;
        *slot = value;
        Ok(())
    }
}

fn list_index(key: &str) -> Result<usize, String> {
    key.parse::<usize>()
        .map_err(|_| format!("'{}' is not a list index", key))
}

fn out_of_range(index: usize, len: usize) -> String {
    format!("index {} out of range for list of length {}", index, len)
}

/// Traversal knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalOptions {
    /// Yield compiled sub-modules but do not enter them.
    pub skip_compiled: bool,
}

/// Enumerate every reachable predictor and sub-module under `root`.
pub fn enumerate_components(root: &Module) -> Vec<(String, Component)> {
    enumerate_with(root, TraversalOptions::default())
}

/// [`enumerate_components`] with explicit options.
pub fn enumerate_with(root: &Module, options: TraversalOptions) -> Vec<(String, Component)> {
    let mut walker = Walker {
        options,
        visited: HashSet::new(),
        found: Vec::new(),
    };
    walker.visited.insert(root as *const Module);
    walker.walk_module(root, "");
    debug!(count = walker.found.len(), "enumerated components");
    walker.found
}

struct Walker {
    options: TraversalOptions,
    visited: HashSet<*const Module>,
    found: Vec<(String, Component)>,
}

impl Walker {
    fn walk_module(&mut self, module: &Module, prefix: &str) {
        for (name, value) in module.attrs() {
            if !is_addressable_attr(name) {
                debug!(attr = name, "skipping attribute that cannot be addressed by path");
                continue;
            }
            self.walk_value(value, join_attr(prefix, name));
        }
    }

    fn walk_value(&mut self, value: &Component, path: String) {
        match value {
            Component::Predictor(_) => self.found.push((path, value.clone())),
            Component::Module(module) => {
                if !self.visited.insert(module.as_ptr() as *const Module) {
                    return;
                }
                let Ok(inner) = module.try_borrow() else {
                    warn!(path = %path, "module is mutably borrowed; not entering it");
                    self.found.push((path, value.clone()));
                    return;
                };
                self.found.push((path.clone(), value.clone()));
                if self.options.skip_compiled && inner.compiled {
                    return;
                }
                self.walk_module(&inner, &path);
            }
            Component::List(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.walk_value(item, join_item(&path, &index.to_string()));
                }
            }
            Component::Map(items) => {
                for (key, item) in items {
                    self.walk_value(item, join_item(&path, key));
                }
            }
            Component::Opaque(_) => {}
        }
    }
}

/// Read the component at `path`, relative to `root`.
pub fn get_by_path(root: &Module, path: &str) -> Result<Component> {
    let segments = path::parse(path)?;
    get_in_module(root, &segments, path)
}

fn get_in_module(module: &Module, segments: &[Segment], path: &str) -> Result<Component> {
    let Some((first, rest)) = segments.split_first() else {
        return Err(ProgramError::unresolved(path, "empty path"));
    };
    let child = module
        .child(first)
        .map_err(|reason| ProgramError::unresolved(path, reason))?;
    get_in_component(child, rest, path)
}

fn get_in_component(component: &Component, segments: &[Segment], path: &str) -> Result<Component> {
    let Some((first, rest)) = segments.split_first() else {
        return Ok(component.clone());
    };
    if let Component::Module(module) = component {
        let inner = module
            .try_borrow()
            .map_err(|_| ProgramError::unresolved(path, "module is mutably borrowed"))?;
        return get_in_module(&inner, segments, path);
    }
    let child = component
        .child(first)
        .map_err(|reason| ProgramError::unresolved(path, reason))?;
    get_in_component(child, rest, path)
}

/// Replace the component at `path` in place.
///
/// Every segment must already resolve; this never creates attributes, list
/// slots or mapping keys.
#[instrument(level = "debug", skip(root, value), fields(kind = value.kind()))]
pub fn set_by_path(root: &mut Module, path: &str, value: Component) -> Result<()> {
    let segments = path::parse(path)?;
    set_in_module(root, &segments, value, path)?;
    debug!("component replaced");
    Ok(())
}

fn set_in_module(
    module: &mut Module,
    segments: &[Segment],
    value: Component,
    path: &str,
) -> Result<()> {
    let Some((first, rest)) = segments.split_first() else {
        return Err(ProgramError::unresolved(path, "empty path"));
    };
    if rest.is_empty() {
        return module
            .set_child(first, value)
            .map_err(|reason| ProgramError::unresolved(path, reason));
    }
    let child = module
        .child_mut(first)
        .map_err(|reason| ProgramError::unresolved(path, reason))?;
    set_in_component(child, rest, value, path)
}

fn set_in_component(
    component: &mut Component,
    segments: &[Segment],
    value: Component,
    path: &str,
) -> Result<()> {
    let Some((first, rest)) = segments.split_first() else {
        return Err(ProgramError::unresolved(path, "empty path"));
    };
    if let Component::Module(module) = component {
        let module = module.clone();
        let mut inner = module
            .try_borrow_mut()
            .map_err(|_| ProgramError::unresolved(path, "module is already borrowed"))?;
        return set_in_module(&mut inner, segments, value, path);
    }
    if rest.is_empty() {
        return component
            .set_child(first, value)
            .map_err(|reason| ProgramError::unresolved(path, reason));
    }
    let child = component
        .child_mut(first)
        .map_err(|reason| ProgramError::unresolved(path, reason))?;
    set_in_component(child, rest, value, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::component::Predictor;
    use crate::test_support::{list, map, predictor, shared};
    use serde_json::json;

    fn paths(root: &Module) -> Vec<String> {
        enumerate_components(root)
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    #[test]
    fn walks_attributes_then_indices_then_keys() {
        let inner = Module::new()
            .with_attr("generate", predictor("q -> a"))
            .with_attr("temperature", json!(0.7));
        let root = Module::new()
            .with_attr("retrieve", predictor("q -> passages"))
            .with_attr("steps", list(vec![predictor("s0"), inner.into()]))
            .with_attr(
                "by_lang",
                map(vec![("fr", predictor("fr")), ("de", predictor("de"))]),
            );

        assert_eq!(
            paths(&root),
            vec![
                "retrieve",
                "steps[0]",
                "steps[1]",
                "steps[1].generate",
                "by_lang[de]",
                "by_lang[fr]",
            ]
        );
    }

    #[test]
    fn aliased_module_is_visited_once() {
        let shared_child = shared(Module::new().with_attr("p", predictor("x -> y")));
        let root = Module::new()
            .with_attr("first", shared_child.clone())
            .with_attr("second", shared_child);

        assert_eq!(paths(&root), vec!["first", "first.p"]);
    }

    #[test]
    fn compiled_modules_are_not_entered_when_skipping() {
        let mut frozen = Module::new().with_attr("p", predictor("x -> y"));
        frozen.compiled = true;
        let root = Module::new().with_attr("frozen", frozen);

        let found = enumerate_with(&root, TraversalOptions { skip_compiled: true });
        let names: Vec<_> = found.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(names, vec!["frozen"]);
        assert_eq!(paths(&root), vec!["frozen", "frozen.p"]);
    }

    #[test]
    fn get_by_path_resolves_nested_containers() {
        let root = Module::new().with_attr(
            "steps",
            list(vec![map(vec![("draft", predictor("d -> e"))])]),
        );
        let found = get_by_path(&root, "steps[0][draft]").expect("resolve");
        assert_eq!(found.as_predictor(), Some(&Predictor::new("d -> e")));
    }

    #[test]
    fn set_by_path_replaces_inside_submodule() {
        let mut root = Module::new().with_attr(
            "qa",
            Module::new().with_attr("generate", predictor("q -> a")),
        );
        set_by_path(&mut root, "qa.generate", predictor("q -> short_a")).expect("set");

        let found = get_by_path(&root, "qa.generate").expect("get");
        assert_eq!(found.as_predictor(), Some(&Predictor::new("q -> short_a")));
    }

    #[test]
    fn set_by_path_reports_unresolved_segments() {
        let mut root = Module::new()
            .with_attr("steps", list(vec![predictor("a")]))
            .with_attr("lookup", map(vec![("k", predictor("b"))]))
            .with_attr("limit", json!(3));

        for bad in ["missing", "steps[1]", "steps[x]", "lookup[nope]", "limit[0]", "steps.p"] {
            let err = set_by_path(&mut root, bad, predictor("z")).expect_err(bad);
            assert!(
                matches!(err, ProgramError::PathResolution { .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn cyclic_write_through_borrowed_module_fails_cleanly() {
        let root = shared(Module::new().with_attr("p", predictor("a")));
        let child = shared(Module::new().with_attr("parent", root.clone()));
        root.borrow_mut().set_attr("child", child);

        let mut guard = root.borrow_mut();
        let err = set_by_path(&mut guard, "child.parent.p", predictor("b")).expect_err("borrowed");
        assert!(matches!(err, ProgramError::PathResolution { .. }));
    }
}
