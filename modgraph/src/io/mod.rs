//! File-backed helpers used by the `modgraph` binary.

pub mod graph_file;
pub mod settings;
