//! Pure graph logic: naming, traversal, module operations, retries.
//!
//! Nothing under `core` touches the filesystem or process environment.

pub mod assertions;
pub mod component;
pub mod gate;
pub mod module;
pub mod path;
pub mod state;
pub mod traversal;
