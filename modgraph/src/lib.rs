//! Module composition and introspection for language-model programs.
//!
//! A program is a tree of [`Module`]s holding [`Predictor`] leaves, possibly
//! nested inside lists and mappings. The crate is split the same way as its
//! binary uses it:
//!
//! - **[`core`]**: Pure graph logic. Traversal and dotted-path naming
//!   ([`core::traversal`], [`core::path`]), module operations
//!   ([`core::module`]), and the assertion retry transform
//!   ([`core::assertions`]).
//! - **[`io`]**: Settings and graph description files.
//!
//! ```
//! use modgraph::{LmHandle, Module, Predictor};
//!
//! let mut program = Module::new()
//!     .with_attr("retrieve", Predictor::new("question -> passages"))
//!     .with_attr("qa", Module::new().with_attr("generate", Predictor::new("passages -> answer")));
//!
//! let paths: Vec<_> = program.named_predictors().into_iter().map(|(p, _)| p).collect();
//! assert_eq!(paths, ["retrieve", "qa.generate"]);
//!
//! program.set_lm(&true, LmHandle::model("small")).unwrap();
//! assert_eq!(program.get_lm(&true).unwrap(), Some(LmHandle::model("small")));
//! ```

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::assertions::{
    AssertionHandler, AssertionOptions, Backtrack, CallContext, RetryContext, RetryState, activate,
    backtrack_handler,
};
pub use crate::core::component::{Component, LmConfig, LmHandle, Predictor, PredictorState};
pub use crate::core::gate::FeatureGate;
pub use crate::core::module::{Args, Forward, Module, ModuleRef, Prediction};
pub use crate::core::state::{deep_copy, reset_copy};
pub use crate::core::traversal::{
    Addressable, TraversalOptions, enumerate_components, get_by_path, set_by_path,
};
pub use crate::error::{AssertionFailure, ProgramError, ensure};
pub use crate::io::settings::Settings;
