//! Error taxonomy for program graphs.
//!
//! Only [`ProgramError::Assertion`] is recoverable, and only at the boundary
//! installed by `activate_assertions`. Every other variant bubbles to the caller
//! unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::path::join_attr;

/// Constraint violation raised by a `forward` implementation.
///
/// `target` optionally names the predictor (by dotted path) whose output broke
/// the constraint, so a backtrack handler can steer that predictor on retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionFailure {
    pub message: String,
    pub target: Option<String>,
}

impl AssertionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target: None,
        }
    }

    /// Attach the dotted path of the offending predictor.
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.target = Some(path.into());
        self
    }

    /// Re-root the target path under attribute `name` of the parent module.
    pub fn nested_under(mut self, name: &str) -> Self {
        self.target = self.target.map(|target| join_attr(name, &target));
        self
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} (at {})", self.message, target),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for AssertionFailure {}

/// Errors surfaced by traversal, module operations and the retry transform.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("{operation} is an experimental feature; enable `experimental` in settings")]
    FeatureGated { operation: &'static str },

    #[error("multiple LMs are being used in the module ({distinct} distinct handles)")]
    InconsistentLm { distinct: usize },

    #[error("cannot resolve path '{path}': {reason}")]
    PathResolution { path: String, reason: String },

    #[error("invalid path '{path}': {reason}")]
    PathSyntax { path: String, reason: String },

    #[error("assertion failed: {0}")]
    Assertion(#[from] AssertionFailure),

    #[error("assertion still failing after {attempts} attempts: {failure}")]
    RetriesExhausted {
        attempts: u32,
        failure: AssertionFailure,
    },

    #[error("module has no forward implementation")]
    MissingForward,

    #[error("state for '{path}' does not match the program: {reason}")]
    StateMismatch { path: String, reason: String },

    #[error(transparent)]
    Forward(#[from] anyhow::Error),
}

impl ProgramError {
    pub(crate) fn unresolved(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PathResolution {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for the single recoverable kind handled by the retry transform.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Self::Assertion(_))
    }
}

pub type Result<T, E = ProgramError> = std::result::Result<T, E>;

/// Fail with an [`AssertionFailure`] unless `condition` holds.
pub fn ensure(condition: bool, failure: impl FnOnce() -> AssertionFailure) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(ProgramError::Assertion(failure()))
    }
}
