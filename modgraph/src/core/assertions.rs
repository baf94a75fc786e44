//! Assertion-driven retry transform around `Module::invoke`.
//!
//! Per top-level invocation:
//!
//! ```text
//! Start -> Running -> Success
//!                  -> AssertionFailed -> Running   (attempts < max_attempts)
//!                                     -> Failed    (attempts == max_attempts)
//! ```
//!
//! The attempt bound is enforced here, not by the handler, so a custom handler
//! can never turn the loop unbounded.

use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, info, instrument, warn};

use crate::core::component::Component;
use crate::core::module::{Args, Module, Prediction};
use crate::core::traversal::set_by_path;
use crate::error::{AssertionFailure, ProgramError, Result};

/// Lifecycle of one transformed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Start,
    Running,
    Success,
    AssertionFailed,
    Failed,
}

/// Bookkeeping for one top-level invocation of a transformed module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub state: RetryState,
    /// Attempts started so far, 1-based once running.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Every failure seen in this invocation, oldest first.
    pub failures: Vec<AssertionFailure>,
    /// Predictor path -> hint count before this invocation touched it.
    pub hinted: BTreeMap<String, usize>,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: RetryState::Start,
            attempts: 0,
            max_attempts,
            failures: Vec::new(),
            hinted: BTreeMap::new(),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// State threaded through `forward` calls of one top-level invocation.
#[derive(Debug, Default)]
pub struct CallContext {
    retry: Option<RetryContext>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active retry context, if a transformed module is driving this call.
    pub fn retry(&self) -> Option<&RetryContext> {
        self.retry.as_ref()
    }

    pub fn retry_active(&self) -> bool {
        self.retry.is_some()
    }

    /// Current attempt number, or 1 outside of any retry loop.
    pub fn attempt(&self) -> u32 {
        self.retry.as_ref().map_or(1, |retry| retry.attempts.max(1))
    }
}

/// Strategy consulted after an assertion failure that still has budget left.
///
/// Returning `Ok(())` re-runs `forward` with the same arguments; returning an
/// error ends the invocation with that error.
pub trait AssertionHandler {
    fn handle(
        &self,
        module: &mut Module,
        retry: &mut RetryContext,
        failure: &AssertionFailure,
    ) -> Result<()>;

    /// Called once when the invocation ends, successfully or not.
    fn finish(&self, _module: &mut Module, _retry: &RetryContext) -> Result<()> {
        Ok(())
    }
}

impl<F> AssertionHandler for F
where
    F: Fn(&mut Module, &mut RetryContext, &AssertionFailure) -> Result<()>,
{
    fn handle(
        &self,
        module: &mut Module,
        retry: &mut RetryContext,
        failure: &AssertionFailure,
    ) -> Result<()> {
        self(module, retry, failure)
    }
}

/// Default handler: feeds the failure message back to the offending predictor
/// as a correction hint, then retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Backtrack {
    /// Keep hints on the predictors after the invocation ends.
    pub keep_hints: bool,
}

pub fn backtrack_handler() -> Rc<dyn AssertionHandler> {
    Rc::new(Backtrack::default())
}

impl AssertionHandler for Backtrack {
    fn handle(
        &self,
        module: &mut Module,
        retry: &mut RetryContext,
        failure: &AssertionFailure,
    ) -> Result<()> {
        let Some(target) = failure.target.as_deref() else {
            debug!(attempt = retry.attempts, "no target predictor; retrying unchanged");
            return Ok(());
        };
        let mut predictor = module.predictor(target)?;
        retry
            .hinted
            .entry(target.to_string())
            .or_insert(predictor.hints.len());
        predictor.hints.push(failure.message.clone());
        set_by_path(module, target, Component::Predictor(predictor))?;
        debug!(target, attempt = retry.attempts, "added correction hint");
        Ok(())
    }

    fn finish(&self, module: &mut Module, retry: &RetryContext) -> Result<()> {
        if self.keep_hints {
            return Ok(());
        }
        for (path, original_len) in &retry.hinted {
            let mut predictor = module.predictor(path)?;
            predictor.hints.truncate(*original_len);
            set_by_path(module, path, Component::Predictor(predictor))?;
        }
        Ok(())
    }
}

/// Tuning for an installed transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssertionOptions {
    /// Total attempts per top-level invocation, including the first. At least 1.
    pub max_attempts: u32,
}

impl AssertionOptions {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for AssertionOptions {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Installed transform: the handler plus its options.
#[derive(Clone)]
pub(crate) struct AssertionTransform {
    handler: Rc<dyn AssertionHandler>,
    options: AssertionOptions,
}

/// Install the retry transform on `module`, replacing any previous one.
pub fn activate(
    module: &mut Module,
    handler: Rc<dyn AssertionHandler>,
    options: AssertionOptions,
) -> &mut Module {
    if module.assertions.is_some() {
        debug!("replacing existing assertion transform");
    }
    module.assertions = Some(AssertionTransform {
        handler,
        options: AssertionOptions::with_max_attempts(options.max_attempts),
    });
    module
}

impl Module {
    /// See [`activate`].
    pub fn activate_assertions(
        &mut self,
        handler: Rc<dyn AssertionHandler>,
        options: AssertionOptions,
    ) -> &mut Self {
        activate(self, handler, options)
    }

    pub fn deactivate_assertions(&mut self) -> &mut Self {
        self.assertions = None;
        self
    }

    pub fn assertions_active(&self) -> bool {
        self.assertions.is_some()
    }
}

#[instrument(level = "debug", skip_all, fields(max_attempts = transform.options.max_attempts))]
pub(crate) fn run_with_retries(
    module: &mut Module,
    transform: &AssertionTransform,
    ctx: &mut CallContext,
    args: &Args,
) -> Result<Prediction> {
    ctx.retry = Some(RetryContext::new(transform.options.max_attempts));
    let outcome = retry_loop(module, transform, ctx, args);
    let retry = ctx
        .retry
        .take()
        .unwrap_or_else(|| RetryContext::new(transform.options.max_attempts));
    let finished = transform.handler.finish(module, &retry);
    let prediction = outcome?;
    finished?;
    Ok(prediction)
}

fn retry_loop(
    module: &mut Module,
    transform: &AssertionTransform,
    ctx: &mut CallContext,
    args: &Args,
) -> Result<Prediction> {
    let max_attempts = transform.options.max_attempts;
    loop {
        {
            let retry = ctx
                .retry
                .get_or_insert_with(|| RetryContext::new(max_attempts));
            retry.attempts += 1;
            retry.state = RetryState::Running;
            debug!(attempt = retry.attempts, "running forward");
        }

        let failure = match module.call_forward(ctx, args) {
            Ok(prediction) => {
                let retry = ctx
                    .retry
                    .get_or_insert_with(|| RetryContext::new(max_attempts));
                retry.state = RetryState::Success;
                if retry.attempts > 1 {
                    info!(attempts = retry.attempts, "assertions satisfied after retry");
                }
                return Ok(prediction);
            }
            Err(ProgramError::Assertion(failure)) => failure,
            Err(other) => return Err(other),
        };

        let retry = ctx
            .retry
            .get_or_insert_with(|| RetryContext::new(max_attempts));
        retry.state = RetryState::AssertionFailed;
        retry.failures.push(failure.clone());

        if retry.exhausted() {
            retry.state = RetryState::Failed;
            warn!(attempts = retry.attempts, failure = %failure, "assertion retries exhausted");
            return Err(ProgramError::RetriesExhausted {
                attempts: retry.attempts,
                failure,
            });
        }

        debug!(attempt = retry.attempts, failure = %failure, "assertion failed; backtracking");
        transform.handler.handle(module, retry, &failure)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::predictor;
    use serde_json::json;
    use std::cell::Cell;

    fn failing_until(success_on: u32, calls: Rc<Cell<u32>>) -> Module {
        Module::new()
            .with_attr("generate", predictor("q -> a"))
            .with_forward(move |_: &Module, ctx: &mut CallContext, _: &Args| -> Result<Prediction> {
                calls.set(calls.get() + 1);
                if ctx.attempt() < success_on {
                    return Err(AssertionFailure::new("answer too long").at("generate").into());
                }
                Ok(json!({ "attempt": ctx.attempt() }))
            })
    }

    #[test]
    fn reactivation_replaces_transform() {
        let calls = Rc::new(Cell::new(0));
        let mut module = failing_until(u32::MAX, calls.clone());
        module
            .activate_assertions(backtrack_handler(), AssertionOptions::with_max_attempts(5))
            .activate_assertions(backtrack_handler(), AssertionOptions::with_max_attempts(2));

        let err = module.invoke(&Args::new()).expect_err("exhausted");
        assert!(matches!(err, ProgramError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let calls = Rc::new(Cell::new(0));
        let mut module = failing_until(1, calls.clone());
        module.activate_assertions(backtrack_handler(), AssertionOptions::with_max_attempts(0));

        assert_eq!(module.invoke(&Args::new()).expect("ok"), json!({ "attempt": 1 }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backtrack_hint_is_visible_during_retry_and_removed_after() {
        let seen_hints = Rc::new(Cell::new(0usize));
        let seen = seen_hints.clone();
        let mut module = Module::new()
            .with_attr("generate", predictor("q -> a"))
            .with_forward(move |module: &Module, _: &mut CallContext, _: &Args| -> Result<Prediction> {
                let hints = module.predictor("generate")?.hints;
                seen.set(hints.len());
                if hints.is_empty() {
                    return Err(AssertionFailure::new("cite a source").at("generate").into());
                }
                Ok(json!(hints))
            });
        module.activate_assertions(backtrack_handler(), AssertionOptions::default());

        let out = module.invoke(&Args::new()).expect("invoke");
        assert_eq!(out, json!(["cite a source"]));
        assert_eq!(seen_hints.get(), 1);
        assert!(module.predictor("generate").expect("predictor").hints.is_empty());
    }

    #[test]
    fn keep_hints_leaves_predictor_adjusted() {
        let calls = Rc::new(Cell::new(0));
        let mut module = failing_until(2, calls);
        module.activate_assertions(
            Rc::new(Backtrack { keep_hints: true }),
            AssertionOptions::default(),
        );

        module.invoke(&Args::new()).expect("invoke");
        let hints = module.predictor("generate").expect("predictor").hints;
        assert_eq!(hints, vec!["answer too long".to_string()]);
    }

    #[test]
    fn handler_error_stops_retrying() {
        let calls = Rc::new(Cell::new(0));
        let mut module = failing_until(u32::MAX, calls.clone());
        let veto = |_: &mut Module, retry: &mut RetryContext, _: &AssertionFailure| -> Result<()> {
            assert_eq!(retry.state, RetryState::AssertionFailed);
            Err(ProgramError::Forward(anyhow::anyhow!("giving up")))
        };
        module.activate_assertions(Rc::new(veto), AssertionOptions::default());

        let err = module.invoke(&Args::new()).expect_err("vetoed");
        assert!(matches!(err, ProgramError::Forward(_)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn non_assertion_errors_are_not_retried() {
        let calls = Rc::new(Cell::new(0u32));
        let counter = calls.clone();
        let mut module = Module::new().with_forward(
            move |_: &Module, _: &mut CallContext, _: &Args| -> Result<Prediction> {
                counter.set(counter.get() + 1);
                Err(ProgramError::InconsistentLm { distinct: 2 })
            },
        );
        module.activate_assertions(backtrack_handler(), AssertionOptions::default());

        let err = module.invoke(&Args::new()).expect_err("bubbles");
        assert!(matches!(err, ProgramError::InconsistentLm { .. }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn unresolvable_target_bubbles_as_path_error() {
        let mut module = Module::new().with_forward(
            |_: &Module, _: &mut CallContext, _: &Args| -> Result<Prediction> {
                Err(AssertionFailure::new("bad").at("nowhere").into())
            },
        );
        module.activate_assertions(backtrack_handler(), AssertionOptions::default());

        let err = module.invoke(&Args::new()).expect_err("unresolved");
        assert!(matches!(err, ProgramError::PathResolution { .. }));
    }
}
