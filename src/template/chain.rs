//! Chained execution state machine
//!
//! `Ready -> Submitted -> {Done | Ready(next args)}`, driven by the loop in
//! [`super::TemplateContext::execute_chained`]. Transitions are pure so the
//! termination rules can be tested without a ledger.

use super::ExecutionResult;
use crate::context::ParentLink;
use crate::error::{ContextError, Result};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

/// What the decider sees after each successful step
pub struct ChainInput<A> {
    /// The template node
    pub node: ParentLink,
    /// The template's parent, for re-resolving state with `no_cache`
    pub parent: ParentLink,
    pub result: ExecutionResult<A>,
    /// Zero-based index of the step that just completed
    pub step: usize,
}

/// Decides whether another step is needed, and with which arguments
///
/// Re-resolved ledger state is authoritative; decoded events are a hint.
pub struct ChainDecider<A>(Arc<dyn Fn(ChainInput<A>) -> BoxFuture<'static, Result<Option<A>>> + Send + Sync>);

impl<A> Clone for ChainDecider<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: 'static> ChainDecider<A> {
    pub fn new<F, Fut>(decide: F) -> Self
    where
        F: Fn(ChainInput<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<A>>> + Send + 'static,
    {
        Self(Arc::new(move |input| decide(input).boxed()))
    }

    pub(crate) fn decide(&self, input: ChainInput<A>) -> BoxFuture<'static, Result<Option<A>>> {
        (self.0)(input)
    }
}

/// Position of a chained execution
#[derive(Debug)]
pub enum ChainState<A> {
    /// Next step should be assembled with `args`
    Ready { args: Arc<A>, step: usize },
    /// Step `step` confirmed; waiting for the decider
    Submitted { result: ExecutionResult<A>, step: usize },
    Done(ExecutionResult<A>),
}

impl<A> ChainState<A> {
    pub fn start(args: Arc<A>) -> Self {
        Self::Ready { args, step: 0 }
    }

    /// Record a confirmed step
    pub fn submitted(self, result: ExecutionResult<A>) -> Result<Self> {
        match self {
            Self::Ready { step, .. } => Ok(Self::Submitted { result, step }),
            other => Err(ContextError::internal(format!(
                "chain step submitted from state {}",
                other.name()
            ))),
        }
    }

    /// Apply the decider's answer
    ///
    /// Requesting more work after `max_iterations` submissions is an error
    /// carrying the last confirmed signature.
    pub fn advance(self, decision: Option<A>, max_iterations: usize, template: &str) -> Result<Self> {
        let (result, step) = match self {
            Self::Submitted { result, step } => (result, step),
            other => {
                return Err(ContextError::internal(format!(
                    "chain advanced from state {}",
                    other.name()
                )))
            }
        };
        match decision {
            None => Ok(Self::Done(result)),
            Some(_) if step + 1 >= max_iterations => Err(ContextError::ChainLimitExceeded {
                template: template.to_string(),
                max_iterations,
                last_signature: result.signature,
            }),
            Some(next) => Ok(Self::Ready {
                args: Arc::new(next),
                step: step + 1,
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Submitted { .. } => "submitted",
            Self::Done(_) => "done",
        }
    }
}
