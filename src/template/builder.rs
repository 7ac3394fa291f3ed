//! Instruction builders and argument validation

use super::ExecuteOverrides;
use crate::context::{Context, ParentLink};
use crate::error::{ContextError, Result};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signer::Signer};
use std::future::Future;
use std::sync::Arc;

/// What a dynamic builder receives
pub struct BuildInput<A> {
    /// The template node
    pub node: ParentLink,
    /// The template's parent, usually the node the operation acts on
    pub parent: ParentLink,
    /// Template path, used to attribute errors
    pub label: String,
    pub args: Arc<A>,
    /// Effective fee payer, when one could be determined
    pub payer: Option<Pubkey>,
    /// Per-call overrides of the execution this assembly belongs to
    pub overrides: Arc<ExecuteOverrides>,
}

impl<A> Clone for BuildInput<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            parent: self.parent.clone(),
            label: self.label.clone(),
            args: self.args.clone(),
            payer: self.payer,
            overrides: self.overrides.clone(),
        }
    }
}

impl<A> BuildInput<A> {
    /// Unresolved-prerequisite error attributed to the template
    pub fn invalid(&self, reason: impl Into<String>) -> ContextError {
        ContextError::invalid_context(self.label.clone(), reason)
    }

    /// Parent node as a concrete type
    pub fn parent<T: Context>(&self) -> Result<Arc<T>> {
        self.parent.downcast::<T>(&self.label)
    }

    pub fn payer(&self) -> Result<Pubkey> {
        self.payer.ok_or_else(|| self.invalid("fee payer is not determined"))
    }

    /// Keys of the extra signers supplied for this call
    pub fn extra_signer_keys(&self) -> Vec<Pubkey> {
        self.overrides
            .extra_signers
            .iter()
            .map(|signer| signer.pubkey())
            .collect()
    }
}

/// Output of one builder: nothing, one instruction or several
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltInstructions(Vec<Instruction>);

impl BuiltInstructions {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn into_vec(self) -> Vec<Instruction> {
        self.0
    }
}

impl From<Instruction> for BuiltInstructions {
    fn from(ix: Instruction) -> Self {
        Self(vec![ix])
    }
}

impl From<Vec<Instruction>> for BuiltInstructions {
    fn from(ixs: Vec<Instruction>) -> Self {
        Self(ixs)
    }
}

impl From<Option<Instruction>> for BuiltInstructions {
    fn from(ix: Option<Instruction>) -> Self {
        Self(ix.into_iter().collect())
    }
}

impl From<Option<Vec<Instruction>>> for BuiltInstructions {
    fn from(ixs: Option<Vec<Instruction>>) -> Self {
        Self(ixs.unwrap_or_default())
    }
}

type BuildFn<A> = Arc<dyn Fn(BuildInput<A>) -> BoxFuture<'static, Result<BuiltInstructions>> + Send + Sync>;

/// One entry of a template's ordered builder list
pub enum InstructionBuilder<A> {
    Static(Instruction),
    Dynamic(BuildFn<A>),
}

impl<A> Clone for InstructionBuilder<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(ix) => Self::Static(ix.clone()),
            Self::Dynamic(build) => Self::Dynamic(build.clone()),
        }
    }
}

impl<A: Send + Sync + 'static> InstructionBuilder<A> {
    pub fn dynamic<F, Fut, O>(build: F) -> Self
    where
        F: Fn(BuildInput<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<BuiltInstructions>,
    {
        Self::Dynamic(Arc::new(move |input| {
            let built: BoxFuture<'static, Result<BuiltInstructions>> =
                build(input).map(|built| built.map(Into::into)).boxed();
            built
        }))
    }

    fn run(&self, input: BuildInput<A>) -> BoxFuture<'static, Result<Vec<Instruction>>> {
        match self {
            Self::Static(ix) => futures::future::ready(Ok(vec![ix.clone()])).boxed(),
            Self::Dynamic(build) => build(input).map(|built| built.map(BuiltInstructions::into_vec)).boxed(),
        }
    }
}

/// Run all builders concurrently; outputs are concatenated in declaration
/// order and the first failure aborts the whole assembly
pub async fn run_builders<A: Send + Sync + 'static>(
    builders: &[InstructionBuilder<A>],
    input: BuildInput<A>,
) -> Result<Vec<Instruction>> {
    let outputs = try_join_all(builders.iter().map(|builder| builder.run(input.clone()))).await?;
    Ok(outputs.into_iter().flatten().collect())
}

/// Rejects structurally invalid arguments before any builder runs
pub struct ArgsValidator<A>(Arc<dyn Fn(&A) -> std::result::Result<(), String> + Send + Sync>);

impl<A> Clone for ArgsValidator<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A> ArgsValidator<A> {
    pub fn new<F>(validate: F) -> Self
    where
        F: Fn(&A) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self(Arc::new(validate))
    }

    pub fn validate(&self, args: &A) -> Result<()> {
        (self.0)(args).map_err(ContextError::Schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ix(tag: u8) -> Instruction {
        Instruction::new_with_bytes(Pubkey::default(), &[tag], vec![])
    }

    fn input(args: u64) -> BuildInput<u64> {
        BuildInput {
            node: ParentLink::root(),
            parent: ParentLink::root(),
            label: "deposit".to_string(),
            args: Arc::new(args),
            payer: None,
            overrides: Arc::new(ExecuteOverrides::default()),
        }
    }

    #[tokio::test]
    async fn test_outputs_keep_declaration_order() {
        let builders = vec![
            InstructionBuilder::dynamic(|_: BuildInput<u64>| async { Ok(ix(1)) }),
            InstructionBuilder::dynamic(|_: BuildInput<u64>| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(vec![ix(2), ix(3)])
            }),
            InstructionBuilder::dynamic(|_: BuildInput<u64>| async { Ok(None::<Instruction>) }),
            InstructionBuilder::Static(ix(4)),
        ];

        let ixs = run_builders(&builders, input(0)).await.unwrap();
        let tags: Vec<u8> = ixs.iter().map(|ix| ix.data[0]).collect();
        assert_eq!(tags, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_builder_failure_aborts() {
        let builders = vec![
            InstructionBuilder::Static(ix(1)),
            InstructionBuilder::dynamic(|input: BuildInput<u64>| async move {
                Err::<Instruction, _>(input.invalid("receipt token mint is not set"))
            }),
        ];
        let err = run_builders(&builders, input(0)).await.unwrap_err();
        assert_eq!(err.category(), "invalid_context");
        assert!(err.to_string().contains("deposit"));
    }

    #[test]
    fn test_validator() {
        let validator = ArgsValidator::new(|amount: &u64| {
            if *amount == 0 {
                Err("amount must be positive".to_string())
            } else {
                Ok(())
            }
        });
        assert!(validator.validate(&5).is_ok());
        assert!(matches!(validator.validate(&0), Err(ContextError::Schema(_))));
    }

    #[test]
    fn test_missing_payer_is_invalid_context() {
        assert_eq!(input(1).payer().unwrap_err().category(), "invalid_context");
    }
}
