//! Transaction template context
//!
//! A template is a node holding a parameterized recipe: an argument
//! validator, an ordered list of instruction builders, optional lookup
//! tables, event decoders and a chain decider. Its lifecycle per call is
//! assemble (validate, resolve, build) -> compile and sign -> submit ->
//! decode events -> invalidate dependent cache entries.
//!
//! Nothing is submitted unless assembly succeeded as a whole, and a failed
//! submission is never retried here.

pub mod builder;
pub mod bundle;
pub mod chain;
pub mod events;

pub use builder::{run_builders, ArgsValidator, BuildInput, BuiltInstructions, InstructionBuilder};
pub use bundle::{compile, decode_lookup_table, fetch_lookup_tables, required_signers, InstructionBundle};
pub use chain::{ChainDecider, ChainInput, ChainState};
pub use events::{encode_event_line, DecodedEvent, EventBuckets, EventDecoders, EventTag};

use crate::context::{read_keys, Context, NodeCore, NodeSpec, SharedSigner};
use crate::error::{ContextError, Result, SubmissionDiagnostic};
use crate::ledger::SendOptions;
use crate::metrics::Timer;
use crate::observability::TraceContext;
use serde::de::DeserializeOwned;
#[allow(deprecated)]
use solana_sdk::address_lookup_table::AddressLookupTableAccount;
use solana_sdk::{
    instruction::Instruction, pubkey::Pubkey, signature::Signature, signer::Signer,
    transaction::VersionedTransaction,
};
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

/// Which cached state a successful execution drops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidationScope {
    None,
    /// The template's parent and everything below it
    #[default]
    ParentTree,
    /// The whole graph the template belongs to
    Root,
}

/// Recipe of a template
pub struct TemplateConfig<A> {
    validator: Option<ArgsValidator<A>>,
    builders: Vec<InstructionBuilder<A>>,
    lookup_tables: Vec<Pubkey>,
    events: EventDecoders,
    chain: Option<ChainDecider<A>>,
    fee_payer: Option<SharedSigner>,
    signers: Vec<SharedSigner>,
    invalidate: InvalidationScope,
}

impl<A> Default for TemplateConfig<A> {
    fn default() -> Self {
        Self {
            validator: None,
            builders: Vec::new(),
            lookup_tables: Vec::new(),
            events: EventDecoders::new(),
            chain: None,
            fee_payer: None,
            signers: Vec::new(),
            invalidate: InvalidationScope::default(),
        }
    }
}

impl<A: Send + Sync + 'static> TemplateConfig<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&A) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(ArgsValidator::new(validate));
        self
    }

    /// Append an instruction that does not depend on arguments
    pub fn instruction(mut self, ix: Instruction) -> Self {
        self.builders.push(InstructionBuilder::Static(ix));
        self
    }

    /// Append a dynamic builder
    pub fn builder<F, Fut, O>(mut self, build: F) -> Self
    where
        F: Fn(BuildInput<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<BuiltInstructions>,
    {
        self.builders.push(InstructionBuilder::dynamic(build));
        self
    }

    pub fn lookup_table(mut self, key: Pubkey) -> Self {
        self.lookup_tables.push(key);
        self
    }

    pub fn events(mut self, events: EventDecoders) -> Self {
        self.events = events;
        self
    }

    pub fn chain<F, Fut>(mut self, decide: F) -> Self
    where
        F: Fn(ChainInput<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<A>>> + Send + 'static,
    {
        self.chain = Some(ChainDecider::new(decide));
        self
    }

    /// Template-level default fee payer
    pub fn fee_payer(mut self, signer: SharedSigner) -> Self {
        self.fee_payer = Some(signer);
        self
    }

    /// Additional signer offered to every compiled message
    pub fn signer(mut self, signer: SharedSigner) -> Self {
        self.signers.push(signer);
        self
    }

    pub fn invalidate(mut self, scope: InvalidationScope) -> Self {
        self.invalidate = scope;
        self
    }
}

/// Per-call overrides
#[derive(Clone, Default)]
pub struct ExecuteOverrides {
    /// Takes precedence over template and node fee payers
    pub fee_payer: Option<SharedSigner>,
    pub extra_signers: Vec<SharedSigner>,
    /// Defaults to the environment's execution configuration
    pub send_options: Option<SendOptions>,
}

impl std::fmt::Debug for ExecuteOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOverrides")
            .field("fee_payer", &self.fee_payer.as_ref().map(|signer| signer.pubkey()))
            .field("extra_signers", &self.extra_signers.len())
            .field("send_options", &self.send_options)
            .finish()
    }
}

impl ExecuteOverrides {
    pub fn fee_payer(signer: SharedSigner) -> Self {
        Self {
            fee_payer: Some(signer),
            ..Self::default()
        }
    }

    pub fn with_signer(mut self, signer: SharedSigner) -> Self {
        self.extra_signers.push(signer);
        self
    }

    pub fn with_send_options(mut self, options: SendOptions) -> Self {
        self.send_options = Some(options);
        self
    }
}

/// Confirmed outcome of one execution
#[derive(Debug)]
pub struct ExecutionResult<A> {
    pub args: Arc<A>,
    pub events: EventBuckets,
    pub succeeded: bool,
    pub signature: Signature,
    pub slot: u64,
    pub logs: Vec<String>,
}

impl<A> Clone for ExecutionResult<A> {
    fn clone(&self) -> Self {
        Self {
            args: self.args.clone(),
            events: self.events.clone(),
            succeeded: self.succeeded,
            signature: self.signature,
            slot: self.slot,
            logs: self.logs.clone(),
        }
    }
}

/// Outcome of a simulation that the ledger accepted
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub logs: Vec<String>,
    pub units_consumed: Option<u64>,
    pub events: EventBuckets,
}

/// Node holding a transaction template
pub struct TemplateContext<A> {
    core: NodeCore,
    config: TemplateConfig<A>,
}

impl<A> std::fmt::Debug for TemplateContext<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateContext")
            .field("core", &self.core)
            .field("builders", &self.config.builders.len())
            .field("chained", &self.config.chain.is_some())
            .finish_non_exhaustive()
    }
}

impl<A: Send + Sync + 'static> TemplateContext<A> {
    pub fn new(spec: NodeSpec, config: TemplateConfig<A>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this: Weak<dyn Context> = this.clone();
            Self {
                core: spec.into_core(this),
                config,
            }
        })
    }

    pub fn is_chained(&self) -> bool {
        self.config.chain.is_some()
    }

    /// Deserialize and validate raw arguments
    pub fn parse_args(&self, value: serde_json::Value) -> Result<A>
    where
        A: DeserializeOwned,
    {
        let args: A = serde_json::from_value(value).map_err(|e| ContextError::schema(e.to_string()))?;
        self.validate_args(&args)?;
        Ok(args)
    }

    fn validate_args(&self, args: &A) -> Result<()> {
        match &self.config.validator {
            Some(validator) => validator.validate(args),
            None => Ok(()),
        }
    }

    /// Fee payer: call override, then template default, then nearest node default
    pub fn effective_fee_payer(&self, overrides: &ExecuteOverrides) -> Result<SharedSigner> {
        overrides
            .fee_payer
            .clone()
            .or_else(|| self.config.fee_payer.clone())
            .or_else(|| self.core.inherited_fee_payer())
            .ok_or_else(|| {
                ContextError::Configuration(format!("no fee payer for template {}", self.core.path()))
            })
    }

    /// Lookup tables declared by the template, through the cache
    pub async fn resolve_lookup_tables(&self, no_cache: bool) -> Result<Vec<AddressLookupTableAccount>> {
        if self.config.lookup_tables.is_empty() {
            return Ok(Vec::new());
        }
        let env = self.core.env();
        let reader = env.reader().clone();
        let keys = self.config.lookup_tables.clone();
        let label = self.core.path();
        let (key, alternatives) = read_keys(self.core.id(), "lookup_tables", no_cache);
        env.cache()
            .deduplicated(key, &alternatives, env.policy().interval(no_cache), move || async move {
                fetch_lookup_tables(reader.as_ref(), &label, &keys, no_cache).await
            })
            .await
    }

    /// Validate, resolve lookup tables and run every builder
    ///
    /// Performs reads only. Invalid arguments fail before any remote call.
    pub async fn assemble(&self, args: A) -> Result<InstructionBundle> {
        self.assemble_with(Arc::new(args), &ExecuteOverrides::default()).await
    }

    #[instrument(skip_all, fields(template = %self.core.path()))]
    pub async fn assemble_with(&self, args: Arc<A>, overrides: &ExecuteOverrides) -> Result<InstructionBundle> {
        let env = self.core.env().clone();
        let timer = Timer::start();
        let result = self.assemble_inner(args, overrides).await;
        if let Some(metrics) = env.metrics() {
            timer.observe_duration(&metrics.assemble_latency);
        }
        result.inspect_err(|e| env.record_error(e))
    }

    async fn assemble_inner(&self, args: Arc<A>, overrides: &ExecuteOverrides) -> Result<InstructionBundle> {
        self.validate_args(&args)?;

        let input = BuildInput {
            node: self.core.link(),
            parent: self.core.parent().clone(),
            label: self.core.path(),
            args,
            payer: self.effective_fee_payer(overrides).ok().map(|signer| signer.pubkey()),
            overrides: Arc::new(overrides.clone()),
        };
        let (lookup_tables, instructions) = futures::try_join!(
            self.resolve_lookup_tables(false),
            run_builders(&self.config.builders, input)
        )?;
        debug!(instructions = instructions.len(), lookup_tables = lookup_tables.len(), "assembled");
        Ok(InstructionBundle {
            instructions,
            lookup_tables,
        })
    }

    /// Compile and sign `bundle` against a fresh blockhash
    pub async fn compile(&self, bundle: &InstructionBundle, overrides: &ExecuteOverrides) -> Result<VersionedTransaction> {
        let payer = self.effective_fee_payer(overrides)?;
        let writer = self.core.env().writer()?;
        let blockhash = writer.latest_blockhash().await?;
        let signers: Vec<SharedSigner> = overrides
            .extra_signers
            .iter()
            .chain(&self.config.signers)
            .cloned()
            .collect();
        compile(&self.core.path(), bundle, &payer, &signers, blockhash)
    }

    /// Assemble, sign and simulate without landing anything
    pub async fn simulate(&self, args: A, overrides: &ExecuteOverrides) -> Result<SimulationResult> {
        let env = self.core.env().clone();
        self.simulate_inner(Arc::new(args), overrides)
            .await
            .inspect_err(|e| env.record_error(e))
    }

    async fn simulate_inner(&self, args: Arc<A>, overrides: &ExecuteOverrides) -> Result<SimulationResult> {
        let env = self.core.env();
        let writer = env.writer()?.clone();
        let bundle = self.assemble_with(args, overrides).await?;
        let tx = self.compile(&bundle, overrides).await?;
        let outcome = writer.simulate(&tx).await?;
        if let Some(metrics) = env.metrics() {
            metrics.simulations.inc();
        }
        if let Some(error) = outcome.error {
            return Err(ContextError::Submission(SubmissionDiagnostic {
                signature: tx.signatures.first().copied(),
                error,
                logs: outcome.logs,
                simulated: true,
            }));
        }
        let events = self.config.events.decode_logs(&outcome.logs)?;
        Ok(SimulationResult {
            logs: outcome.logs,
            units_consumed: outcome.units_consumed,
            events,
        })
    }

    /// Assemble, sign, submit and await confirmation once
    pub async fn execute(&self, args: A, overrides: &ExecuteOverrides) -> Result<ExecutionResult<A>> {
        let trace = TraceContext::new("execute");
        self.execute_step(Arc::new(args), overrides, &trace, 0).await
    }

    #[instrument(
        skip_all,
        fields(
            template = %self.core.path(),
            correlation_id = %trace.correlation_id.as_str(),
            span_id = %trace.span_id,
            step = step
        )
    )]
    async fn execute_step(
        &self,
        args: Arc<A>,
        overrides: &ExecuteOverrides,
        trace: &TraceContext,
        step: usize,
    ) -> Result<ExecutionResult<A>> {
        let env = self.core.env().clone();
        let timer = Timer::start();
        let result = self.submit_once(args, overrides).await;
        if let Some(metrics) = env.metrics() {
            timer.observe_duration(&metrics.execute_latency);
        }
        result.inspect_err(|e| env.record_error(e))
    }

    async fn submit_once(&self, args: Arc<A>, overrides: &ExecuteOverrides) -> Result<ExecutionResult<A>> {
        let env = self.core.env();
        let writer = env.writer()?.clone();
        let options = overrides.send_options.clone().unwrap_or_else(|| env.send_options());

        let bundle = self.assemble_with(args.clone(), overrides).await?;
        let tx = self.compile(&bundle, overrides).await?;

        if options.simulate_first {
            let simulation = writer.simulate(&tx).await?;
            if let Some(metrics) = env.metrics() {
                metrics.simulations.inc();
            }
            if let Some(error) = simulation.error {
                warn!(%error, "simulation rejected, not submitting");
                return Err(ContextError::Submission(SubmissionDiagnostic {
                    signature: tx.signatures.first().copied(),
                    error,
                    logs: simulation.logs,
                    simulated: true,
                }));
            }
        }

        let outcome = writer.submit(&tx, &options).await?;
        if !outcome.succeeded {
            if let Some(metrics) = env.metrics() {
                metrics.submissions_failed.inc();
            }
            let error = outcome.error.unwrap_or_else(|| "transaction failed".to_string());
            warn!(signature = %outcome.signature, slot = outcome.slot, %error, "submission failed");
            return Err(ContextError::Submission(SubmissionDiagnostic {
                signature: Some(outcome.signature),
                error,
                logs: outcome.logs,
                simulated: false,
            }));
        }
        if let Some(metrics) = env.metrics() {
            metrics.submissions_success.inc();
        }
        info!(signature = %outcome.signature, slot = outcome.slot, "submission confirmed");

        self.invalidate_after_success();
        let events = self.config.events.decode_logs(&outcome.logs).map_err(|e| {
            warn!(signature = %outcome.signature, slot = outcome.slot, error = %e, "landed, but events do not decode");
            e.with_landing(outcome.signature, outcome.slot)
        })?;
        Ok(ExecutionResult {
            args,
            events,
            succeeded: true,
            signature: outcome.signature,
            slot: outcome.slot,
            logs: outcome.logs,
        })
    }

    fn invalidate_after_success(&self) {
        let target: Option<Arc<dyn Context>> = match self.config.invalidate {
            InvalidationScope::None => None,
            InvalidationScope::ParentTree => self.core.parent().get().or_else(|| self.core.link().get()),
            InvalidationScope::Root => {
                let mut node = self.core.link().get();
                while let Some(parent) = node.as_ref().and_then(|n| n.core().parent().get()) {
                    node = Some(parent);
                }
                node
            }
        };
        if let Some(target) = target {
            debug!(scope = ?self.config.invalidate, root = %target.core().label(), "invalidating after execution");
            target.invalidate_tree();
        }
    }

    /// Execute repeatedly while the chain decider asks for more
    ///
    /// Steps are strictly sequential. The last successful result is returned
    /// once the decider answers `None`.
    #[instrument(skip_all, fields(template = %self.core.path()))]
    pub async fn execute_chained(&self, args: A, overrides: &ExecuteOverrides) -> Result<ExecutionResult<A>> {
        let template = self.core.path();
        let decider = self.config.chain.clone().ok_or_else(|| ContextError::ChainMisconfiguration {
            template: template.clone(),
            reason: "template has no chain decider".to_string(),
        })?;
        let max_iterations = self.core.env().execution().max_chain_iterations;
        if max_iterations == 0 {
            return Err(ContextError::ChainMisconfiguration {
                template,
                reason: "max_chain_iterations is zero".to_string(),
            });
        }

        let trace = TraceContext::new("execute_chained");
        let mut state = ChainState::start(Arc::new(args));
        loop {
            match state {
                ChainState::Ready { ref args, step } => {
                    let step_trace = trace.child_span("chain_step");
                    let result = self.execute_step(args.clone(), overrides, &step_trace, step).await?;
                    if let Some(metrics) = self.core.env().metrics() {
                        metrics.chain_steps.inc();
                    }
                    info!(step, signature = %result.signature, "chain step confirmed");
                    state = state.submitted(result)?;
                }
                ChainState::Submitted { ref result, step } => {
                    let input = ChainInput {
                        node: self.core.link(),
                        parent: self.core.parent().clone(),
                        result: result.clone(),
                        step,
                    };
                    let decision = decider.decide(input).await.map_err(|e| {
                        let err = ContextError::ChainMisconfiguration {
                            template: template.clone(),
                            reason: format!("chain decider failed: {}", e),
                        };
                        self.core.env().record_error(&err);
                        err
                    })?;
                    state = state.advance(decision, max_iterations, &template)?;
                }
                ChainState::Done(result) => {
                    debug!(signature = %result.signature, "chain finished");
                    return Ok(result);
                }
            }
        }
    }
}

impl<A: Send + Sync + 'static> Context for TemplateContext<A> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn properties(&self) -> Vec<(String, String)> {
        let mut properties = vec![("builders".to_string(), self.config.builders.len().to_string())];
        if !self.config.lookup_tables.is_empty() {
            properties.push((
                "lookup_tables".to_string(),
                self.config.lookup_tables.len().to_string(),
            ));
        }
        if self.is_chained() {
            properties.push(("chained".to_string(), "true".to_string()));
        }
        properties
    }
}
