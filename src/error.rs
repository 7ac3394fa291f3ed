//! Error types for the context graph and transaction templates
//!
//! Every public resolution or execution method returns [`Result`]. The
//! taxonomy separates failures that happen before anything reaches the
//! ledger (unresolved prerequisites, schema violations, decode failures)
//! from failures the ledger itself reports (submission errors), so callers
//! can tell a missing account apart from a malformed one and a rejected
//! transaction apart from a transaction that was never sent.

use solana_sdk::{pubkey::Pubkey, signature::Signature};
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ContextError>;

/// Failure to turn raw account or event bytes into a typed record
///
/// Raised only when bytes exist. An account that does not exist is reported
/// as `Ok(None)` by the resolvers and never reaches a decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Leading discriminator does not belong to the expected record type
    #[error("discriminator mismatch (expected {expected:02x?}, found {found:02x?})")]
    Discriminator { expected: Vec<u8>, found: Vec<u8> },

    /// Fewer bytes than the record layout needs
    #[error("payload too short ({len} bytes, need at least {min})")]
    TooShort { len: usize, min: usize },

    /// Bytes have the right tag but do not deserialize
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Diagnostic payload attached to a rejected simulation or submission
///
/// Carries the ledger's own error string and program logs verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionDiagnostic {
    /// Signature of the rejected transaction, if it got far enough to have one
    pub signature: Option<Signature>,
    /// Ledger-reported error, unmodified
    pub error: String,
    /// Program logs captured by the ledger
    pub logs: Vec<String>,
    /// Whether the failure came from simulation rather than execution
    pub simulated: bool,
}

impl std::fmt::Display for SubmissionDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = if self.simulated { "simulation" } else { "execution" };
        match &self.signature {
            Some(sig) => write!(f, "{} failed ({}): {}", stage, sig, self.error),
            None => write!(f, "{} failed: {}", stage, self.error),
        }
    }
}

/// Comprehensive error type for graph resolution and template execution
///
/// The type is `Clone` because a single failed remote call is delivered to
/// every caller that coalesced onto it.
#[derive(Error, Debug, Clone)]
pub enum ContextError {
    /// A prerequisite address or snapshot resolved to nothing
    ///
    /// Raised by instruction builders and projections before any submission.
    #[error("Invalid context ({node}): {reason}")]
    InvalidContext { node: String, reason: String },

    /// Raw bytes exist but do not match the expected shape
    #[error("Decode error ({address}): {error}")]
    Decode { address: Pubkey, error: DecodeError },

    /// A registered event tag was found but its payload does not decode
    ///
    /// `landed` is set when the logs came from a confirmed submission.
    #[error("Event decode error ({event}): {error}")]
    EventDecode {
        event: String,
        error: DecodeError,
        landed: Option<Landed>,
    },

    /// Caller-supplied arguments were rejected by the template schema
    #[error("Schema validation failed: {0}")]
    Schema(String),

    /// The ledger rejected simulation or execution
    #[error("Submission error: {0}")]
    Submission(SubmissionDiagnostic),

    /// Chained execution requested on a template that cannot chain
    #[error("Chain misconfiguration ({template}): {reason}")]
    ChainMisconfiguration { template: String, reason: String },

    /// The chain decider kept requesting work past the iteration cap
    #[error("Chain exceeded {max_iterations} iterations ({template})")]
    ChainLimitExceeded {
        template: String,
        max_iterations: usize,
        last_signature: Signature,
    },

    /// Instructions could not be compiled into a message
    #[error("Instruction build error ({template}): {reason}")]
    InstructionBuild { template: String, reason: String },

    /// Signing the compiled message failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Remote read/write primitive failure
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Missing or invalid configuration (fee payer, writer, limits)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A node outlived the parent it needs for resolution
    #[error("Parent of {0} is no longer alive")]
    Detached(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContextError {
    /// Check if retrying the same call might succeed
    ///
    /// Nothing in this crate retries on its own; this is advisory for callers
    /// that wrap resolution in their own retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc(_) => true,

            Self::InvalidContext { .. } => false,
            Self::Decode { .. } => false,
            Self::EventDecode { .. } => false,
            Self::Schema(_) => false,
            Self::Submission(_) => false,
            Self::ChainMisconfiguration { .. } => false,
            Self::ChainLimitExceeded { .. } => false,
            Self::InstructionBuild { .. } => false,
            Self::Signing(_) => false,
            Self::Configuration(_) => false,
            Self::Detached(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Get the error category for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidContext { .. } => "invalid_context",
            Self::Decode { .. } => "decode",
            Self::EventDecode { .. } => "event_decode",
            Self::Schema(_) => "schema",
            Self::Submission(_) => "submission",
            Self::ChainMisconfiguration { .. } => "chain_config",
            Self::ChainLimitExceeded { .. } => "chain_limit",
            Self::InstructionBuild { .. } => "instruction",
            Self::Signing(_) => "signing",
            Self::Rpc(_) => "rpc",
            Self::Configuration(_) => "config",
            Self::Detached(_) => "detached",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the error was raised before anything was sent to the ledger
    pub fn is_pre_submission(&self) -> bool {
        !matches!(
            self,
            Self::Submission(_) | Self::Rpc(_) | Self::EventDecode { .. } | Self::ChainLimitExceeded { .. }
        )
    }

    /// Signature and slot of a transaction that landed before the error
    pub fn landed(&self) -> Option<Landed> {
        match self {
            Self::EventDecode { landed, .. } => *landed,
            _ => None,
        }
    }

    /// Attach the landing of a confirmed submission to an event decode error
    pub fn with_landing(self, signature: Signature, slot: u64) -> Self {
        match self {
            Self::EventDecode { event, error, .. } => Self::EventDecode {
                event,
                error,
                landed: Some(Landed { signature, slot }),
            },
            other => other,
        }
    }

    /// Ledger diagnostic payload, for submission errors
    pub fn diagnostic(&self) -> Option<&SubmissionDiagnostic> {
        match self {
            Self::Submission(diag) => Some(diag),
            _ => None,
        }
    }
}

/// Where a confirmed transaction landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landed {
    pub signature: Signature,
    pub slot: u64,
}

// Convenience constructors for common error scenarios
impl ContextError {
    /// Create an unresolved-prerequisite error
    pub fn invalid_context(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContext {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Create a decode error for an address
    pub fn decode(address: Pubkey, error: DecodeError) -> Self {
        Self::Decode { address, error }
    }

    /// Create a schema validation error
    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema(reason.into())
    }

    /// Create an RPC error
    pub fn rpc(reason: impl Into<String>) -> Self {
        Self::Rpc(reason.into())
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}

impl From<anyhow::Error> for ContextError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ContextError::invalid_context("fund.deposit", "receipt token mint is not set");
        assert_eq!(
            err.to_string(),
            "Invalid context (fund.deposit): receipt token mint is not set"
        );

        let err = ContextError::decode(
            Pubkey::default(),
            DecodeError::TooShort { len: 3, min: 8 },
        );
        assert!(err.to_string().contains("payload too short (3 bytes, need at least 8)"));
    }

    #[test]
    fn test_submission_display_carries_ledger_error() {
        let err = ContextError::Submission(SubmissionDiagnostic {
            signature: None,
            error: "custom program error: 0x1771".to_string(),
            logs: vec!["Program log: AnchorError".to_string()],
            simulated: true,
        });
        assert_eq!(
            err.to_string(),
            "Submission error: simulation failed: custom program error: 0x1771"
        );
        assert_eq!(err.diagnostic().map(|d| d.logs.len()), Some(1));
    }

    #[test]
    fn test_error_retryability() {
        assert!(ContextError::rpc("timeout").is_retryable());
        assert!(!ContextError::schema("amount must be positive").is_retryable());
        assert!(!ContextError::invalid_context("n", "r").is_retryable());
        assert!(!ContextError::internal("x").is_retryable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ContextError::schema("x").category(), "schema");
        assert_eq!(ContextError::rpc("x").category(), "rpc");
        assert_eq!(
            ContextError::Detached("vault".to_string()).category(),
            "detached"
        );
    }

    #[test]
    fn test_pre_submission_classification() {
        assert!(ContextError::invalid_context("n", "r").is_pre_submission());
        assert!(ContextError::schema("bad").is_pre_submission());
        assert!(!ContextError::rpc("down").is_pre_submission());
    }
}
