//! User-input error taxonomy.
//!
//! Per the two-tier model: these are the only errors the core ever returns. Environmental
//! misses (unmapped reads) are silent `Option`/`bool` results, never `Err`. Invariant
//! violations panic at the point of detection instead of being represented here.

use thiserror::Error;

/// Errors raised while parsing a `/extend` rule (§4.5 grammar).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtendRuleError {
    #[error("extend rule `{0}` has no direction marker (expected `->`, `~>`, or `<-`)")]
    MissingDirection(String),
    #[error("extend rule `{0}` has an unparsable offset")]
    BadOffset(String),
    #[error("extend rule `{0}` targets state label `{1}` more than once as its base state")]
    DuplicateBaseState(String, String),
    #[error("no extend rule has base state 0 (the base state); the machine would never leave it")]
    UnreachableBaseState,
    #[error("{0} references state `{1}` which no rule ever declares as its base")]
    UnknownTargetState(String, String),
}

/// Errors raised while resolving a signature/pattern constraint (§4.4 grammar).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unknown signature name `{0}` (pass /allowMissingSignatures to ignore)")]
    UnknownSignature(String),
    #[error("unknown pattern name `{0}` (pass /allowMissingSignatures to ignore)")]
    UnknownPattern(String),
    #[error("`{0}` is not a valid hex address")]
    BadHexAddress(String),
}

/// Errors raised while validating a query's `/size`, `/minincoming`, … switches (§6, §7).
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("switch /{0} may appear at most once")]
    DuplicateSwitch(&'static str),
    #[error("switch /{0} has an unparsable argument `{1}`")]
    BadArgument(&'static str, String),
    #[error("/geometricSample base must be >= 2, got {0}")]
    BadGeometricBase(u64),
    #[error("/setOperation must be `assign` or `subtract`, got `{0}`")]
    BadSetOperation(String),
    #[error("unknown on/off value `{1}` for switch /{0}")]
    BadBoolean(&'static str, String),
    #[error("invalid extend rule: {0}")]
    Extend(#[from] ExtendRuleError),
    #[error("invalid signature/pattern constraint: {0}")]
    Signature(#[from] SignatureError),
    #[error("the allocation graph is required for this query but was not built")]
    GraphRequired,
    #[error("unknown switch /{0}")]
    UnknownSwitch(String),
    #[error("switch /{0} is missing its argument")]
    MissingArgument(&'static str),
}
