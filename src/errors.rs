//! Error types for the round engine
//!
//! One root error with a sub-enum per concern, so callers can match on the
//! family they care about and still propagate everything with `?`.

use crate::games::types::{BetOption, Variant};
use crate::ledger::NodeId;
use crate::money::Money;
use crate::round::Phase;

/// Root error type for all engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Wager validation errors, reported synchronously to the bettor
    #[error("Wager rejected: {0}")]
    Wager(#[from] WagerError),

    /// Illegal phase change requested on a round
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    /// Outcome strategy could not produce a legal deal
    #[error("Outcome error: {0}")]
    Outcome(#[from] OutcomeError),

    /// Durable store or snapshot cache failures
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Ownership tree inconsistencies found while distributing
    #[error("Hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    #[error("Variant not enabled: {0}")]
    VariantDisabled(Variant),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Configuration and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Reasons a wager is refused. None of them mutate state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WagerError {
    #[error("round {round_id} is not accepting wagers")]
    InvalidRound { round_id: String },

    #[error("option {option} is not offered by {variant}")]
    InvalidOption { option: BetOption, variant: Variant },

    #[error("stake {stake} is outside the allowed range {min}..={max}")]
    InvalidStake { stake: Money, min: Money, max: Money },

    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: Money, requested: Money },

    #[error("bettor {user} is blocked from wagering")]
    BlockedBettor { user: String },

    #[error("unknown bettor {user}")]
    UnknownBettor { user: String },
}

impl WagerError {
    /// Stable code surfaced to clients
    pub fn reason_code(&self) -> &'static str {
        match self {
            WagerError::InvalidRound { .. } => "INVALID_ROUND",
            WagerError::InvalidOption { .. } => "INVALID_OPTION",
            WagerError::InvalidStake { .. } => "INVALID_STAKE",
            WagerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            WagerError::BlockedBettor { .. } => "BLOCKED_BETTOR",
            WagerError::UnknownBettor { .. } => "UNKNOWN_BETTOR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("round {round_id} has no outcome to deal")]
    MissingOutcome { round_id: String },

    #[error("no live round on {variant}")]
    NoLiveRound { variant: Variant },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutcomeError {
    #[error("no legal deal for {variant} after trying {attempted} outcomes")]
    Exhausted { variant: Variant, attempted: usize },

    #[error("no outcome strategy registered for {0}")]
    UnsupportedVariant(Variant),
}

/// Storage system errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyError {
    #[error("ownership node {0} does not exist")]
    MissingNode(NodeId),

    #[error("ownership chain above {0} is cyclic or too deep")]
    Cycle(NodeId),

    #[error("bettor {0} has no sponsoring parent")]
    Orphan(NodeId),
}

impl EngineError {
    /// Reason code when this is a wager rejection
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            EngineError::Wager(e) => Some(e.reason_code()),
            _ => None,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(StorageError::Unavailable(_))
                | EngineError::Storage(StorageError::WriteFailed(_))
                | EngineError::Storage(StorageError::ReadFailed(_))
        )
    }
}

// External error conversions
impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(StorageError::CorruptedData(e.to_string()))
    }
}

// Convenience type alias for Results
pub type EngineResult<T> = Result<T, EngineError>;
