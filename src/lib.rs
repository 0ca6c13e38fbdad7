//! Parlor - multi-tenant card-game round engine
//!
//! Runs one live round per variant through WAITING, BETTING, DEALING and
//! COMPLETED, picks outcomes that minimise house exposure, keeps a
//! double-entry wager ledger and distributes every settled wager up an
//! ownership hierarchy.

pub mod backoff;
pub mod cards;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod games;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod money;
pub mod round;
pub mod services;
pub mod settlement;
pub mod storage;
pub mod wagers;

pub use config::{ConfigLoader, EngineConfig};
pub use engine::{EngineServices, RecoveryReport, RoundEngine};
pub use errors::{EngineError, EngineResult};
pub use events::EngineEvent;
pub use games::{BetOption, Variant};
pub use money::{Money, Rate};
pub use round::{Phase, RoundId, RoundView};
pub use wagers::{WagerReceipt, WagerRequest};
