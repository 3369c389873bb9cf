//! Bookswap Engine - Atomic booking ownership exchange
//!
//! Orchestrates two-party booking swaps as a saga against an external
//! ledger: validate, propose, accept, execute, verify, with reverse-order
//! compensation when a step fails after state was mutated.

pub mod alerts;
pub mod cache;
pub mod classify;
pub mod compensation;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod store;
pub mod validator;

pub use error::{EngineResult, SwapError};
pub use orchestrator::{SwapExecutionRequest, SwapExecutionResult, SwapOrchestrator, SwapStep};
