//! Test support for hydrochain.
//!
//! [`Harness`] builds a study on a temporary directory backed by the JSON
//! document store and wires the in-memory fakes from [`fakes`] into the
//! engine. End-to-end scenarios live in this crate's `tests/`.

pub mod fakes;
pub mod harness;

pub use fakes::{
    ChainCall, EventRecorder, FakeQueue, RecordingChaining, RecordingFlex, RecordingReservoir, RulesCall,
    ScriptedStrategy, StrategyCall,
};
pub use harness::{Harness, PersistenceProbe, CASE_LIST, RULES_FILE};
