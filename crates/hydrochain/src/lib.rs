//! # Hydrochain
//!
//! Deterministic orchestration of chained hydrothermal planning cases.
//!
//! A **Study** is an ordered chain of **Cases** (long-horizon and
//! short-horizon model executions). Each Case is submitted to a batch
//! scheduler as one or more **Runs**. Outputs of finished cases are chained
//! into the inputs of later ones, infeasible cases are flexibilized and
//! resubmitted, and the whole chain survives a crash of the orchestrator.
//!
//! ## Architecture
//!
//! ```text
//! Engine (one monitor tick per poll interval)
//!     │
//!     ▼
//! StudyMachine ◄── Inbox<CaseEvent> ──┐
//!     │ monitor()                      │ emit
//!     ▼                                │
//! CaseMachine ◄── Inbox<RunEvent> ──┐  │
//!     │ CasePolicy.decide()          │  │
//!     ▼                              │  │
//! RunController ── QueueAdapter ─────┘  │
//!     │                                 │
//!     └─► Store (UnitOfWork per aggregate family)
//! ```
//!
//! ## Key invariants
//!
//! 1. **Persist, then emit.** Every event is announced after the aggregate
//!    that produced it has been committed with its post-state.
//! 2. **Machines decide, effects execute.** [`CasePolicy`] and
//!    [`StudyPolicy`] are pure; the machines around them do the IO.
//! 3. **One active Run per Case.**
//! 4. **`Done` and `Error` are absorbing** for both Cases and Runs.
//! 5. **One external call at a time.** A tick awaits each call before the
//!    next is issued.
//!
//! Storage, scheduler and HTTP implementations live in sibling crates; this
//! crate only names their contracts.

pub mod bus;
pub mod case;
pub mod collaborators;
pub mod config;
pub mod deps;
pub mod engine;
pub mod error;
pub mod events;
pub mod machine;
pub mod model;
pub mod process;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod rules;
pub mod run;
pub mod store;
pub mod strategy;
pub mod study;
pub mod tap;

pub use bus::{EventBus, Inbox, Listener};
pub use case::{CaseCommand, CaseInput, CaseMachine, CasePolicy};
pub use collaborators::{CaseRef, ChainedValue, ChainingService, FlexService, ReservoirRuleService};
pub use config::{HookCommands, PerProgram, QueueBackendKind, Settings, StateBackend, SyncFormat};
pub use deps::Deps;
pub use engine::{Engine, EngineBuilder, Exit};
pub use error::{
    Categorizable, ErrorCategory, OrchestratorError, QueueError, Result, ServiceError, StoreError,
};
pub use events::{CaseEvent, Envelope, RunEvent, StudyEvent};
pub use machine::Machine;
pub use model::{
    Case, CaseId, CaseState, Program, Run, RunId, RunState, Study, StudyId, StudyState,
};
pub use process::{CommandOutput, CommandRunner, Invocation, ProcessRunner};
pub use queue::QueueAdapter;
pub use recovery::{rehydrate, RehydrationReport};
pub use retry::RetryPolicy;
pub use run::{run_transition, RunController};
pub use store::{Aggregate, Store, StoreExt, UnitOfWork};
pub use strategy::{ConvergenceCriteria, Outcome, ProgramStrategy, StrategyFactory};
pub use study::{StudyCommand, StudyMachine, StudyPolicy};
pub use tap::TracingTap;

// Re-export commonly used external types
pub use async_trait::async_trait;
