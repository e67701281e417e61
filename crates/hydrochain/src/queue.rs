//! Queue Adapter contract.
//!
//! The adapter turns a batch scheduler into a stream of classified job
//! states drawn from the closed [`RunState`] set. Backend-specific tokens
//! never leave the adapter implementation.

use crate::error::QueueError;
use crate::model::{Run, RunState};
use async_trait::async_trait;

#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Submits `run` and fills in its scheduler job id and canonical name.
    async fn submit(&self, run: &mut Run) -> Result<(), QueueError>;

    /// Classifies the current scheduler state of `run`.
    ///
    /// `run.state` is the last persisted state; it decides whether a missing
    /// scheduler row means `Finished` or `NotStarted`.
    async fn poll(&self, run: &Run) -> Result<RunState, QueueError>;

    async fn delete(&self, run: &Run) -> Result<(), QueueError>;
}
