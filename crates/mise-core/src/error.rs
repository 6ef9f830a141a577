//! Worker error taxonomy.
//!
//! Every failure a message handler can produce maps to a [`Disposition`] the
//! runtime understands: retry the message later, or reject it permanently.
//! Storage and bus errors arrive as `anyhow::Error` and are carried in the
//! `Transient` variant; the rest are typed outcomes of the handlers
//! themselves.

use thiserror::Error;
use uuid::Uuid;

/// One plan's failure inside a materialization batch.
#[derive(Debug)]
pub struct PlanFailure {
    pub meal_plan_id: Uuid,
    pub cause: anyhow::Error,
}

/// Errors a workflow handler can return to the runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Infrastructure failure (storage contention, bus unavailable, timeout).
    /// Redelivery may succeed.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),

    /// The recipe graph is unusable: a dependency cycle or a product
    /// reference pointing outside the recipe. The plan stays unmaterialized
    /// until the recipe is fixed.
    #[error("invalid recipe {recipe_id}: {reason}")]
    InvalidRecipe { recipe_id: Uuid, reason: String },

    /// A tally ran but the plan did not change state. The plan may become
    /// finalizable later, so the message is redelivered.
    #[error("meal plan {meal_plan_id} was not finalized")]
    NotFinalized { meal_plan_id: Uuid },

    /// The message body could not be decoded. Never redelivered.
    #[error("malformed message ({payload_len} bytes): {detail}")]
    Malformed { payload_len: usize, detail: String },

    /// Some plans in a batch failed while the others went through. Each plan
    /// is idempotent, so redelivering the whole batch is safe.
    #[error("{} plan(s) failed materialization", failures.len())]
    PartialFailure { failures: Vec<PlanFailure> },
}

/// What the runtime does with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nack: the bus redelivers after the visibility timeout.
    Retry,
    /// Permanent reject: the message never comes back.
    Reject,
}

impl WorkerError {
    /// Map this error to its redelivery disposition. Only undecodable
    /// messages are rejected; everything else is worth retrying because the
    /// handlers are idempotent.
    pub fn disposition(&self) -> Disposition {
        match self {
            WorkerError::Malformed { .. } => Disposition::Reject,
            WorkerError::Transient(_)
            | WorkerError::InvalidRecipe { .. }
            | WorkerError::NotFinalized { .. }
            | WorkerError::PartialFailure { .. } => Disposition::Retry,
        }
    }
}
