//! Error types for the simulation kernel.
//!
//! Two families share one enum: kernel operation errors (bad arguments,
//! empty schedule, the stop sentinel) propagate synchronously out of the
//! calling API, while event failures ([`SimError::Failure`],
//! [`SimError::Interrupted`]) flow through the event graph — they are
//! delivered to subscribers first and only re-raised out of
//! [`step`](crate::Environment::step) when the failed event was not defused.

use crate::types::Value;

/// The outcome of a triggered event: its value on success, its failure
/// payload otherwise.
pub type Outcome = Result<Value, SimError>;

/// Everything that can go wrong inside the kernel.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum SimError {
    /// `step` was called with nothing scheduled; the simulation is
    /// exhausted.
    #[error("no scheduled events remain")]
    EmptyQueue,

    /// Delivered into a process after [`interrupt`](crate::Process::interrupt);
    /// the coroutine may catch it, otherwise it becomes the process outcome.
    #[error("interrupted: {0}")]
    Interrupted(Value),

    /// Raised by the stop sentinel installed by
    /// [`run_until`](crate::Environment::run_until) and caught there.
    #[error("simulation stopped: {0}")]
    StopSimulation(Value),

    /// A coroutine or event-graph operation left the event protocol:
    /// awaiting outside a process, suspending on a foreign future, or
    /// propagating from an untriggered event.
    #[error("invalid yield: {0}")]
    InvalidYield(String),

    /// A condition was built over events from different environments.
    #[error("events belong to different environments")]
    MixedEnvironment,

    /// `succeed`, `fail`, or `trigger` was called on an already triggered
    /// event.
    #[error("event already triggered")]
    AlreadyTriggered,

    /// A negative (or NaN) delay, or a run bound not in the future.
    #[error("negative delay: {0}")]
    NegativeDelay(f64),

    /// A zero-amount resource request or release, or a zero-capacity
    /// resource.
    #[error("invalid resource amount: {0}")]
    CapacityViolation(u64),

    /// A user-supplied failure payload travelling through the event graph.
    #[error("failure: {0}")]
    Failure(Value),
}

impl SimError {
    /// Wraps an arbitrary payload as an event failure.
    ///
    /// ```
    /// use eventide::SimError;
    ///
    /// let err = SimError::failure("disk on fire");
    /// assert!(matches!(err, SimError::Failure(_)));
    /// ```
    #[must_use]
    pub fn failure(payload: impl Into<Value>) -> Self {
        Self::Failure(payload.into())
    }

    /// Returns the payload of a `Failure`, `Interrupted`, or
    /// `StopSimulation`, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Failure(v) | Self::Interrupted(v) | Self::StopSimulation(v) => Some(v),
            _ => None,
        }
    }
}
