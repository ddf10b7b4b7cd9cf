//! Eventide: a discrete-event simulation kernel for Rust.
//!
//! # Overview
//!
//! Eventide advances a virtual clock by replaying timestamped events. User
//! *processes* are coroutines that suspend exactly where they wait on an
//! event and resume with its outcome; *condition events* compose AND/OR
//! waits over heterogeneous events; *resources* arbitrate contention for
//! finite capacity through paired FIFO get/put queues. Execution is
//! strictly single-threaded cooperative: the environment's step loop is the
//! only executor, and side effects interleave only at event boundaries.
//!
//! # Core Guarantees
//!
//! - **Monotone clock**: `now` never decreases across steps
//! - **At-most-once trigger**: an event's outcome is set exactly once
//! - **Deterministic order**: same-tick events fan urgent-first, then FIFO;
//!   callbacks fan in registration order
//! - **No hidden failures**: a failed event nobody defused re-raises out of
//!   the step loop
//! - **FIFO fairness**: the head of a resource queue is never overtaken
//!
//! # Module Structure
//!
//! - [`types`]: core types ([`SimTime`], [`Value`], ids, [`Priority`])
//! - [`error`](mod@error): the [`SimError`] taxonomy
//! - [`event`]: events, conditions, timeouts
//! - [`env`]: the environment, step loop, and run bounds
//! - [`process`]: coroutine processes and the [`Sim`] context
//! - [`resource`]: capacity-bounded resources
//! - [`observe`]: instrumentation hooks, trace capture, invariant audit
//!
//! # Quick Start
//!
//! ```
//! use eventide::{Environment, SimTime, Value};
//!
//! let env = Environment::new();
//! let machine = env.resource(1)?;
//!
//! for id in 0..2_i64 {
//!     let machine = machine.clone();
//!     env.process_named(format!("job-{id}"), move |sim| async move {
//!         let slot = machine.get(1)?;
//!         sim.wait(&slot).await?;
//!         sim.hold(5.0).await?;
//!         let done = machine.put(1)?;
//!         sim.wait(&done).await?;
//!         Ok(Value::from(id))
//!     });
//! }
//!
//! env.run()?;
//! assert_eq!(env.now(), SimTime::new(10.0));
//! # Ok::<(), eventide::SimError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)]

pub mod env;
pub mod error;
pub mod event;
pub mod observe;
pub mod process;
mod queue;
pub mod resource;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use env::{Environment, Until};
pub use error::{Outcome, SimError};
pub use event::condition::{Condition, ConditionPredicate, ConditionValue};
pub use event::timeout::Timeout;
pub use event::{CallbackId, Event, Waitable};
pub use observe::audit::{AuditViolation, ResourceAudit};
pub use observe::trace::{TraceRecord, TraceRecorder};
pub use observe::{Observer, ObserverId};
pub use process::{EventFuture, Process, Sim};
pub use resource::{GetResource, PutResource, Resource};
pub use types::{EventId, Priority, ProcessId, ResourceId, SimTime, Value};
