//! Delay events.
//!
//! A [`Timeout`] is an event born successful and scheduled `delay` time
//! units in the future with normal priority. Waiting on it is how a process
//! holds for a span of virtual time; composing it with `or` is how a user
//! models a deadline on another event.

use core::fmt;

use crate::env::Environment;
use crate::error::SimError;
use crate::event::{Event, Waitable};
use crate::types::{Priority, Value};

/// An event that triggers `delay` time units after its construction.
///
/// # Example
///
/// ```
/// use eventide::{Environment, SimTime};
///
/// let env = Environment::new();
/// let _t = env.timeout(5.0)?;
/// env.run()?;
/// assert_eq!(env.now(), SimTime::new(5.0));
/// # Ok::<(), eventide::SimError>(())
/// ```
#[derive(Clone)]
pub struct Timeout {
    event: Event,
    delay: f64,
}

impl Timeout {
    /// Creates a timeout delivering `()` after `delay`.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if `delay` is negative or NaN.
    pub fn new(env: &Environment, delay: f64) -> Result<Self, SimError> {
        Self::with_value(env, delay, Value::unit())
    }

    /// Creates a timeout delivering `value` after `delay`.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if `delay` is negative or NaN.
    pub fn with_value(
        env: &Environment,
        delay: f64,
        value: impl Into<Value>,
    ) -> Result<Self, SimError> {
        if !(delay >= 0.0) {
            return Err(SimError::NegativeDelay(delay));
        }
        let event = env.event();
        event.set_outcome(Ok(value.into()))?;
        event.schedule_self(Priority::Normal, delay)?;
        Ok(Self { event, delay })
    }

    /// The delay this timeout was created with.
    #[must_use]
    pub fn delay(&self) -> f64 {
        self.delay
    }
}

impl Waitable for Timeout {
    fn as_event(&self) -> &Event {
        &self.event
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("event", &self.event)
            .field("delay", &self.delay)
            .finish()
    }
}
