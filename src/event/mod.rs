//! Events: the unit of scheduling and observation.
//!
//! An [`Event`] is a cheap cloneable handle. It starts *pending*, is
//! *triggered* exactly once with a success or failure outcome, and becomes
//! *processed* when the environment pops it and fans its callbacks. The
//! callback list is released at that point; late subscribers are rejected.
//!
//! Callbacks are registered with a token ([`CallbackId`]) so a registrant
//! can remove its own callback again — conditions unhook their child checks
//! once satisfied, and interrupted processes unhook their pending resume.
//!
//! Reference shape: the environment owns scheduled events through the heap
//! (strong handles); events hold a weak back-reference to the environment.
//! Callbacks own whatever they capture.

pub mod condition;
pub mod timeout;

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::env::{EnvCore, Environment};
use crate::error::{Outcome, SimError};
use crate::types::{EventId, Priority, Value};

use condition::Condition;

/// A handler invoked exactly once when its event is processed.
pub(crate) type Callback = Box<dyn FnOnce(&Event) -> Result<(), SimError>>;

/// Token returned by [`Event::add_callback`], usable for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub(crate) struct EventInner {
    pub(crate) env: Weak<EnvCore>,
    id: EventId,
    outcome: RefCell<Option<Outcome>>,
    /// `None` once the event has been processed and the list released.
    callbacks: RefCell<Option<Vec<(CallbackId, Callback)>>>,
    next_callback: Cell<u64>,
    pub(crate) scheduled: Cell<bool>,
    defused: Cell<bool>,
}

/// The unit of scheduling: a one-shot occurrence with subscribers.
///
/// # Example
///
/// ```
/// use eventide::{Environment, Value};
///
/// let env = Environment::new();
/// let event = env.event();
/// assert!(!event.triggered());
/// event.succeed(Value::from("payload"))?;
/// assert_eq!(event.ok(), Some(true));
/// env.run()?;
/// assert!(event.processed());
/// # Ok::<(), eventide::SimError>(())
/// ```
#[derive(Clone)]
pub struct Event {
    pub(crate) inner: Rc<EventInner>,
}

impl Event {
    pub(crate) fn new(core: &Rc<EnvCore>, id: EventId) -> Self {
        Self {
            inner: Rc::new(EventInner {
                env: Rc::downgrade(core),
                id,
                outcome: RefCell::new(None),
                callbacks: RefCell::new(Some(Vec::new())),
                next_callback: Cell::new(0),
                scheduled: Cell::new(false),
                defused: Cell::new(false),
            }),
        }
    }

    /// The event's identifier, unique within its environment.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.inner.id
    }

    /// The environment this event belongs to.
    ///
    /// # Panics
    ///
    /// Panics if the environment has been dropped; environments must
    /// outlive their events.
    #[must_use]
    pub fn env(&self) -> Environment {
        Environment {
            core: self.core(),
        }
    }

    pub(crate) fn core(&self) -> Rc<EnvCore> {
        self.inner.env.upgrade().expect("environment dropped before its events")
    }

    /// Returns true once the event has an outcome.
    #[must_use]
    pub fn triggered(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Returns true once the callbacks have been fanned and released.
    #[must_use]
    pub fn processed(&self) -> bool {
        self.inner.callbacks.borrow().is_none()
    }

    /// `Some(true)` for a success outcome, `Some(false)` for a failure,
    /// `None` while pending.
    #[must_use]
    pub fn ok(&self) -> Option<bool> {
        self.inner.outcome.borrow().as_ref().map(Result::is_ok)
    }

    /// The full outcome, or `None` while pending.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.outcome.borrow().clone()
    }

    /// The success value, or `None` while pending or failed.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        match &*self.inner.outcome.borrow() {
            Some(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Returns true if a failure outcome will not be re-raised by `step`.
    #[must_use]
    pub fn defused(&self) -> bool {
        self.inner.defused.get()
    }

    /// Marks a failure outcome as handled so `step` will not re-raise it.
    pub fn defuse(&self) {
        self.inner.defused.set(true);
    }

    /// Sets or clears the defuse flag.
    pub fn set_defused(&self, defused: bool) {
        self.inner.defused.set(defused);
    }

    /// Returns true if both handles refer to the same event.
    #[must_use]
    pub fn handle_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakEvent {
        WeakEvent(Rc::downgrade(&self.inner))
    }

    /// Triggers the event as a success and schedules it for processing at
    /// the current instant with normal priority.
    ///
    /// # Errors
    ///
    /// [`SimError::AlreadyTriggered`] if the event has an outcome.
    pub fn succeed(&self, value: impl Into<Value>) -> Result<(), SimError> {
        self.set_outcome(Ok(value.into()))?;
        self.schedule_self(Priority::Normal, 0.0)
    }

    /// Triggers the event as a failure and schedules it for processing.
    ///
    /// The failure is delivered to subscribers when the event is processed;
    /// if nobody defuses it, it re-raises out of `step`.
    ///
    /// # Errors
    ///
    /// [`SimError::AlreadyTriggered`] if the event has an outcome.
    pub fn fail(&self, error: SimError) -> Result<(), SimError> {
        self.set_outcome(Err(error))?;
        self.schedule_self(Priority::Normal, 0.0)
    }

    /// Copies the outcome of an already triggered event and schedules this
    /// one for processing.
    ///
    /// # Errors
    ///
    /// [`SimError::AlreadyTriggered`] if this event has an outcome;
    /// [`SimError::InvalidYield`] if `source` is still pending.
    pub fn trigger(&self, source: &Event) -> Result<(), SimError> {
        let outcome = source.outcome().ok_or_else(|| {
            SimError::InvalidYield(format!("trigger from pending event {}", source.id()))
        })?;
        self.set_outcome(outcome)?;
        self.schedule_self(Priority::Normal, 0.0)
    }

    /// Builds an AND condition over this event and another waitable.
    ///
    /// # Errors
    ///
    /// [`SimError::MixedEnvironment`] if the operands belong to different
    /// environments.
    pub fn and<W: Waitable>(&self, other: &W) -> Result<Condition, SimError> {
        Condition::all_of(&self.env(), [self.clone(), other.as_event().clone()])
    }

    /// Builds an OR condition over this event and another waitable.
    ///
    /// # Errors
    ///
    /// [`SimError::MixedEnvironment`] if the operands belong to different
    /// environments.
    pub fn or<W: Waitable>(&self, other: &W) -> Result<Condition, SimError> {
        Condition::any_of(&self.env(), [self.clone(), other.as_event().clone()])
    }

    /// Registers a callback, invoked with the event when it is processed.
    ///
    /// Callbacks fan in registration order. The returned token can be
    /// passed to [`remove_callback`](Self::remove_callback).
    ///
    /// # Errors
    ///
    /// [`SimError::AlreadyTriggered`] if the event has already been
    /// processed (the callback list is released).
    pub fn add_callback(
        &self,
        callback: impl FnOnce(&Event) -> Result<(), SimError> + 'static,
    ) -> Result<CallbackId, SimError> {
        let mut slot = self.inner.callbacks.borrow_mut();
        let Some(list) = slot.as_mut() else {
            return Err(SimError::AlreadyTriggered);
        };
        let id = CallbackId(self.inner.next_callback.get());
        self.inner.next_callback.set(id.0 + 1);
        list.push((id, Box::new(callback)));
        Ok(id)
    }

    /// Removes a previously registered callback.
    ///
    /// Returns false if the callback was already consumed or removed, or
    /// the event has been processed.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut slot = self.inner.callbacks.borrow_mut();
        let Some(list) = slot.as_mut() else {
            return false;
        };
        let before = list.len();
        list.retain(|(cb_id, _)| *cb_id != id);
        list.len() != before
    }

    /// Registers an internal callback on an event known to be unprocessed.
    pub(crate) fn push_callback(
        &self,
        callback: impl FnOnce(&Event) -> Result<(), SimError> + 'static,
    ) -> CallbackId {
        self.add_callback(callback)
            .expect("callback list already released")
    }

    /// Stores the outcome without scheduling. Emits the trigger hooks.
    pub(crate) fn set_outcome(&self, outcome: Outcome) -> Result<(), SimError> {
        {
            let mut slot = self.inner.outcome.borrow_mut();
            if slot.is_some() {
                return Err(SimError::AlreadyTriggered);
            }
            trace!(event = %self.inner.id, ok = outcome.is_ok(), "event triggered");
            *slot = Some(outcome);
        }
        if let Some(core) = self.inner.env.upgrade() {
            match self.outcome() {
                Some(Ok(_)) => core.emit(|o| o.on_event_succeeded(core.now(), self)),
                Some(Err(e)) => core.emit(|o| o.on_event_failed(core.now(), self, &e)),
                None => {}
            }
        }
        Ok(())
    }

    /// Replaces the success value in place. Used by conditions to swap the
    /// placeholder for the built [`condition::ConditionValue`] before
    /// subscribers fan.
    pub(crate) fn replace_value(&self, value: Value) {
        if let Some(Ok(v)) = self.inner.outcome.borrow_mut().as_mut() {
            *v = value;
        }
    }

    pub(crate) fn schedule_self(&self, priority: Priority, delay: f64) -> Result<(), SimError> {
        self.core().schedule(self, priority, delay)
    }

    /// Takes the callback list, marking the event processed.
    pub(crate) fn take_callbacks(&self) -> Option<Vec<(CallbackId, Callback)>> {
        self.inner.callbacks.borrow_mut().take()
    }

    /// Releases an empty callback list so the heap discards the entry.
    ///
    /// Used when an interrupt unhooks the last subscriber of an event the
    /// interrupted process was awaiting: nothing can observe the event any
    /// more, and a dead entry must not advance the clock.
    pub(crate) fn release_if_unobserved(&self) {
        let mut slot = self.inner.callbacks.borrow_mut();
        if slot.as_ref().is_some_and(Vec::is_empty) && !self.triggered() {
            trace!(event = %self.inner.id, "releasing unobserved event");
            *slot = None;
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.ok() {
            None => "pending",
            Some(true) => "ok",
            Some(false) => "failed",
        };
        let mut s = f.debug_struct("Event");
        s.field("id", &self.inner.id).field("state", &state);
        if self.processed() {
            s.field("processed", &true);
        }
        s.finish()
    }
}

/// A weak event handle, used where a strong one would form a cycle.
#[derive(Clone)]
pub(crate) struct WeakEvent(Weak<EventInner>);

impl WeakEvent {
    pub(crate) fn upgrade(&self) -> Option<Event> {
        self.0.upgrade().map(|inner| Event { inner })
    }
}

/// Anything a process can wait on: events, timeouts, conditions, processes,
/// and resource requests all expose their underlying event here.
pub trait Waitable {
    /// The event that triggers when this waitable completes.
    fn as_event(&self) -> &Event;
}

impl Waitable for Event {
    fn as_event(&self) -> &Event {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Environment;

    #[test]
    fn succeed_is_at_most_once() {
        let env = Environment::new();
        let event = env.event();
        event.succeed(Value::unit()).expect("first trigger");
        assert!(matches!(
            event.succeed(Value::unit()),
            Err(SimError::AlreadyTriggered)
        ));
        assert!(matches!(
            event.fail(SimError::failure("late")),
            Err(SimError::AlreadyTriggered)
        ));
    }

    #[test]
    fn outcome_is_immutable_once_set() {
        let env = Environment::new();
        let event = env.event();
        event.succeed(Value::from(7_i64)).expect("trigger");
        assert_eq!(event.ok(), Some(true));
        assert_eq!(
            event.value().and_then(|v| v.downcast_ref::<i64>().copied()),
            Some(7)
        );
    }

    #[test]
    fn trigger_copies_source_outcome() {
        let env = Environment::new();
        let source = env.event();
        source.succeed(Value::from("payload")).expect("trigger");

        let target = env.event();
        target.trigger(&source).expect("copy");
        assert_eq!(target.value().as_ref().and_then(Value::as_str).map(str::to_owned),
            Some(String::from("payload")));
    }

    #[test]
    fn trigger_from_pending_source_is_rejected() {
        let env = Environment::new();
        let source = env.event();
        let target = env.event();
        assert!(matches!(
            target.trigger(&source),
            Err(SimError::InvalidYield(_))
        ));
        assert!(!target.triggered());
    }

    #[test]
    fn callbacks_fan_in_registration_order() {
        let env = Environment::new();
        let event = env.event();
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            event
                .add_callback(move |_| {
                    order.borrow_mut().push(tag);
                    Ok(())
                })
                .expect("register");
        }
        event.succeed(Value::unit()).expect("trigger");
        env.run().expect("run");
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn removed_callback_does_not_fan() {
        let env = Environment::new();
        let event = env.event();
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let keep = hits.clone();
        event
            .add_callback(move |_| {
                keep.set(keep.get() + 1);
                Ok(())
            })
            .expect("register");
        let drop_hits = hits.clone();
        let id = event
            .add_callback(move |_| {
                drop_hits.set(drop_hits.get() + 10);
                Ok(())
            })
            .expect("register");

        assert!(event.remove_callback(id));
        assert!(!event.remove_callback(id));

        event.succeed(Value::unit()).expect("trigger");
        env.run().expect("run");
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn late_subscription_is_rejected() {
        let env = Environment::new();
        let event = env.event();
        event.succeed(Value::unit()).expect("trigger");
        env.run().expect("run");
        assert!(event.processed());
        assert!(matches!(
            event.add_callback(|_| Ok(())),
            Err(SimError::AlreadyTriggered)
        ));
    }

    #[test]
    fn handle_identity() {
        let env = Environment::new();
        let a = env.event();
        let b = a.clone();
        assert!(a.handle_eq(&b));
        assert!(!a.handle_eq(&env.event()));
    }
}
