//! AND/OR composition over heterogeneous events.
//!
//! A [`Condition`] is an ordinary event constructed over a set of child
//! events and a predicate. Each still-pending child gets a *check* callback
//! (token-registered, so the condition can unhook the remaining checks the
//! moment it settles). The first observed child failure fails the condition
//! with that child's error and defuses the child; otherwise the condition
//! succeeds once the predicate holds over the count of settled children.
//!
//! The condition's own first callback is the *value builder*: it runs ahead
//! of every subscriber and replaces the placeholder success value with a
//! [`ConditionValue`] — the ordered child→value map of the children that
//! were already processed at that moment.

use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::env::Environment;
use crate::error::SimError;
use crate::event::{CallbackId, Event, Waitable, WeakEvent};
use crate::types::Value;

/// Predicate deciding when a condition is satisfied, given its children and
/// the number of them that have settled.
pub type ConditionPredicate = fn(&[Event], usize) -> bool;

/// Satisfied when every child has settled.
#[must_use]
pub fn all(children: &[Event], count: usize) -> bool {
    count == children.len()
}

/// Satisfied as soon as one child settles; immediately for no children.
#[must_use]
pub fn any(children: &[Event], count: usize) -> bool {
    count > 0 || children.is_empty()
}

struct ConditionCore {
    event: WeakEvent,
    children: Vec<Event>,
    predicate: ConditionPredicate,
    count: usize,
    registrations: Vec<(Event, CallbackId)>,
}

/// A composite event satisfied by a predicate over child events.
///
/// # Example
///
/// ```
/// use eventide::{Environment, Value, Waitable};
///
/// let env = Environment::new();
/// let a = env.event();
/// let b = env.event();
/// let both = a.and(&b)?;
/// a.succeed(Value::from(1_i64))?;
/// b.succeed(Value::from(2_i64))?;
/// env.run()?;
/// assert_eq!(both.as_event().ok(), Some(true));
/// # Ok::<(), eventide::SimError>(())
/// ```
#[derive(Clone)]
pub struct Condition {
    event: Event,
}

impl Condition {
    /// Builds a condition satisfied when *all* children have triggered.
    ///
    /// An empty child set succeeds immediately.
    ///
    /// # Errors
    ///
    /// [`SimError::MixedEnvironment`] if any child belongs to a different
    /// environment.
    pub fn all_of(
        env: &Environment,
        children: impl IntoIterator<Item = Event>,
    ) -> Result<Self, SimError> {
        Self::with_predicate(env, all, children.into_iter().collect())
    }

    /// Builds a condition satisfied when *any* child has triggered.
    ///
    /// An empty child set succeeds immediately.
    ///
    /// # Errors
    ///
    /// [`SimError::MixedEnvironment`] if any child belongs to a different
    /// environment.
    pub fn any_of(
        env: &Environment,
        children: impl IntoIterator<Item = Event>,
    ) -> Result<Self, SimError> {
        Self::with_predicate(env, any, children.into_iter().collect())
    }

    /// Builds a condition with a custom predicate.
    ///
    /// The predicate is evaluated after each child settles, with the child
    /// list and the settled count.
    ///
    /// # Errors
    ///
    /// [`SimError::MixedEnvironment`] if any child belongs to a different
    /// environment.
    pub fn with_predicate(
        env: &Environment,
        predicate: ConditionPredicate,
        children: Vec<Event>,
    ) -> Result<Self, SimError> {
        for child in &children {
            if !std::rc::Weak::ptr_eq(&child.inner.env, &Rc::downgrade(&env.core)) {
                return Err(SimError::MixedEnvironment);
            }
        }

        let event = env.event();
        trace!(
            condition = %event.id(),
            children = children.len(),
            "building condition"
        );
        let core = Rc::new(RefCell::new(ConditionCore {
            event: event.downgrade(),
            children: children.clone(),
            predicate,
            count: 0,
            registrations: Vec::new(),
        }));

        {
            let core = core.clone();
            event.push_callback(move |e| build_value(&core, e));
        }

        for child in &children {
            if child.processed() {
                check(&core, child)?;
            } else if !event.triggered() {
                let registration = {
                    let core = core.clone();
                    child.add_callback(move |settled| check(&core, settled))?
                };
                core.borrow_mut()
                    .registrations
                    .push((child.clone(), registration));
            }
        }

        let satisfied = {
            let c = core.borrow();
            !event.triggered() && (c.predicate)(&c.children, c.count)
        };
        if satisfied {
            unhook(&core, None);
            event.succeed(Value::unit())?;
        }

        Ok(Self { event })
    }

    /// Chains an AND over this condition and another waitable.
    ///
    /// # Errors
    ///
    /// [`SimError::MixedEnvironment`] if the operands belong to different
    /// environments.
    pub fn and<W: Waitable>(&self, other: &W) -> Result<Condition, SimError> {
        self.event.and(other)
    }

    /// Chains an OR over this condition and another waitable.
    ///
    /// # Errors
    ///
    /// [`SimError::MixedEnvironment`] if the operands belong to different
    /// environments.
    pub fn or<W: Waitable>(&self, other: &W) -> Result<Condition, SimError> {
        self.event.or(other)
    }
}

impl Waitable for Condition {
    fn as_event(&self) -> &Event {
        &self.event
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.event).finish()
    }
}

/// The check callback: advances the settled count and settles the
/// condition when a child fails or the predicate holds.
fn check(core: &Rc<RefCell<ConditionCore>>, child: &Event) -> Result<(), SimError> {
    enum Settle {
        Not,
        Fail(SimError),
        Succeed,
    }

    let (event, settle) = {
        let mut c = core.borrow_mut();
        let Some(event) = c.event.upgrade() else {
            return Ok(());
        };
        if event.triggered() {
            return Ok(());
        }
        c.count += 1;
        let settle = match child.outcome() {
            Some(Err(error)) => Settle::Fail(error),
            _ if (c.predicate)(&c.children, c.count) => Settle::Succeed,
            _ => Settle::Not,
        };
        (event, settle)
    };

    match settle {
        Settle::Not => Ok(()),
        Settle::Fail(error) => {
            child.defuse();
            unhook(core, Some(child));
            trace!(condition = %event.id(), child = %child.id(), "condition failed by child");
            event.fail(error)
        }
        Settle::Succeed => {
            unhook(core, Some(child));
            trace!(condition = %event.id(), "condition satisfied");
            event.succeed(Value::unit())
        }
    }
}

/// Removes the remaining check callbacks from still-pending children. The
/// child currently fanning is skipped: its callback is already consumed.
fn unhook(core: &Rc<RefCell<ConditionCore>>, fanning: Option<&Event>) {
    let registrations: Vec<_> = core.borrow_mut().registrations.drain(..).collect();
    for (child, id) in registrations {
        if fanning.is_some_and(|f| f.handle_eq(&child)) {
            continue;
        }
        child.remove_callback(id);
    }
}

/// The value builder: fans first and swaps the placeholder for the
/// assembled child→value map.
fn build_value(core: &Rc<RefCell<ConditionCore>>, event: &Event) -> Result<(), SimError> {
    if event.ok() != Some(true) {
        return Ok(());
    }
    let assembled = {
        let c = core.borrow();
        let mut value = ConditionValue::default();
        for child in &c.children {
            if !child.processed() {
                continue;
            }
            if let Some(Ok(v)) = child.outcome() {
                if let Some(nested) = v.downcast_ref::<ConditionValue>() {
                    value.items.extend(nested.items.iter().cloned());
                } else {
                    value.items.push((child.clone(), v));
                }
            }
        }
        value
    };
    event.replace_value(Value::new(assembled));
    Ok(())
}

/// The ordered child→value map delivered by a successful condition.
///
/// Entries appear in child order and cover the children that were already
/// processed when the condition itself was processed. Values of nested
/// conditions are flattened into the parent map.
#[derive(Clone, Default)]
pub struct ConditionValue {
    items: Vec<(Event, Value)>,
}

impl ConditionValue {
    /// The value contributed by a child, if it was included.
    #[must_use]
    pub fn get(&self, child: &Event) -> Option<&Value> {
        self.items
            .iter()
            .find(|(e, _)| e.handle_eq(child))
            .map(|(_, v)| v)
    }

    /// Returns true if the child contributed a value.
    #[must_use]
    pub fn contains(&self, child: &Event) -> bool {
        self.get(child).is_some()
    }

    /// Number of contributing children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no child contributed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates `(child, value)` pairs in child order.
    pub fn iter(&self) -> impl Iterator<Item = (&Event, &Value)> {
        self.items.iter().map(|(e, v)| (e, v))
    }

    /// Iterates contributed values in child order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.items.iter().map(|(_, v)| v)
    }
}

impl fmt::Debug for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (event, value) in &self.items {
            map.entry(&event.id(), value);
        }
        map.finish()
    }
}
