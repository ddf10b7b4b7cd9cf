//! Processes: suspendable computations driven by events.
//!
//! A process wraps a coroutine — a future built by a user factory — and
//! adapts it to the event protocol. The kernel polls the coroutine with a
//! no-op waker; suspension happens exactly where the coroutine awaits an
//! event through [`Sim::wait`], which registers the process's resume as a
//! callback on that event. When the event fans, the process is resumed with
//! the event's outcome: the value on success, the error as an `Err` the
//! coroutine may catch.
//!
//! A process is itself a waitable event that triggers when the coroutine
//! returns (success), errors (failure), or leaves the protocol
//! ([`InvalidYield`](SimError::InvalidYield)).
//!
//! Construction schedules an urgent, pre-succeeded bootstrap event at zero
//! delay, so the coroutine first executes before any normal event at the
//! same instant. [`interrupt`](Process::interrupt) schedules an urgent
//! interruption carrying [`Interrupted`](SimError::Interrupted); delivery
//! unhooks the process's pending resume from whatever it was awaiting and
//! throws the error into the coroutine at its suspension point.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use tracing::trace;

use crate::env::{EnvCore, Environment};
use crate::error::{Outcome, SimError};
use crate::event::timeout::Timeout;
use crate::event::{CallbackId, Event, Waitable};
use crate::types::{ProcessId, Priority, SimTime, Value};

type Coroutine = Pin<Box<dyn Future<Output = Result<Value, SimError>>>>;

pub(crate) struct ProcessInner {
    id: ProcessId,
    name: String,
    env: Weak<EnvCore>,
    event: Event,
    coroutine: RefCell<Option<Coroutine>>,
    /// Outcome to deliver at the next poll instead of the awaited event's
    /// own outcome; set by interrupt delivery.
    injected: RefCell<Option<Outcome>>,
    /// The event the process is suspended on and its resume token.
    waiting_on: RefCell<Option<(Event, CallbackId)>>,
    started: Cell<bool>,
}

/// A suspendable computation adapted to the event protocol.
///
/// # Example
///
/// ```
/// use eventide::{Environment, SimTime, Value, Waitable};
///
/// let env = Environment::new();
/// let p = env.process(|sim| async move {
///     let value = sim.hold(2.0).await?;
///     assert!(value.is_unit());
///     Ok(Value::from(42_i64))
/// });
/// env.run()?;
/// assert_eq!(p.as_event().ok(), Some(true));
/// assert_eq!(env.now(), SimTime::new(2.0));
/// # Ok::<(), eventide::SimError>(())
/// ```
#[derive(Clone)]
pub struct Process {
    pub(crate) inner: Rc<ProcessInner>,
}

impl Process {
    pub(crate) fn spawn<F, Fut>(env: &Environment, name: String, factory: F) -> Self
    where
        F: FnOnce(Sim) -> Fut,
        Fut: Future<Output = Result<Value, SimError>> + 'static,
    {
        let event = env.event();
        let id = env.core.next_process_id();
        let sim = Sim {
            env: Rc::downgrade(&env.core),
        };
        let coroutine: Coroutine = Box::pin(factory(sim));
        let process = Self {
            inner: Rc::new(ProcessInner {
                id,
                name,
                env: Rc::downgrade(&env.core),
                event,
                coroutine: RefCell::new(Some(coroutine)),
                injected: RefCell::new(None),
                waiting_on: RefCell::new(None),
                started: Cell::new(false),
            }),
        };
        trace!(process = %id, name = %process.name(), "process created");

        let bootstrap = env.event();
        bootstrap
            .set_outcome(Ok(Value::unit()))
            .expect("fresh bootstrap event");
        bootstrap.push_callback({
            let process = process.clone();
            move |_| process.resume()
        });
        env.core
            .schedule(&bootstrap, Priority::Urgent, 0.0)
            .expect("schedule at zero delay");
        process
    }

    /// The process identifier, unique within its environment.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.inner.id
    }

    /// The process name, derived from its factory or given explicitly.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns true while the coroutine has not settled.
    #[must_use]
    pub fn alive(&self) -> bool {
        !self.inner.event.triggered()
    }

    /// Throws [`Interrupted`](SimError::Interrupted) into the coroutine at
    /// its current suspension point.
    ///
    /// Delivery is urgent-scheduled at the current instant; the coroutine
    /// may catch the error and continue. Interrupting a settled process is
    /// silently ignored.
    pub fn interrupt(&self, cause: impl Into<Value>) {
        if !self.alive() {
            trace!(process = %self.inner.id, "interrupt ignored: process settled");
            return;
        }
        let Some(core) = self.inner.env.upgrade() else {
            return;
        };
        core.emit(|o| o.on_process_interrupted(core.now(), self));
        trace!(process = %self.inner.id, "interrupt scheduled");

        let env = Environment { core: core.clone() };
        let interruption = env.event();
        interruption
            .set_outcome(Err(SimError::Interrupted(cause.into())))
            .expect("fresh interruption event");
        interruption.defuse();
        interruption.push_callback({
            let process = self.clone();
            move |event| process.deliver_interrupt(event)
        });
        core.schedule(&interruption, Priority::Urgent, 0.0)
            .expect("schedule at zero delay");
    }

    fn deliver_interrupt(&self, interruption: &Event) -> Result<(), SimError> {
        if !self.alive() {
            return Ok(());
        }
        if let Some((target, id)) = self.inner.waiting_on.borrow_mut().take() {
            target.remove_callback(id);
            target.release_if_unobserved();
        }
        *self.inner.injected.borrow_mut() = interruption.outcome();
        self.resume()
    }

    /// Advances the coroutine until it suspends on an event or settles.
    ///
    /// Idempotent on settled processes: a stale callback resuming a
    /// process that already completed is a no-op.
    pub(crate) fn resume(&self) -> Result<(), SimError> {
        if self.inner.event.triggered() {
            trace!(process = %self.inner.id, "ignoring resume of settled process");
            return Ok(());
        }
        let core = self
            .inner
            .env
            .upgrade()
            .expect("environment dropped before its processes");
        let previous = core.active.borrow_mut().replace(self.clone());
        if !self.inner.started.replace(true) {
            core.emit(|o| o.on_process_started(core.now(), self));
        }
        *self.inner.waiting_on.borrow_mut() = None;

        let coroutine = self.inner.coroutine.borrow_mut().take();
        let settled = match coroutine {
            None => None,
            Some(mut future) => {
                let mut cx = Context::from_waker(Waker::noop());
                match future.as_mut().poll(&mut cx) {
                    Poll::Ready(outcome) => Some(outcome),
                    Poll::Pending => {
                        let target = self
                            .inner
                            .waiting_on
                            .borrow()
                            .as_ref()
                            .map(|(event, _)| event.clone());
                        if let Some(target) = target {
                            *self.inner.coroutine.borrow_mut() = Some(future);
                            trace!(
                                process = %self.inner.id,
                                event = %target.id(),
                                "process suspended"
                            );
                            core.emit(|o| o.on_process_yielded(core.now(), self, &target));
                            None
                        } else {
                            Some(Err(SimError::InvalidYield(String::from(
                                "process suspended on a foreign future",
                            ))))
                        }
                    }
                }
            }
        };
        self.inner.injected.borrow_mut().take();

        if let Some(outcome) = settled {
            self.settle(&core, outcome);
        }
        *core.active.borrow_mut() = previous;
        Ok(())
    }

    fn settle(&self, core: &Rc<EnvCore>, outcome: Outcome) {
        match &outcome {
            Ok(_) => trace!(process = %self.inner.id, "process completed"),
            Err(error) => trace!(process = %self.inner.id, %error, "process failed"),
        }
        self.inner
            .event
            .set_outcome(outcome)
            .expect("process event already triggered");
        core.schedule(&self.inner.event, Priority::Normal, 0.0)
            .expect("schedule at zero delay");
        core.emit(|o| o.on_process_completed(core.now(), self));
    }
}

impl Waitable for Process {
    fn as_event(&self) -> &Event {
        &self.inner.event
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("alive", &self.alive())
            .finish()
    }
}

/// The context handed to every coroutine: its window into the environment.
///
/// `Sim` holds a weak environment handle, so coroutines captured in
/// long-lived structures cannot keep the environment alive.
#[derive(Clone)]
pub struct Sim {
    env: Weak<EnvCore>,
}

impl Sim {
    /// The owning environment.
    ///
    /// # Panics
    ///
    /// Panics if the environment has been dropped.
    #[must_use]
    pub fn env(&self) -> Environment {
        Environment {
            core: self.env.upgrade().expect("environment dropped"),
        }
    }

    /// The current virtual time.
    #[must_use]
    pub fn now(&self) -> SimTime {
        self.env().now()
    }

    /// Suspends the calling process until the waitable's event fans.
    ///
    /// Resolves to the event's outcome: its value on success, its error on
    /// failure (which also defuses the event — the process owns the error
    /// from here). Awaiting an already processed event continues
    /// immediately, in the same tick, with its outcome.
    pub fn wait<W: Waitable>(&self, waitable: &W) -> EventFuture {
        EventFuture {
            event: waitable.as_event().clone(),
            registered: None,
        }
    }

    /// Creates a timeout delivering `()` after `delay`.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if `delay` is negative or NaN.
    pub fn timeout(&self, delay: f64) -> Result<Timeout, SimError> {
        self.env().timeout(delay)
    }

    /// Holds the calling process for `delay` time units.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if `delay` is negative or NaN;
    /// [`SimError::Interrupted`] if the process is interrupted while
    /// holding.
    pub async fn hold(&self, delay: f64) -> Result<Value, SimError> {
        let timeout = self.env().timeout(delay)?;
        self.wait(&timeout).await
    }
}

impl fmt::Debug for Sim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sim")
    }
}

/// Future returned by [`Sim::wait`].
///
/// Registers the active process's resume on the event at first poll;
/// resolves once the event is processed or an interrupt is delivered.
pub struct EventFuture {
    event: Event,
    registered: Option<CallbackId>,
}

impl Future for EventFuture {
    type Output = Result<Value, SimError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(core) = this.event.inner.env.upgrade() else {
            return Poll::Ready(Err(SimError::InvalidYield(String::from(
                "environment dropped",
            ))));
        };
        let active = core.active.borrow().clone();
        let Some(process) = active else {
            return Poll::Ready(Err(SimError::InvalidYield(String::from(
                "event awaited outside a process",
            ))));
        };

        if let Some(delivered) = process.inner.injected.borrow_mut().take() {
            this.registered = None;
            return Poll::Ready(delivered);
        }

        if this.event.processed() {
            this.registered = None;
            let outcome = this.event.outcome().unwrap_or_else(|| Ok(Value::unit()));
            if outcome.is_err() {
                this.event.defuse();
            }
            return Poll::Ready(outcome);
        }

        let id = match this.registered {
            Some(id) => id,
            None => {
                let id = this.event.push_callback({
                    let process = process.clone();
                    move |_| process.resume()
                });
                this.registered = Some(id);
                id
            }
        };
        *process.inner.waiting_on.borrow_mut() = Some((this.event.clone(), id));
        Poll::Pending
    }
}

impl Drop for EventFuture {
    fn drop(&mut self) {
        if let Some(id) = self.registered.take() {
            self.event.remove_callback(id);
        }
    }
}

/// Best-effort process name from the factory's type name.
pub(crate) fn factory_name<F>() -> String {
    let full = std::any::type_name::<F>();
    let trimmed = full.trim_end_matches("::{{closure}}");
    let segment = trimmed.rsplit("::").next().unwrap_or(trimmed);
    if segment.is_empty() {
        String::from("anonymous")
    } else {
        segment.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Environment;

    fn init() {
        crate::test_utils::init_test_logging();
    }

    #[test]
    fn process_advances_through_timeouts() {
        init();
        let env = Environment::new();
        let p = env.process(|sim| async move {
            sim.hold(3.0).await?;
            sim.hold(4.0).await?;
            Ok(Value::from("done"))
        });
        env.run().expect("run");
        assert_eq!(env.now(), SimTime::new(7.0));
        assert_eq!(p.as_event().ok(), Some(true));
        assert_eq!(
            p.as_event().value().as_ref().and_then(Value::as_str),
            Some("done")
        );
    }

    #[test]
    fn awaiting_a_processed_event_continues_immediately() {
        let env = Environment::new();
        let early = env.timeout_with(0.0, "early").expect("timeout");
        env.run().expect("run");
        assert!(early.as_event().processed());

        let p = env.process(move |sim| async move {
            let value = sim.wait(&early).await?;
            Ok(value)
        });
        env.run().expect("run");
        assert_eq!(env.now(), SimTime::ZERO);
        assert_eq!(
            p.as_event().value().as_ref().and_then(Value::as_str),
            Some("early")
        );
    }

    #[test]
    fn caught_interrupt_becomes_the_return_value() {
        init();
        let env = Environment::new();
        let p = env.process(|sim| async move {
            match sim.hold(100.0).await {
                Err(SimError::Interrupted(cause)) => Ok(cause),
                other => other,
            }
        });
        p.interrupt("boom");
        env.run().expect("run");
        assert_eq!(env.now(), SimTime::ZERO);
        assert_eq!(
            p.as_event().value().as_ref().and_then(Value::as_str),
            Some("boom")
        );
    }

    #[test]
    fn uncaught_interrupt_fails_the_process() {
        let env = Environment::new();
        let p = env.process(|sim| async move {
            sim.hold(100.0).await?;
            Ok(Value::unit())
        });
        p.interrupt("dropped");
        let result = env.run();
        assert!(matches!(result, Err(SimError::Interrupted(_))));
        assert_eq!(p.as_event().ok(), Some(false));
    }

    #[test]
    fn interrupting_a_settled_process_is_ignored() {
        let env = Environment::new();
        let p = env.process(|_| async move { Ok(Value::unit()) });
        env.run().expect("run");
        assert!(!p.alive());
        p.interrupt("too late");
        env.run().expect("run");
        assert_eq!(p.as_event().ok(), Some(true));
    }

    #[test]
    fn process_failure_surfaces_when_unobserved() {
        let env = Environment::new();
        let _p = env.process(|_| async move { Err(SimError::failure("exploded")) });
        let result = env.run();
        assert!(matches!(result, Err(SimError::Failure(ref v)) if v.as_str() == Some("exploded")));
    }

    #[test]
    fn one_process_can_await_another() {
        let env = Environment::new();
        let worker = env.process_named("worker", |sim| async move {
            sim.hold(5.0).await?;
            Ok(Value::from(99_i64))
        });
        let watcher = env.process_named("watcher", move |sim| async move {
            let value = sim.wait(&worker).await?;
            Ok(value)
        });
        env.run().expect("run");
        assert_eq!(
            watcher
                .as_event()
                .value()
                .and_then(|v| v.downcast_ref::<i64>().copied()),
            Some(99)
        );
        assert_eq!(env.now(), SimTime::new(5.0));
    }

    #[test]
    fn foreign_suspension_is_an_invalid_yield() {
        struct Never;
        impl Future for Never {
            type Output = Result<Value, SimError>;
            fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
                Poll::Pending
            }
        }

        let env = Environment::new();
        let p = env.process(|_| async move { Never.await });
        let result = env.run();
        assert!(matches!(result, Err(SimError::InvalidYield(_))));
        assert_eq!(p.as_event().ok(), Some(false));
    }

    #[test]
    fn failed_event_is_defused_when_caught_by_a_process() {
        let env = Environment::new();
        let doomed = env.event();
        doomed.fail(SimError::failure("expected")).expect("fail");

        let captured = doomed.clone();
        let p = env.process(move |sim| async move {
            match sim.wait(&captured).await {
                Err(SimError::Failure(v)) => Ok(v),
                other => other,
            }
        });
        env.run().expect("run");
        assert!(doomed.defused());
        assert_eq!(
            p.as_event().value().as_ref().and_then(Value::as_str),
            Some("expected")
        );
    }

    #[test]
    fn names_derive_from_factories() {
        let env = Environment::new();
        let auto = env.process(|_| async move { Ok(Value::unit()) });
        assert!(!auto.name().is_empty());
        let named = env.process_named("pump", |_| async move { Ok(Value::unit()) });
        assert_eq!(named.name(), "pump");
        env.run().expect("run");
    }

    #[test]
    fn factory_name_trims_closure_suffixes() {
        let name = factory_name::<fn(Sim)>();
        assert!(!name.is_empty());
    }
}
