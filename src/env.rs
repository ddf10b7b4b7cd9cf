//! The environment: virtual clock, scheduling heap, and the step loop.
//!
//! The environment is the only executor. Each [`step`](Environment::step)
//! pops the earliest live entry, advances the clock to its time, fans the
//! event's callbacks in registration order, and re-raises the outcome if it
//! is an undefused failure. [`run`](Environment::run) drives steps to queue
//! exhaustion; [`run_until`](Environment::run_until) installs a stop
//! sentinel at a time or on an event and swallows its
//! [`StopSimulation`](crate::SimError::StopSimulation).
//!
//! `step` and `run` are not reentrant: a callback must not drive its own
//! environment. `schedule` and every constructor are reentrant.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{trace, warn};

use crate::error::SimError;
use crate::event::timeout::Timeout;
use crate::event::{Event, Waitable};
use crate::observe::{Observer, ObserverId};
use crate::process::{Process, Sim};
use crate::queue::{EventQueue, QueueEntry};
use crate::resource::Resource;
use crate::types::{EventId, Priority, ProcessId, ResourceId, SimTime, Value};

pub(crate) struct EnvCore {
    now: Cell<SimTime>,
    queue: RefCell<EventQueue>,
    next_seq: Cell<u64>,
    next_event: Cell<u64>,
    next_process: Cell<u64>,
    next_resource: Cell<u64>,
    pub(crate) active: RefCell<Option<Process>>,
    observers: RefCell<Vec<(ObserverId, Rc<RefCell<dyn Observer>>)>>,
    next_observer: Cell<u64>,
}

impl EnvCore {
    pub(crate) fn now(&self) -> SimTime {
        self.now.get()
    }

    pub(crate) fn next_event_id(&self) -> EventId {
        let id = self.next_event.get();
        self.next_event.set(id + 1);
        EventId(id)
    }

    pub(crate) fn next_process_id(&self) -> ProcessId {
        let id = self.next_process.get();
        self.next_process.set(id + 1);
        ProcessId(id)
    }

    pub(crate) fn next_resource_id(&self) -> ResourceId {
        let id = self.next_resource.get();
        self.next_resource.set(id + 1);
        ResourceId(id)
    }

    /// Pushes an event onto the heap at `now + delay`.
    ///
    /// An event already in the heap is not pushed twice; the `scheduled`
    /// flag guards paths that may race to schedule the same event within a
    /// tick (interrupt delivery versus natural completion).
    pub(crate) fn schedule(
        &self,
        event: &Event,
        priority: Priority,
        delay: f64,
    ) -> Result<(), SimError> {
        if !(delay >= 0.0) {
            return Err(SimError::NegativeDelay(delay));
        }
        if event.inner.scheduled.get() {
            trace!(event = %event.id(), "schedule skipped: already queued");
            return Ok(());
        }
        let time = self.now.get() + delay;
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.queue.borrow_mut().push(QueueEntry {
            time,
            priority,
            seq,
            event: event.clone(),
        });
        event.inner.scheduled.set(true);
        trace!(event = %event.id(), %time, %priority, seq, "scheduled");
        self.emit(|o| o.on_event_scheduled(self.now.get(), event, time, priority));
        Ok(())
    }

    /// Invokes a hook on every attached observer.
    ///
    /// A panicking observer is caught and logged; an observer re-entered
    /// while already borrowed is skipped. Neither perturbs the simulation.
    pub(crate) fn emit(&self, hook: impl Fn(&mut dyn Observer)) {
        if self.observers.borrow().is_empty() {
            return;
        }
        let snapshot: Vec<Rc<RefCell<dyn Observer>>> = self
            .observers
            .borrow()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in snapshot {
            let Ok(mut guard) = observer.try_borrow_mut() else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| hook(&mut *guard))).is_err() {
                warn!("observer panicked; ignoring");
            }
        }
    }
}

/// Where [`Environment::run_until`] should stop.
pub enum Until {
    /// Stop once the clock reaches this time.
    Time(SimTime),
    /// Stop once this event is processed.
    Event(Event),
}

impl From<f64> for Until {
    fn from(t: f64) -> Self {
        Self::Time(SimTime::new(t))
    }
}

impl From<SimTime> for Until {
    fn from(t: SimTime) -> Self {
        Self::Time(t)
    }
}

impl From<Event> for Until {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<&Event> for Until {
    fn from(event: &Event) -> Self {
        Self::Event(event.clone())
    }
}

impl From<&Process> for Until {
    fn from(process: &Process) -> Self {
        Self::Event(process.as_event().clone())
    }
}

impl From<&Timeout> for Until {
    fn from(timeout: &Timeout) -> Self {
        Self::Event(timeout.as_event().clone())
    }
}

impl From<&crate::event::condition::Condition> for Until {
    fn from(condition: &crate::event::condition::Condition) -> Self {
        Self::Event(condition.as_event().clone())
    }
}

/// The simulation environment: owns the clock and the heap.
///
/// `Environment` is a cheap cloneable handle; clones share state. It must
/// outlive every event, process, and resource created through it.
///
/// # Example
///
/// ```
/// use eventide::{Environment, SimTime, Value, Waitable};
///
/// let env = Environment::new();
/// let p = env.process(|sim| async move {
///     sim.hold(3.0).await?;
///     Ok(Value::from("done"))
/// });
/// env.run()?;
/// assert_eq!(env.now(), SimTime::new(3.0));
/// assert_eq!(p.as_event().ok(), Some(true));
/// # Ok::<(), eventide::SimError>(())
/// ```
#[derive(Clone)]
pub struct Environment {
    pub(crate) core: Rc<EnvCore>,
}

impl Environment {
    /// Creates an environment with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(SimTime::ZERO)
    }

    /// Creates an environment with the clock at `initial`.
    ///
    /// # Panics
    ///
    /// Panics if `initial` is not finite.
    #[must_use]
    pub fn starting_at(initial: SimTime) -> Self {
        assert!(initial.is_finite(), "initial time must be finite");
        Self {
            core: Rc::new(EnvCore {
                now: Cell::new(initial),
                queue: RefCell::new(EventQueue::new()),
                next_seq: Cell::new(0),
                next_event: Cell::new(0),
                next_process: Cell::new(0),
                next_resource: Cell::new(0),
                active: RefCell::new(None),
                observers: RefCell::new(Vec::new()),
                next_observer: Cell::new(0),
            }),
        }
    }

    /// The current virtual time.
    #[must_use]
    pub fn now(&self) -> SimTime {
        self.core.now()
    }

    /// The next scheduled time, or [`SimTime::INFINITY`] when nothing is
    /// scheduled.
    #[must_use]
    pub fn peek(&self) -> SimTime {
        self.core.queue.borrow().peek_time()
    }

    /// Number of entries currently in the heap, stale ones included.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.core.queue.borrow().len()
    }

    /// Creates a fresh pending event bound to this environment.
    #[must_use]
    pub fn event(&self) -> Event {
        Event::new(&self.core, self.core.next_event_id())
    }

    /// Creates a timeout delivering `()` after `delay`.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if `delay` is negative or NaN.
    pub fn timeout(&self, delay: f64) -> Result<Timeout, SimError> {
        Timeout::new(self, delay)
    }

    /// Creates a timeout delivering `value` after `delay`.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if `delay` is negative or NaN.
    pub fn timeout_with(
        &self,
        delay: f64,
        value: impl Into<Value>,
    ) -> Result<Timeout, SimError> {
        Timeout::with_value(self, delay, value)
    }

    /// Spawns a process from a coroutine factory.
    ///
    /// The factory receives a [`Sim`] context and returns the coroutine
    /// future. The process name is derived from the factory's type name.
    pub fn process<F, Fut>(&self, factory: F) -> Process
    where
        F: FnOnce(Sim) -> Fut,
        Fut: std::future::Future<Output = Result<Value, SimError>> + 'static,
    {
        let name = crate::process::factory_name::<F>();
        Process::spawn(self, name, factory)
    }

    /// Spawns a process with an explicit name.
    pub fn process_named<F, Fut>(&self, name: impl Into<String>, factory: F) -> Process
    where
        F: FnOnce(Sim) -> Fut,
        Fut: std::future::Future<Output = Result<Value, SimError>> + 'static,
    {
        Process::spawn(self, name.into(), factory)
    }

    /// Creates a capacity-bounded resource.
    ///
    /// # Errors
    ///
    /// [`SimError::CapacityViolation`] if `capacity` is zero.
    pub fn resource(&self, capacity: u64) -> Result<Resource, SimError> {
        Resource::new(self, capacity)
    }

    /// The process whose coroutine is currently executing, if any.
    #[must_use]
    pub fn active_process(&self) -> Option<Process> {
        self.core.active.borrow().clone()
    }

    /// Schedules an event for processing at `now + delay`.
    ///
    /// Scheduling an event already in the heap is a no-op.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if `delay` is negative or NaN.
    pub fn schedule(
        &self,
        event: &Event,
        priority: Priority,
        delay: f64,
    ) -> Result<(), SimError> {
        self.core.schedule(event, priority, delay)
    }

    /// Processes the next scheduled event.
    ///
    /// Pops the earliest live entry (entries whose event was already
    /// processed are discarded without advancing the clock), advances `now`
    /// to its time, and fans the callbacks in registration order. A
    /// callback error aborts the fan and propagates. After fanning, a
    /// failure outcome that nobody defused is re-raised here.
    ///
    /// # Errors
    ///
    /// [`SimError::EmptyQueue`] when nothing is scheduled; otherwise
    /// whatever a callback raised or an undefused failure outcome.
    pub fn step(&self) -> Result<(), SimError> {
        let entry = loop {
            let entry = self
                .core
                .queue
                .borrow_mut()
                .pop()
                .ok_or(SimError::EmptyQueue)?;
            entry.event.inner.scheduled.set(false);
            if entry.event.processed() {
                trace!(event = %entry.event.id(), "discarding stale entry");
                continue;
            }
            break entry;
        };
        self.core.now.set(entry.time);
        let event = entry.event;
        trace!(now = %entry.time, event = %event.id(), "step");
        self.core.emit(|o| o.on_step(entry.time, &event));

        let callbacks = event.take_callbacks().unwrap_or_default();
        for (_, callback) in callbacks {
            callback(&event)?;
        }

        match event.outcome() {
            Some(Err(error)) if !event.defused() => Err(error),
            _ => Ok(()),
        }
    }

    /// Runs until the queue is exhausted.
    ///
    /// # Errors
    ///
    /// Whatever escapes [`step`](Self::step), except queue exhaustion,
    /// which is normal termination.
    pub fn run(&self) -> Result<Option<Value>, SimError> {
        self.run_loop(None)
    }

    /// Runs until a time is reached or an event is processed.
    ///
    /// With a time bound, a pre-succeeded sentinel is urgent-scheduled at
    /// that time; with an event bound, the stop is attached to the event.
    /// Returns the stopping event's value, or `None` if the queue drained
    /// before an unbounded stop.
    ///
    /// # Errors
    ///
    /// [`SimError::NegativeDelay`] if a time bound is not strictly in the
    /// future; [`SimError::EmptyQueue`] if the queue drains while an event
    /// bound is still pending; the bound event's failure if it fails;
    /// otherwise whatever escapes `step`.
    pub fn run_until(&self, until: impl Into<Until>) -> Result<Option<Value>, SimError> {
        let stop = match until.into() {
            Until::Time(t) => {
                let delay = t - self.now();
                if !(delay > 0.0) {
                    return Err(SimError::NegativeDelay(delay));
                }
                let sentinel = self.event();
                sentinel.set_outcome(Ok(Value::unit()))?;
                self.core.schedule(&sentinel, Priority::Urgent, delay)?;
                sentinel
            }
            Until::Event(event) => {
                if event.processed() {
                    return Ok(event.value());
                }
                event
            }
        };
        stop.add_callback(|event| match event.outcome() {
            Some(Err(error)) => {
                event.defuse();
                Err(error)
            }
            outcome => Err(SimError::StopSimulation(
                outcome.and_then(Result::ok).unwrap_or_else(Value::unit),
            )),
        })?;
        self.run_loop(Some(&stop))
    }

    fn run_loop(&self, until: Option<&Event>) -> Result<Option<Value>, SimError> {
        loop {
            match self.step() {
                Ok(()) => {}
                Err(SimError::StopSimulation(value)) => return Ok(Some(value)),
                Err(SimError::EmptyQueue) => {
                    return match until {
                        Some(stop) if !stop.triggered() => Err(SimError::EmptyQueue),
                        _ => Ok(None),
                    };
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Attaches an observer; hooks fire synchronously from the kernel.
    pub fn attach_observer<O: Observer + 'static>(&self, observer: O) -> ObserverId {
        let id = ObserverId(self.core.next_observer.get());
        self.core.next_observer.set(id.0 + 1);
        self.core
            .observers
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(observer))));
        id
    }

    /// Detaches an observer. Returns false if it was not attached.
    pub fn detach_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.core.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("now", &self.now())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn init() {
        crate::test_utils::init_test_logging();
    }

    #[test]
    fn step_on_empty_queue_errors() {
        init();
        let env = Environment::new();
        assert!(matches!(env.step(), Err(SimError::EmptyQueue)));
    }

    #[test]
    fn clock_is_monotone_across_steps() {
        let env = Environment::new();
        for delay in [5.0, 1.0, 3.0, 1.0] {
            env.timeout(delay).expect("timeout");
        }
        let mut last = env.now();
        while env.step().is_ok() {
            assert!(env.now() >= last);
            last = env.now();
        }
        assert_eq!(env.now(), SimTime::new(5.0));
    }

    #[test]
    fn starting_at_offsets_the_clock() {
        let env = Environment::starting_at(SimTime::new(100.0));
        assert_eq!(env.now(), SimTime::new(100.0));
        env.timeout(5.0).expect("timeout");
        env.run().expect("run");
        assert_eq!(env.now(), SimTime::new(105.0));
    }

    #[test]
    fn peek_reports_next_time() {
        let env = Environment::new();
        assert_eq!(env.peek(), SimTime::INFINITY);
        env.timeout(9.0).expect("timeout");
        env.timeout(4.0).expect("timeout");
        assert_eq!(env.peek(), SimTime::new(4.0));
    }

    #[test]
    fn negative_delay_is_rejected() {
        let env = Environment::new();
        let event = env.event();
        assert!(matches!(
            env.schedule(&event, Priority::Normal, -0.5),
            Err(SimError::NegativeDelay(_))
        ));
    }

    #[test]
    fn fifo_within_a_tick() {
        let env = Environment::new();
        let order = StdRc::new(StdRefCell::new(Vec::new()));
        for tag in 0..4 {
            let event = env.event();
            let order = order.clone();
            event
                .add_callback(move |_| {
                    order.borrow_mut().push(tag);
                    Ok(())
                })
                .expect("register");
            env.schedule(&event, Priority::Normal, 5.0).expect("schedule");
        }
        env.run().expect("run");
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn urgent_fans_before_normal() {
        let env = Environment::new();
        let order = StdRc::new(StdRefCell::new(Vec::new()));
        let normal = env.event();
        {
            let order = order.clone();
            normal
                .add_callback(move |_| {
                    order.borrow_mut().push("normal");
                    Ok(())
                })
                .expect("register");
        }
        let urgent = env.event();
        {
            let order = order.clone();
            urgent
                .add_callback(move |_| {
                    order.borrow_mut().push("urgent");
                    Ok(())
                })
                .expect("register");
        }
        env.schedule(&normal, Priority::Normal, 5.0).expect("schedule");
        env.schedule(&urgent, Priority::Urgent, 5.0).expect("schedule");
        env.run().expect("run");
        assert_eq!(*order.borrow(), vec!["urgent", "normal"]);
    }

    #[test]
    fn undefused_failure_raises_from_step() {
        init();
        let env = Environment::new();
        let event = env.event();
        event.fail(SimError::failure("loud")).expect("fail");
        let result = env.run();
        assert!(matches!(result, Err(SimError::Failure(ref v)) if v.as_str() == Some("loud")));
    }

    #[test]
    fn defused_failure_is_silent() {
        let env = Environment::new();
        let event = env.event();
        event.fail(SimError::failure("quiet")).expect("fail");
        event.defuse();
        env.run().expect("run");
        assert!(event.processed());
    }

    #[test]
    fn callback_error_aborts_the_fan() {
        let env = Environment::new();
        let event = env.event();
        let later = StdRc::new(std::cell::Cell::new(false));
        event
            .add_callback(|_| Err(SimError::failure("abort")))
            .expect("register");
        {
            let later = later.clone();
            event
                .add_callback(move |_| {
                    later.set(true);
                    Ok(())
                })
                .expect("register");
        }
        event.succeed(Value::unit()).expect("trigger");
        assert!(matches!(env.run(), Err(SimError::Failure(_))));
        assert!(!later.get());
    }

    #[test]
    fn run_until_time_stops_early() {
        let env = Environment::new();
        env.timeout(5.0).expect("timeout");
        env.timeout(50.0).expect("timeout");
        env.run_until(10.0).expect("run");
        assert_eq!(env.now(), SimTime::new(10.0));
        // The later timeout is still scheduled.
        assert_eq!(env.peek(), SimTime::new(50.0));
    }

    #[test]
    fn run_until_rejects_past_times() {
        let env = Environment::starting_at(SimTime::new(10.0));
        assert!(matches!(
            env.run_until(10.0),
            Err(SimError::NegativeDelay(_))
        ));
        assert!(matches!(env.run_until(3.0), Err(SimError::NegativeDelay(_))));
    }

    #[test]
    fn run_until_event_returns_its_value() {
        let env = Environment::new();
        let t = env.timeout_with(4.0, "landed").expect("timeout");
        env.timeout(100.0).expect("later");
        let value = env.run_until(&t).expect("run").expect("value");
        assert_eq!(value.as_str(), Some("landed"));
        assert_eq!(env.now(), SimTime::new(4.0));
    }

    #[test]
    fn run_until_processed_event_returns_immediately() {
        let env = Environment::new();
        let t = env.timeout_with(1.0, "early").expect("timeout");
        env.run().expect("run");
        let value = env.run_until(&t).expect("run").expect("value");
        assert_eq!(value.as_str(), Some("early"));
    }

    #[test]
    fn run_until_starved_bound_errors() {
        let env = Environment::new();
        let never = env.event();
        env.timeout(1.0).expect("timeout");
        assert!(matches!(
            env.run_until(&never),
            Err(SimError::EmptyQueue)
        ));
    }

    #[test]
    fn double_schedule_is_ignored() {
        let env = Environment::new();
        let event = env.event();
        env.schedule(&event, Priority::Normal, 1.0).expect("schedule");
        env.schedule(&event, Priority::Normal, 2.0).expect("schedule");
        assert_eq!(env.pending_count(), 1);
    }
}
