//! Instrumentation hooks.
//!
//! An [`Observer`] receives synchronous callbacks at the kernel's notable
//! points: scheduling, triggering, stepping, process lifecycle, and
//! resource arbitration. Every hook has an empty default body, so an
//! observer implements only the subset it cares about.
//!
//! Observers are passive. A panicking observer is caught and logged; an
//! observer that re-enters the kernel deeply enough to need itself again is
//! skipped for that hook. Neither can perturb the simulation.
//!
//! - [`trace`]: records a serializable trace of the run, JSONL-exportable
//! - [`audit`]: replays resource events against the accounting invariant

pub mod audit;
pub mod trace;

use crate::error::SimError;
use crate::event::Event;
use crate::process::Process;
use crate::resource::Resource;
use crate::types::{Priority, SimTime};

/// Token returned by [`attach_observer`](crate::Environment::attach_observer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Synchronous instrumentation hooks invoked by the kernel.
#[allow(unused_variables)]
pub trait Observer {
    /// An event was pushed onto the heap for time `at`.
    fn on_event_scheduled(&mut self, now: SimTime, event: &Event, at: SimTime, priority: Priority) {
    }

    /// An event was triggered with a success outcome.
    fn on_event_succeeded(&mut self, now: SimTime, event: &Event) {}

    /// An event was triggered with a failure outcome.
    fn on_event_failed(&mut self, now: SimTime, event: &Event, error: &SimError) {}

    /// The clock advanced to `now` and `event` is about to fan.
    fn on_step(&mut self, now: SimTime, event: &Event) {}

    /// A process's coroutine executed for the first time.
    fn on_process_started(&mut self, now: SimTime, process: &Process) {}

    /// A process suspended waiting on `event`.
    fn on_process_yielded(&mut self, now: SimTime, process: &Process, event: &Event) {}

    /// A process's coroutine settled (returned or errored).
    fn on_process_completed(&mut self, now: SimTime, process: &Process) {}

    /// An interrupt was scheduled against a live process.
    fn on_process_interrupted(&mut self, now: SimTime, process: &Process) {}

    /// A request for `amount` units was enqueued.
    fn on_resource_requested(&mut self, now: SimTime, resource: &Resource, amount: u64) {}

    /// `amount` units were acquired.
    fn on_resource_acquired(&mut self, now: SimTime, resource: &Resource, amount: u64) {}

    /// `amount` units were released.
    fn on_resource_released(&mut self, now: SimTime, resource: &Resource, amount: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Environment, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        hooks: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Observer for Recorder {
        fn on_event_scheduled(
            &mut self,
            _now: SimTime,
            _event: &Event,
            _at: SimTime,
            _priority: Priority,
        ) {
            self.hooks.borrow_mut().push("scheduled");
        }

        fn on_event_succeeded(&mut self, _now: SimTime, _event: &Event) {
            self.hooks.borrow_mut().push("succeeded");
        }

        fn on_step(&mut self, _now: SimTime, _event: &Event) {
            self.hooks.borrow_mut().push("step");
        }
    }

    #[test]
    fn hooks_fire_in_kernel_order() {
        let env = Environment::new();
        let hooks = Rc::new(RefCell::new(Vec::new()));
        env.attach_observer(Recorder {
            hooks: hooks.clone(),
        });

        let event = env.event();
        event.succeed(Value::unit()).expect("trigger");
        env.run().expect("run");

        assert_eq!(*hooks.borrow(), vec!["succeeded", "scheduled", "step"]);
    }

    #[test]
    fn detached_observers_fall_silent() {
        let env = Environment::new();
        let hooks = Rc::new(RefCell::new(Vec::new()));
        let id = env.attach_observer(Recorder {
            hooks: hooks.clone(),
        });
        assert!(env.detach_observer(id));
        assert!(!env.detach_observer(id));

        let event = env.event();
        event.succeed(Value::unit()).expect("trigger");
        env.run().expect("run");
        assert!(hooks.borrow().is_empty());
    }

    struct Panicker;

    impl Observer for Panicker {
        fn on_step(&mut self, _now: SimTime, _event: &Event) {
            panic!("observer misbehaved");
        }
    }

    #[test]
    fn panicking_observer_is_swallowed() {
        let env = Environment::new();
        env.attach_observer(Panicker);
        env.timeout(1.0).expect("timeout");
        env.run().expect("run survives observer panic");
        assert_eq!(env.now(), crate::SimTime::new(1.0));
    }
}
