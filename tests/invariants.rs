//! Property-based checks of the kernel invariants.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::collection::vec;
use proptest::prelude::*;

use eventide::{Environment, Priority, ResourceAudit, SimError, Waitable};

proptest! {
    /// The clock never decreases across steps, and every live entry fans.
    #[test]
    fn clock_is_monotone(delays in vec(0.0f64..1000.0, 1..40)) {
        let env = Environment::new();
        for &delay in &delays {
            env.timeout(delay).unwrap();
        }

        let mut last = env.now();
        let mut fanned = 0_usize;
        loop {
            match env.step() {
                Ok(()) => {
                    prop_assert!(env.now() >= last);
                    last = env.now();
                    fanned += 1;
                }
                Err(SimError::EmptyQueue) => break,
                Err(error) => panic!("unexpected error: {error}"),
            }
        }
        prop_assert_eq!(fanned, delays.len());
    }

    /// Events scheduled at one `(time, priority)` fan in schedule order.
    #[test]
    fn fifo_within_a_tick(count in 1_usize..30, delay in 0.0f64..100.0) {
        let env = Environment::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..count {
            let event = env.event();
            let order = order.clone();
            event.add_callback(move |_| {
                order.borrow_mut().push(tag);
                Ok(())
            }).unwrap();
            env.schedule(&event, Priority::Normal, delay).unwrap();
        }
        env.run().unwrap();
        prop_assert_eq!(&*order.borrow(), &(0..count).collect::<Vec<_>>());
    }

    /// At one instant, every urgent event fans before any normal one, and
    /// schedule order is preserved within each class.
    #[test]
    fn urgent_precedes_normal(classes in vec(any::<bool>(), 1..30)) {
        let env = Environment::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (tag, &urgent) in classes.iter().enumerate() {
            let event = env.event();
            let order = order.clone();
            event.add_callback(move |_| {
                order.borrow_mut().push((urgent, tag));
                Ok(())
            }).unwrap();
            let priority = if urgent { Priority::Urgent } else { Priority::Normal };
            env.schedule(&event, priority, 5.0).unwrap();
        }
        env.run().unwrap();

        let order = order.borrow();
        prop_assert_eq!(order.len(), classes.len());
        // No urgent entry fans after a normal one.
        prop_assert!(order.windows(2).all(|w| !(( !w[0].0) && w[1].0)));
        // Within each class, schedule order is fan order.
        for class in [true, false] {
            let tags: Vec<usize> = order.iter().filter(|(u, _)| *u == class).map(|(_, t)| *t).collect();
            prop_assert!(tags.windows(2).all(|w| w[0] < w[1]));
        }
    }

    /// Acquired minus released equals held, within `0..=capacity`, at
    /// every observation point and at the end.
    #[test]
    fn resource_accounting_balances(ops in vec((any::<bool>(), 1_u64..4), 0..60)) {
        let env = Environment::new();
        let audit = ResourceAudit::new();
        env.attach_observer(audit.clone());

        let resource = env.resource(5).unwrap();
        for &(is_get, amount) in &ops {
            if is_get {
                resource.get(amount).unwrap();
            } else {
                resource.put(amount).unwrap();
            }
        }
        env.run().unwrap();

        prop_assert!(audit.check().is_ok(), "audit: {:?}", audit.violations());
        prop_assert!(resource.users() <= resource.capacity());
    }

    /// Once capacity frees up, grants form a prefix of the wait queue: the
    /// head is never overtaken.
    #[test]
    fn grants_are_a_queue_prefix(amounts in vec(1_u64..4, 1..20)) {
        let env = Environment::new();
        let resource = env.resource(3).unwrap();

        // Saturate, queue the contenders, then free everything at once.
        let holder = resource.get(3).unwrap();
        prop_assert!(holder.as_event().triggered());
        let requests: Vec<_> = amounts
            .iter()
            .map(|&amount| resource.get(amount).unwrap())
            .collect();
        resource.put(3).unwrap();
        env.run().unwrap();

        let granted: Vec<bool> = requests
            .iter()
            .map(|r| r.as_event().triggered())
            .collect();
        let boundary = granted.iter().filter(|&&g| g).count();
        // Granted requests are exactly the leading ones.
        prop_assert!(granted[..boundary].iter().all(|&g| g));
        prop_assert!(granted[boundary..].iter().all(|&g| !g));

        let granted_sum: u64 = amounts[..boundary].iter().sum();
        prop_assert!(granted_sum <= 3);
        if boundary < amounts.len() {
            prop_assert!(granted_sum + amounts[boundary] > 3);
        }
    }
}
