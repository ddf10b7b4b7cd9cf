//! Resource accounting oracle.
//!
//! [`ResourceAudit`] replays resource events against the accounting
//! invariant: for every resource, the units held equal acquired minus
//! released and stay within `0 ..= capacity` at every observation. Attach
//! a clone during a test run and call [`check`](ResourceAudit::check) at
//! the end.

use core::fmt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::observe::Observer;
use crate::resource::Resource;
use crate::types::{ResourceId, SimTime};

/// A detected violation of the resource accounting invariant.
#[derive(Debug, Clone)]
pub struct AuditViolation {
    /// The offending resource.
    pub resource: ResourceId,
    /// When the violation was observed.
    pub time: SimTime,
    /// Units the kernel reported held.
    pub reported: u64,
    /// Units the audit's own ledger expected.
    pub expected: i64,
    /// Capacity of the resource.
    pub capacity: u64,
}

impl fmt::Display for AuditViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resource {} at t={}: reported {} units held, ledger expected {} (capacity {})",
            self.resource, self.time, self.reported, self.expected, self.capacity
        )
    }
}

impl std::error::Error for AuditViolation {}

#[derive(Default)]
struct Ledger {
    capacity: u64,
    acquired: u64,
    released: u64,
}

impl Ledger {
    fn held(&self) -> i64 {
        self.acquired as i64 - self.released as i64
    }
}

#[derive(Default)]
struct AuditInner {
    ledgers: HashMap<ResourceId, Ledger>,
    violations: Vec<AuditViolation>,
}

/// An observer verifying resource conservation and capacity bounds.
///
/// Clones share their ledger: attach one clone to the environment and keep
/// another to query after the run.
///
/// # Example
///
/// ```
/// use eventide::{Environment, ResourceAudit};
///
/// let env = Environment::new();
/// let audit = ResourceAudit::new();
/// env.attach_observer(audit.clone());
///
/// let res = env.resource(2)?;
/// res.get(1)?;
/// res.put(1)?;
/// env.run()?;
/// audit.check()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone, Default)]
pub struct ResourceAudit {
    inner: Rc<RefCell<AuditInner>>,
}

impl ResourceAudit {
    /// Creates an audit with an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Violations observed so far.
    #[must_use]
    pub fn violations(&self) -> Vec<AuditViolation> {
        self.inner.borrow().violations.clone()
    }

    /// Returns the first violation, if any was observed.
    ///
    /// # Errors
    ///
    /// The first [`AuditViolation`] recorded during the run.
    pub fn check(&self) -> Result<(), AuditViolation> {
        match self.inner.borrow().violations.first() {
            Some(violation) => Err(violation.clone()),
            None => Ok(()),
        }
    }

    fn record(&self, now: SimTime, resource: &Resource, acquired: u64, released: u64) {
        let mut inner = self.inner.borrow_mut();
        let ledger = inner.ledgers.entry(resource.id()).or_default();
        ledger.capacity = resource.capacity();
        ledger.acquired += acquired;
        ledger.released += released;

        let reported = resource.users();
        let expected = ledger.held();
        let capacity = ledger.capacity;
        let in_bounds = expected >= 0 && expected <= capacity as i64;
        let mismatch = i64::try_from(reported).map_or(true, |r| r != expected);
        if mismatch || !in_bounds {
            inner.violations.push(AuditViolation {
                resource: resource.id(),
                time: now,
                reported,
                expected,
                capacity,
            });
        }
    }
}

impl Observer for ResourceAudit {
    fn on_resource_acquired(&mut self, now: SimTime, resource: &Resource, amount: u64) {
        self.record(now, resource, amount, 0);
    }

    fn on_resource_released(&mut self, now: SimTime, resource: &Resource, amount: u64) {
        self.record(now, resource, 0, amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Environment, Value};

    #[test]
    fn clean_run_passes() {
        let env = Environment::new();
        let audit = ResourceAudit::new();
        env.attach_observer(audit.clone());

        let res = env.resource(2).expect("resource");
        let res2 = res.clone();
        env.process(move |sim| async move {
            let req = res2.get(2)?;
            sim.wait(&req).await?;
            sim.hold(3.0).await?;
            let rel = res2.put(2)?;
            sim.wait(&rel).await?;
            Ok(Value::unit())
        });
        env.run().expect("run");

        audit.check().expect("no violations");
        assert!(audit.violations().is_empty());
    }

    #[test]
    fn contended_run_balances() {
        let env = Environment::new();
        let audit = ResourceAudit::new();
        env.attach_observer(audit.clone());

        let res = env.resource(1).expect("resource");
        for _ in 0..3 {
            let res = res.clone();
            env.process(move |sim| async move {
                let req = res.get(1)?;
                sim.wait(&req).await?;
                sim.hold(2.0).await?;
                let rel = res.put(1)?;
                sim.wait(&rel).await?;
                Ok(Value::unit())
            });
        }
        env.run().expect("run");

        audit.check().expect("no violations");
        assert_eq!(res.users(), 0);
    }

    #[test]
    fn violation_reports_the_ledger() {
        let violation = AuditViolation {
            resource: ResourceId(3),
            time: SimTime::new(4.0),
            reported: 5,
            expected: 2,
            capacity: 4,
        };
        let text = violation.to_string();
        assert!(text.contains("R3"));
        assert!(text.contains("reported 5"));
    }
}
