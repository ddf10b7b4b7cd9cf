//! Capacity-bounded resources with paired get/put queues.
//!
//! A [`Resource`] is a counting arbiter: `get` acquires units, `put`
//! releases them, and both sides queue FIFO when they cannot proceed. The
//! head of the get queue blocks everyone behind it until enough capacity is
//! free (no overtaking), and symmetrically for puts.
//!
//! Draining happens at construction and at processing. Constructing a
//! request or release drives both queues once, synchronously: the new
//! entry may satisfy immediately, and the units it moves may unblock the
//! counterpart queue before the clock advances. Every get event also
//! carries a callback that re-drives the put queue when it is processed,
//! and every put event one that re-drives the get queue.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::env::Environment;
use crate::error::SimError;
use crate::event::{Event, Waitable};
use crate::types::{ResourceId, Value};

pub(crate) struct ResourceInner {
    env: Weak<crate::env::EnvCore>,
    id: ResourceId,
    capacity: u64,
    users: Cell<u64>,
    get_queue: RefCell<VecDeque<GetResource>>,
    put_queue: RefCell<VecDeque<PutResource>>,
}

/// A capacity-bounded counter arbitrating concurrent acquisition.
///
/// # Example
///
/// ```
/// use eventide::{Environment, Value, Waitable};
///
/// let env = Environment::new();
/// let server = env.resource(1)?;
/// let worker = {
///     let server = server.clone();
///     env.process(move |sim| async move {
///         let req = server.get(1)?;
///         sim.wait(&req).await?;
///         sim.hold(5.0).await?;
///         let rel = server.put(1)?;
///         sim.wait(&rel).await?;
///         Ok(Value::unit())
///     })
/// };
/// env.run()?;
/// assert_eq!(worker.as_event().ok(), Some(true));
/// assert_eq!(server.users(), 0);
/// # Ok::<(), eventide::SimError>(())
/// ```
#[derive(Clone)]
pub struct Resource {
    inner: Rc<ResourceInner>,
}

impl Resource {
    pub(crate) fn new(env: &Environment, capacity: u64) -> Result<Self, SimError> {
        if capacity == 0 {
            return Err(SimError::CapacityViolation(0));
        }
        Ok(Self {
            inner: Rc::new(ResourceInner {
                env: Rc::downgrade(&env.core),
                id: env.core.next_resource_id(),
                capacity,
                users: Cell::new(0),
                get_queue: RefCell::new(VecDeque::new()),
                put_queue: RefCell::new(VecDeque::new()),
            }),
        })
    }

    /// The resource identifier, unique within its environment.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// Total capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Units currently held.
    #[must_use]
    pub fn users(&self) -> u64 {
        self.inner.users.get()
    }

    /// Number of acquisition requests still queued.
    #[must_use]
    pub fn queued_gets(&self) -> usize {
        self.inner.get_queue.borrow().len()
    }

    /// Number of releases still queued.
    #[must_use]
    pub fn queued_puts(&self) -> usize {
        self.inner.put_queue.borrow().len()
    }

    fn env(&self) -> Environment {
        Environment {
            core: self
                .inner
                .env
                .upgrade()
                .expect("environment dropped before its resources"),
        }
    }

    /// Requests `amount` units. The returned request's event triggers once
    /// the units are acquired; waiting on it suspends the calling process
    /// until then.
    ///
    /// # Errors
    ///
    /// [`SimError::CapacityViolation`] if `amount` is zero.
    pub fn get(&self, amount: u64) -> Result<GetResource, SimError> {
        if amount == 0 {
            return Err(SimError::CapacityViolation(0));
        }
        let env = self.env();
        let request = GetResource {
            event: env.event(),
            amount,
            resource: Rc::downgrade(&self.inner),
            requester: env.active_process().map(|p| p.name().to_owned()),
        };
        trace!(
            resource = %self.inner.id,
            event = %request.event.id(),
            amount,
            "get queued"
        );
        self.inner.get_queue.borrow_mut().push_back(request.clone());
        request.event.push_callback({
            let inner = Rc::downgrade(&self.inner);
            move |_| match inner.upgrade() {
                Some(inner) => Resource { inner }.trigger_put(),
                None => Ok(()),
            }
        });
        env.core
            .emit(|o| o.on_resource_requested(env.core.now(), self, amount));
        // Both queues drain at construction: the new request may satisfy
        // immediately, and the units it takes may cover a queued release.
        self.trigger_get()?;
        self.trigger_put()?;
        Ok(request)
    }

    /// Releases `amount` units. The returned release's event triggers once
    /// the units have been returned; a release of more units than are held
    /// queues until enough acquisitions have happened.
    ///
    /// # Errors
    ///
    /// [`SimError::CapacityViolation`] if `amount` is zero.
    pub fn put(&self, amount: u64) -> Result<PutResource, SimError> {
        if amount == 0 {
            return Err(SimError::CapacityViolation(0));
        }
        let env = self.env();
        let release = PutResource {
            event: env.event(),
            amount,
            resource: Rc::downgrade(&self.inner),
        };
        trace!(
            resource = %self.inner.id,
            event = %release.event.id(),
            amount,
            "put queued"
        );
        self.inner.put_queue.borrow_mut().push_back(release.clone());
        release.event.push_callback({
            let inner = Rc::downgrade(&self.inner);
            move |_| match inner.upgrade() {
                Some(inner) => Resource { inner }.trigger_get(),
                None => Ok(()),
            }
        });
        // Both queues drain at construction: the new release may complete
        // immediately, and the units it frees may cover a queued request.
        self.trigger_put()?;
        self.trigger_get()?;
        Ok(release)
    }

    /// Synonym for [`get(1)`](Self::get).
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn request(&self) -> Result<GetResource, SimError> {
        self.get(1)
    }

    /// Synonym for [`put(1)`](Self::put).
    ///
    /// # Errors
    ///
    /// As [`put`](Self::put).
    pub fn release(&self) -> Result<PutResource, SimError> {
        self.put(1)
    }

    /// Walks the get queue from the head, acquiring for each request that
    /// fits. The head blocking stops the walk: FIFO fairness.
    fn trigger_get(&self) -> Result<(), SimError> {
        let mut idx = 0;
        loop {
            let request = self.inner.get_queue.borrow().get(idx).cloned();
            let Some(request) = request else { break };
            let proceed = self.do_get(&request)?;
            if request.event.triggered() {
                let _ = self.inner.get_queue.borrow_mut().remove(idx);
            } else {
                idx += 1;
            }
            if !proceed {
                break;
            }
        }
        Ok(())
    }

    /// Walks the put queue from the head, releasing for each entry whose
    /// amount is covered by the units currently held.
    fn trigger_put(&self) -> Result<(), SimError> {
        let mut idx = 0;
        loop {
            let release = self.inner.put_queue.borrow().get(idx).cloned();
            let Some(release) = release else { break };
            let proceed = self.do_put(&release)?;
            if release.event.triggered() {
                let _ = self.inner.put_queue.borrow_mut().remove(idx);
            } else {
                idx += 1;
            }
            if !proceed {
                break;
            }
        }
        Ok(())
    }

    fn do_get(&self, request: &GetResource) -> Result<bool, SimError> {
        let users = self.inner.users.get();
        if self.inner.capacity - users >= request.amount {
            self.inner.users.set(users + request.amount);
            request.event.succeed(Value::unit())?;
            trace!(
                resource = %self.inner.id,
                users = self.inner.users.get(),
                amount = request.amount,
                "acquired"
            );
            if let Some(core) = self.inner.env.upgrade() {
                core.emit(|o| o.on_resource_acquired(core.now(), self, request.amount));
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn do_put(&self, release: &PutResource) -> Result<bool, SimError> {
        let users = self.inner.users.get();
        if users >= release.amount {
            self.inner.users.set(users - release.amount);
            release.event.succeed(Value::unit())?;
            trace!(
                resource = %self.inner.id,
                users = self.inner.users.get(),
                amount = release.amount,
                "released"
            );
            if let Some(core) = self.inner.env.upgrade() {
                core.emit(|o| o.on_resource_released(core.now(), self, release.amount));
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn cancel_get(&self, request: &GetResource) -> bool {
        let mut queue = self.inner.get_queue.borrow_mut();
        let Some(pos) = queue
            .iter()
            .position(|r| r.event.handle_eq(&request.event))
        else {
            return false;
        };
        let _ = queue.remove(pos);
        trace!(resource = %self.inner.id, event = %request.event.id(), "get cancelled");
        true
    }

    fn cancel_put(&self, release: &PutResource) -> bool {
        let mut queue = self.inner.put_queue.borrow_mut();
        let Some(pos) = queue
            .iter()
            .position(|r| r.event.handle_eq(&release.event))
        else {
            return false;
        };
        let _ = queue.remove(pos);
        trace!(resource = %self.inner.id, event = %release.event.id(), "put cancelled");
        true
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("users", &self.inner.users.get())
            .field("queued_gets", &self.queued_gets())
            .field("queued_puts", &self.queued_puts())
            .finish()
    }
}

/// A pending or granted acquisition of resource units.
#[derive(Clone)]
pub struct GetResource {
    event: Event,
    amount: u64,
    resource: Weak<ResourceInner>,
    requester: Option<String>,
}

impl GetResource {
    /// Units requested.
    #[must_use]
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Name of the process that created the request, if any.
    #[must_use]
    pub fn requester(&self) -> Option<&str> {
        self.requester.as_deref()
    }

    /// Withdraws a still-queued request. Cancelling a granted or already
    /// cancelled request is a no-op; returns whether anything was removed.
    pub fn cancel(&self) -> bool {
        if self.event.triggered() {
            return false;
        }
        let Some(inner) = self.resource.upgrade() else {
            return false;
        };
        Resource { inner }.cancel_get(self)
    }
}

impl Waitable for GetResource {
    fn as_event(&self) -> &Event {
        &self.event
    }
}

impl fmt::Debug for GetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetResource")
            .field("event", &self.event)
            .field("amount", &self.amount)
            .finish()
    }
}

/// A pending or completed release of resource units.
#[derive(Clone)]
pub struct PutResource {
    event: Event,
    amount: u64,
    resource: Weak<ResourceInner>,
}

impl PutResource {
    /// Units released.
    #[must_use]
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Withdraws a still-queued release. Cancelling a completed or already
    /// cancelled release is a no-op; returns whether anything was removed.
    pub fn cancel(&self) -> bool {
        if self.event.triggered() {
            return false;
        }
        let Some(inner) = self.resource.upgrade() else {
            return false;
        };
        Resource { inner }.cancel_put(self)
    }
}

impl Waitable for PutResource {
    fn as_event(&self) -> &Event {
        &self.event
    }
}

impl fmt::Debug for PutResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutResource")
            .field("event", &self.event)
            .field("amount", &self.amount)
            .finish()
    }
}
