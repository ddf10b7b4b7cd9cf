//! Dynamically typed event payloads.
//!
//! Events carry values of arbitrary types: a timeout may deliver `()`, a
//! process may return a domain struct, a condition delivers a map of child
//! outcomes. [`Value`] erases the payload type behind a cheap shared handle
//! and remembers the payload's type name for diagnostics.
//!
//! The kernel is strictly single-threaded cooperative, so the handle is an
//! `Rc`, not an `Arc`.

use core::fmt;
use std::any::Any;
use std::rc::Rc;

/// A shared, dynamically typed payload.
///
/// Cloning a `Value` clones the handle, not the payload. Two clones of the
/// same `Value` compare equal under [`handle_eq`](Self::handle_eq).
///
/// # Example
///
/// ```
/// use eventide::Value;
///
/// let v = Value::new(42_u32);
/// assert_eq!(v.downcast_ref::<u32>(), Some(&42));
/// assert!(v.downcast_ref::<String>().is_none());
/// ```
#[derive(Clone)]
pub struct Value {
    payload: Rc<dyn Any>,
    type_name: &'static str,
}

impl Value {
    /// Wraps an arbitrary payload.
    #[must_use]
    pub fn new<T: 'static>(payload: T) -> Self {
        Self {
            payload: Rc::new(payload),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The unit payload, used by events that carry no data.
    #[must_use]
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Returns true if the payload is `()`.
    #[must_use]
    pub fn is_unit(&self) -> bool {
        self.is::<()>()
    }

    /// Returns true if the payload has type `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.payload.is::<T>()
    }

    /// Borrows the payload as `T`, if that is its type.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    /// The type name captured when the payload was wrapped.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns true if both handles point at the same payload.
    #[must_use]
    pub fn handle_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.payload, &other.payload)
    }

    /// Borrows a string payload (`&str` or `String`), if present.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        if let Some(s) = self.downcast_ref::<&'static str>() {
            Some(s)
        } else if let Some(s) = self.downcast_ref::<String>() {
            Some(s.as_str())
        } else {
            None
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "Value({s:?})")
        } else if self.is_unit() {
            write!(f, "Value(())")
        } else {
            write!(f, "Value(<{}>)", self.type_name)
        }
    }
}

/// Renders common payload types directly; everything else by type name.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else if self.is_unit() {
            write!(f, "()")
        } else if let Some(n) = self.downcast_ref::<i64>() {
            write!(f, "{n}")
        } else if let Some(n) = self.downcast_ref::<u64>() {
            write!(f, "{n}")
        } else if let Some(n) = self.downcast_ref::<f64>() {
            write!(f, "{n}")
        } else if let Some(b) = self.downcast_ref::<bool>() {
            write!(f, "{b}")
        } else {
            write!(f, "<{}>", self.type_name)
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::unit()
    }
}

impl From<&'static str> for Value {
    fn from(s: &'static str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::new(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::new(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::new(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::new(b)
    }
}
