use crate::error::{CallbackError, Result, RunLoopError};
use std::any::{Any, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Opaque receiver of a scheduled callback.
///
/// Targets compare by identity: two handles are equal only when they point
/// at the same allocation, whatever the value inside looks like.
#[derive(Clone)]
pub struct Target(Rc<dyn Any>);

impl Target {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// Wraps an existing shared value without reallocating, so the caller's
    /// `Rc` and the returned target share one identity.
    pub fn from_rc<T: Any>(value: Rc<T>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.0).downcast_ref::<T>()
    }

    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        Rc::clone(&self.0).downcast::<T>().ok()
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.addr(), other.addr())
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({:p})", self.addr())
    }
}

impl<T: Any> From<Rc<T>> for Target {
    fn from(value: Rc<T>) -> Self {
        Self::from_rc(value)
    }
}

/// A pending invocation. Receives the entry's target, or `None` for unbound calls.
pub type Callback = Box<dyn FnOnce(Option<&Target>) -> Result<(), CallbackError>>;

/// Method signature for targets that expose callbacks by name.
pub type MethodFn<T> = fn(&T) -> Result<(), CallbackError>;

/// Name-based method table for a target type.
///
/// Lets call sites schedule `"render"` against a target instead of building
/// a closure, in the same way UI bindings name the operation they coalesce.
pub trait Methods: Any + Sized {
    fn method(name: &str) -> Option<MethodFn<Self>>;
}

/// Resolves `name` on `T`, failing with `InvalidArgument` when the type has
/// no such method.
pub(crate) fn resolve<T: Methods>(name: &str) -> Result<MethodFn<T>> {
    T::method(name).ok_or_else(|| {
        RunLoopError::InvalidArgument(format!(
            "`{name}` is not a callable method of `{}`",
            type_name::<T>()
        ))
    })
}
