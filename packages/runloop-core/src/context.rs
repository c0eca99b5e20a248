//! Thread-local default scheduler.
//!
//! Libraries that cannot thread a `Scheduler` through every call site can
//! schedule against the one installed here. Tests should keep creating
//! their own instances instead.

use crate::error::{CallbackError, Result, RunLoopError};
use crate::queue::QueueName;
use crate::scheduler::Scheduler;
use crate::target::Target;
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static DEFAULT: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

/// Installs `scheduler` as this thread's default, returning the previous one.
pub fn install(scheduler: Rc<Scheduler>) -> Option<Rc<Scheduler>> {
    DEFAULT.with(|d| d.borrow_mut().replace(scheduler))
}

pub fn uninstall() -> Option<Rc<Scheduler>> {
    DEFAULT.with(|d| d.borrow_mut().take())
}

pub fn default_scheduler() -> Option<Rc<Scheduler>> {
    DEFAULT.with(|d| d.borrow().clone())
}

/// Calls `f` with the default scheduler. The thread-local is not borrowed
/// while `f` runs, so `f` may install or uninstall schedulers.
pub fn with_default<F, R>(f: F) -> Result<R>
where
    F: FnOnce(&Scheduler) -> Result<R>,
{
    let scheduler = default_scheduler()
        .ok_or(RunLoopError::InvalidState("no default scheduler installed on this thread"))?;
    f(&scheduler)
}

pub fn run<R>(f: impl FnOnce() -> Result<R, CallbackError>) -> Result<R> {
    with_default(|s| s.run(f))
}

pub fn schedule_once(
    queue: &str,
    target: Option<Target>,
    id: Option<&str>,
    method: impl FnOnce(Option<&Target>) -> Result<(), CallbackError> + 'static,
) -> Result<()> {
    with_default(|s| s.schedule_once(queue, target, id, method))
}

pub fn add_queue(name: impl Into<QueueName>) -> Result<bool> {
    with_default(|s| Ok(s.add_queue(name)))
}
