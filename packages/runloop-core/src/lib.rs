//! Nested run loops with ordered, coalescing queues of deferred work.
//!
//! Work scheduled while a loop is current is held until that loop ends,
//! then invoked lane by lane in queue registration order. Scheduling the
//! same `(target, id)` again before the flush replaces the pending callback
//! instead of adding another.
//!
//! ```
//! use runloop_core::{DeferQueue, Scheduler, Target};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let scheduler = Scheduler::new(DeferQueue::new());
//! let widget = Target::new("widget");
//! let renders = Rc::new(Cell::new(0));
//!
//! scheduler
//!     .run(|| {
//!         for _ in 0..3 {
//!             let renders = renders.clone();
//!             scheduler.schedule_once("sync", Some(widget.clone()), Some("render"), move |_| {
//!                 renders.set(renders.get() + 1);
//!                 Ok(())
//!             })?;
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(renders.get(), 1);
//! ```

pub mod config;
pub mod context;
pub mod defer;
pub mod error;
pub mod observer;
pub mod queue;
pub mod run_loop;
pub mod scheduler;
pub mod target;

/// The host capability the scheduler needs for autorun: run `task` once,
/// soon, after the current synchronous work yields, on the same thread.
///
/// Backed by whatever the host has (an animation-frame callback, a timer,
/// an executor's local task queue). The scheduler never branches on which.
pub trait Defer {
    fn defer(&self, task: Box<dyn FnOnce()>);
}

pub use config::SchedulerConfig;
#[cfg(feature = "tokio")]
pub use defer::TokioLocalDefer;
pub use defer::DeferQueue;
pub use error::{CallbackError, RunLoopError};
pub use observer::{LoopEvent, ObserverId};
pub use queue::QueueName;
pub use run_loop::{LoopId, LoopState, RunLoop};
pub use scheduler::Scheduler;
pub use target::{Callback, MethodFn, Methods, Target};
