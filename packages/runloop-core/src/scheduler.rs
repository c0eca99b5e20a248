use crate::Defer;
use crate::config::SchedulerConfig;
use crate::error::{CallbackError, Result, RunLoopError};
use crate::observer::{LoopEvent, ObserverId, Observers};
use crate::queue::QueueName;
use crate::run_loop::{Carried, LoopId, RunLoop, entry_key, invoke_lane};
use crate::target::{Methods, Target, resolve};
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, error, trace, warn};

const MISSING_LOOP: RunLoopError =
    RunLoopError::InvalidState("current run loop is missing from the stack");

/// Owns the stack of run loops and the global queue order.
///
/// Single-threaded: share it through `Rc` and call it from callbacks freely.
/// No internal borrow is held while user code runs, so callbacks may nest
/// `run`, schedule more work, or begin loops of their own.
pub struct Scheduler {
    this: Weak<Scheduler>,
    queues: RefCell<SmallVec<[QueueName; 4]>>,
    loops: RefCell<SlotMap<LoopId, RunLoop>>,
    current: Cell<Option<LoopId>>,
    autorun_armed: Cell<bool>,
    autorun: bool,
    defer: Box<dyn Defer>,
    observers: Observers,
}

impl Scheduler {
    pub fn new(defer: impl Defer + 'static) -> Rc<Self> {
        Self::with_config(SchedulerConfig::default(), defer)
    }

    pub fn with_config(config: SchedulerConfig, defer: impl Defer + 'static) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            queues: RefCell::new(config.queue_order()),
            loops: RefCell::new(SlotMap::with_key()),
            current: Cell::new(None),
            autorun_armed: Cell::new(false),
            autorun: config.autorun,
            defer: Box::new(defer),
            observers: Observers::default(),
        })
    }

    /// Appends a lane to the flush order. Loops created from now on flush it
    /// after every existing lane. Returns `false` if the name was already known.
    pub fn add_queue(&self, name: impl Into<QueueName>) -> bool {
        let name = name.into();
        let mut queues = self.queues.borrow_mut();
        if queues.contains(&name) {
            return false;
        }
        debug!(queue = %name, position = queues.len(), "registered queue");
        queues.push(name);
        true
    }

    pub fn queues(&self) -> Vec<QueueName> {
        self.queues.borrow().to_vec()
    }

    pub fn current(&self) -> Option<LoopId> {
        self.current.get()
    }

    pub fn is_running(&self) -> bool {
        self.current.get().is_some()
    }

    /// Number of loops on the stack.
    pub fn depth(&self) -> usize {
        self.current
            .get()
            .and_then(|id| self.with_loop(id, RunLoop::depth))
            .unwrap_or(0)
    }

    pub fn is_autorun_armed(&self) -> bool {
        self.autorun_armed.get()
    }

    /// Entries waiting in the current loop.
    pub fn pending(&self) -> usize {
        self.current
            .get()
            .and_then(|id| self.with_loop(id, RunLoop::len))
            .unwrap_or(0)
    }

    /// The loop that was current when `id` began, or `None` for the outermost
    /// loop and for ids no longer on the stack.
    pub fn prev(&self, id: LoopId) -> Option<LoopId> {
        self.with_loop(id, RunLoop::prev).flatten()
    }

    /// Calls `f` with the loop `id` while it is still on the stack.
    ///
    /// The stack is borrowed for the duration of `f`, so `f` must not call
    /// back into this scheduler.
    pub fn with_loop<R>(&self, id: LoopId, f: impl FnOnce(&RunLoop) -> R) -> Option<R> {
        self.loops.borrow().get(id).map(f)
    }

    pub fn observe(&self, observer: impl Fn(&Scheduler, &LoopEvent) + 'static) -> ObserverId {
        self.observers.insert(Rc::new(observer))
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Pushes a fresh loop and makes it current.
    pub fn begin(&self) -> LoopId {
        let prev = self.current.get();
        let order = self.queues.borrow().clone();
        let (id, depth) = {
            let mut loops = self.loops.borrow_mut();
            let depth = prev.and_then(|p| loops.get(p)).map_or(0, RunLoop::depth) + 1;
            (loops.insert(RunLoop::new(prev, depth, order)), depth)
        };
        self.current.set(Some(id));

        debug!(?id, depth, "run loop begin");
        self.observers
            .notify(self, &LoopEvent::Created { id, depth });
        id
    }

    /// Flushes the current loop, then pops it.
    ///
    /// The loop stays current while it flushes. Work its callbacks schedule
    /// into a lane the flush has not reached yet runs in this pass; work for
    /// a lane already drained moves to the predecessor once the loop is
    /// popped, or to a new autorun loop when there is none.
    pub fn end(&self) -> Result<()> {
        let id = self
            .current
            .get()
            .ok_or(RunLoopError::InvalidState("end() called with no active run loop"))?;
        let depth = {
            let mut loops = self.loops.borrow_mut();
            let run_loop = loops.get_mut(id).ok_or(MISSING_LOOP)?;
            run_loop.begin_flush()?;
            debug!(?id, depth = run_loop.depth(), pending = run_loop.len(), "run loop end");
            run_loop.depth()
        };

        let guard = UnwindGuard { scheduler: self, id };
        let mut result = self.drain(id);
        let closed = self.end_above(id);
        drop(guard);
        if result.is_ok() {
            result = closed;
        }

        let removed = self.loops.borrow_mut().remove(id);
        let mut run_loop = removed.ok_or(MISSING_LOOP)?;
        self.current.set(run_loop.prev());
        let carried = run_loop.take_carried();
        drop(run_loop.discard());

        if let Err(err) = &result {
            debug!(?id, error = %err, "run loop flush aborted");
        }
        self.observers.notify(self, &LoopEvent::Ended { id, depth });

        let forwarded = self.forward(carried);
        if let (Err(_), Err(err)) = (&result, &forwarded) {
            warn!(error = %err, "follow-up pass failed after an aborted flush");
        }
        result.and(forwarded)
    }

    // Drains the lanes of `id` in order. Each lane is taken when the flush
    // reaches it and no borrow is held while its callbacks run.
    fn drain(&self, id: LoopId) -> Result<()> {
        loop {
            let lane = self.loops.borrow_mut().get_mut(id).and_then(RunLoop::next_lane);
            let Some((name, entries)) = lane else { return Ok(()) };
            invoke_lane(&name, entries).map_err(RunLoopError::Callback)?;
        }
    }

    // Hands work set aside by a popped loop to the loop that follows it.
    fn forward(&self, carried: Carried) -> Result<()> {
        if carried.is_empty() {
            return Ok(());
        }
        if self.current.get().is_none() && !self.autorun {
            // Without autorun nothing would pick the work up later.
            trace!("running set-aside work in a follow-up pass");
            let id = self.begin();
            self.absorb(id, carried);
            return self.end();
        }
        self.autorun()?;
        let id = self.current.get().ok_or(MISSING_LOOP)?;
        self.absorb(id, carried);
        Ok(())
    }

    fn absorb(&self, id: LoopId, carried: Carried) {
        let displaced = self
            .loops
            .borrow_mut()
            .get_mut(id)
            .map(|run_loop| run_loop.absorb(carried));
        drop(displaced);
    }

    /// Runs `f` inside a new loop and flushes that loop before returning.
    ///
    /// The loop is ended on every exit path. If both `f` and the flush fail,
    /// the error from `f` is returned and the flush error is logged.
    pub fn run<R>(&self, f: impl FnOnce() -> Result<R, CallbackError>) -> Result<R> {
        let id = self.begin();
        let guard = UnwindGuard { scheduler: self, id };
        let outcome = f();
        let flushed = self.end_through(id);
        drop(guard);

        match (outcome, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(RunLoopError::Callback(err)),
            (Err(err), Err(flush_err)) => {
                error!(error = %flush_err, "flush failed after run callback error; keeping the callback error");
                Err(RunLoopError::Callback(err))
            }
        }
    }

    /// Like [`run`](Self::run), with `target` handed to `f` as its receiver.
    pub fn run_with<R>(
        &self,
        target: &Target,
        f: impl FnOnce(&Target) -> Result<R, CallbackError>,
    ) -> Result<R> {
        self.run(|| f(target))
    }

    /// Runs the method called `name` on `target` inside a new loop.
    pub fn run_named<T: Methods>(&self, target: &Rc<T>, name: &str) -> Result<()> {
        let method = resolve::<T>(name)?;
        self.run(|| method(target))
    }

    /// Schedules `method` into `queue`, collapsing it with any pending entry
    /// for the same `target` and `id` in the current loop.
    ///
    /// Outside any loop this starts an autorun loop that the deferred-callback
    /// capability flushes on the next turn.
    pub fn schedule_once(
        &self,
        queue: &str,
        target: Option<Target>,
        id: Option<&str>,
        method: impl FnOnce(Option<&Target>) -> Result<(), CallbackError> + 'static,
    ) -> Result<()> {
        self.autorun()?;
        let current = self
            .current
            .get()
            .ok_or(RunLoopError::InvalidState("no run loop is active"))?;

        // A coalesced entry gives back the callback it replaced. It is dropped
        // only after the stack borrow ends, since its captures may schedule.
        let displaced = {
            let mut loops = self.loops.borrow_mut();
            let run_loop = loops.get_mut(current).ok_or(MISSING_LOOP)?;
            let pos = run_loop.accepting(queue)?;
            run_loop.place(pos, entry_key(target, id), Box::new(method))
        };
        drop(displaced);
        Ok(())
    }

    /// Schedules the method called `name` on `target`.
    pub fn schedule_named<T: Methods>(
        &self,
        queue: &str,
        target: &Rc<T>,
        id: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let method = resolve::<T>(name)?;
        let receiver = Rc::clone(target);
        self.schedule_once(queue, Some(Target::from_rc(Rc::clone(target))), id, move |_| {
            method(&receiver)
        })
    }

    /// Ensures a loop is current, arming at most one deferred flush.
    pub fn autorun(&self) -> Result<()> {
        if self.current.get().is_some() {
            return Ok(());
        }
        if !self.autorun {
            return Err(RunLoopError::InvalidState(
                "no run loop is active and autorun is disabled",
            ));
        }

        self.begin();
        if !self.autorun_armed.replace(true) {
            debug!("arming autorun flush");
            let this = self.this.clone();
            self.defer.defer(Box::new(move || {
                if let Some(scheduler) = this.upgrade() {
                    scheduler.fire_autorun();
                }
            }));
        }
        Ok(())
    }

    fn fire_autorun(&self) {
        self.autorun_armed.set(false);
        if self.current.get().is_none() {
            trace!("autorun fired with no active run loop");
            return;
        }
        debug!("autorun flush");
        if let Err(err) = self.end() {
            error!(error = %err, "autorun flush failed");
        }
    }

    fn contains(&self, id: LoopId) -> bool {
        self.loops.borrow().contains_key(id)
    }

    // Ends loops until `id` itself has been ended, flushing any loop a
    // callback began and left open.
    fn end_through(&self, id: LoopId) -> Result<()> {
        let mut first_err = None;
        while self.contains(id) {
            if self.current.get() != Some(id) {
                warn!(?id, "run callback left a nested run loop open; ending it");
            }
            if let Err(err) = self.end() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // Ends the loops a flush callback began on top of `id` and left open.
    fn end_above(&self, id: LoopId) -> Result<()> {
        let mut first_err = None;
        while self.contains(id) && self.current.get() != Some(id) {
            warn!(?id, "flush callback left a nested run loop open; ending it");
            if let Err(err) = self.end() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // Pops loops down to and including `id` without flushing them.
    fn discard_through(&self, id: LoopId) {
        while self.contains(id) {
            let Some(current) = self.current.get() else { return };
            let removed = self.loops.borrow_mut().remove(current);
            let Some(run_loop) = removed else { return };
            warn!(id = ?current, pending = run_loop.len(), "discarding run loop after panic");
            self.current.set(run_loop.prev());
        }
    }
}

/// Restores the loop stack when a callback panics.
struct UnwindGuard<'a> {
    scheduler: &'a Scheduler,
    id: LoopId,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.scheduler.discard_through(self.id);
        }
    }
}
