use crate::run_loop::LoopId;
use crate::scheduler::Scheduler;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;

new_key_type! {
    pub struct ObserverId;
}

/// Lifecycle notification emitted by a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// The loop has just become current. Work scheduled from the observer
    /// lands in it.
    Created { id: LoopId, depth: usize },
    /// The loop has been flushed and popped. Also sent when its flush failed.
    Ended { id: LoopId, depth: usize },
}

impl LoopEvent {
    pub fn id(&self) -> LoopId {
        match *self {
            LoopEvent::Created { id, .. } | LoopEvent::Ended { id, .. } => id,
        }
    }

    /// Nesting depth of the loop, 1 for an outermost loop.
    pub fn depth(&self) -> usize {
        match *self {
            LoopEvent::Created { depth, .. } | LoopEvent::Ended { depth, .. } => depth,
        }
    }
}

pub type ObserverFn = Rc<dyn Fn(&Scheduler, &LoopEvent)>;

#[derive(Default)]
pub(crate) struct Observers {
    slots: RefCell<SlotMap<ObserverId, ObserverFn>>,
}

impl Observers {
    pub fn insert(&self, observer: ObserverFn) -> ObserverId {
        self.slots.borrow_mut().insert(observer)
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        self.slots.borrow_mut().remove(id).is_some()
    }

    // Observers may register or drop observers while being notified, so the
    // list is copied out before any of them runs.
    pub fn notify(&self, scheduler: &Scheduler, event: &LoopEvent) {
        let observers: SmallVec<[ObserverFn; 4]> = self.slots.borrow().values().cloned().collect();
        for observer in observers {
            observer(scheduler, event);
        }
    }
}
