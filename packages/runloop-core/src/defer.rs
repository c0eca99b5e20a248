use crate::Defer;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A FIFO of deferred tasks pumped by the host.
///
/// Suits hosts that already own an event loop (a windowing loop, a test)
/// and can call [`DeferQueue::run_pending`] once per turn.
#[derive(Default)]
pub struct DeferQueue {
    queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl DeferQueue {
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub fn push(&self, task: Box<dyn FnOnce()>) {
        self.queue.borrow_mut().push_back(task);
    }

    pub fn pop(&self) -> Option<Box<dyn FnOnce()>> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs the tasks that were queued when the call started and returns how
    /// many ran. Tasks deferred by those tasks wait for the next turn.
    pub fn run_pending(&self) -> usize {
        let pending = self.len();
        let mut ran = 0;
        while ran < pending {
            let Some(task) = self.pop() else { break };
            task();
            ran += 1;
        }
        ran
    }
}

impl Defer for DeferQueue {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        self.push(task);
    }
}

impl<D: Defer + ?Sized> Defer for Rc<D> {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        (**self).defer(task);
    }
}

/// Defers onto the current tokio [`LocalSet`](tokio::task::LocalSet).
///
/// Panics when the deferral happens outside a `LocalSet`, as
/// `spawn_local` does.
#[cfg(feature = "tokio")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLocalDefer;

#[cfg(feature = "tokio")]
impl Defer for TokioLocalDefer {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        tokio::task::spawn_local(async move { task() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn run_pending_leaves_tasks_deferred_during_the_turn() {
        let queue = Rc::new(DeferQueue::new());
        let count = Rc::new(Cell::new(0));

        {
            let q = queue.clone();
            let c = count.clone();
            queue.defer(Box::new(move || {
                c.set(c.get() + 1);
                let c = c.clone();
                q.defer(Box::new(move || c.set(c.get() + 10)));
            }));
        }

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(count.get(), 1);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(count.get(), 11);
        assert!(queue.is_empty());
        assert_eq!(queue.run_pending(), 0);
    }
}
