use crate::error::{CallbackError, Result, RunLoopError};
use crate::queue::{Entry, EntryKey, Queue, QueueName};
use crate::target::{Callback, Target};
use slotmap::new_key_type;
use smallvec::SmallVec;
use std::rc::Rc;

new_key_type! {
    /// Handle of a run loop owned by a [`Scheduler`](crate::Scheduler).
    pub struct LoopId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created,
    Accumulating,
    Flushing,
    Discarded,
}

/// Work a flushing loop set aside for the loop that follows it, per lane.
pub(crate) type Carried = SmallVec<[(QueueName, Vec<Entry>); 4]>;

/// One nesting level of deferred work.
///
/// A loop captures the scheduler's queue order when it is created and keeps
/// one [`Queue`] per lane. Flushing drains lanes in that order, taking each
/// lane's entries only when the flush reaches it. Work scheduled while the
/// flush runs lands in this pass if its lane has not been reached yet, and is
/// set aside for the next loop otherwise.
pub struct RunLoop {
    prev: Option<LoopId>,
    depth: usize,
    order: SmallVec<[QueueName; 4]>,
    queues: SmallVec<[Queue; 4]>,
    carried: SmallVec<[Queue; 4]>,
    cursor: Option<usize>,
    state: LoopState,
}

impl RunLoop {
    pub(crate) fn new(prev: Option<LoopId>, depth: usize, order: SmallVec<[QueueName; 4]>) -> Self {
        let queues = order.iter().map(|_| Queue::default()).collect();
        let carried = order.iter().map(|_| Queue::default()).collect();
        Self {
            prev,
            depth,
            order,
            queues,
            carried,
            cursor: None,
            state: LoopState::Created,
        }
    }

    /// The loop that was current when this one began.
    pub fn prev(&self) -> Option<LoopId> {
        self.prev
    }

    /// Position on the stack, counting the outermost loop as 1.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Lanes this loop flushes, in flush order.
    pub fn queues(&self) -> &[QueueName] {
        &self.order
    }

    /// Entries waiting for this loop's flush.
    pub fn len(&self) -> usize {
        self.queues.iter().map(Queue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.position(queue).map_or(0, |pos| self.queues[pos].len())
    }

    /// Entries scheduled during the flush into a lane it had already reached.
    /// They run in the loop that follows this one.
    pub fn deferred_len(&self) -> usize {
        self.carried.iter().map(Queue::len).sum()
    }

    fn position(&self, queue: &str) -> Option<usize> {
        self.order.iter().position(|name| name.as_str() == queue)
    }

    /// Adds `method` to `queue`, or replaces the callback of the pending entry
    /// with the same target and id. Returns `true` when coalesced.
    pub fn schedule(
        &mut self,
        queue: &str,
        target: Option<Target>,
        id: Option<&str>,
        method: Callback,
    ) -> Result<bool> {
        let pos = self.accepting(queue)?;
        let displaced = self.place(pos, entry_key(target, id), method);
        Ok(displaced.is_some())
    }

    /// Checks that `queue` can take an entry and returns its lane.
    pub(crate) fn accepting(&self, queue: &str) -> Result<usize> {
        if self.state == LoopState::Discarded {
            return Err(RunLoopError::InvalidState(
                "run loop has already been flushed",
            ));
        }
        self.position(queue)
            .ok_or_else(|| RunLoopError::UnknownQueue(QueueName::new(queue.to_owned())))
    }

    /// Stores an entry in lane `pos` and returns the callback it displaced.
    pub(crate) fn place(&mut self, pos: usize, key: EntryKey, method: Callback) -> Option<Callback> {
        if self.state == LoopState::Created {
            self.state = LoopState::Accumulating;
        }
        let deferred = self.reached(pos);
        let lane = if deferred {
            &mut self.carried[pos]
        } else {
            &mut self.queues[pos]
        };
        let displaced = lane.schedule(key, method);
        tracing::trace!(
            queue = %self.order[pos],
            coalesced = displaced.is_some(),
            deferred,
            "scheduled entry"
        );
        displaced
    }

    // Whether the flush has already taken lane `pos`.
    fn reached(&self, pos: usize) -> bool {
        self.state == LoopState::Flushing && self.cursor.is_some_and(|cursor| pos <= cursor)
    }

    /// Moves work set aside by a finished loop into this one. Lanes this loop
    /// does not know yet are appended; the global order only ever grows, so
    /// they still sort after every lane this loop already has.
    pub(crate) fn absorb(&mut self, carried: Carried) -> Vec<Callback> {
        let mut displaced = Vec::new();
        for (name, entries) in carried {
            let pos = match self.position(name.as_str()) {
                Some(pos) => pos,
                None => {
                    self.order.push(name);
                    self.queues.push(Queue::default());
                    self.carried.push(Queue::default());
                    self.order.len() - 1
                }
            };
            for Entry { key, method } in entries {
                displaced.extend(self.place(pos, key, method));
            }
        }
        displaced
    }

    pub(crate) fn begin_flush(&mut self) -> Result<()> {
        if self.state == LoopState::Flushing {
            return Err(RunLoopError::InvalidState("run loop is already flushing"));
        }
        self.state = LoopState::Flushing;
        self.cursor = None;
        Ok(())
    }

    /// Advances the flush to the next lane and takes that lane's entries.
    pub(crate) fn next_lane(&mut self) -> Option<(QueueName, Vec<Entry>)> {
        let next = self.cursor.map_or(0, |cursor| cursor + 1);
        let name = self.order.get(next)?.clone();
        self.cursor = Some(next);
        Some((name, self.queues[next].take()))
    }

    /// Ends the flush. Returns the entries an aborted flush never reached.
    pub(crate) fn discard(&mut self) -> Vec<Entry> {
        self.state = LoopState::Discarded;
        self.cursor = None;
        self.queues.iter_mut().flat_map(Queue::take).collect()
    }

    pub(crate) fn take_carried(&mut self) -> Carried {
        self.order
            .iter()
            .zip(self.carried.iter_mut())
            .filter(|(_, lane)| !lane.is_empty())
            .map(|(name, lane)| (name.clone(), lane.take()))
            .collect()
    }

    /// Invokes every pending entry, lane by lane in queue order.
    ///
    /// The first callback error aborts the flush and the remaining entries
    /// are dropped. Work set aside for the next loop is kept.
    pub fn flush(&mut self) -> Result<()> {
        self.begin_flush()?;
        let mut result = Ok(());
        while let Some((name, entries)) = self.next_lane() {
            result = invoke_lane(&name, entries);
            if result.is_err() {
                break;
            }
        }
        drop(self.discard());
        result.map_err(RunLoopError::Callback)
    }
}

pub(crate) fn entry_key(target: Option<Target>, id: Option<&str>) -> EntryKey {
    EntryKey {
        target,
        id: id.map(Rc::from),
    }
}

/// Runs one lane's snapshot in order, stopping at the first error.
pub(crate) fn invoke_lane(name: &QueueName, entries: Vec<Entry>) -> Result<(), CallbackError> {
    if !entries.is_empty() {
        tracing::trace!(queue = %name, count = entries.len(), "flushing queue");
    }
    entries.into_iter().try_for_each(Entry::invoke)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn order(names: &[&'static str]) -> SmallVec<[QueueName; 4]> {
        names.iter().copied().map(QueueName::from).collect()
    }

    fn push(log: &Rc<RefCell<Vec<String>>>, label: &str) -> Callback {
        let log = log.clone();
        let label = label.to_owned();
        Box::new(move |_| {
            log.borrow_mut().push(label);
            Ok(())
        })
    }

    #[test]
    fn flush_follows_queue_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut run_loop = RunLoop::new(None, 1, order(&["a", "b", "c"]));

        run_loop.schedule("c", None, Some("1"), push(&log, "c")).unwrap();
        run_loop.schedule("a", None, Some("1"), push(&log, "a")).unwrap();
        run_loop.schedule("b", None, Some("1"), push(&log, "b")).unwrap();
        assert_eq!(run_loop.len(), 3);
        assert_eq!(run_loop.queue_len("a"), 1);

        run_loop.flush().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert!(run_loop.is_empty());
        assert_eq!(run_loop.state(), LoopState::Discarded);
    }

    #[test]
    fn target_is_passed_to_callback() {
        let seen = Rc::new(RefCell::new(None));
        let target = Target::new(7u8);
        let mut run_loop = RunLoop::new(None, 1, order(&["sync"]));

        let sink = seen.clone();
        run_loop
            .schedule(
                "sync",
                Some(target.clone()),
                None,
                Box::new(move |t| {
                    *sink.borrow_mut() = t.and_then(|t| t.downcast_ref::<u8>()).copied();
                    Ok(())
                }),
            )
            .unwrap();
        run_loop.flush().unwrap();
        assert_eq!(*seen.borrow(), Some(7));
    }

    #[test]
    fn unknown_queue_is_rejected() {
        let mut run_loop = RunLoop::new(None, 1, order(&["sync"]));
        let err = run_loop
            .schedule("render", None, None, Box::new(|_| Ok(())))
            .unwrap_err();
        assert!(matches!(err, RunLoopError::UnknownQueue(name) if name.as_str() == "render"));
        assert_eq!(run_loop.state(), LoopState::Created);
    }

    #[test]
    fn error_aborts_later_queues_and_clears_storage() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut run_loop = RunLoop::new(None, 1, order(&["a", "b"]));

        run_loop
            .schedule("a", None, Some("boom"), Box::new(|_| Err("boom".into())))
            .unwrap();
        run_loop.schedule("b", None, None, push(&log, "b")).unwrap();

        assert!(matches!(run_loop.flush(), Err(RunLoopError::Callback(_))));
        assert!(log.borrow().is_empty());
        assert!(run_loop.is_empty());

        // A second flush has nothing left to invoke.
        run_loop.flush().unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn discarded_loop_rejects_work() {
        let mut run_loop = RunLoop::new(None, 1, order(&["sync"]));
        run_loop.flush().unwrap();
        assert!(matches!(
            run_loop.schedule("sync", None, None, Box::new(|_| Ok(()))),
            Err(RunLoopError::InvalidState(_))
        ));
    }

    #[test]
    fn lanes_are_taken_one_at_a_time() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut run_loop = RunLoop::new(None, 1, order(&["a", "b"]));
        run_loop.schedule("a", None, Some("1"), push(&log, "a1")).unwrap();

        run_loop.begin_flush().unwrap();
        let (name, entries) = run_loop.next_lane().unwrap();
        assert_eq!(name.as_str(), "a");
        assert_eq!(entries.len(), 1);

        // "b" has not been reached: the entry joins this pass.
        run_loop.schedule("b", None, Some("1"), push(&log, "b1")).unwrap();
        // "a" has been taken: the entry waits for the next loop.
        run_loop.schedule("a", None, Some("2"), push(&log, "a2")).unwrap();
        assert_eq!(run_loop.queue_len("b"), 1);
        assert_eq!(run_loop.queue_len("a"), 0);
        assert_eq!(run_loop.deferred_len(), 1);

        let (name, entries) = run_loop.next_lane().unwrap();
        assert_eq!(name.as_str(), "b");
        assert_eq!(entries.len(), 1);
        assert!(run_loop.next_lane().is_none());

        let carried = run_loop.take_carried();
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].0.as_str(), "a");
        assert_eq!(run_loop.deferred_len(), 0);
    }

    #[test]
    fn a_flushing_loop_cannot_be_flushed_again() {
        let mut run_loop = RunLoop::new(None, 1, order(&["sync"]));
        run_loop.begin_flush().unwrap();
        assert!(matches!(
            run_loop.begin_flush(),
            Err(RunLoopError::InvalidState(_))
        ));
    }

    #[test]
    fn absorb_appends_unknown_lanes_and_coalesces() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut run_loop = RunLoop::new(None, 1, order(&["sync"]));
        run_loop.schedule("sync", None, Some("k"), push(&log, "old")).unwrap();

        let mut carried = Carried::new();
        carried.push((
            QueueName::SYNC,
            vec![Entry {
                key: entry_key(None, Some("k")),
                method: push(&log, "new"),
            }],
        ));
        carried.push((
            QueueName::from("late"),
            vec![Entry {
                key: entry_key(None, None),
                method: push(&log, "late"),
            }],
        ));

        let displaced = run_loop.absorb(carried);
        assert_eq!(displaced.len(), 1);
        assert_eq!(run_loop.queues(), &[QueueName::SYNC, QueueName::from("late")]);

        run_loop.flush().unwrap();
        assert_eq!(*log.borrow(), vec!["new", "late"]);
    }
}
