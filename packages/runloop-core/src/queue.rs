use crate::error::{CallbackError, Result};
use crate::target::{Callback, Target};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::borrow::{Borrow, Cow};
use std::collections::hash_map::Entry as Slot;
use std::fmt;
use std::rc::Rc;

/// Name of an ordered lane of work. Lanes flush in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(Cow<'static, str>);

impl QueueName {
    /// The lane every scheduler starts with.
    pub const SYNC: QueueName = QueueName::from_static("sync");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for QueueName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for QueueName {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Coalescing key: one pending entry per (target, id) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct EntryKey {
    pub target: Option<Target>,
    pub id: Option<Rc<str>>,
}

pub(crate) struct Entry {
    pub key: EntryKey,
    pub method: Callback,
}

impl Entry {
    pub fn invoke(self) -> Result<(), CallbackError> {
        let Entry { key, method } = self;
        method(key.target.as_ref())
    }
}

/// Pending entries of one lane in first-scheduled order.
///
/// The index maps each key to its position in `entries`, so a repeated
/// schedule replaces the callback in place without a scan.
#[derive(Default)]
pub(crate) struct Queue {
    entries: Vec<Entry>,
    index: FxHashMap<EntryKey, usize>,
}

impl Queue {
    /// Inserts or replaces the entry for `key`.
    ///
    /// A coalesced schedule hands back the callback it displaced. The caller
    /// drops it, so whatever the old closure captured is released outside
    /// any borrow the caller holds.
    #[must_use = "the displaced callback should be dropped outside any scheduler borrow"]
    pub fn schedule(&mut self, key: EntryKey, method: Callback) -> Option<Callback> {
        match self.index.entry(key) {
            Slot::Occupied(slot) => {
                let entry = &mut self.entries[*slot.get()];
                Some(std::mem::replace(&mut entry.method, method))
            }
            Slot::Vacant(slot) => {
                let key = slot.key().clone();
                slot.insert(self.entries.len());
                self.entries.push(Entry { key, method });
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes every entry, leaving the queue empty.
    pub fn take(&mut self) -> Vec<Entry> {
        self.index.clear();
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn key(target: &Target, id: Option<&str>) -> EntryKey {
        EntryKey {
            target: Some(target.clone()),
            id: id.map(Rc::from),
        }
    }

    fn record(log: &Rc<RefCell<Vec<&'static str>>>, label: &'static str) -> Callback {
        let log = log.clone();
        Box::new(move |_| {
            log.borrow_mut().push(label);
            Ok(())
        })
    }

    #[test]
    fn coalesce_keeps_first_position_last_callback() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = Target::new(());
        let b = Target::new(());
        let mut queue = Queue::default();

        assert!(queue.schedule(key(&a, None), record(&log, "a1")).is_none());
        assert!(queue.schedule(key(&b, None), record(&log, "b")).is_none());
        let displaced = queue.schedule(key(&a, None), record(&log, "a2"));
        assert_eq!(queue.len(), 2);

        // The displaced callback is the first one and still callable.
        displaced.expect("a1 was coalesced")(None).unwrap();
        assert_eq!(*RefCell::borrow(&log), vec!["a1"]);
        log.borrow_mut().clear();

        for entry in queue.take() {
            entry.invoke().unwrap();
        }
        assert_eq!(*RefCell::borrow(&log), vec!["a2", "b"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn ids_split_a_target() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let t = Target::new(());
        let mut queue = Queue::default();

        let _ = queue.schedule(key(&t, Some("x")), record(&log, "x"));
        let _ = queue.schedule(key(&t, Some("y")), record(&log, "y"));
        let _ = queue.schedule(key(&t, None), record(&log, "none"));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn unbound_entries_coalesce_by_id() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = Queue::default();
        let unbound = |id: &str| EntryKey {
            target: None,
            id: Some(Rc::from(id)),
        };

        let _ = queue.schedule(unbound("tick"), record(&log, "first"));
        assert!(queue.schedule(unbound("tick"), record(&log, "second")).is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn queue_name_serde_is_a_plain_string() {
        let name: QueueName = serde_json::from_str("\"render\"").unwrap();
        assert_eq!(name.as_str(), "render");
        assert_eq!(serde_json::to_string(&QueueName::SYNC).unwrap(), "\"sync\"");
    }
}
