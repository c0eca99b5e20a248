use crate::queue::QueueName;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Scheduler settings, loadable from a host's own configuration file.
///
/// ```
/// use runloop_core::SchedulerConfig;
///
/// let config = SchedulerConfig::default().with_queue("render");
/// assert_eq!(config.queues.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Initial lanes in flush order. Duplicates are ignored.
    pub queues: Vec<QueueName>,
    /// Lazily create and defer-flush a loop when work is scheduled outside
    /// any run. When off, such scheduling fails with `InvalidState`.
    pub autorun: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueName::SYNC],
            autorun: true,
        }
    }
}

impl SchedulerConfig {
    pub fn with_queue(mut self, name: impl Into<QueueName>) -> Self {
        self.queues.push(name.into());
        self
    }

    pub fn autorun(mut self, enabled: bool) -> Self {
        self.autorun = enabled;
        self
    }

    pub(crate) fn queue_order(&self) -> SmallVec<[QueueName; 4]> {
        let mut order = SmallVec::new();
        for name in &self.queues {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }
}
