//! Priority queue for pending tasks.
//!
//! One FIFO per priority class. Entries carry a monotonic sequence number
//! assigned at submission, which is the only tie-break within a class. A
//! resource-denied entry is put back at its sequence position, so re-queueing
//! never lets a later submission overtake it.

use super::handle::TaskCell;
use super::task::{Priority, Task, TaskId, TaskType};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// A task waiting for dispatch.
pub(crate) struct QueuedTask {
    pub(crate) task: Task,
    pub(crate) cell: Arc<TaskCell>,
    pub(crate) sequence: u64,
    pub(crate) enqueued_at: Instant,
    /// Number of resource denials so far.
    pub(crate) denials: u32,
    /// Earliest instant of the next dispatch attempt after a denial.
    pub(crate) not_before: Option<Instant>,
}

impl QueuedTask {
    pub(crate) fn task_type(&self) -> &TaskType {
        &self.task.task_type
    }

    pub(crate) fn in_backoff(&self, now: Instant) -> bool {
        self.not_before.is_some_and(|at| at > now)
    }
}

/// Result of scanning the queue for the next dispatchable entry.
pub(crate) enum Selection {
    /// An entry removed from the queue, ready for a resource check.
    Candidate(QueuedTask),
    /// A class head is backing off; nothing may dispatch before this instant.
    BlockedUntil(Instant),
    /// Nothing can dispatch right now (empty, or all capped).
    Idle,
}

pub(crate) struct TaskQueue {
    classes: [VecDeque<QueuedTask>; 4],
    next_sequence: u64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            classes: Default::default(),
            next_sequence: 0,
        }
    }

    /// Appends a new task at the tail of its class.
    pub(crate) fn push(&mut self, task: Task, cell: Arc<TaskCell>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let class = task.priority.index();
        self.classes[class].push_back(QueuedTask {
            task,
            cell,
            sequence,
            enqueued_at: Instant::now(),
            denials: 0,
            not_before: None,
        });
    }

    /// Puts an entry back at its original sequence position.
    pub(crate) fn reinsert(&mut self, entry: QueuedTask) {
        let class = &mut self.classes[entry.task.priority.index()];
        let pos = class.partition_point(|e| e.sequence < entry.sequence);
        class.insert(pos, entry);
    }

    /// Removes a pending task by id.
    pub(crate) fn remove(&mut self, id: TaskId) -> Option<QueuedTask> {
        for class in self.classes.iter_mut() {
            if let Some(pos) = class.iter().position(|e| e.cell.id == id) {
                return class.remove(pos);
            }
        }
        None
    }

    /// Removes every entry, highest priority first.
    pub(crate) fn drain(&mut self) -> Vec<QueuedTask> {
        self.classes
            .iter_mut()
            .flat_map(|class| class.drain(..))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.classes.iter().all(VecDeque::is_empty)
    }

    /// Finds the next entry to try, scanning classes from highest priority.
    ///
    /// Within a class, entries whose type is at its cap are stepped over so
    /// that other types can proceed. The first remaining entry is the class
    /// head: if it is backing off, scanning stops and lower classes wait.
    pub(crate) fn select<F>(&mut self, now: Instant, mut type_has_capacity: F) -> Selection
    where
        F: FnMut(&TaskType) -> bool,
    {
        for class in self.classes.iter_mut() {
            let Some(pos) = class.iter().position(|e| type_has_capacity(e.task_type())) else {
                continue;
            };
            let head = &class[pos];
            if head.in_backoff(now) {
                if let Some(at) = head.not_before {
                    return Selection::BlockedUntil(at);
                }
            }
            if let Some(entry) = class.remove(pos) {
                return Selection::Candidate(entry);
            }
        }
        Selection::Idle
    }
}
