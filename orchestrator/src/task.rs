use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::{ProcessPool, TrainingConfig};

/// Opaque identifier of a training task started in non-blocking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A running training task.
pub struct Task {
    pub id: TaskId,
    pub pool: Box<dyn ProcessPool>,
    /// Ascending, position `i` is the practitioner behind worker `i`.
    pub practitioner_ids: Vec<u64>,
    pub config: TrainingConfig,
}

/// The pending tasks, shared by every caller of an orchestrator.
#[derive(Default)]
pub struct TaskStore {
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) -> TaskId {
        let id = task.id;
        self.tasks.lock().insert(id, Arc::new(task));
        id
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().get(id).cloned()
    }

    /// Takes a task out of the store, only one caller ever gets it.
    pub fn remove(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadPool;

    fn task() -> Task {
        Task {
            id: TaskId::new(),
            pool: Box::new(ThreadPool::new()),
            practitioner_ids: vec![1, 2],
            config: TrainingConfig::new(2, 1),
        }
    }

    #[test]
    fn test_remove_happens_once() {
        let store = TaskStore::new();
        let id = store.insert(task());

        assert_eq!(store.len(), 1);
        assert!(store.get(&id).is_some());
        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }
}
