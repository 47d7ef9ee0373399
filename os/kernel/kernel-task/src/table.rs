use crate::task::{Task, TaskId};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::MAX_TASKS;

/// Fixed array of task slots. Slot 0 is the boot context and stays empty.
pub(crate) struct TaskTable {
    slots: Vec<Option<Arc<Task>>>,
}

impl TaskTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_TASKS);
        slots.resize_with(MAX_TASKS, || None);
        Self { slots }
    }

    /// Lowest unused slot.
    #[allow(clippy::cast_possible_truncation)]
    pub fn free_slot(&self) -> Option<TaskId> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, s)| s.is_none())
            .map(|(i, _)| TaskId::new(i as u32))
    }

    pub fn insert(&mut self, task: Arc<Task>) {
        let i = task.id().as_index();
        debug_assert!(self.slots[i].is_none(), "slot {i} already taken");
        self.slots[i] = Some(task);
    }

    pub fn get(&self, id: TaskId) -> Option<&Arc<Task>> {
        self.slots.get(id.as_index()).and_then(Option::as_ref)
    }

    /// Return the slot to `Unused`.
    pub fn remove(&mut self, id: TaskId) -> Option<Arc<Task>> {
        self.slots.get_mut(id.as_index()).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> + '_ {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}
