use super::{MigrationTask, TaskStore, TaskStoreError};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Process-local task store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<DashMap<Uuid, MigrationTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &MigrationTask) -> Result<(), TaskStoreError> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MigrationTask>, TaskStoreError> {
        Ok(self.tasks.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update(&self, task: &MigrationTask) -> Result<(), TaskStoreError> {
        match self.tasks.get_mut(&task.id) {
            Some(mut entry) => {
                *entry = task.clone();
                Ok(())
            }
            None => Err(TaskStoreError::NotFound(task.id)),
        }
    }

    async fn list(&self) -> Result<Vec<MigrationTask>, TaskStoreError> {
        let mut tasks: Vec<MigrationTask> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }
}
