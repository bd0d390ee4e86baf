//! Parent-indexed arena mirroring the tracker's task tree.
//!
//! Tasks are keyed by id and each stores its parent id, so reparenting is a
//! single field update and cycle checks walk the ancestor chain only.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

use crate::core::types::Task;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskArena {
    tasks: BTreeMap<String, Task>,
}

impl TaskArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena from tracker records. Later duplicates overwrite earlier ones.
    pub fn from_tasks<I: IntoIterator<Item = Task>>(tasks: I) -> Self {
        let mut arena = Self::new();
        for task in tasks {
            arena.tasks.insert(task.id.clone(), task);
        }
        arena
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Insert a task, refusing ids that already exist or parents that would cycle.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(anyhow!("duplicate task id '{}'", task.id));
        }
        if let Some(parent) = &task.parent_id
            && !self.tasks.contains_key(parent)
        {
            return Err(anyhow!(
                "task '{}' references unknown parent '{parent}'",
                task.id
            ));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// True if making `new_parent` the parent of `id` would create a cycle.
    pub fn would_cycle(&self, id: &str, new_parent: &str) -> bool {
        let mut cursor = Some(new_parent);
        let mut steps = 0usize;
        while let Some(current) = cursor {
            if current == id {
                return true;
            }
            steps += 1;
            if steps > self.tasks.len() {
                // Existing data already contains a cycle.
                return true;
            }
            cursor = self
                .tasks
                .get(current)
                .and_then(|task| task.parent_id.as_deref());
        }
        false
    }

    pub fn reparent(&mut self, id: &str, new_parent: &str) -> Result<()> {
        if !self.tasks.contains_key(new_parent) {
            return Err(anyhow!("unknown parent '{new_parent}'"));
        }
        if self.would_cycle(id, new_parent) {
            return Err(anyhow!(
                "moving '{id}' under '{new_parent}' would create a cycle"
            ));
        }
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown task '{id}'"))?;
        task.parent_id = Some(new_parent.to_string());
        Ok(())
    }

    /// Ids of direct children of `id`, in id order.
    pub fn children(&self, id: &str) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|task| task.parent_id.as_deref() == Some(id))
            .map(|task| task.id.as_str())
            .collect()
    }

    /// `root` and every task below it, in id order.
    pub fn descendants(&self, root: &str) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| self.is_under(&task.id, root))
            .collect()
    }

    fn is_under(&self, id: &str, root: &str) -> bool {
        let mut cursor = Some(id);
        let mut steps = 0usize;
        while let Some(current) = cursor {
            if current == root {
                return true;
            }
            steps += 1;
            if steps > self.tasks.len() {
                return false;
            }
            cursor = self
                .tasks
                .get(current)
                .and_then(|task| task.parent_id.as_deref());
        }
        false
    }

    /// Structural checks: dangling parents, cycles, and exactly one parentless root.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut roots = Vec::new();
        for task in self.tasks.values() {
            match &task.parent_id {
                None => roots.push(task.id.as_str()),
                Some(parent) if !self.tasks.contains_key(parent) => {
                    errors.push(format!(
                        "task '{}' references unknown parent '{parent}'",
                        task.id
                    ));
                }
                Some(parent) => {
                    if self.would_cycle(&task.id, parent) {
                        errors.push(format!("task '{}' is part of a parent cycle", task.id));
                    }
                }
            }
        }
        if roots.len() != 1 && !self.tasks.is_empty() {
            errors.push(format!(
                "expected exactly one root task, found {} ({})",
                roots.len(),
                roots.join(", ")
            ));
        }
        errors
    }
}
