use crate::application::task_repository::TaskRepository;
use crate::domain::models::{Task, TaskListQuery};
use crate::infrastructure::error::InfraError;
use std::sync::Arc;
use tokio::sync::watch;

/// Continuously updated view of one bucket.
///
/// The first call to [`TaskFeed::next`] yields the current list right away.
/// Later calls wait for the next committed store change and yield a freshly
/// materialized list. Several changes between two calls yield one list.
pub struct TaskFeed<R>
where
    R: TaskRepository + ?Sized,
{
    repository: Arc<R>,
    filter: TaskListQuery,
    changes: watch::Receiver<u64>,
    started: bool,
}

impl<R> TaskFeed<R>
where
    R: TaskRepository + ?Sized,
{
    pub fn new(repository: Arc<R>, filter: TaskListQuery) -> Self {
        let changes = repository.subscribe();
        Self {
            repository,
            filter,
            changes,
            started: false,
        }
    }

    pub fn filter(&self) -> TaskListQuery {
        self.filter
    }

    /// `None` once the underlying store has gone away.
    pub async fn next(&mut self) -> Option<Result<Vec<Task>, InfraError>> {
        if self.started {
            self.changes.changed().await.ok()?;
        }
        self.started = true;
        self.changes.borrow_and_update();
        Some(self.repository.get_tasks(self.filter))
    }
}
