use crate::domain::models::{Task, TaskListQuery};
use crate::infrastructure::alarm_scheduler::AlarmScheduler;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_store::{SqliteTaskStore, TaskRow, TaskTable};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Per-item result counts of a best-effort batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub missing: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.succeeded + self.missing + self.failed
    }

    pub fn all_succeeded(&self) -> bool {
        self.missing == 0 && self.failed == 0
    }
}

pub trait TaskRepository: Send + Sync {
    /// Root tasks of one bucket, each with its full subtree.
    fn get_tasks(&self, filter: TaskListQuery) -> Result<Vec<Task>, InfraError>;
    fn get_task(&self, id: i64) -> Result<Option<Task>, InfraError>;
    /// Inserts the whole tree as fresh rows and returns the new root id.
    fn save_task(&self, task: &Task) -> Result<i64, InfraError>;
    fn update_task(&self, task: &Task) -> Result<(), InfraError>;
    fn set_task_completed(&self, id: i64, completed: bool) -> Result<(), InfraError>;
    /// Returns `false` when no task had that id.
    fn delete_task(&self, id: i64) -> Result<bool, InfraError>;
    /// Version counter bumped after every committed change.
    fn subscribe(&self) -> watch::Receiver<u64>;

    fn complete_tasks(&self, ids: &[i64]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for &id in ids {
            match self.set_task_completed(id, true) {
                Ok(()) => outcome.succeeded += 1,
                Err(InfraError::TaskNotFound(_)) => outcome.missing += 1,
                Err(error) => {
                    warn!(task_id = id, %error, "failed completing task");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    fn delete_tasks(&self, ids: &[i64]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for &id in ids {
            match self.delete_task(id) {
                Ok(true) => outcome.succeeded += 1,
                Ok(false) => outcome.missing += 1,
                Err(error) => {
                    warn!(task_id = id, %error, "failed deleting task");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}

pub struct SqliteTaskRepository<A>
where
    A: AlarmScheduler,
{
    store: Arc<SqliteTaskStore>,
    alarms: Arc<A>,
    timezone: Tz,
    now_provider: NowProvider,
}

impl<A> SqliteTaskRepository<A>
where
    A: AlarmScheduler,
{
    pub fn new(store: Arc<SqliteTaskStore>, alarms: Arc<A>) -> Self {
        Self {
            store,
            alarms,
            timezone: Tz::UTC,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn today(&self) -> NaiveDate {
        (self.now_provider)().with_timezone(&self.timezone).date_naive()
    }

    /// Arms alarms for every pending node of the notification bucket, as
    /// needed after a restart. Returns how many nodes were handed to the scheduler.
    pub fn rearm_alarms(&self) -> Result<usize, InfraError> {
        fn pending_nodes(mut task: Task, pending: &mut Vec<Task>) {
            let subtasks = std::mem::take(&mut task.subtasks);
            if !task.completed {
                pending.push(task);
            }
            for subtask in subtasks {
                pending_nodes(subtask, pending);
            }
        }

        let mut pending = Vec::new();
        for root in self.get_tasks(TaskListQuery::Notification)? {
            pending_nodes(root, &mut pending);
        }
        self.schedule_alarms(&pending);
        info!(count = pending.len(), "re-armed task alarms");
        Ok(pending.len())
    }

    fn assemble(table: &TaskTable<'_>, row: TaskRow) -> Result<Task, InfraError> {
        let subtasks = table
            .get_subtasks(row.id)?
            .into_iter()
            .map(|child| Self::assemble(table, child))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(row.into_task(subtasks))
    }

    /// Inserts `task`'s subtasks below `parent_id`, collecting each stored node.
    fn insert_children(
        table: &TaskTable<'_>,
        task: &Task,
        parent_id: i64,
        inserted: &mut Vec<Task>,
    ) -> Result<(), InfraError> {
        for subtask in &task.subtasks {
            let id = table.insert(&TaskRow::from_task(subtask, Some(parent_id)))?;
            inserted.push(Task {
                id,
                subtasks: Vec::new(),
                ..subtask.clone()
            });
            Self::insert_children(table, subtask, id, inserted)?;
        }
        Ok(())
    }

    fn schedule_alarms(&self, tasks: &[Task]) {
        for task in tasks {
            if let Err(error) = self.alarms.schedule(task) {
                warn!(task_id = task.id, %error, "failed scheduling alarm");
            }
        }
    }

    fn cancel_alarms(&self, ids: &[i64]) {
        for &id in ids {
            if let Err(error) = self.alarms.cancel(id) {
                warn!(task_id = id, %error, "failed cancelling alarm");
            }
        }
    }

    fn validate(task: &Task) -> Result<(), InfraError> {
        task.validate().map_err(InfraError::InvalidTask)
    }
}

impl<A> TaskRepository for SqliteTaskRepository<A>
where
    A: AlarmScheduler,
{
    fn get_tasks(&self, filter: TaskListQuery) -> Result<Vec<Task>, InfraError> {
        let today = self.today();
        self.store.read(|table| {
            table
                .query(filter, today)?
                .into_iter()
                .map(|row| Self::assemble(table, row))
                .collect()
        })
    }

    fn get_task(&self, id: i64) -> Result<Option<Task>, InfraError> {
        self.store.read(|table| {
            table
                .get_by_id(id)?
                .map(|row| Self::assemble(table, row))
                .transpose()
        })
    }

    fn save_task(&self, task: &Task) -> Result<i64, InfraError> {
        Self::validate(task)?;
        let mut inserted = Vec::new();
        let root_id = self.store.write(|table| {
            let root_id = table.insert(&TaskRow::from_task(task, None))?;
            inserted.push(Task {
                id: root_id,
                subtasks: Vec::new(),
                ..task.clone()
            });
            Self::insert_children(table, task, root_id, &mut inserted)?;
            Ok(root_id)
        })?;

        self.schedule_alarms(&inserted);
        info!(task_id = root_id, nodes = inserted.len(), "task saved");
        Ok(root_id)
    }

    fn update_task(&self, task: &Task) -> Result<(), InfraError> {
        Self::validate(task)?;

        if task.subtasks.is_empty() {
            self.store.write(|table| {
                let existing = table
                    .get_by_id(task.id)?
                    .ok_or(InfraError::TaskNotFound(task.id))?;
                table.update(&TaskRow::from_task(task, existing.parent_task_id))?;
                Ok(())
            })?;
            self.cancel_alarms(&[task.id]);
            self.schedule_alarms(&[Task {
                subtasks: Vec::new(),
                ..task.clone()
            }]);
            debug!(task_id = task.id, "task updated in place");
            return Ok(());
        }

        let mut inserted = Vec::new();
        let replaced_ids = self.store.write(|table| {
            let existing = table
                .get_by_id(task.id)?
                .ok_or(InfraError::TaskNotFound(task.id))?;
            let mut replaced_ids = vec![task.id];
            replaced_ids.extend(table.descendant_ids(task.id)?);

            table.delete_by_id(task.id)?;
            table.insert_with_id(&TaskRow::from_task(task, existing.parent_task_id))?;
            inserted.push(Task {
                subtasks: Vec::new(),
                ..task.clone()
            });
            Self::insert_children(table, task, task.id, &mut inserted)?;
            Ok(replaced_ids)
        })?;

        self.cancel_alarms(&replaced_ids);
        self.schedule_alarms(&inserted);
        debug!(
            task_id = task.id,
            replaced = replaced_ids.len(),
            inserted = inserted.len(),
            "task subtree replaced"
        );
        Ok(())
    }

    fn set_task_completed(&self, id: i64, completed: bool) -> Result<(), InfraError> {
        self.store.write(|table| {
            let row = table.get_by_id(id)?.ok_or(InfraError::TaskNotFound(id))?;
            table.update(&TaskRow { completed, ..row })?;
            Ok(())
        })
    }

    fn delete_task(&self, id: i64) -> Result<bool, InfraError> {
        let mut subtree = vec![id];
        subtree.extend(self.store.read(|table| table.descendant_ids(id))?);
        self.cancel_alarms(&subtree);

        let deleted = self.store.write(|table| table.delete_by_id(id))?;
        if deleted {
            info!(task_id = id, removed = subtree.len(), "task deleted");
        }
        Ok(deleted)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }
}
