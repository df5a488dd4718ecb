use crate::domain::dates::bucket_bounds;
use crate::domain::models::{Task, TaskListQuery, TaskPriority};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::debug;

const TASK_COLUMNS: &str =
    "id, title, deadline, priority, periodicity, notes, completed, notify, parent_task_id";

/// Flat persisted form of a task node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskRow {
    pub id: i64,
    pub title: String,
    pub deadline: String,
    pub priority: i64,
    pub periodicity: String,
    pub notes: String,
    pub completed: bool,
    pub notify: String,
    pub parent_task_id: Option<i64>,
}

impl TaskRow {
    pub fn from_task(task: &Task, parent_task_id: Option<i64>) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            deadline: task.deadline.clone(),
            priority: task.priority.level(),
            periodicity: task.periodicity.clone(),
            notes: task.notes.clone(),
            completed: task.completed,
            notify: task.notify.clone(),
            parent_task_id,
        }
    }

    pub fn into_task(self, subtasks: Vec<Task>) -> Task {
        Task {
            id: self.id,
            title: self.title,
            deadline: self.deadline,
            priority: TaskPriority::from_level(self.priority),
            periodicity: self.periodicity,
            notes: self.notes,
            completed: self.completed,
            notify: self.notify,
            subtasks,
        }
    }

    fn from_sql(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            deadline: row.get(2)?,
            priority: row.get(3)?,
            periodicity: row.get(4)?,
            notes: row.get(5)?,
            completed: row.get(6)?,
            notify: row.get(7)?,
            parent_task_id: row.get(8)?,
        })
    }
}

fn bucket_filter(query: TaskListQuery) -> &'static str {
    match query {
        TaskListQuery::All => "completed = 0 ORDER BY deadline ASC",
        TaskListQuery::Past => {
            "completed = 0 AND deadline != '' AND deadline < ?1
             ORDER BY deadline DESC, priority DESC"
        }
        TaskListQuery::Now => {
            "completed = 0 AND deadline != '' AND deadline >= ?1 AND deadline < ?2
             ORDER BY COALESCE(NULLIF(deadline, ''), NULLIF(notify, '')) ASC, priority DESC"
        }
        TaskListQuery::Future => {
            "completed = 0 AND deadline != '' AND deadline >= ?1
             ORDER BY deadline ASC, priority DESC"
        }
        TaskListQuery::Priority => "completed = 0 AND priority > 1 ORDER BY deadline ASC",
        TaskListQuery::Notification => {
            "completed = 0 AND notify != '' AND notify >= ?1 ORDER BY notify ASC"
        }
        TaskListQuery::NoDate => "completed = 0 AND deadline = '' ORDER BY priority DESC, title ASC",
        TaskListQuery::Completed => "completed = 1 ORDER BY deadline ASC",
    }
}

fn bucket_params(query: TaskListQuery, today: NaiveDate) -> Vec<String> {
    let (today, day_after_tomorrow) = bucket_bounds(today);
    match query {
        TaskListQuery::Past | TaskListQuery::Notification => vec![today],
        TaskListQuery::Now => vec![today, day_after_tomorrow],
        TaskListQuery::Future => vec![day_after_tomorrow],
        TaskListQuery::All
        | TaskListQuery::Priority
        | TaskListQuery::NoDate
        | TaskListQuery::Completed => Vec::new(),
    }
}

/// Row operations bound to one open connection or transaction.
pub struct TaskTable<'a> {
    connection: &'a Connection,
}

impl<'a> TaskTable<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    pub fn insert(&self, row: &TaskRow) -> Result<i64, InfraError> {
        self.connection.execute(
            "INSERT INTO tasks (title, deadline, priority, periodicity, notes, completed, notify, parent_task_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.title,
                row.deadline,
                row.priority,
                row.periodicity,
                row.notes,
                row.completed,
                row.notify,
                row.parent_task_id,
            ],
        )?;
        Ok(self.connection.last_insert_rowid())
    }

    /// Inserts a row keeping its existing id.
    pub fn insert_with_id(&self, row: &TaskRow) -> Result<i64, InfraError> {
        self.connection.execute(
            "INSERT INTO tasks (id, title, deadline, priority, periodicity, notes, completed, notify, parent_task_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.id,
                row.title,
                row.deadline,
                row.priority,
                row.periodicity,
                row.notes,
                row.completed,
                row.notify,
                row.parent_task_id,
            ],
        )?;
        Ok(row.id)
    }

    pub fn update(&self, row: &TaskRow) -> Result<bool, InfraError> {
        let changed = self.connection.execute(
            "UPDATE tasks SET
               title = ?2, deadline = ?3, priority = ?4, periodicity = ?5,
               notes = ?6, completed = ?7, notify = ?8, parent_task_id = ?9
             WHERE id = ?1",
            params![
                row.id,
                row.title,
                row.deadline,
                row.priority,
                row.periodicity,
                row.notes,
                row.completed,
                row.notify,
                row.parent_task_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_by_id(&self, id: i64) -> Result<bool, InfraError> {
        let changed = self
            .connection
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<TaskRow>, InfraError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        self.connection
            .query_row(&sql, params![id], TaskRow::from_sql)
            .optional()
            .map_err(InfraError::from)
    }

    pub fn get_subtasks(&self, parent_task_id: i64) -> Result<Vec<TaskRow>, InfraError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_task_id = ?1 ORDER BY priority DESC"
        );
        let mut statement = self.connection.prepare(&sql)?;
        let rows = statement
            .query_map(params![parent_task_id], TaskRow::from_sql)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ids of every row below `id`, excluding `id` itself.
    pub fn descendant_ids(&self, id: i64) -> Result<Vec<i64>, InfraError> {
        let mut statement = self.connection.prepare(
            "WITH RECURSIVE subtree(id) AS (
               SELECT id FROM tasks WHERE parent_task_id = ?1
               UNION ALL
               SELECT tasks.id FROM tasks JOIN subtree ON tasks.parent_task_id = subtree.id
             )
             SELECT id FROM subtree",
        )?;
        let ids = statement
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Top-level rows of one bucket. `today` bounds the date-based buckets.
    pub fn query(&self, query: TaskListQuery, today: NaiveDate) -> Result<Vec<TaskRow>, InfraError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_task_id IS NULL AND {}",
            bucket_filter(query)
        );
        let mut statement = self.connection.prepare(&sql)?;
        let rows = statement
            .query_map(params_from_iter(bucket_params(query, today)), TaskRow::from_sql)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[derive(Debug)]
pub struct SqliteTaskStore {
    db_path: PathBuf,
    changes: watch::Sender<u64>,
}

impl SqliteTaskStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            changes,
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }

    pub fn read<T, F>(&self, operation: F) -> Result<T, InfraError>
    where
        F: FnOnce(&TaskTable<'_>) -> Result<T, InfraError>,
    {
        let connection = self.connect()?;
        operation(&TaskTable::new(&connection))
    }

    /// Runs `operation` in one transaction and notifies observers after commit.
    pub fn write<T, F>(&self, operation: F) -> Result<T, InfraError>
    where
        F: FnOnce(&TaskTable<'_>) -> Result<T, InfraError>,
    {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let value = operation(&TaskTable::new(&transaction))?;
        transaction.commit()?;
        self.changes.send_modify(|version| *version += 1);
        debug!(version = *self.changes.borrow(), "task store changed");
        Ok(value)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
