use crate::domain::dates::parse_task_datetime;
use crate::domain::models::Task;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub trait AlarmScheduler: Send + Sync {
    /// Arms a one-shot trigger at the task's notify time. Tasks whose notify
    /// value is empty, unparseable or already past are ignored.
    fn schedule(&self, task: &Task) -> Result<(), InfraError>;
    fn cancel(&self, task_id: i64) -> Result<(), InfraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlarmPrecision {
    #[default]
    Exact,
    /// Fires on the next whole minute at or after the requested time.
    Inexact,
}

impl AlarmPrecision {
    /// Exact timing when the host allows it, minute-granular otherwise.
    pub fn when_exact_available(available: bool) -> Self {
        if available { Self::Exact } else { Self::Inexact }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEvent {
    pub task_id: i64,
    pub title: String,
    pub fire_at: DateTime<Utc>,
}

/// Resolves a task's notify value to an instant in `timezone`, if it lies after `now`.
pub fn notify_instant(task: &Task, timezone: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local = parse_task_datetime(&task.notify)?;
    let fire_at = timezone
        .from_local_datetime(&local)
        .earliest()?
        .with_timezone(&Utc);
    (fire_at > now).then_some(fire_at)
}

pub struct TokioAlarmScheduler {
    timezone: Tz,
    precision: AlarmPrecision,
    events: mpsc::UnboundedSender<AlarmEvent>,
    armed: Mutex<HashMap<i64, JoinHandle<()>>>,
    now_provider: NowProvider,
}

impl TokioAlarmScheduler {
    pub fn new(timezone: Tz, events: mpsc::UnboundedSender<AlarmEvent>) -> Self {
        Self {
            timezone,
            precision: AlarmPrecision::default(),
            events,
            armed: Mutex::new(HashMap::new()),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_precision(mut self, precision: AlarmPrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn armed_ids(&self) -> Result<Vec<i64>, InfraError> {
        let armed = self.lock_armed()?;
        let mut ids: Vec<i64> = armed
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn lock_armed(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, JoinHandle<()>>>, InfraError> {
        self.armed
            .lock()
            .map_err(|error| InfraError::Alarm(format!("alarm table lock poisoned: {error}")))
    }

    fn delay_until(&self, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
        let delay = (fire_at - now).to_std().unwrap_or_default();
        match self.precision {
            AlarmPrecision::Exact => delay,
            AlarmPrecision::Inexact => {
                let remainder = delay.as_secs() % 60;
                if remainder == 0 && delay.subsec_nanos() == 0 {
                    delay
                } else {
                    std::time::Duration::from_secs(delay.as_secs() - remainder + 60)
                }
            }
        }
    }
}

impl AlarmScheduler for TokioAlarmScheduler {
    fn schedule(&self, task: &Task) -> Result<(), InfraError> {
        let now = (self.now_provider)();
        let Some(fire_at) = notify_instant(task, self.timezone, now) else {
            debug!(task_id = task.id, notify = %task.notify, "no future notify time, alarm not armed");
            return Ok(());
        };
        let runtime = Handle::try_current()
            .map_err(|error| InfraError::Alarm(format!("no async runtime to arm alarm: {error}")))?;

        let delay = self.delay_until(fire_at, now);
        let event = AlarmEvent {
            task_id: task.id,
            title: task.title.clone(),
            fire_at,
        };
        let events = self.events.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            info!(task_id = event.task_id, title = %event.title, "alarm fired");
            let _ = events.send(event);
        });

        let mut armed = self.lock_armed()?;
        armed.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = armed.insert(task.id, handle) {
            previous.abort();
        }
        drop(armed);
        debug!(task_id = task.id, %fire_at, precision = ?self.precision, "alarm armed");
        Ok(())
    }

    fn cancel(&self, task_id: i64) -> Result<(), InfraError> {
        if let Some(handle) = self.lock_armed()?.remove(&task_id) {
            handle.abort();
            debug!(task_id, "alarm cancelled");
        }
        Ok(())
    }
}

impl Drop for TokioAlarmScheduler {
    fn drop(&mut self) {
        if let Ok(armed) = self.armed.get_mut() {
            for (_, handle) in armed.drain() {
                handle.abort();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmCall {
    Scheduled(i64),
    Cancelled(i64),
}

/// Records every call without arming anything.
#[derive(Debug, Default)]
pub struct InMemoryAlarmScheduler {
    calls: Mutex<Vec<AlarmCall>>,
}

impl InMemoryAlarmScheduler {
    pub fn calls(&self) -> Vec<AlarmCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn scheduled_ids(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AlarmCall::Scheduled(id) => Some(id),
                AlarmCall::Cancelled(_) => None,
            })
            .collect()
    }

    pub fn cancelled_ids(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AlarmCall::Cancelled(id) => Some(id),
                AlarmCall::Scheduled(_) => None,
            })
            .collect()
    }

    fn record(&self, call: AlarmCall) -> Result<(), InfraError> {
        let mut calls = self
            .calls
            .lock()
            .map_err(|error| InfraError::Alarm(format!("alarm recorder lock poisoned: {error}")))?;
        calls.push(call);
        Ok(())
    }
}

impl AlarmScheduler for InMemoryAlarmScheduler {
    fn schedule(&self, task: &Task) -> Result<(), InfraError> {
        self.record(AlarmCall::Scheduled(task.id))
    }

    fn cancel(&self, task_id: i64) -> Result<(), InfraError> {
        self.record(AlarmCall::Cancelled(task_id))
    }
}
