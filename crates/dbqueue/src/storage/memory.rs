//! In-process queue storage.
//!
//! Emulates row locking without a database: every transaction owns the
//! rows it touched until commit or rollback, and the claim scan walks the
//! due rows in order and skips those owned by someone else. Rollback
//! replays an undo log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::queue::model::{NewTask, QueueLocation, TaskRecord};
use crate::queue::settings::FailureSettings;
use crate::storage::{QueueDatabase, QueueTransaction};

#[derive(Debug, Clone)]
struct StoredRow {
    table: String,
    queue_name: String,
    record: TaskRecord,
}

impl StoredRow {
    fn belongs_to(&self, location: &QueueLocation) -> bool {
        self.table == location.table_name() && self.queue_name == location.queue_id().as_str()
    }
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<i64, StoredRow>,
    /// row id -> owning transaction
    locks: HashMap<i64, u64>,
    last_id: i64,
    last_tx: u64,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone, Default)]
pub struct MemoryQueueDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryQueueDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed and uncommitted rows of `location`, ordered by id.
    pub fn tasks(&self, location: &QueueLocation) -> Vec<TaskRecord> {
        self.state
            .lock()
            .rows
            .values()
            .filter(|row| row.belongs_to(location))
            .map(|row| row.record.clone())
            .collect()
    }

    pub fn task(&self, task_id: i64) -> Option<TaskRecord> {
        self.state
            .lock()
            .rows
            .get(&task_id)
            .map(|row| row.record.clone())
    }

    /// Make a row due (or not) regardless of its schedule.
    pub fn set_next_process_at(&self, task_id: i64, at: DateTime<Utc>) -> bool {
        match self.state.lock().rows.get_mut(&task_id) {
            Some(row) => {
                row.record.next_process_at = at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl QueueDatabase for MemoryQueueDatabase {
    async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        let tx_id = {
            let mut state = self.state.lock();
            state.last_tx += 1;
            state.last_tx
        };
        Ok(Box::new(MemoryQueueTransaction {
            state: self.state.clone(),
            tx_id,
            undo: Vec::new(),
            open: true,
        }))
    }
}

pub struct MemoryQueueTransaction {
    state: Arc<Mutex<MemoryState>>,
    tx_id: u64,
    undo: Vec<(i64, Option<StoredRow>)>,
    open: bool,
}

/// Take the row lock for `tx_id` and remember the row's prior image.
fn lock_row(
    state: &mut MemoryState,
    undo: &mut Vec<(i64, Option<StoredRow>)>,
    tx_id: u64,
    task_id: i64,
) -> Result<()> {
    match state.locks.get(&task_id) {
        Some(owner) if *owner != tx_id => return Err(QueueError::RowLocked(task_id)),
        Some(_) => return Ok(()),
        None => {}
    }
    state.locks.insert(task_id, tx_id);
    undo.push((task_id, state.rows.get(&task_id).cloned()));
    Ok(())
}

impl MemoryQueueTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(QueueError::TransactionClosed)
        }
    }

    fn release(&mut self, restore: bool) {
        let mut state = self.state.lock();
        if restore {
            for (task_id, prior) in self.undo.drain(..).rev() {
                match prior {
                    Some(row) => {
                        state.rows.insert(task_id, row);
                    }
                    None => {
                        state.rows.remove(&task_id);
                    }
                }
            }
        } else {
            self.undo.clear();
        }
        let tx_id = self.tx_id;
        state.locks.retain(|_, owner| *owner != tx_id);
        self.open = false;
    }
}

#[async_trait]
impl QueueTransaction for MemoryQueueTransaction {
    async fn pick_task(
        &mut self,
        location: &QueueLocation,
        failure: &FailureSettings,
    ) -> Result<Option<TaskRecord>> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut state = self.state.lock();

        let mut due: Vec<(DateTime<Utc>, i64)> = state
            .rows
            .values()
            .filter(|row| row.belongs_to(location) && row.record.next_process_at <= now)
            .map(|row| (row.record.next_process_at, row.record.id))
            .collect();
        due.sort();

        let tx_id = self.tx_id;
        let candidate = due
            .into_iter()
            .map(|(_, id)| id)
            .find(|id| state.locks.get(id).map_or(true, |owner| *owner == tx_id));

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        lock_row(&mut state, &mut self.undo, tx_id, task_id)?;
        let Some(row) = state.rows.get_mut(&task_id) else {
            return Ok(None);
        };
        let record = &mut row.record;
        record.next_process_at = after(now, failure.delay_for(record.attempt));
        record.attempt += 1;
        record.total_attempt += 1;
        Ok(Some(record.clone()))
    }

    async fn enqueue_task(&mut self, location: &QueueLocation, task: &NewTask) -> Result<i64> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut state = self.state.lock();

        state.last_id += 1;
        let task_id = state.last_id;
        lock_row(&mut state, &mut self.undo, self.tx_id, task_id)?;
        state.rows.insert(
            task_id,
            StoredRow {
                table: location.table_name().to_string(),
                queue_name: location.queue_id().as_str().to_string(),
                record: TaskRecord {
                    id: task_id,
                    payload: task.payload.clone(),
                    attempt: 0,
                    reenqueue_attempt: 0,
                    total_attempt: 0,
                    created_at: now,
                    next_process_at: after(now, task.execution_delay),
                    ext_data: task.ext_data.clone(),
                },
            },
        );
        Ok(task_id)
    }

    async fn delete_task(&mut self, location: &QueueLocation, task_id: i64) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if !state.rows.get(&task_id).is_some_and(|row| row.belongs_to(location)) {
            return Ok(false);
        }
        lock_row(&mut state, &mut self.undo, self.tx_id, task_id)?;
        Ok(state.rows.remove(&task_id).is_some())
    }

    async fn reenqueue_task(
        &mut self,
        location: &QueueLocation,
        task_id: i64,
        delay: Duration,
    ) -> Result<bool> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        if !state.rows.get(&task_id).is_some_and(|row| row.belongs_to(location)) {
            return Ok(false);
        }
        lock_row(&mut state, &mut self.undo, self.tx_id, task_id)?;
        let Some(row) = state.rows.get_mut(&task_id) else {
            return Ok(false);
        };
        row.record.next_process_at = after(now, delay);
        row.record.attempt = 0;
        row.record.reenqueue_attempt += 1;
        Ok(true)
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.release(false);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.release(true);
        Ok(())
    }
}

impl Drop for MemoryQueueTransaction {
    fn drop(&mut self) {
        if self.open {
            self.release(true);
        }
    }
}
