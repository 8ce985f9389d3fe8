//! Task journal and failure log persistence.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row};

use super::connection::Store;
use super::hash::signature_hash;
use super::{FailedTask, TaskStore};
use crate::queue::Task;
use crate::{Error, now_unix};

const TASK_COLUMNS: &str = "task_id, name, arguments_json, signature, create_date, start_date, timeout_date,
     priority, retry_count, retry_max, lock_id, error";

/// A task row with its arguments still encoded.
type TaskRow = (Task, String);

fn task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    let task = Task {
        task_id: row.get(0)?,
        name: row.get(1)?,
        arguments: Map::new(),
        signature: row.get(3)?,
        create_date: row.get(4)?,
        start_date: row.get(5)?,
        timeout_date: row.get(6)?,
        priority: row.get(7)?,
        retry_count: row.get(8)?,
        retry_max: row.get(9)?,
        lock_id: row.get(10)?,
        error: row.get(11)?,
    };
    Ok((task, row.get(2)?))
}

fn decode_arguments(id: &str, json: &str) -> Result<Map<String, Value>, Error> {
    serde_json::from_str(json).map_err(|e| Error::CorruptRecord(format!("task {id} arguments: {e}")))
}

fn decode_task((mut task, arguments_json): TaskRow) -> Result<Task, Error> {
    task.arguments = decode_arguments(&task.task_id, &arguments_json)?;
    Ok(task)
}

#[async_trait]
impl TaskStore for Store {
    async fn insert_task(&self, task: &Task) -> Result<bool, Error> {
        let task = task.clone();
        let arguments_json = serde_json::to_string(&task.arguments)?;
        let hash = task.signature.as_deref().map(|sig| signature_hash(&task.name, sig));

        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let inserted = conn.execute(
                    "INSERT INTO tasks (
                        task_id, name, arguments_json, signature, signature_hash, create_date,
                        start_date, timeout_date, priority, retry_count, retry_max, lock_id, error
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    ON CONFLICT(signature_hash) DO NOTHING",
                    params![
                        &task.task_id,
                        &task.name,
                        arguments_json,
                        &task.signature,
                        hash,
                        task.create_date,
                        task.start_date,
                        task.timeout_date,
                        task.priority,
                        task.retry_count,
                        task.retry_max,
                        &task.lock_id,
                        &task.error,
                    ],
                )?;
                Ok(inserted > 0)
            })
            .await
            .map_err(Error::from)
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<Task>, Error> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Task>, Error> {
                let row = conn
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                        params![task_id],
                        task_row,
                    )
                    .optional()?;
                row.map(decode_task).transpose()
            })
            .await
            .map_err(Error::from)
    }

    async fn lock_tasks(&self, lock_id: &str, now: i64, timeout_date: i64, limit: usize) -> Result<u64, Error> {
        let lock_id = lock_id.to_string();
        let limit = limit as i64;
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "UPDATE tasks SET lock_id = ?1, timeout_date = ?2
                     WHERE task_id IN (
                        SELECT task_id FROM tasks
                        WHERE timeout_date <= ?3 AND start_date <= ?3
                        ORDER BY priority ASC, start_date ASC
                        LIMIT ?4
                     )",
                    params![lock_id, timeout_date, now, limit],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    async fn locked_tasks(&self, lock_id: &str) -> Result<Vec<Task>, Error> {
        let lock_id = lock_id.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<Task>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE lock_id = ?1 ORDER BY priority ASC, start_date ASC"
                ))?;
                let rows = stmt
                    .query_map(params![lock_id], task_row)?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                rows.into_iter().map(decode_task).collect()
            })
            .await
            .map_err(Error::from)
    }

    async fn update_task(&self, task: &Task) -> Result<(), Error> {
        let task = task.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "UPDATE tasks SET
                        start_date = ?2, timeout_date = ?3, priority = ?4, retry_count = ?5,
                        retry_max = ?6, lock_id = ?7, error = ?8
                     WHERE task_id = ?1",
                    params![
                        &task.task_id,
                        task.start_date,
                        task.timeout_date,
                        task.priority,
                        task.retry_count,
                        task.retry_max,
                        &task.lock_id,
                        &task.error,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), Error> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn log_failure(&self, task: &Task, error: &str) -> Result<(), Error> {
        let task = task.clone();
        let error = error.to_string();
        let arguments_json = serde_json::to_string(&task.arguments)?;
        let failed_at = now_unix();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO task_failures (task_id, name, arguments_json, error, retry_count, failed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![&task.task_id, &task.name, arguments_json, error, task.retry_count, failed_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn failures(&self, limit: usize) -> Result<Vec<FailedTask>, Error> {
        let limit = limit as i64;
        self.conn
            .call(move |conn| -> Result<Vec<FailedTask>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT task_id, name, arguments_json, error, retry_count, failed_at
                     FROM task_failures ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, u32>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;

                rows.into_iter()
                    .map(|(task_id, name, arguments_json, error, retry_count, failed_at)| {
                        let arguments = decode_arguments(&task_id, &arguments_json)?;
                        Ok(FailedTask { task_id, name, arguments, error, retry_count, failed_at })
                    })
                    .collect()
            })
            .await
            .map_err(Error::from)
    }

    async fn count_tasks(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
