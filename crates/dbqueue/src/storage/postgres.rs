// crates/dbqueue/src/storage/postgres.rs

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::queue::model::{NewTask, QueueLocation, TaskRecord};
use crate::queue::retry::FailureRetryType;
use crate::queue::schema::QueueTableSchema;
use crate::queue::settings::FailureSettings;
use crate::storage::{QueueDatabase, QueueTransaction};

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct PgQueueDatabase {
    pool: PgPool,
    schema: Arc<QueueTableSchema>,
}

impl PgQueueDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self::with_schema(pool, QueueTableSchema::default())
    }

    pub fn with_schema(pool: PgPool, schema: QueueTableSchema) -> Self {
        Self {
            pool,
            schema: Arc::new(schema),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueDatabase for PgQueueDatabase {
    async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgQueueTransaction {
            tx: Some(tx),
            schema: self.schema.clone(),
        }))
    }
}

pub struct PgQueueTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    schema: Arc<QueueTableSchema>,
}

impl PgQueueTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(QueueError::TransactionClosed)
    }
}

#[async_trait]
impl QueueTransaction for PgQueueTransaction {
    /// Claim one due row.
    ///
    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED inside the CTE, so a
    /// row held by a concurrent claimant is skipped instead of waited on.
    async fn pick_task(
        &mut self,
        location: &QueueLocation,
        failure: &FailureSettings,
    ) -> Result<Option<TaskRecord>> {
        let sql = pick_sql(&self.schema, location, failure.retry_type);
        let schema = self.schema.clone();

        let row = sqlx::query(&sql)
            .bind(location.queue_id().as_str())
            .bind(millis(failure.retry_interval))
            .fetch_optional(self.conn()?)
            .await?;

        row.map(|r| record_from_row(&r, &schema)).transpose()
    }

    async fn enqueue_task(&mut self, location: &QueueLocation, task: &NewTask) -> Result<i64> {
        let sql = enqueue_sql(&self.schema, location);
        let schema = self.schema.clone();

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(location.queue_id().as_str())
            .bind(task.payload.as_deref())
            .bind(millis(task.execution_delay));
        for field in schema.extra_fields() {
            query = query.bind(task.ext_data.get(field).cloned());
        }

        let id = query.fetch_one(self.conn()?).await?;
        Ok(id)
    }

    async fn delete_task(&mut self, location: &QueueLocation, task_id: i64) -> Result<bool> {
        let sql = delete_sql(&self.schema, location);
        let res = sqlx::query(&sql)
            .bind(location.queue_id().as_str())
            .bind(task_id)
            .execute(self.conn()?)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn reenqueue_task(
        &mut self,
        location: &QueueLocation,
        task_id: i64,
        delay: Duration,
    ) -> Result<bool> {
        let sql = reenqueue_sql(&self.schema, location);
        let res = sqlx::query(&sql)
            .bind(location.queue_id().as_str())
            .bind(task_id)
            .bind(millis(delay))
            .execute(self.conn()?)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(QueueError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(QueueError::TransactionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}

fn returning_columns(schema: &QueueTableSchema, alias: &str) -> String {
    let mut cols = vec![
        schema.id_field(),
        schema.payload_field(),
        schema.attempt_field(),
        schema.reenqueue_attempt_field(),
        schema.total_attempt_field(),
        schema.created_at_field(),
        schema.next_process_at_field(),
    ];
    cols.extend(schema.extra_fields().iter().map(String::as_str));
    cols.iter()
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// $1 = queue name, $2 = failure retry interval in milliseconds.
///
/// The backoff factor reads `t.attempt` before the SET applies, i.e. the
/// pre-increment attempt count.
pub(crate) fn pick_sql(
    schema: &QueueTableSchema,
    location: &QueueLocation,
    retry_type: FailureRetryType,
) -> String {
    let table = location.table_name();
    let id = schema.id_field();
    let next = schema.next_process_at_field();
    let attempt = schema.attempt_field();
    let total = schema.total_attempt_field();
    let factor = retry_type.sql_factor(&format!("t.{attempt}"));

    format!(
        r#"
        WITH candidate AS (
          SELECT {id}
          FROM {table}
          WHERE {queue_name} = $1
            AND {next} <= now()
          ORDER BY {next} ASC, {id} ASC
          LIMIT 1
          FOR UPDATE SKIP LOCKED
        )
        UPDATE {table} t
        SET {next} = now() + ({factor} * $2::bigint * interval '1 millisecond'),
            {attempt} = t.{attempt} + 1,
            {total} = t.{total} + 1
        FROM candidate
        WHERE t.{id} = candidate.{id}
        RETURNING {returning}
        "#,
        queue_name = schema.queue_name_field(),
        returning = returning_columns(schema, "t"),
    )
}

/// $1 = queue name, $2 = payload, $3 = delay ms, $4.. = extension columns.
pub(crate) fn enqueue_sql(schema: &QueueTableSchema, location: &QueueLocation) -> String {
    let mut columns = Vec::new();
    let mut values = Vec::new();

    if let Some(seq) = location.id_sequence() {
        columns.push(schema.id_field().to_string());
        values.push(format!("nextval('{seq}')"));
    }
    columns.push(schema.queue_name_field().to_string());
    values.push("$1".to_string());
    columns.push(schema.payload_field().to_string());
    values.push("$2".to_string());
    columns.push(schema.next_process_at_field().to_string());
    values.push("now() + ($3::bigint * interval '1 millisecond')".to_string());
    columns.push(schema.attempt_field().to_string());
    values.push("0".to_string());
    columns.push(schema.reenqueue_attempt_field().to_string());
    values.push("0".to_string());
    columns.push(schema.total_attempt_field().to_string());
    values.push("0".to_string());
    for (i, field) in schema.extra_fields().iter().enumerate() {
        columns.push(field.clone());
        values.push(format!("${}", i + 4));
    }

    format!(
        "INSERT INTO {table} ({columns}) VALUES ({values}) RETURNING {id}",
        table = location.table_name(),
        columns = columns.join(", "),
        values = values.join(", "),
        id = schema.id_field(),
    )
}

/// $1 = queue name, $2 = id.
pub(crate) fn delete_sql(schema: &QueueTableSchema, location: &QueueLocation) -> String {
    format!(
        "DELETE FROM {table} WHERE {queue_name} = $1 AND {id} = $2",
        table = location.table_name(),
        queue_name = schema.queue_name_field(),
        id = schema.id_field(),
    )
}

/// $1 = queue name, $2 = id, $3 = delay ms.
///
/// `total_attempt` is left alone: the claim preceding every reenqueue
/// already counted this attempt.
pub(crate) fn reenqueue_sql(schema: &QueueTableSchema, location: &QueueLocation) -> String {
    format!(
        r#"
        UPDATE {table}
        SET {next} = now() + ($3::bigint * interval '1 millisecond'),
            {attempt} = 0,
            {reenqueue} = {reenqueue} + 1
        WHERE {queue_name} = $1
          AND {id} = $2
        "#,
        table = location.table_name(),
        next = schema.next_process_at_field(),
        attempt = schema.attempt_field(),
        reenqueue = schema.reenqueue_attempt_field(),
        queue_name = schema.queue_name_field(),
        id = schema.id_field(),
    )
}

fn record_from_row(row: &PgRow, schema: &QueueTableSchema) -> Result<TaskRecord> {
    let mut ext_data = HashMap::new();
    for field in schema.extra_fields() {
        if let Some(value) = row.try_get::<Option<String>, _>(field.as_str())? {
            ext_data.insert(field.clone(), value);
        }
    }

    Ok(TaskRecord {
        id: row.try_get(schema.id_field())?,
        payload: row.try_get(schema.payload_field())?,
        attempt: i64::from(row.try_get::<i32, _>(schema.attempt_field())?),
        reenqueue_attempt: i64::from(
            row.try_get::<i32, _>(schema.reenqueue_attempt_field())?,
        ),
        total_attempt: i64::from(row.try_get::<i32, _>(schema.total_attempt_field())?),
        created_at: row.try_get(schema.created_at_field())?,
        next_process_at: row.try_get(schema.next_process_at_field())?,
        ext_data,
    })
}
