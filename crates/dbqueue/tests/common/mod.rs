use dbqueue::queue::{NewTask, QueueId, QueueLocation};
use dbqueue::storage::PgQueueDatabase;
use dbqueue::QueueDatabase;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Connects to `TEST_DATABASE_URL`, migrates and empties the queue table.
/// Returns `None` (and the test should return early) when no database is
/// configured.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE queue_tasks RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

#[allow(dead_code)]
pub fn location(queue: &str) -> QueueLocation {
    QueueLocation::new(QueueId::new(queue), "queue_tasks")
}

#[allow(dead_code)]
pub async fn insert_task(db: &PgQueueDatabase, queue: &str, payload: &str) -> i64 {
    let mut tx = db.begin().await.expect("begin failed");
    let id = tx
        .enqueue_task(
            &location(queue),
            &NewTask {
                payload: Some(payload.to_string()),
                ..NewTask::default()
            },
        )
        .await
        .expect("failed to insert task");
    tx.commit().await.expect("commit failed");
    id
}

#[allow(dead_code)]
pub async fn counters(pool: &PgPool, id: i64) -> Option<(i32, i32, i32)> {
    sqlx::query_as::<_, (i32, i32, i32)>(
        "SELECT attempt, reenqueue_attempt, total_attempt FROM queue_tasks WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .unwrap()
}
