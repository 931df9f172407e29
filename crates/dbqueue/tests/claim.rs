// tests/claim.rs
mod common;

use common::{counters, insert_task, location, setup_db};

use chrono::Utc;
use dbqueue::queue::{FailureRetryType, FailureSettings, QueueSettings, SettingsHandle};
use dbqueue::queue::{TaskExecutionResult, ReenqueueSettings};
use dbqueue::runner::TaskResultHandler;
use dbqueue::storage::PgQueueDatabase;
use dbqueue::QueueDatabase;
use serial_test::serial;
use std::time::Duration;

fn failure(retry_type: FailureRetryType) -> FailureSettings {
    FailureSettings {
        retry_type,
        retry_interval: Duration::from_secs(60),
    }
}

#[tokio::test]
#[serial]
async fn two_claimants_never_get_the_same_task() {
    let Some(pool) = setup_db().await else { return };
    let db = PgQueueDatabase::new(pool.clone());
    insert_task(&db, "default", "only").await;

    let mut tx_a = db.begin().await.unwrap();
    let mut tx_b = db.begin().await.unwrap();
    let failure = failure(FailureRetryType::GeometricBackoff);

    let loc = location("default");
    let (a, b) = tokio::join!(
        tx_a.pick_task(&loc, &failure),
        tx_b.pick_task(&loc, &failure),
    );
    let got_a = a.unwrap().is_some();
    let got_b = b.unwrap().is_some();

    // XOR: exactly one claimant wins, the other skips the locked row
    assert!(
        got_a ^ got_b,
        "expected exactly one claim, got_a={got_a}, got_b={got_b}"
    );
    tx_a.commit().await.unwrap();
    tx_b.commit().await.unwrap();
}

#[tokio::test]
#[serial]
async fn claim_advances_counters_and_schedules_failure_backoff() {
    let Some(pool) = setup_db().await else { return };
    let db = PgQueueDatabase::new(pool.clone());
    let id = insert_task(&db, "default", "p").await;

    let before = Utc::now();
    let mut tx = db.begin().await.unwrap();
    let record = tx
        .pick_task(&location("default"), &failure(FailureRetryType::ArithmeticBackoff))
        .await
        .unwrap()
        .expect("task should be claimable");
    tx.commit().await.unwrap();

    assert_eq!(record.id, id);
    assert_eq!(record.payload.as_deref(), Some("p"));
    assert_eq!(counters(&pool, id).await, Some((1, 0, 1)));
    // arithmetic backoff for attempt 0 is one interval
    let wait = record.next_process_at - before;
    assert!(wait >= chrono::Duration::seconds(59) && wait <= chrono::Duration::seconds(62));

    let mut tx = db.begin().await.unwrap();
    let again = tx
        .pick_task(&location("default"), &failure(FailureRetryType::ArithmeticBackoff))
        .await
        .unwrap();
    assert!(again.is_none(), "task must wait out its backoff");
}

#[tokio::test]
#[serial]
async fn claim_orders_by_next_process_at_then_id() {
    let Some(pool) = setup_db().await else { return };
    let db = PgQueueDatabase::new(pool.clone());
    let first = insert_task(&db, "default", "a").await;
    let second = insert_task(&db, "default", "b").await;
    sqlx::query("UPDATE queue_tasks SET next_process_at = now() - interval '10 seconds'")
        .execute(&pool)
        .await
        .unwrap();
    insert_task(&db, "other", "c").await;

    let failure = failure(FailureRetryType::LinearBackoff);
    let mut tx = db.begin().await.unwrap();
    let a = tx.pick_task(&location("default"), &failure).await.unwrap().unwrap();
    let b = tx.pick_task(&location("default"), &failure).await.unwrap().unwrap();
    let none = tx.pick_task(&location("default"), &failure).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!((a.id, b.id), (first, second));
    assert!(none.is_none());
}

#[tokio::test]
#[serial]
async fn finish_and_reenqueue_update_the_row() {
    let Some(pool) = setup_db().await else { return };
    let db = PgQueueDatabase::new(pool.clone());
    let finished = insert_task(&db, "default", "done").await;
    let requeued = insert_task(&db, "default", "again").await;

    let settings = SettingsHandle::new(QueueSettings::default().with_reenqueue(
        ReenqueueSettings::Fixed {
            fixed_delay: Duration::from_secs(10),
        },
    ));
    let handler = TaskResultHandler::new(location("default"), settings.clone());
    let failure = settings.load().failure.clone();

    let mut tx = db.begin().await.unwrap();
    let a = tx.pick_task(&location("default"), &failure).await.unwrap().unwrap();
    let b = tx.pick_task(&location("default"), &failure).await.unwrap().unwrap();
    handler
        .handle_result(&mut *tx, &a, &TaskExecutionResult::finish())
        .await
        .unwrap();
    handler
        .handle_result(&mut *tx, &b, &TaskExecutionResult::reenqueue())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(a.id, finished);
    assert_eq!(counters(&pool, finished).await, None);
    assert_eq!(counters(&pool, requeued).await, Some((0, 1, 1)));
}

#[tokio::test]
#[serial]
async fn rollback_undoes_the_claim() {
    let Some(pool) = setup_db().await else { return };
    let db = PgQueueDatabase::new(pool.clone());
    let id = insert_task(&db, "default", "p").await;

    let mut tx = db.begin().await.unwrap();
    tx.pick_task(&location("default"), &failure(FailureRetryType::GeometricBackoff))
        .await
        .unwrap()
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(counters(&pool, id).await, Some((0, 0, 0)));
}
