use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueError;
use crate::producer::QueueProducer;
use crate::queue::model::{EnqueueParams, QueueId};
use crate::service::QueueService;

pub mod models;

use models::{EnqueueRequest, EnqueueResponse, QueueStatusItem};

pub type JsonProducer = Arc<dyn QueueProducer<Value>>;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<QueueService>,
    /// Queues that accept enqueues over HTTP.
    pub producers: Arc<HashMap<QueueId, JsonProducer>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/queues", get(list_queues))
        .route("/queues/:id/pause", post(pause_queue))
        .route("/queues/:id/unpause", post(unpause_queue))
        .route("/queues/:id/wakeup", post(wakeup_queue))
        .route("/queues/:id/tasks", post(enqueue_task))
        .route("/health", get(health))
        .with_state(state)
}

fn queue_err(e: QueueError) -> (StatusCode, String) {
    match e {
        QueueError::UnknownQueue(_) | QueueError::UnknownShard(_) => {
            (StatusCode::NOT_FOUND, e.to_string())
        }
        QueueError::InvalidSettings(_) | QueueError::Payload(_) => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("internal error: {e}"),
        ),
    }
}

pub async fn list_queues(State(state): State<ApiState>) -> Json<Vec<QueueStatusItem>> {
    let items = state
        .service
        .registered_queues()
        .into_iter()
        .map(|queue_id| QueueStatusItem {
            paused: state.service.is_queue_paused(&queue_id).unwrap_or(false),
            shutdown: state.service.is_queue_shutdown(&queue_id).unwrap_or(false),
            terminated: state.service.is_queue_terminated(&queue_id).unwrap_or(false),
            accepts_tasks: state.producers.contains_key(&queue_id),
            queue_id,
        })
        .collect();
    Json(items)
}

pub async fn pause_queue(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .service
        .pause_queue(&QueueId::new(id))
        .map_err(queue_err)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpause_queue(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .service
        .unpause_queue(&QueueId::new(id))
        .map_err(queue_err)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn wakeup_queue(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .service
        .wakeup_queue(&QueueId::new(id))
        .map_err(queue_err)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enqueue_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, (StatusCode, String)> {
    let queue_id = QueueId::new(id);
    let producer = state.producers.get(&queue_id).cloned().ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("queue does not accept tasks: queue_id={queue_id}"),
        )
    })?;

    let EnqueueRequest {
        payload,
        delay_ms,
        mut ext,
    } = body;
    let trace_id = ext
        .entry("trace_id".to_string())
        .or_insert_with(|| Uuid::new_v4().to_string())
        .clone();

    let mut params = match payload {
        Some(payload) => EnqueueParams::create(payload),
        None => EnqueueParams::empty(),
    }
    .with_execution_delay(Duration::from_millis(delay_ms.unwrap_or(0)));
    params.ext_data = ext;

    let result = producer.enqueue(params).await.map_err(queue_err)?;

    // a delayed task is not due yet, nothing to wake for
    if delay_ms.unwrap_or(0) == 0 {
        if let Err(e) = state.service.wakeup(&queue_id, &result.shard_id) {
            tracing::warn!(queue_id = %queue_id, error = %e, "wakeup after enqueue failed");
        }
    }

    Ok(Json(EnqueueResponse {
        queue_id,
        shard_id: result.shard_id,
        enqueue_id: result.enqueue_id,
        trace_id,
    }))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
