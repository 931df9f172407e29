pub mod model;
pub mod payload;
pub mod reenqueue;
pub mod retry;
pub mod schema;
pub mod settings;

pub use model::{
    ActionType, EnqueueParams, EnqueueResult, NewTask, QueueId, QueueLocation,
    QueueProcessingStatus, QueueShardId, Task, TaskExecutionResult, TaskRecord,
};
pub use payload::{JsonPayloadTransformer, PayloadTransformer, StringPayloadTransformer};
pub use reenqueue::{reenqueue_strategy, ReenqueueRetryStrategy, ReenqueueSettings};
pub use retry::FailureRetryType;
pub use schema::QueueTableSchema;
pub use settings::{
    FailureSettings, PollSettings, ProcessingMode, ProcessingSettings, QueueSettings,
    SettingsHandle,
};
