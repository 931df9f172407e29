pub mod api;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod listener;
pub mod producer;
pub mod queue;
pub mod runner;
pub mod service;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use consumer::{QueueConfig, QueueConsumer};
pub use error::{QueueError, Result};
pub use producer::{QueueProducer, QueueShardRouter, ShardingQueueProducer};
pub use service::QueueService;
pub use storage::{QueueDatabase, QueueShard, QueueTransaction};
