//! Work queue: at-least-once delivery of run identifiers to workers.
//!
//! Messages are deleted only after a successful terminal commit. The queue's
//! visibility timeout must be kept aligned with lease_ttl_seconds (configured
//! on the queue itself): an abandoned message then redelivers after the
//! reaper has already driven the run terminal, and the next receiver simply
//! observes a non-QUEUED row and discards.

use async_trait::async_trait;
use std::time::Duration;

use tollgate_common::api::JobMessage;

use crate::error::{EngineError, EngineResult};

/// A received message plus the opaque handle needed to delete it.
#[derive(Clone, Debug)]
pub struct ReceivedJob {
    pub message: JobMessage,
    pub receipt: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, message: &JobMessage) -> EngineResult<()>;

    /// Long-poll receive of up to `max` messages.
    async fn receive(&self, max: usize, wait: Duration) -> EngineResult<Vec<ReceivedJob>>;

    async fn delete(&self, receipt: &str) -> EngineResult<()>;
}

/// Production queue on SQS. Dead-lettering after N receives is queue
/// configuration, not engine logic.
pub struct SqsWorkQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsWorkQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl WorkQueue for SqsWorkQueue {
    async fn send(&self, message: &JobMessage) -> EngineResult<()> {
        let body = serde_json::to_string(message)
            .map_err(|err| EngineError::Internal(format!("queue message encode: {err}")))?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(EngineError::queue)?;
        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> EngineResult<Vec<ReceivedJob>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.min(10) as i32)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .send()
            .await
            .map_err(EngineError::queue)?;

        let mut jobs = Vec::new();
        for raw in output.messages() {
            let (Some(body), Some(receipt)) = (raw.body(), raw.receipt_handle()) else {
                continue;
            };
            match serde_json::from_str::<JobMessage>(body) {
                Ok(message) => jobs.push(ReceivedJob {
                    message,
                    receipt: receipt.to_string(),
                }),
                Err(err) => {
                    // Malformed payload: drop it rather than poison the queue.
                    log::error!("Discarding undecodable queue message: {}", err);
                    self.delete(receipt).await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn delete(&self, receipt: &str) -> EngineResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(EngineError::queue)?;
        Ok(())
    }
}
