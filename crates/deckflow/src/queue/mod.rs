//! Named FIFO queues carrying job ids.
//!
//! Every stage and pipeline kind owns one request queue (`<kind>:request`) and
//! one response queue per requester (`<kind>:response:<client_uid>`). Values
//! are decimal job ids; payloads never travel through the broker.

use std::time::Duration;

use async_trait::async_trait;

use crate::jobs::model::{JobId, JobKind};

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryBroker, MemoryConnector};
pub use self::redis::{RedisBroker, RedisConnector};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append `value` to the tail of `queue`.
    async fn push(&self, queue: &str, value: &str) -> anyhow::Result<()>;

    /// Blocking pop from the head of the first non-empty queue in `queues`,
    /// returning `(queue, value)`. `Ok(None)` on timeout.
    async fn pop(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, String)>>;
}

/// Opens fresh broker connections. Worker loops drop their connection on a
/// transient error and ask for a new one.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn Broker>>;
}

pub fn request_queue(kind: JobKind) -> String {
    format!("{kind}:request")
}

pub fn response_queue(kind: JobKind, client_uid: &str) -> String {
    format!("{kind}:response:{client_uid}")
}

/// Job ids travel as positive decimal integers.
pub fn parse_job_id(raw: &str) -> Option<JobId> {
    raw.trim().parse::<JobId>().ok().filter(|id| *id > 0)
}

pub async fn push_id(broker: &dyn Broker, queue: &str, id: JobId) -> anyhow::Result<()> {
    broker.push(queue, &id.to_string()).await
}
