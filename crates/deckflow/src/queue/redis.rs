use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{Broker, BrokerConnector};

/// Broker over Redis lists: `RPUSH` to enqueue, `BLPOP` to dequeue.
#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
}

impl RedisBroker {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, queue: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(queue)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, String)>> {
        let mut conn = self.conn.clone();
        // BLPOP replies nil on timeout, else [queue, value]
        let ret: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(queues)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(ret)
    }
}

#[derive(Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn Broker>> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisBroker::new(conn)))
    }
}
