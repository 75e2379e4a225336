use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Broker, BrokerConnector};

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<String>>,
    pushes: Vec<(String, String)>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    unavailable: AtomicBool,
}

/// In-process broker with the same FIFO and timeout behavior as Redis lists.
/// Keeps a log of every push for assertions.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("broker unavailable");
        }
        Ok(())
    }

    fn try_pop(&self, queues: &[String]) -> Option<(String, String)> {
        let mut state = self.state();
        queues.iter().find_map(|queue| {
            let value = state.queues.get_mut(queue)?.pop_front()?;
            Some((queue.clone(), value))
        })
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Values pushed to `queue` over the broker's lifetime, in order.
    pub fn pushes_to(&self, queue: &str) -> Vec<String> {
        self.state()
            .pushes
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Values currently waiting in `queue`.
    pub fn pending(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, queue: &str, value: &str) -> anyhow::Result<()> {
        self.check_available()?;
        {
            let mut state = self.state();
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(value.to_string());
            state.pushes.push((queue.to_string(), value.to_string()));
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn pop(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // register before checking so a push in between is not missed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            if let Some(popped) = self.try_pop(queues) {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

/// Hands out handles to one shared [`MemoryBroker`] and counts connects.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn Broker>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.broker.check_available()?;
        Ok(Box::new(self.broker.clone()))
    }
}
