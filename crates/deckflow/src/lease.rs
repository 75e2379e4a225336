//! Short-lived cross-worker leases for "globally at most once" housekeeping.
//!
//! A lease is a key holding a random token with a TTL. The holder renews it
//! every `ttl / 3` from a background task; renew and release only touch the
//! key while it still holds the holder's token. A crashed holder simply
//! stops renewing and the key expires.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[async_trait]
pub trait LeaseBackend: Send + Sync + 'static {
    /// Take `key` if free. True when acquired.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Extend the TTL if `key` still holds `token`.
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Delete `key` if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> anyhow::Result<bool>;
}

// ----------------------------
// Redis backend
// ----------------------------

const RENEW_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Lease backend over one shared, self-reconnecting Redis connection, opened
/// on first use.
#[derive(Clone)]
pub struct RedisLease {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl RedisLease {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Arc::new(OnceCell::new()),
        }
    }

    async fn conn(&self) -> anyhow::Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LeaseBackend for RedisLease {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

// ----------------------------
// Memory backend
// ----------------------------

/// Process-local lease table; expiry follows tokio's clock.
#[derive(Clone, Default)]
pub struct MemoryLease {
    held: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> R) -> R {
        let mut table = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        table.retain(|_, (_, expires)| *expires > now);
        f(&mut table)
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.with_table(|t| t.contains_key(key))
    }
}

#[async_trait]
impl LeaseBackend for MemoryLease {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        Ok(self.with_table(|t| {
            if t.contains_key(key) {
                return false;
            }
            t.insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
            true
        }))
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        Ok(self.with_table(|t| match t.get_mut(key) {
            Some((held, expires)) if held == token => {
                *expires = Instant::now() + ttl;
                true
            }
            _ => false,
        }))
    }

    async fn release(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        Ok(self.with_table(|t| {
            if t.get(key).is_some_and(|(held, _)| held == token) {
                t.remove(key);
                true
            } else {
                false
            }
        }))
    }
}

// ----------------------------
// Guard
// ----------------------------

/// A held lease. Renewed in the background; released on [`LeaseGuard::release`]
/// or when dropped.
pub struct LeaseGuard {
    backend: Arc<dyn LeaseBackend>,
    key: String,
    token: String,
    lost: Arc<AtomicBool>,
    renewer: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    pub async fn acquire(
        backend: Arc<dyn LeaseBackend>,
        key: &str,
        ttl: Duration,
    ) -> anyhow::Result<Option<Self>> {
        let token = uuid::Uuid::new_v4().to_string();
        if !backend.try_acquire(key, &token, ttl).await? {
            return Ok(None);
        }
        debug!(lease = key, "lease acquired");

        let lost = Arc::new(AtomicBool::new(false));
        let renewer = tokio::spawn(renew_loop(
            backend.clone(),
            key.to_string(),
            token.clone(),
            ttl,
            lost.clone(),
        ));

        Ok(Some(Self {
            backend,
            key: key.to_string(),
            token,
            lost,
            renewer: Some(renewer),
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// True once a renewal found the key gone or taken by someone else.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
        let released = self.backend.release(&self.key, &self.token).await?;
        if !released {
            warn!(lease = %self.key, "lease expired before release");
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(renewer) = self.renewer.take() else {
            return;
        };
        renewer.abort();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // no runtime left; the key will expire on its own
            return;
        };
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = backend.release(&key, &token).await {
                warn!(lease = %key, error = %e, "lease release on drop failed");
            }
        });
    }
}

async fn renew_loop(
    backend: Arc<dyn LeaseBackend>,
    key: String,
    token: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let every = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(every).await;
        match backend.renew(&key, &token, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(lease = %key, "lease lost");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                // keep trying; the key survives until ttl runs out
                warn!(lease = %key, error = %e, "lease renew failed");
            }
        }
    }
}

/// Run `f` while holding `key`. `Ok(None)` when someone else holds it. The
/// lease is released whether `f` succeeds or fails.
pub async fn run_exclusive<T, F, Fut>(
    backend: Arc<dyn LeaseBackend>,
    key: &str,
    ttl: Duration,
    f: F,
) -> anyhow::Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let Some(guard) = LeaseGuard::acquire(backend, key, ttl).await? else {
        return Ok(None);
    };

    let out = f().await;
    let released = guard.release().await;
    let value = out?;
    released?;
    Ok(Some(value))
}
