// Distributed lease lock gating the pipeline cycle.
//
// SET NX PX with a random holder token; a background heartbeat extends
// the lease while the guard lives, and release/extend compare the token
// server-side so a stale holder can never clobber a newer one. If the
// heartbeat ever fails to extend, the guard reports the lease as lost
// and the holder must abort before its next state-mutating step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gps2bq_config::RedisConfig;
use gps2bq_core::{nonce, LeaseGuard, LeaseLock, SourceError};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    key: String,
    ttl: Duration,
    command_timeout: Duration,
}

impl RedisLock {
    pub async fn connect(config: &RedisConfig) -> Result<Self, SourceError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            key: config.lock_key.clone(),
            ttl: config.lock_ttl(),
            command_timeout: config.command_timeout(),
        })
    }

    /// Share the drainer's connection instead of opening a second one.
    pub fn with_connection(conn: ConnectionManager, config: &RedisConfig) -> Self {
        Self {
            conn,
            key: config.lock_key.clone(),
            ttl: config.lock_ttl(),
            command_timeout: config.command_timeout(),
        }
    }
}

#[async_trait]
impl LeaseLock for RedisLock {
    async fn acquire(&self) -> Result<Option<Box<dyn LeaseGuard>>, SourceError> {
        let token = nonce(16);
        let mut conn = self.conn.clone();

        let set: Option<String> = tokio::time::timeout(self.command_timeout, async {
            redis::cmd("SET")
                .arg(&self.key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
        })
        .await
        .map_err(|_| SourceError::Unavailable("lock acquire timed out".to_string()))?
        .map_err(|e: redis::RedisError| SourceError::Unavailable(e.to_string()))?;

        if set.is_none() {
            debug!(key = %self.key, "lock held elsewhere");
            return Ok(None);
        }

        let held = Arc::new(AtomicBool::new(true));
        let heartbeat = spawn_heartbeat(
            self.conn.clone(),
            self.key.clone(),
            token.clone(),
            self.ttl,
            Arc::clone(&held),
        );

        debug!(key = %self.key, "lock acquired");
        Ok(Some(Box::new(RedisLeaseGuard {
            conn: self.conn.clone(),
            key: self.key.clone(),
            token,
            held,
            heartbeat,
            command_timeout: self.command_timeout,
        })))
    }
}

/// Extend the lease at a third of its TTL until stopped or lost.
fn spawn_heartbeat(
    conn: ConnectionManager,
    key: String,
    token: String,
    ttl: Duration,
    held: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = ttl / 3;
        let script = Script::new(EXTEND_SCRIPT);
        let mut conn = conn;
        loop {
            tokio::time::sleep(period).await;

            let extended: redis::RedisResult<i64> = script
                .key(&key)
                .arg(&token)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await;

            match extended {
                Ok(1) => {}
                Ok(_) => {
                    warn!(key = %key, "lease lost: token no longer present");
                    held.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "lease heartbeat failed");
                    held.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    })
}

struct RedisLeaseGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
    held: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
    command_timeout: Duration,
}

#[async_trait]
impl LeaseGuard for RedisLeaseGuard {
    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    async fn release(self: Box<Self>) {
        self.heartbeat.abort();
        self.held.store(false, Ordering::SeqCst);

        let mut conn = self.conn.clone();
        let script = Script::new(RELEASE_SCRIPT);
        let released: Result<redis::RedisResult<i64>, _> =
            tokio::time::timeout(self.command_timeout, async {
                script
                    .key(&self.key)
                    .arg(&self.token)
                    .invoke_async(&mut conn)
                    .await
            })
            .await;

        match released {
            Ok(Ok(1)) => debug!(key = %self.key, "lock released"),
            Ok(Ok(_)) => debug!(key = %self.key, "lock already expired"),
            Ok(Err(e)) => warn!(key = %self.key, error = %e, "lock release failed; lease will expire"),
            Err(_) => warn!(key = %self.key, "lock release timed out; lease will expire"),
        }
    }
}

impl Drop for RedisLeaseGuard {
    fn drop(&mut self) {
        // Guards dropped without an explicit release (cancellation,
        // panic unwind) stop heartbeating so the TTL reclaims the lock.
        self.heartbeat.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_compare_the_holder_token() {
        assert!(RELEASE_SCRIPT.contains("GET"));
        assert!(RELEASE_SCRIPT.contains("ARGV[1]"));
        assert!(EXTEND_SCRIPT.contains("PEXPIRE"));
        assert!(EXTEND_SCRIPT.contains("ARGV[2]"));
    }
}
