// Atomic read-then-clear of the per-stream Redis lists.
//
// The primary realization runs server-side as a Lua script, so the
// read+delete pair is atomic with respect to concurrent producers.
// When scripting is disabled by configuration, a RENAME-based fallback
// preserves the invariant: producers targeting the live key see it
// empty during the window.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use gps2bq_config::RedisConfig;
use gps2bq_core::{nonce, DrainResult, QueueSource, SourceError, StreamType};

/// `LRANGE` + `DEL` as one server-side step.
const DRAIN_SCRIPT: &str = r#"
local v = redis.call('LRANGE', KEYS[1], 0, -1)
redis.call('DEL', KEYS[1])
return v
"#;

/// Destructive consumer of the telemetry lists.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    gps_key: String,
    mobile_key: String,
    command_timeout: Duration,
    atomic: bool,
}

impl RedisQueue {
    pub async fn connect(config: &RedisConfig) -> Result<Self, SourceError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            gps_key: config.gps_key.clone(),
            mobile_key: config.mobile_key.clone(),
            command_timeout: config.command_timeout(),
            atomic: config.atomic_enabled,
        })
    }

    /// Handle to the underlying connection, for components that share it.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn key(&self, stream: StreamType) -> &str {
        match stream {
            StreamType::Gps => &self.gps_key,
            StreamType::Mobile => &self.mobile_key,
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, SourceError> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SourceError::Unavailable(e.to_string())),
            Err(_) => Err(SourceError::Unavailable(format!(
                "redis command timed out after {:?}",
                self.command_timeout
            ))),
        }
    }

    async fn drain_scripted(&self, stream: StreamType) -> Result<Vec<String>, SourceError> {
        let key = self.key(stream).to_string();
        let mut conn = self.conn.clone();
        let script = Script::new(DRAIN_SCRIPT);
        self.with_timeout(async move { script.key(&key).invoke_async(&mut conn).await })
            .await
    }

    /// RENAME the live key aside, read it, delete it. Producers keep
    /// pushing to the live key the whole time.
    async fn drain_renamed(&self, stream: StreamType) -> Result<Vec<String>, SourceError> {
        let key = self.key(stream).to_string();
        let shadow = format!("{}:drain:{}", key, nonce(4));

        let rename: Result<(), SourceError> = {
            let key = key.clone();
            let shadow = shadow.clone();
            let mut conn = self.conn.clone();
            self.with_timeout(async move { conn.rename(&key, &shadow).await })
                .await
        };
        if let Err(err) = rename {
            // RENAME on a missing key means the list was empty.
            if err.to_string().contains("no such key") {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let read: Result<Vec<String>, SourceError> = {
            let shadow = shadow.clone();
            let mut conn = self.conn.clone();
            self.with_timeout(async move { conn.lrange(&shadow, 0, -1).await })
                .await
        };

        let records = match read {
            Ok(records) => records,
            Err(err) => {
                // Put the data back where producers can see it; if that
                // fails too the records are stranded in the shadow key
                // and the invariant is broken.
                let mut conn = self.conn.clone();
                let restore: Result<(), SourceError> = self
                    .with_timeout(async move { conn.rename(&shadow, &key).await })
                    .await;
                return match restore {
                    Ok(()) => Err(err),
                    Err(restore_err) => Err(SourceError::AtomicityViolation {
                        stream,
                        detail: format!(
                            "read failed ({}) and restore failed ({})",
                            err, restore_err
                        ),
                    }),
                };
            }
        };

        {
            let shadow = shadow.clone();
            let mut conn = self.conn.clone();
            let deleted: Result<(), SourceError> = self
                .with_timeout(async move { conn.del(&shadow).await })
                .await;
            deleted?;
        }

        Ok(records)
    }
}

#[async_trait]
impl QueueSource for RedisQueue {
    async fn drain(&self, stream: StreamType) -> Result<DrainResult, SourceError> {
        let records = if self.atomic {
            self.drain_scripted(stream).await?
        } else {
            self.drain_renamed(stream).await?
        };

        // Confirm the clear. A non-zero length here is producers
        // refilling after the drain, not records we removed.
        let residual = self.depth(stream).await?;

        let cleared = !records.is_empty();
        if cleared {
            debug!(
                stream = stream.as_str(),
                records = records.len(),
                residual,
                "drained redis list"
            );
        }
        if residual > 0 {
            warn!(
                stream = stream.as_str(),
                residual, "producers refilled the list during the drain window"
            );
        }

        Ok(DrainResult {
            records,
            cleared,
            residual,
        })
    }

    async fn depth(&self, stream: StreamType) -> Result<usize, SourceError> {
        let key = self.key(stream).to_string();
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.llen(&key).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_script_reads_then_deletes() {
        let lrange = DRAIN_SCRIPT.find("LRANGE").expect("script reads the list");
        let del = DRAIN_SCRIPT.find("DEL").expect("script deletes the list");
        assert!(lrange < del, "read must happen before the delete");
    }
}
