//! Outbound delivery: rate-limited, retried fan-out to destinations.
//!
//! The router owns no platform code. It drives a [`DeliveryClient`]
//! implementation through the per-credential token bucket and the retry
//! policy, fanning a message out to every destination of its pair. A
//! fan-out counts as delivered when at least one destination accepted the
//! message; full failure surfaces as an error.

use crate::config::{CompiledPair, ConfigSnapshot};
use crate::error::{RelayError, RelayResult};
use crate::mapping::DestinationRef;
use crate::ratelimit::RateLimiters;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;

/// Platform-facing delivery operations. Implementations translate
/// platform errors into the relay taxonomy; in particular a delete of an
/// already-gone message must return `Ok`.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Send a message, returning the platform message id.
    async fn send(
        &self,
        credential: &SecretString,
        channel: &str,
        text: &str,
        image: Option<&[u8]>,
    ) -> RelayResult<i64>;

    /// Replace the text of a previously sent message.
    async fn edit(
        &self,
        credential: &SecretString,
        channel: &str,
        message_id: i64,
        text: &str,
    ) -> RelayResult<()>;

    /// Delete a previously sent message.
    async fn delete(
        &self,
        credential: &SecretString,
        channel: &str,
        message_id: i64,
    ) -> RelayResult<()>;
}

/// Fans messages out to a pair's destinations.
pub struct DeliveryRouter {
    client: Arc<dyn DeliveryClient>,
    limiters: RateLimiters,
}

impl DeliveryRouter {
    pub fn new(client: Arc<dyn DeliveryClient>) -> Self {
        Self {
            client,
            limiters: RateLimiters::new(),
        }
    }

    /// Deliver a new message to every destination of `pair`. Returns the
    /// destinations that accepted it; partial failures are logged. Errors
    /// only when no destination accepted the message.
    pub async fn deliver(
        &self,
        snapshot: &ConfigSnapshot,
        pair: &CompiledPair,
        text: &str,
        image: Option<&[u8]>,
    ) -> RelayResult<Vec<DestinationRef>> {
        let credential = self.credential(snapshot, pair)?;
        let policy = RetryPolicy::from_limits(&snapshot.limits);
        let bucket = self
            .limiters
            .bucket(&pair.credential, snapshot.limits.rate_per_minute);

        let mut delivered = Vec::new();
        let mut last_err = None;
        for channel in &pair.destinations {
            bucket.acquire().await;
            let result = policy
                .run("send", || {
                    self.client.send(credential, channel, text, image)
                })
                .await;
            match result {
                Ok(message_id) => {
                    tracing::debug!(pair = %pair.id, channel = %channel, message_id, "delivered");
                    delivered.push(DestinationRef {
                        channel: channel.clone(),
                        message_id,
                    });
                }
                Err(e) => {
                    tracing::error!(pair = %pair.id, channel = %channel, error = %e, "delivery failed");
                    last_err = Some(e);
                }
            }
        }

        if delivered.is_empty() {
            Err(last_err.unwrap_or_else(|| {
                RelayError::Rejected(format!("pair {} has no destinations", pair.id))
            }))
        } else {
            Ok(delivered)
        }
    }

    /// Propagate an edit to every previously delivered copy. Failed
    /// destinations are logged; errors only when every copy failed.
    pub async fn sync_edit(
        &self,
        snapshot: &ConfigSnapshot,
        pair: &CompiledPair,
        destinations: &[DestinationRef],
        text: &str,
    ) -> RelayResult<()> {
        let credential = self.credential(snapshot, pair)?;
        let policy = RetryPolicy::from_limits(&snapshot.limits);
        let bucket = self
            .limiters
            .bucket(&pair.credential, snapshot.limits.rate_per_minute);

        let mut synced = 0usize;
        let mut last_err = None;
        for dest in destinations {
            bucket.acquire().await;
            let result = policy
                .run("edit", || {
                    self.client
                        .edit(credential, &dest.channel, dest.message_id, text)
                })
                .await;
            match result {
                Ok(()) => synced += 1,
                Err(e) => {
                    tracing::error!(
                        pair = %pair.id,
                        channel = %dest.channel,
                        message_id = dest.message_id,
                        error = %e,
                        "edit sync failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if synced == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Propagate a deletion to every previously delivered copy. Copies
    /// that are already gone count as synced (the client maps that case
    /// to `Ok`).
    pub async fn sync_delete(
        &self,
        snapshot: &ConfigSnapshot,
        pair: &CompiledPair,
        destinations: &[DestinationRef],
    ) -> RelayResult<()> {
        let credential = self.credential(snapshot, pair)?;
        let policy = RetryPolicy::from_limits(&snapshot.limits);
        let bucket = self
            .limiters
            .bucket(&pair.credential, snapshot.limits.rate_per_minute);

        let mut synced = 0usize;
        let mut last_err = None;
        for dest in destinations {
            bucket.acquire().await;
            let result = policy
                .run("delete", || {
                    self.client
                        .delete(credential, &dest.channel, dest.message_id)
                })
                .await;
            match result {
                Ok(()) => synced += 1,
                Err(e) => {
                    tracing::error!(
                        pair = %pair.id,
                        channel = %dest.channel,
                        message_id = dest.message_id,
                        error = %e,
                        "delete sync failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if synced == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn credential<'a>(
        &self,
        snapshot: &'a ConfigSnapshot,
        pair: &CompiledPair,
    ) -> RelayResult<&'a SecretString> {
        snapshot.credential(&pair.credential).ok_or_else(|| {
            RelayError::ConfigValidation(format!(
                "pair {:?} references unknown credential {:?}",
                pair.id, pair.credential
            ))
        })
    }
}
