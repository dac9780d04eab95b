//! Outbound delivery manager: deduplicates and retries sends.

pub mod fingerprint;
pub mod registry;
pub mod timestamps;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::channels::{DeliveryReceipt, OutboundChannel, SendOptions, split_message};
use crate::config::DeliveryConfig;
use crate::error::{ChannelError, DeliveryError};

pub use fingerprint::DedupKey;
pub use registry::{Begin, RegistryLimits, SendRegistry, SendTicket, SentRecord};
pub use timestamps::OutboundTimestamps;

/// Non-error outcomes of [`DeliveryManager::deliver`].
#[derive(Debug, Clone)]
pub enum DeliveryStatus {
    /// This request performed the send.
    Sent {
        attempts: u32,
        receipt: DeliveryReceipt,
    },
    /// An identical send was already in flight; this request shares its result.
    Attached { receipt: DeliveryReceipt },
    /// Identical content already reached the recipient within the window.
    DuplicateBlocked,
}

impl DeliveryStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Attached { .. } => "attached",
            Self::DuplicateBlocked => "duplicate_blocked",
        }
    }
}

pub struct DeliveryManager {
    channel: Arc<dyn OutboundChannel>,
    config: DeliveryConfig,
    registry: SendRegistry,
    timestamps: Arc<OutboundTimestamps>,
}

impl DeliveryManager {
    pub fn new(
        channel: Arc<dyn OutboundChannel>,
        config: DeliveryConfig,
        timestamps: Arc<OutboundTimestamps>,
    ) -> Self {
        let registry = SendRegistry::new(RegistryLimits {
            duplicate_window: config.duplicate_window,
            stale_after: worst_case_duration(&config),
            max_sent: config.max_sent_records,
            sent_eviction_fraction: config.sent_eviction_fraction,
            max_in_flight: config.max_in_flight,
            in_flight_eviction_fraction: config.in_flight_eviction_fraction,
        });
        Self {
            channel,
            config,
            registry,
            timestamps,
        }
    }

    /// Send `content` to `recipient` at most once per duplicate window.
    pub async fn deliver(
        &self,
        recipient: &str,
        content: &str,
        opts: &SendOptions,
    ) -> Result<DeliveryStatus, DeliveryError> {
        let key = DedupKey::new(recipient, content, self.config.fingerprint_chars);

        let ticket = match self.registry.begin(key, Utc::now()).await {
            Begin::Duplicate(record) => {
                info!(
                    recipient,
                    previous_attempts = record.attempts,
                    "Outbound duplicate blocked"
                );
                return Ok(DeliveryStatus::DuplicateBlocked);
            }
            Begin::Attach(mut rx) => {
                let abandoned = || DeliveryError::Abandoned {
                    recipient: recipient.to_string(),
                };
                let result = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| abandoned())?
                    .clone()
                    .ok_or_else(abandoned)?;
                return result.map(|receipt| DeliveryStatus::Attached { receipt });
            }
            Begin::Owner(ticket) => ticket,
        };

        let result = self.send_chunks(&ticket, recipient, content, opts).await;

        let sent = result.as_ref().ok().map(|(attempts, receipt)| SentRecord {
            sent_at: receipt.sent_at,
            attempts: *attempts,
        });
        self.registry.complete(&ticket, sent).await;

        let shared = result
            .as_ref()
            .map(|(_, receipt)| receipt.clone())
            .map_err(Clone::clone);
        // Attached requests may have gone away; nobody listening is fine.
        let _ = ticket.tx.send(Some(shared));

        let (attempts, receipt) = result?;
        self.timestamps.record(recipient, Utc::now()).await;
        Ok(DeliveryStatus::Sent { attempts, receipt })
    }

    /// Send `content` split to the channel's length limit. Each chunk gets
    /// the full retry budget, and an acknowledged chunk is never resent.
    async fn send_chunks(
        &self,
        ticket: &SendTicket,
        recipient: &str,
        content: &str,
        opts: &SendOptions,
    ) -> Result<(u32, DeliveryReceipt), DeliveryError> {
        let chunks = match self.channel.max_message_len() {
            Some(max) => split_message(content, max),
            None => vec![content.to_string()],
        };
        let total = chunks.len();
        let mut attempts = 0;
        let mut merged: Option<DeliveryReceipt> = None;

        for (index, chunk) in chunks.iter().enumerate() {
            // Only the first chunk quotes the inbound message.
            let chunk_opts = if index == 0 {
                opts.clone()
            } else {
                SendOptions::default()
            };
            let (used, receipt) = self
                .send_with_retry(recipient, chunk, &chunk_opts)
                .await
                .inspect_err(|_| {
                    if index > 0 {
                        warn!(recipient, delivered = index, total, "Outbound message cut short");
                    }
                })?;
            attempts += used;

            merged = Some(match merged.take() {
                None => receipt,
                Some(mut acc) => {
                    acc.provider_ids.extend(receipt.provider_ids);
                    acc.sent_at = receipt.sent_at;
                    acc
                }
            });
            if index + 1 < total {
                self.registry.touch(ticket, Utc::now()).await;
            }
        }

        let receipt = merged.ok_or_else(|| DeliveryError::Exhausted {
            recipient: recipient.to_string(),
            attempts,
            last_error: "nothing to send".to_string(),
        })?;
        Ok((attempts, receipt))
    }

    async fn send_with_retry(
        &self,
        recipient: &str,
        content: &str,
        opts: &SendOptions,
    ) -> Result<(u32, DeliveryReceipt), DeliveryError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let outcome = tokio::time::timeout(
                self.config.send_timeout,
                self.channel.send(recipient, content, opts),
            )
            .await;

            match outcome {
                Ok(Ok(receipt)) => {
                    info!(
                        recipient,
                        attempt,
                        channel = self.channel.name(),
                        len = content.len(),
                        "Outbound message sent"
                    );
                    return Ok((attempt, receipt));
                }
                Ok(Err(e)) if !e.is_transient() => {
                    warn!(recipient, attempt, error = %e, "Outbound send rejected");
                    return Err(exhausted(recipient, attempt, &e));
                }
                Ok(Err(e)) => {
                    warn!(recipient, attempt, error = %e, "Outbound send failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        recipient,
                        attempt,
                        timeout = ?self.config.send_timeout,
                        "Outbound send timed out"
                    );
                    last_error = format!("timed out after {:?}", self.config.send_timeout);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff_delay(self.config.backoff_base, attempt - 1)).await;
            }
        }

        Err(DeliveryError::Exhausted {
            recipient: recipient.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    pub async fn sweep(&self) -> usize {
        self.registry.sweep(Utc::now()).await
    }
}

fn exhausted(recipient: &str, attempts: u32, e: &ChannelError) -> DeliveryError {
    DeliveryError::Exhausted {
        recipient: recipient.to_string(),
        attempts,
        last_error: e.to_string(),
    }
}

/// `base * 2^retry`, saturating.
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Upper bound on how long one chunk of an owned send can take. Progress
/// between chunks refreshes the in-flight entry.
fn worst_case_duration(config: &DeliveryConfig) -> Duration {
    let attempts = config.max_attempts.max(1);
    let sends = config.send_timeout.saturating_mul(attempts);
    let waits = (0..attempts.saturating_sub(1))
        .map(|n| backoff_delay(config.backoff_base, n))
        .fold(Duration::ZERO, Duration::saturating_add);
    sends.saturating_add(waits).saturating_add(Duration::from_secs(5))
}
