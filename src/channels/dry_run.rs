//! Channel that logs sends instead of performing them.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{DeliveryReceipt, OutboundChannel, SendOptions};
use crate::error::ChannelError;

/// Used when no gateway is configured, so the pipeline can run locally.
#[derive(Debug, Default)]
pub struct DryRunChannel;

#[async_trait]
impl OutboundChannel for DryRunChannel {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        opts: &SendOptions,
    ) -> Result<DeliveryReceipt, ChannelError> {
        tracing::info!(
            recipient,
            len = content.len(),
            quoted = ?opts.quoted_message_id,
            "Dry-run send"
        );
        Ok(DeliveryReceipt {
            channel: self.name().to_string(),
            recipient: recipient.to_string(),
            provider_ids: vec![Uuid::new_v4().to_string()],
            sent_at: Utc::now(),
        })
    }
}
