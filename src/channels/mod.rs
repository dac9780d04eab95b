//! Outbound channel abstraction.

pub mod dry_run;
pub mod gateway;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

pub use dry_run::DryRunChannel;
pub use gateway::HttpGateway;

/// Per-send options passed through to the channel.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Provider id of the inbound message to quote in the reply.
    pub quoted_message_id: Option<String>,
    /// Typing delay the gateway should simulate before sending.
    pub presence_delay: Option<Duration>,
}

impl SendOptions {
    pub fn quoting(message_id: impl Into<String>) -> Self {
        Self {
            quoted_message_id: Some(message_id.into()),
            ..Self::default()
        }
    }
}

/// Proof of a successful send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel: String,
    pub recipient: String,
    /// Provider ids, one per chunk when the text was split.
    pub provider_ids: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

/// The outbound send primitive. Implementations perform exactly one
/// attempt at one provider message; splitting, retries and dedup live in
/// the delivery manager.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Channel name, used in logs and receipts.
    fn name(&self) -> &str;

    /// Longest text the provider accepts in one message. Longer content is
    /// split by the delivery manager and each chunk sent separately.
    fn max_message_len(&self) -> Option<usize> {
        None
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        opts: &SendOptions,
    ) -> Result<DeliveryReceipt, ChannelError>;
}

/// Split a message into chunks no longer than `max_len` bytes, preferring
/// newline then space boundaries. Chunks never split a UTF-8 character.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit == 0 {
            // First character is wider than max_len; emit it whole.
            limit = remaining
                .char_indices()
                .nth(1)
                .map_or(remaining.len(), |(i, _)| i);
        }

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
