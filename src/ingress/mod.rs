//! Ingress deduplicator: turns raw webhook payloads into at-most-once
//! normalized messages.

pub mod identity_cache;
pub mod payload;

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::IngressConfig;

pub use identity_cache::IdentityCache;
pub use payload::{MediaKind, MessageContent, MessageIdentity, NormalizedMessage};

use payload::{Envelope, Sender};

/// Result of admitting one webhook payload.
#[derive(Debug, Clone)]
pub enum IngressOutcome {
    IgnoredNonMessage { event: String },
    IgnoredSelfOriginated,
    Duplicate { message_id: String },
    InvalidMissingSender,
    Malformed { reason: String },
    Valid(Box<NormalizedMessage>),
}

impl IngressOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::IgnoredNonMessage { .. } => "ignored_non_message",
            Self::IgnoredSelfOriginated => "ignored_self_originated",
            Self::Duplicate { .. } => "duplicate",
            Self::InvalidMissingSender => "invalid_missing_sender",
            Self::Malformed { .. } => "malformed",
            Self::Valid(_) => "valid",
        }
    }
}

/// Everything derived from the payload before the dedup check.
enum Parsed {
    Done(IngressOutcome),
    Candidate(Box<NormalizedMessage>),
}

/// Normalizes payloads, filters non-messages and echoes, and suppresses
/// repeated deliveries of the same message identity.
pub struct IngressDeduplicator {
    config: IngressConfig,
    seen: IdentityCache,
}

impl IngressDeduplicator {
    pub fn new(config: IngressConfig) -> Self {
        let seen = IdentityCache::new(config.dedup_window, config.max_tracked_ids);
        Self { config, seen }
    }

    /// Admit a payload. Never returns an error and never panics: anything
    /// unexpected becomes [`IngressOutcome::Malformed`].
    pub async fn admit(&self, payload: &Value, now: DateTime<Utc>) -> IngressOutcome {
        let own_ids = &self.config.own_ids;
        let parsed = panic::catch_unwind(AssertUnwindSafe(|| parse(payload, own_ids, now)))
            .unwrap_or_else(|_| {
                Parsed::Done(IngressOutcome::Malformed {
                    reason: "payload normalization panicked".to_string(),
                })
            });

        let msg = match parsed {
            Parsed::Done(outcome) => {
                debug!(outcome = outcome.label(), "Ingress filtered payload");
                return outcome;
            }
            Parsed::Candidate(msg) => msg,
        };

        if !self.seen.check_and_insert(&msg.identity.value, now).await {
            info!(
                message_id = %msg.identity,
                contact = %msg.contact_id,
                "Duplicate inbound event suppressed"
            );
            return IngressOutcome::Duplicate {
                message_id: msg.identity.value,
            };
        }

        info!(
            message_id = %msg.identity,
            synthesized = msg.identity.synthesized,
            contact = %msg.contact_id,
            kind = msg.content.label(),
            len = msg.text.len(),
            "Inbound message admitted"
        );
        IngressOutcome::Valid(msg)
    }

    /// Forget an admitted identity whose processing failed, so the
    /// provider's redelivery is admitted instead of dropped as a duplicate.
    pub async fn release(&self, identity: &MessageIdentity) {
        if self.seen.remove(&identity.value).await {
            info!(message_id = %identity, "Inbound identity released for redelivery");
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.seen.sweep(now).await
    }
}

fn parse(payload: &Value, own_ids: &[String], now: DateTime<Utc>) -> Parsed {
    if !payload.is_object() {
        return Parsed::Done(IngressOutcome::Malformed {
            reason: "payload is not a JSON object".to_string(),
        });
    }

    if let Some(event) = payload::event_name(payload) {
        if payload::is_ignorable_event(&event) {
            return Parsed::Done(IngressOutcome::IgnoredNonMessage { event });
        }
    }

    let Some(root) = payload::message_root(payload) else {
        return Parsed::Done(IngressOutcome::Malformed {
            reason: "no message object found".to_string(),
        });
    };

    let envelope = Envelope::probe(payload, root);
    let contact_id = match payload::resolve_sender(&envelope, own_ids) {
        Sender::Contact(id) => id,
        Sender::SelfOriginated => return Parsed::Done(IngressOutcome::IgnoredSelfOriginated),
        Sender::Missing => {
            warn!(
                remote_jid = ?envelope.remote_jid,
                "Inbound message without a resolvable sender"
            );
            return Parsed::Done(IngressOutcome::InvalidMissingSender);
        }
    };

    let sent_at = envelope.timestamp.unwrap_or(now);
    let identity = match envelope.message_id.as_deref() {
        Some(id) => MessageIdentity::provided(id),
        None => MessageIdentity::synthesize(&contact_id, sent_at),
    };

    let group_id = envelope
        .is_group()
        .then(|| envelope.remote_jid.clone())
        .flatten();
    let reply_to = group_id.clone().unwrap_or_else(|| contact_id.clone());

    let content = payload::extract_content(root);
    let text = content.to_text();
    let needs_transcription = content.needs_transcription();

    Parsed::Candidate(Box::new(NormalizedMessage {
        identity,
        contact_id,
        reply_to,
        group_id,
        push_name: envelope.push_name,
        content,
        text,
        message_type: envelope.message_type,
        sent_at,
        received_at: now,
        needs_transcription,
    }))
}
