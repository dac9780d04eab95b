//! Message pipeline.
//!
//! Every webhook payload flows through:
//! 1. `IngressDeduplicator::admit()`: normalize, filter, dedup
//! 2. `BotClassifier::assess()`: allow, challenge, verify or block
//! 3. `AgentHub::handle()`: one agent turn, possibly a handoff
//! 4. `DeliveryManager::deliver()`: deduplicated, retried replies
//!
//! Only persistence failures abort processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channels::{OutboundChannel, SendOptions};
use crate::classifier::verification::VerificationStatus;
use crate::classifier::{BlockReason, BotClassifier, Verdict};
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryManager, DeliveryStatus, OutboundTimestamps};
use crate::error::Result;
use crate::hub::{AgentHub, AgentRegistry, AgentRole, TurnKind};
use crate::ingress::{IngressDeduplicator, IngressOutcome, NormalizedMessage};
use crate::store::Database;

/// What happened to one webhook payload.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Stopped at ingress (never [`IngressOutcome::Valid`]).
    Filtered(IngressOutcome),
    Blocked {
        contact_id: String,
        reason: BlockReason,
    },
    Challenged {
        contact_id: String,
        attempt: u32,
        reissued: bool,
    },
    Verified {
        contact_id: String,
    },
    Routed {
        contact_id: String,
        role: AgentRole,
        turn: TurnKind,
        /// Replies handed to the channel.
        sent: usize,
        /// Replies that exhausted their retries.
        failed: usize,
    },
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Filtered(outcome) => outcome.label(),
            Self::Blocked { .. } => "blocked",
            Self::Challenged { .. } => "challenged",
            Self::Verified { .. } => "verified",
            Self::Routed { .. } => "routed",
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub identities: usize,
    pub scores: usize,
    pub timestamps: usize,
    pub deliveries: usize,
    pub hub: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.identities + self.scores + self.timestamps + self.deliveries + self.hub
    }
}

#[derive(Debug, Default)]
struct Sends {
    sent: usize,
    failed: usize,
}

pub struct MessagePipeline {
    ingress: IngressDeduplicator,
    classifier: BotClassifier,
    hub: AgentHub,
    delivery: DeliveryManager,
    timestamps: Arc<OutboundTimestamps>,
    config: PipelineConfig,
}

impl MessagePipeline {
    /// Wire every stage. The outbound timestamp store is shared between the
    /// delivery manager (writer) and the classifier (reader).
    pub fn new(
        config: PipelineConfig,
        db: Arc<dyn Database>,
        channel: Arc<dyn OutboundChannel>,
        agents: AgentRegistry,
    ) -> Self {
        let timestamps = Arc::new(OutboundTimestamps::new(
            config.classifier.outbound_timestamp_ttl,
            config.classifier.max_outbound_timestamps,
        ));
        let ingress = IngressDeduplicator::new(config.ingress.clone());
        let classifier = BotClassifier::new(
            config.classifier.clone(),
            config.verification.clone(),
            Arc::clone(&db),
            Arc::clone(&timestamps),
        );
        let hub = AgentHub::new(db, agents, config.hub.clone());
        let delivery = DeliveryManager::new(channel, config.delivery.clone(), Arc::clone(&timestamps));
        Self {
            ingress,
            classifier,
            hub,
            delivery,
            timestamps,
            config,
        }
    }

    /// Process one raw webhook payload end to end.
    ///
    /// When a later stage fails, the message identity is released so the
    /// provider's redelivery is processed rather than dropped as a duplicate.
    pub async fn process(&self, payload: &Value) -> Result<PipelineOutcome> {
        let now = Utc::now();
        let msg = match self.ingress.admit(payload, now).await {
            IngressOutcome::Valid(msg) => msg,
            other => return Ok(PipelineOutcome::Filtered(other)),
        };

        match self.dispatch(&msg, now).await {
            Ok(outcome) => {
                info!(
                    message_id = %msg.identity,
                    contact = %msg.contact_id,
                    outcome = outcome.label(),
                    "Inbound message processed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.ingress.release(&msg.identity).await;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, msg: &NormalizedMessage, now: DateTime<Utc>) -> Result<PipelineOutcome> {
        let contact_id = msg.contact_id.clone();

        let verdict = self.classifier.assess(msg, now).await?;
        debug!(contact = %contact_id, verdict = verdict.label(), "Classifier verdict");

        let outcome = match verdict {
            Verdict::Blocked { reason } => {
                info!(contact = %contact_id, reason = %reason, "Message dropped");
                PipelineOutcome::Blocked { contact_id, reason }
            }
            Verdict::Challenge {
                attempt, reissued, ..
            } => {
                let prompt = if reissued {
                    &self.config.verification.retry_prompt
                } else {
                    &self.config.verification.challenge_prompt
                };
                self.send_all(&msg.contact_id, std::slice::from_ref(prompt), msg)
                    .await;
                PipelineOutcome::Challenged {
                    contact_id,
                    attempt,
                    reissued,
                }
            }
            Verdict::Verified => {
                let ack = &self.config.verification.verified_ack;
                self.send_all(&msg.contact_id, std::slice::from_ref(ack), msg)
                    .await;
                PipelineOutcome::Verified { contact_id }
            }
            Verdict::Allow { verification, .. } => self.route(msg, verification, now).await?,
        };
        Ok(outcome)
    }

    async fn route(
        &self,
        msg: &NormalizedMessage,
        verification: VerificationStatus,
        now: DateTime<Utc>,
    ) -> Result<PipelineOutcome> {
        let report = self.hub.handle(msg, verification, now).await?;
        let sends = self.send_all(&msg.reply_to, &report.replies, msg).await;
        Ok(PipelineOutcome::Routed {
            contact_id: report.contact_id,
            role: report.role,
            turn: report.kind,
            sent: sends.sent,
            failed: sends.failed,
        })
    }

    /// Send replies in order. The first one quotes the inbound message when
    /// it carries a provider id.
    async fn send_all(&self, recipient: &str, replies: &[String], msg: &NormalizedMessage) -> Sends {
        let mut sends = Sends::default();
        for (i, reply) in replies.iter().enumerate() {
            let opts = if i == 0 && !msg.identity.synthesized {
                SendOptions::quoting(msg.identity.value.clone())
            } else {
                SendOptions::default()
            };
            match self.delivery.deliver(recipient, reply, &opts).await {
                Ok(DeliveryStatus::DuplicateBlocked) => {
                    debug!(recipient, "Reply suppressed as duplicate");
                }
                Ok(status) => {
                    debug!(recipient, status = status.label(), "Reply delivered");
                    sends.sent += 1;
                }
                Err(e) => {
                    warn!(recipient, error = %e, "Reply delivery failed");
                    sends.failed += 1;
                }
            }
        }
        sends
    }

    /// Read-only access to the router, for the contact snapshot endpoint.
    pub fn hub(&self) -> &AgentHub {
        &self.hub
    }

    pub fn classifier(&self) -> &BotClassifier {
        &self.classifier
    }

    /// Reclaim memory from every in-memory cache. Correctness never depends
    /// on this running; all expiry is also checked on access.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepStats {
        let stats = SweepStats {
            identities: self.ingress.sweep(now).await,
            scores: self.classifier.sweep(now).await,
            timestamps: self.timestamps.sweep(now).await,
            deliveries: self.delivery.sweep().await,
            hub: self.hub.sweep(now).await,
        };
        if stats.total() > 0 {
            debug!(?stats, "Sweep finished");
        }
        stats
    }
}

/// Spawn a background task that sweeps the pipeline's caches periodically.
pub fn spawn_sweep_task(pipeline: Arc<MessagePipeline>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            pipeline.sweep(Utc::now()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::builtin_registry;
    use crate::channels::DeliveryReceipt;
    use crate::classifier::VerificationChallenge;
    use crate::error::{ChannelError, DatabaseError};
    use crate::hub::state::{ConversationState, HandoffRecord};
    use crate::store::{BlockedContact, LibSqlBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// Store whose conversation loads fail while `down` is set.
    struct OutageDb {
        inner: LibSqlBackend,
        down: AtomicBool,
    }

    #[async_trait]
    impl Database for OutageDb {
        async fn init_schema(&self) -> std::result::Result<(), DatabaseError> {
            self.inner.init_schema().await
        }

        async fn load_conversation(
            &self,
            contact_id: &str,
        ) -> std::result::Result<Option<ConversationState>, DatabaseError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.load_conversation(contact_id).await
        }

        async fn create_conversation(
            &self,
            state: &ConversationState,
        ) -> std::result::Result<i64, DatabaseError> {
            self.inner.create_conversation(state).await
        }

        async fn save_conversation(
            &self,
            state: &ConversationState,
        ) -> std::result::Result<i64, DatabaseError> {
            self.inner.save_conversation(state).await
        }

        async fn commit_handoff(
            &self,
            state: &ConversationState,
            record: &HandoffRecord,
        ) -> std::result::Result<i64, DatabaseError> {
            self.inner.commit_handoff(state, record).await
        }

        async fn list_handoffs(
            &self,
            contact_id: &str,
        ) -> std::result::Result<Vec<HandoffRecord>, DatabaseError> {
            self.inner.list_handoffs(contact_id).await
        }

        async fn get_verification(
            &self,
            contact_id: &str,
        ) -> std::result::Result<Option<VerificationChallenge>, DatabaseError> {
            self.inner.get_verification(contact_id).await
        }

        async fn save_verification(
            &self,
            challenge: &VerificationChallenge,
        ) -> std::result::Result<(), DatabaseError> {
            self.inner.save_verification(challenge).await
        }

        async fn block_contact(
            &self,
            contact_id: &str,
            reason: &str,
            at: DateTime<Utc>,
        ) -> std::result::Result<(), DatabaseError> {
            self.inner.block_contact(contact_id, reason, at).await
        }

        async fn get_block(
            &self,
            contact_id: &str,
        ) -> std::result::Result<Option<BlockedContact>, DatabaseError> {
            self.inner.get_block(contact_id).await
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String, Option<String>)>>,
    }

    #[async_trait]
    impl OutboundChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(
            &self,
            recipient: &str,
            content: &str,
            opts: &SendOptions,
        ) -> std::result::Result<DeliveryReceipt, ChannelError> {
            self.sent.lock().await.push((
                recipient.to_string(),
                content.to_string(),
                opts.quoted_message_id.clone(),
            ));
            Ok(DeliveryReceipt {
                channel: "recording".into(),
                recipient: recipient.to_string(),
                provider_ids: vec![format!("out-{}", content.len())],
                sent_at: Utc::now(),
            })
        }
    }

    struct Fixture {
        pipeline: MessagePipeline,
        channel: Arc<RecordingChannel>,
        db: Arc<dyn Database>,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(RecordingChannel::default());
        let pipeline = MessagePipeline::new(
            PipelineConfig::default(),
            Arc::clone(&db),
            channel.clone(),
            builtin_registry(),
        );
        Fixture {
            pipeline,
            channel,
            db,
        }
    }

    fn webhook(id: &str, text: &str) -> Value {
        json!({
            "event": "messages.upsert",
            "data": {
                "key": {"remoteJid": "5511999990000@s.whatsapp.net", "fromMe": false, "id": id},
                "pushName": "Ana",
                "message": {"conversation": text}
            }
        })
    }

    const LEAD: &str = "Hi, we need a CRM for our sales team, budget is $5k";

    #[tokio::test]
    async fn first_message_hands_off_with_slots() {
        let f = fixture().await;
        let outcome = f.pipeline.process(&webhook("A1", LEAD)).await.unwrap();

        let PipelineOutcome::Routed { role, turn, sent, .. } = outcome else {
            panic!("expected routed, got {outcome:?}");
        };
        assert_eq!(role, AgentRole::Qualification);
        assert_eq!(turn, TurnKind::HandedOff);
        assert_eq!(sent, 1);

        let sent = f.channel.sent.lock().await;
        assert_eq!(sent[0].0, "5511999990000");
        assert!(sent[0].1.ends_with("Who else is involved in the decision?"));
        assert_eq!(sent[0].2.as_deref(), Some("A1"));

        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.slots["need"], json!("a CRM for our sales team"));
        assert_eq!(state.slots["budget"], json!("$5k"));
    }

    #[tokio::test]
    async fn redelivered_webhook_causes_no_second_turn() {
        let f = fixture().await;
        let payload = webhook("A1", LEAD);
        f.pipeline.process(&payload).await.unwrap();
        let again = f.pipeline.process(&payload).await.unwrap();

        assert_eq!(again.label(), "duplicate");
        assert_eq!(f.channel.sent.lock().await.len(), 1);
        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.inbound_count, 1);
    }

    #[tokio::test]
    async fn failed_turn_is_processed_on_redelivery() {
        let db = Arc::new(OutageDb {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            down: AtomicBool::new(true),
        });
        let channel = Arc::new(RecordingChannel::default());
        let pipeline = MessagePipeline::new(
            PipelineConfig::default(),
            db.clone(),
            channel.clone(),
            builtin_registry(),
        );
        let payload = webhook("A1", LEAD);

        assert!(pipeline.process(&payload).await.is_err());
        assert!(channel.sent.lock().await.is_empty());

        db.down.store(false, Ordering::SeqCst);
        let outcome = pipeline.process(&payload).await.unwrap();
        assert_eq!(outcome.label(), "routed");
        assert_eq!(pipeline.process(&payload).await.unwrap().label(), "duplicate");

        let state = db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.inbound_count, 1);
        assert_eq!(channel.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn instant_reply_is_challenged_then_verified() {
        let f = fixture().await;
        f.pipeline.process(&webhook("A1", LEAD)).await.unwrap();

        // Answering within milliseconds of our reply looks automated.
        let outcome = f.pipeline.process(&webhook("A2", "just me")).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Challenged { attempt: 1, reissued: false, .. }));
        let prompt = PipelineConfig::default().verification.challenge_prompt;
        assert_eq!(f.channel.sent.lock().await.last().unwrap().1, prompt);

        let outcome = f.pipeline.process(&webhook("A3", "yes")).await.unwrap();
        assert_eq!(outcome.label(), "verified");

        // Verified contacts go straight to their agent.
        let outcome = f.pipeline.process(&webhook("A4", "just me")).await.unwrap();
        let PipelineOutcome::Routed { role, .. } = outcome else {
            panic!("expected routed, got {outcome:?}");
        };
        assert_eq!(role, AgentRole::Qualification);
        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.verification, VerificationStatus::Verified);
        assert_eq!(state.slots["authority"], json!("just me"));
    }

    #[tokio::test]
    async fn blocked_contact_never_reaches_an_agent() {
        let f = fixture().await;
        f.db.block_contact("5511999990000", "manual", Utc::now())
            .await
            .unwrap();
        let outcome = f.pipeline.process(&webhook("B1", LEAD)).await.unwrap();
        assert!(matches!(
            outcome,
            PipelineOutcome::Blocked { reason: BlockReason::PreviouslyBlocked, .. }
        ));
        assert!(f.channel.sent.lock().await.is_empty());
        assert!(f.db.load_conversation("5511999990000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_messages_are_filtered() {
        let f = fixture().await;
        let outcome = f
            .pipeline
            .process(&json!({"event": "connection.update", "data": {"state": "open"}}))
            .await
            .unwrap();
        assert_eq!(outcome.label(), "ignored_non_message");
        assert!(f.channel.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_entries() {
        let f = fixture().await;
        f.pipeline.process(&webhook("A1", LEAD)).await.unwrap();
        let stats = f.pipeline.sweep(Utc::now() + chrono::Duration::days(1)).await;
        assert!(stats.identities >= 1);
        assert!(stats.total() >= stats.identities);
    }
}
