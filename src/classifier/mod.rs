//! Bot/human classifier: scores each admitted message and runs the
//! verification handshake.
//!
//! Decision order for a message from contact `c`:
//! 1. `c` is in the blocked table: drop without scoring.
//! 2. `c` has a verified challenge: allow.
//! 3. `c` has a pending challenge: check the timeout, score (reading the
//!    outbound timestamp without consuming it), then test the text against
//!    the confirmation phrases.
//! 4. Otherwise score and compare against the thresholds.
//!
//! Messages from one contact are assessed one at a time, so a challenge
//! record is never updated from a stale read.

pub mod registry;
pub mod signals;
pub mod verification;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ClassifierConfig, VerificationConfig};
use crate::delivery::OutboundTimestamps;
use crate::error::DatabaseError;
use crate::hub::ContactLocks;
use crate::ingress::NormalizedMessage;
use crate::store::Database;

pub use registry::{BotScoreRecord, ScoreDecision, ScoreRegistry};
pub use signals::{ContentRules, SignalScores};
pub use verification::{FailureStep, PhraseMatcher, VerificationChallenge, VerificationStatus};

/// Why a contact was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Blocked earlier; the message was not scored.
    PreviouslyBlocked,
    ScoreAboveThreshold,
    AttemptsExhausted,
    ChallengeTimedOut,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreviouslyBlocked => "previously_blocked",
            Self::ScoreAboveThreshold => "score_above_threshold",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::ChallengeTimedOut => "challenge_timed_out",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier decision for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Route to the agents.
    Allow {
        score: f64,
        verification: VerificationStatus,
    },
    /// Send a verification challenge instead of routing.
    Challenge {
        attempt: u32,
        /// True when re-asking after a wrong answer.
        reissued: bool,
        score: f64,
    },
    /// The message confirmed a pending challenge.
    Verified,
    /// Drop the message; the contact is permanently blocked.
    Blocked { reason: BlockReason },
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::Challenge { .. } => "challenge",
            Self::Verified => "verified",
            Self::Blocked { .. } => "blocked",
        }
    }
}

/// Aggregate plus the individual signals for one message.
#[derive(Debug, Clone, Copy)]
struct Assessment {
    scores: SignalScores,
    aggregate: f64,
    content_rule: Option<&'static str>,
}

pub struct BotClassifier {
    config: ClassifierConfig,
    verification: VerificationConfig,
    db: Arc<dyn Database>,
    registry: ScoreRegistry,
    timestamps: Arc<OutboundTimestamps>,
    content_rules: ContentRules,
    matcher: PhraseMatcher,
    /// Serializes the challenge read-modify-write per contact.
    locks: ContactLocks,
}

impl BotClassifier {
    pub fn new(
        config: ClassifierConfig,
        verification: VerificationConfig,
        db: Arc<dyn Database>,
        timestamps: Arc<OutboundTimestamps>,
    ) -> Self {
        let registry = ScoreRegistry::new(registry::RegistryLimits {
            ttl: config.record_ttl,
            capacity: config.max_records,
            eviction_fraction: config.record_eviction_fraction,
        });
        let matcher = PhraseMatcher::new(&verification.confirmation_phrases);
        Self {
            config,
            verification,
            db,
            registry,
            timestamps,
            content_rules: ContentRules::default_rules(),
            matcher,
            locks: ContactLocks::new(),
        }
    }

    pub async fn assess(
        &self,
        msg: &NormalizedMessage,
        now: DateTime<Utc>,
    ) -> Result<Verdict, DatabaseError> {
        let contact = msg.contact_id.as_str();
        let _guard = self.locks.lock(contact).await;

        if self.db.is_blocked(contact).await? {
            info!(contact, "Message from blocked contact dropped");
            return Ok(Verdict::Blocked {
                reason: BlockReason::PreviouslyBlocked,
            });
        }

        match self.db.get_verification(contact).await? {
            Some(challenge) if challenge.status == VerificationStatus::Verified => {
                // Keep the timestamp store from accumulating verified contacts.
                self.timestamps.read(contact, now, false).await;
                Ok(Verdict::Allow {
                    score: 0.0,
                    verification: VerificationStatus::Verified,
                })
            }
            Some(challenge) if challenge.status == VerificationStatus::Blocked => {
                // Challenge says blocked but the block row is missing; restore it.
                self.db
                    .block_contact(contact, BlockReason::AttemptsExhausted.as_str(), now)
                    .await?;
                Ok(Verdict::Blocked {
                    reason: BlockReason::PreviouslyBlocked,
                })
            }
            Some(challenge) if challenge.status == VerificationStatus::Pending => {
                self.assess_pending(msg, challenge, now).await
            }
            _ => self.assess_unverified(msg, now).await,
        }
    }

    async fn assess_unverified(
        &self,
        msg: &NormalizedMessage,
        now: DateTime<Utc>,
    ) -> Result<Verdict, DatabaseError> {
        let contact = msg.contact_id.as_str();
        let assessment = self.score(msg, now, false).await;

        if assessment.aggregate >= self.config.high_threshold {
            self.block(contact, None, BlockReason::ScoreAboveThreshold, &assessment, now)
                .await?;
            return Ok(Verdict::Blocked {
                reason: BlockReason::ScoreAboveThreshold,
            });
        }

        if assessment.aggregate < self.config.low_threshold {
            self.registry.set_decision(contact, ScoreDecision::Allow).await;
            return Ok(Verdict::Allow {
                score: assessment.aggregate,
                verification: VerificationStatus::None,
            });
        }

        let challenge = VerificationChallenge::issue(contact, now);
        self.db.save_verification(&challenge).await?;
        self.registry
            .set_decision(contact, ScoreDecision::Challenge)
            .await;
        info!(
            contact,
            score = assessment.aggregate,
            latency = assessment.scores.latency,
            content_rule = ?assessment.content_rule,
            "Verification challenge issued"
        );
        Ok(Verdict::Challenge {
            attempt: challenge.attempts,
            reissued: false,
            score: assessment.aggregate,
        })
    }

    async fn assess_pending(
        &self,
        msg: &NormalizedMessage,
        mut challenge: VerificationChallenge,
        now: DateTime<Utc>,
    ) -> Result<Verdict, DatabaseError> {
        let contact = msg.contact_id.as_str();

        if challenge.is_expired(now, self.verification.timeout) {
            challenge.block(now);
            let assessment = self.score(msg, now, false).await;
            self.block(
                contact,
                Some(&challenge),
                BlockReason::ChallengeTimedOut,
                &assessment,
                now,
            )
            .await?;
            return Ok(Verdict::Blocked {
                reason: BlockReason::ChallengeTimedOut,
            });
        }

        // Every reply in the handshake is timed against the same send.
        let assessment = self.score(msg, now, true).await;

        if assessment.aggregate >= self.config.high_threshold {
            challenge.block(now);
            self.block(
                contact,
                Some(&challenge),
                BlockReason::ScoreAboveThreshold,
                &assessment,
                now,
            )
            .await?;
            return Ok(Verdict::Blocked {
                reason: BlockReason::ScoreAboveThreshold,
            });
        }

        if self.matcher.matches(&msg.text) {
            challenge.verify(now);
            self.db.save_verification(&challenge).await?;
            self.timestamps.read(contact, now, false).await;
            self.registry.set_decision(contact, ScoreDecision::Allow).await;
            info!(contact, attempts = challenge.attempts, "Contact verified");
            return Ok(Verdict::Verified);
        }

        match challenge.record_failure(now, self.verification.max_attempts) {
            FailureStep::Reissue { attempt } => {
                self.db.save_verification(&challenge).await?;
                self.registry
                    .set_decision(contact, ScoreDecision::Challenge)
                    .await;
                info!(contact, attempt, "Verification challenge reissued");
                Ok(Verdict::Challenge {
                    attempt,
                    reissued: true,
                    score: assessment.aggregate,
                })
            }
            FailureStep::Exhausted => {
                self.block(
                    contact,
                    Some(&challenge),
                    BlockReason::AttemptsExhausted,
                    &assessment,
                    now,
                )
                .await?;
                Ok(Verdict::Blocked {
                    reason: BlockReason::AttemptsExhausted,
                })
            }
        }
    }

    /// Compute all signals and fold the result into the contact's record.
    async fn score(&self, msg: &NormalizedMessage, now: DateTime<Utc>, preserve: bool) -> Assessment {
        let contact = msg.contact_id.as_str();
        let reply_after = self
            .timestamps
            .read(contact, now, preserve)
            .await
            .map(|sent| msg.received_at - sent);
        let latency = signals::latency(
            reply_after,
            self.config.latency_bot,
            self.config.latency_human,
        );
        let (content, content_rule) = self.content_rules.score(&msg.text);

        let config = &self.config;
        let text = msg.text.clone();
        self.registry
            .with_record(contact, now, move |record| {
                record.arrivals.push_back(now);
                let window = chrono::Duration::from_std(config.frequency_window)
                    .unwrap_or(chrono::Duration::MAX);
                trim_front(&mut record.arrivals, |t| now - *t > window);

                record.recent_texts.push_back(text);
                while record.recent_texts.len() > config.history_len.max(1) {
                    record.recent_texts.pop_front();
                }

                let history = signals::carryover(
                    record.carried_penalty,
                    now - record.last_seen,
                    config.carryover_half_life,
                );

                let scores = SignalScores {
                    frequency: signals::frequency(
                        &record.arrivals,
                        now,
                        config.frequency_window,
                        config.frequency_ceiling,
                    ),
                    latency,
                    entropy: signals::entropy(&record.recent_texts),
                    content,
                    history,
                };
                let aggregate = scores.aggregate(&config.weights);

                record.scores = scores;
                record.aggregate = aggregate;
                record.carried_penalty = if aggregate >= config.low_threshold {
                    history.max(aggregate)
                } else {
                    history
                };
                record.last_seen = now;

                Assessment {
                    scores,
                    aggregate,
                    content_rule,
                }
            })
            .await
    }

    async fn block(
        &self,
        contact: &str,
        challenge: Option<&VerificationChallenge>,
        reason: BlockReason,
        assessment: &Assessment,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        if let Some(challenge) = challenge {
            self.db.save_verification(challenge).await?;
        }
        self.db.block_contact(contact, reason.as_str(), now).await?;
        self.timestamps.read(contact, now, false).await;
        self.registry.set_decision(contact, ScoreDecision::Block).await;
        warn!(
            contact,
            %reason,
            score = assessment.aggregate,
            "Contact permanently blocked"
        );
        Ok(())
    }

    /// Current score record, for diagnostics.
    pub async fn score_record(&self, contact: &str) -> Option<BotScoreRecord> {
        self.registry.get(contact).await
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.registry.sweep(now).await + self.locks.prune().await
    }
}

fn trim_front<T>(queue: &mut VecDeque<T>, mut stale: impl FnMut(&T) -> bool) {
    while queue.front().is_some_and(&mut stale) {
        queue.pop_front();
    }
}
