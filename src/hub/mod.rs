//! Conversation router: owns which agent role handles each contact,
//! dispatches turns, executes handoffs and persists state.

pub mod agent;
pub mod engine_cache;
pub mod locks;
pub mod roles;
pub mod state;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::classifier::verification::VerificationStatus;
use crate::config::HubConfig;
use crate::error::{AgentError, DatabaseError};
use crate::ingress::NormalizedMessage;
use crate::store::Database;

pub use agent::{AgentEngine, AgentRegistry, AgentReply, ConversationAgent, TurnOutcome};
pub use engine_cache::EngineCache;
pub use locks::ContactLocks;
pub use roles::AgentRole;
pub use state::{ConversationState, HandoffRecord, PendingHandoff};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Continued,
    HandedOff,
    /// The agent failed. A fallback reply was produced and nothing from the
    /// turn was persisted.
    Failed,
}

impl TurnKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continued => "continued",
            Self::HandedOff => "handed_off",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of [`AgentHub::handle`].
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub contact_id: String,
    /// Role that owns the conversation after the turn.
    pub role: AgentRole,
    /// Replies to send, in order.
    pub replies: Vec<String>,
    pub handoff: Option<HandoffRecord>,
    pub kind: TurnKind,
}

pub struct AgentHub {
    db: Arc<dyn Database>,
    agents: AgentRegistry,
    engines: EngineCache,
    locks: ContactLocks,
    config: HubConfig,
}

impl AgentHub {
    pub fn new(db: Arc<dyn Database>, agents: AgentRegistry, config: HubConfig) -> Self {
        let engines = EngineCache::new(config.engine_idle_window, config.max_cached_engines);
        Self {
            db,
            agents,
            engines,
            locks: ContactLocks::new(),
            config,
        }
    }

    /// Run one turn for the message's contact.
    ///
    /// Agent failures are contained and reported as [`TurnKind::Failed`];
    /// only persistence failures surface as errors.
    pub async fn handle(
        &self,
        msg: &NormalizedMessage,
        verification: VerificationStatus,
        now: DateTime<Utc>,
    ) -> Result<TurnReport, DatabaseError> {
        let contact = msg.contact_id.as_str();
        let _guard = self.locks.lock(contact).await;

        let mut state = self.load_or_create(contact, now).await?;
        if verification != VerificationStatus::None {
            state.verification = verification;
        }
        let role = state.current_role();
        let mut replies = Vec::new();

        let mut engine = match self.hydrate(contact, &state, now).await {
            Ok(engine) => engine,
            Err(e) => return Ok(self.contained(&state, replies, e)),
        };

        if let Some(pending) = state.pending_handoff.clone() {
            match guarded(role, engine.on_handoff_received(&pending.payload, &state)).await {
                Ok(reply) => {
                    self.absorb(&mut state, reply, &mut replies);
                    state.agent_state = engine.snapshot();
                    state.pending_handoff = None;
                    state.updated_at = now;
                    state.version = self.db.save_conversation(&state).await?;
                    info!(
                        contact = %contact,
                        role = %role,
                        attempts = pending.attempts + 1,
                        "Pending handoff initialized"
                    );
                }
                Err(e) => {
                    warn!(contact = %contact, role = %role, error = %e, "Handoff initializer failed again");
                    return Ok(self.contained(&state, replies, e));
                }
            }
        }

        let outcome = match guarded(role, engine.process_turn(msg, &state)).await {
            Ok(outcome) => outcome,
            Err(e) => return Ok(self.contained(&state, replies, e)),
        };

        state.inbound_count += 1;
        state.updated_at = now;

        match outcome {
            TurnOutcome::Continue(reply) => {
                self.absorb(&mut state, reply, &mut replies);
                state.agent_state = engine.snapshot();
                state.version = self.db.save_conversation(&state).await?;
                self.engines.checkin(contact, role, engine, now).await;
                debug!(contact = %contact, role = %role, replies = replies.len(), "Turn continued");

                Ok(TurnReport {
                    contact_id: contact.to_string(),
                    role,
                    replies,
                    handoff: None,
                    kind: TurnKind::Continued,
                })
            }
            TurnOutcome::Handoff {
                reply,
                target,
                payload,
            } => {
                if !role.can_transition_to(target) {
                    let e = AgentError::InvalidHandoff { from: role, to: target };
                    return Ok(self.contained(&state, replies, e));
                }
                self.absorb(&mut state, reply, &mut replies);
                let record = match state.apply_handoff(target, payload, now) {
                    Ok(record) => record,
                    Err(e) => return Ok(self.contained(&state, replies, e)),
                };
                state.version = self.db.commit_handoff(&state, &record).await?;
                drop(engine);
                info!(contact = %contact, from = %record.from, to = %record.to, "Handoff committed");

                self.initialize_target(&mut state, &mut replies, now).await?;

                Ok(TurnReport {
                    contact_id: contact.to_string(),
                    role: state.current_role(),
                    replies,
                    handoff: Some(record),
                    kind: TurnKind::HandedOff,
                })
            }
        }
    }

    /// Persisted conversation for a contact, if any.
    pub async fn conversation(
        &self,
        contact: &str,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        self.db.load_conversation(contact).await
    }

    /// Drop idle engines and unused contact locks.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let engines = self.engines.sweep(now).await;
        let locks = self.locks.prune().await;
        engines + locks
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    async fn load_or_create(
        &self,
        contact: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, DatabaseError> {
        if let Some(state) = self.db.load_conversation(contact).await? {
            return Ok(state);
        }
        let mut state = ConversationState::new(contact, now);
        state.version = self.db.create_conversation(&state).await?;
        info!(contact = %contact, "Conversation created");
        Ok(state)
    }

    /// A cached or fresh engine for the current role, restored from the
    /// durable snapshot.
    async fn hydrate(
        &self,
        contact: &str,
        state: &ConversationState,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn AgentEngine>, AgentError> {
        let role = state.current_role();
        let mut engine = match self.engines.checkout(contact, role, now).await {
            Some(engine) => engine,
            None => self.agents.get(role)?.build_engine(contact),
        };
        guarded(role, engine.restore(&state.agent_state)).await?;
        Ok(engine)
    }

    /// Build the new owner's engine and run its initializer. On failure the
    /// handoff stays pending and is retried at the start of the next turn.
    async fn initialize_target(
        &self,
        state: &mut ConversationState,
        replies: &mut Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let role = state.current_role();
        let contact = state.contact_id.clone();
        let Some(payload) = state.pending_handoff.as_ref().map(|p| p.payload.clone()) else {
            return Ok(());
        };

        let agent = match self.agents.get(role) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(contact = %contact, error = %e, "Handoff target unavailable, left pending");
                return Ok(());
            }
        };
        let mut engine = agent.build_engine(&contact);

        let init = async {
            engine.restore(&Value::Null).await?;
            engine.on_handoff_received(&payload, state).await
        };
        match guarded(role, init).await {
            Ok(reply) => {
                self.absorb(state, reply, replies);
                state.agent_state = engine.snapshot();
                state.pending_handoff = None;
                state.updated_at = now;
                state.version = self.db.save_conversation(state).await?;
                self.engines.checkin(&contact, role, engine, now).await;
            }
            Err(e) => {
                warn!(contact = %contact, role = %role, error = %e, "Handoff initializer failed, left pending");
                if let Some(pending) = state.pending_handoff.as_mut() {
                    pending.attempts += 1;
                }
                state.version = self.db.save_conversation(state).await?;
            }
        }
        Ok(())
    }

    fn absorb(&self, state: &mut ConversationState, reply: AgentReply, replies: &mut Vec<String>) {
        state.merge_slots(reply.slots);
        if let Some(text) = reply.text.filter(|t| !t.trim().is_empty()) {
            state.outbound_count += 1;
            replies.push(text);
        }
    }

    fn contained(
        &self,
        state: &ConversationState,
        mut replies: Vec<String>,
        error: AgentError,
    ) -> TurnReport {
        warn!(
            contact = %state.contact_id,
            role = %state.current_role(),
            error = %error,
            "Agent turn failed, sending fallback"
        );
        replies.push(self.config.fallback_reply.clone());
        TurnReport {
            contact_id: state.contact_id.clone(),
            role: state.current_role(),
            replies,
            handoff: None,
            kind: TurnKind::Failed,
        }
    }
}

/// Run an agent future, turning panics into [`AgentError::Panicked`].
async fn guarded<T, F>(role: AgentRole, fut: F) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Panicked { role }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Behaviour shared by every engine a [`TestAgent`] builds.
    #[derive(Clone, Default)]
    struct Script {
        handoff_on: Option<(&'static str, AgentRole)>,
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
        init_failures: Arc<AtomicUsize>,
        builds: Arc<AtomicUsize>,
        inits: Arc<StdMutex<Vec<Value>>>,
    }

    struct TestAgent {
        role: AgentRole,
        script: Script,
    }

    impl ConversationAgent for TestAgent {
        fn role(&self) -> AgentRole {
            self.role
        }

        fn build_engine(&self, _contact_id: &str) -> Box<dyn AgentEngine> {
            self.script.builds.fetch_add(1, Ordering::SeqCst);
            Box::new(TestEngine {
                role: self.role,
                script: self.script.clone(),
                turns: 0,
            })
        }
    }

    struct TestEngine {
        role: AgentRole,
        script: Script,
        turns: u64,
    }

    #[async_trait]
    impl AgentEngine for TestEngine {
        async fn restore(&mut self, snapshot: &Value) -> Result<(), AgentError> {
            self.turns = snapshot["turns"].as_u64().unwrap_or(0);
            Ok(())
        }

        async fn process_turn(
            &mut self,
            msg: &NormalizedMessage,
            _state: &ConversationState,
        ) -> Result<TurnOutcome, AgentError> {
            let text = msg.text.as_str();
            if self.script.fail_on == Some(text) {
                return Err(AgentError::TurnFailed {
                    role: self.role,
                    reason: "scripted failure".into(),
                });
            }
            if self.script.panic_on == Some(text) {
                panic!("scripted panic");
            }
            self.turns += 1;
            if let Some((trigger, target)) = self.script.handoff_on {
                if text.contains(trigger) {
                    return Ok(TurnOutcome::Handoff {
                        reply: AgentReply::say("passing you along"),
                        target,
                        payload: json!({"need": text}),
                    });
                }
            }
            Ok(TurnOutcome::Continue(
                AgentReply::say(format!("{} turn {}", self.role, self.turns))
                    .with_slot("last", text),
            ))
        }

        async fn on_handoff_received(
            &mut self,
            payload: &Value,
            _state: &ConversationState,
        ) -> Result<AgentReply, AgentError> {
            let remaining = self.script.init_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.script.init_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AgentError::HandoffRejected {
                    role: self.role,
                    reason: "not ready".into(),
                });
            }
            self.script.inits.lock().unwrap().push(payload.clone());
            Ok(AgentReply::say(format!("{} ready", self.role)).with_slot("need", payload["need"].clone()))
        }

        fn snapshot(&self) -> Value {
            json!({"turns": self.turns})
        }
    }

    struct Fixture {
        hub: AgentHub,
        db: Arc<dyn Database>,
        intake: Script,
        qualification: Script,
    }

    async fn fixture(intake: Script, qualification: Script) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Fixture {
            hub: hub_on(Arc::clone(&db), &intake, &qualification),
            db,
            intake,
            qualification,
        }
    }

    fn hub_on(db: Arc<dyn Database>, intake: &Script, qualification: &Script) -> AgentHub {
        let agents = AgentRegistry::new()
            .with(Arc::new(TestAgent {
                role: AgentRole::Intake,
                script: intake.clone(),
            }))
            .with(Arc::new(TestAgent {
                role: AgentRole::Qualification,
                script: qualification.clone(),
            }))
            .with(Arc::new(TestAgent {
                role: AgentRole::Support,
                script: Script::default(),
            }));
        AgentHub::new(db, agents, HubConfig::default())
    }

    fn handing_off() -> Script {
        Script {
            handoff_on: Some(("crm", AgentRole::Qualification)),
            ..Script::default()
        }
    }

    fn msg(text: &str) -> NormalizedMessage {
        NormalizedMessage::from_text("5511999990000", text, Utc::now())
    }

    async fn turn(hub: &AgentHub, text: &str) -> TurnReport {
        hub.handle(&msg(text), VerificationStatus::None, Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_message_creates_conversation() {
        let f = fixture(Script::default(), Script::default()).await;
        let report = turn(&f.hub, "hello").await;

        assert_eq!(report.kind, TurnKind::Continued);
        assert_eq!(report.replies, vec!["intake turn 1"]);
        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.current_role(), AgentRole::Intake);
        assert_eq!(state.inbound_count, 1);
        assert_eq!(state.outbound_count, 1);
        assert_eq!(state.slots["last"], json!("hello"));
        assert_eq!(state.agent_state, json!({"turns": 1}));
    }

    #[tokio::test]
    async fn handoff_swaps_role_and_runs_initializer() {
        let f = fixture(handing_off(), Script::default()).await;
        turn(&f.hub, "hi").await;
        let report = turn(&f.hub, "we need a crm").await;

        assert_eq!(report.kind, TurnKind::HandedOff);
        assert_eq!(report.role, AgentRole::Qualification);
        assert_eq!(report.replies, vec!["passing you along", "qualification ready"]);
        let record = report.handoff.unwrap();
        assert_eq!((record.from, record.to), (AgentRole::Intake, AgentRole::Qualification));

        assert_eq!(
            f.qualification.inits.lock().unwrap().as_slice(),
            &[json!({"need": "we need a crm"})]
        );

        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.current_role(), AgentRole::Qualification);
        assert!(state.pending_handoff.is_none());
        assert_eq!(state.slots["need"], json!("we need a crm"));
        assert_eq!(state.handoff_history.len(), 1);
        assert_eq!(f.db.list_handoffs("5511999990000").await.unwrap().len(), 1);

        let next = turn(&f.hub, "budget is 10k").await;
        assert_eq!(next.replies, vec!["qualification turn 1"]);
    }

    #[tokio::test]
    async fn failed_turn_keeps_role_and_state() {
        let intake = Script {
            fail_on: Some("boom"),
            ..handing_off()
        };
        let f = fixture(intake, Script::default()).await;
        turn(&f.hub, "hi").await;
        let before = f.db.load_conversation("5511999990000").await.unwrap().unwrap();

        let report = turn(&f.hub, "boom").await;
        assert_eq!(report.kind, TurnKind::Failed);
        assert_eq!(report.replies, vec![HubConfig::default().fallback_reply]);
        assert_eq!(report.role, AgentRole::Intake);

        let after = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.inbound_count, before.inbound_count);
    }

    #[tokio::test]
    async fn panicking_agent_is_contained() {
        let intake = Script {
            panic_on: Some("explode"),
            ..Script::default()
        };
        let f = fixture(intake, Script::default()).await;
        let report = turn(&f.hub, "explode").await;
        assert_eq!(report.kind, TurnKind::Failed);

        // The hub keeps working for the same contact.
        let report = turn(&f.hub, "hello").await;
        assert_eq!(report.kind, TurnKind::Continued);
        assert_eq!(report.replies, vec!["intake turn 1"]);
    }

    #[tokio::test]
    async fn state_rehydrates_across_hub_instances() {
        let f = fixture(Script::default(), Script::default()).await;
        turn(&f.hub, "one").await;
        turn(&f.hub, "two").await;

        let fresh = hub_on(Arc::clone(&f.db), &f.intake, &f.qualification);
        let report = turn(&fresh, "three").await;
        assert_eq!(report.replies, vec!["intake turn 3"]);
    }

    #[tokio::test]
    async fn cached_engine_is_reused_but_still_restored() {
        let f = fixture(Script::default(), Script::default()).await;
        turn(&f.hub, "one").await;
        turn(&f.hub, "two").await;
        assert_eq!(f.intake.builds.load(Ordering::SeqCst), 1);

        // Another writer moves the durable snapshot; the cached engine follows it.
        let mut state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        state.agent_state = json!({"turns": 10});
        f.db.save_conversation(&state).await.unwrap();

        let report = turn(&f.hub, "three").await;
        assert_eq!(report.replies, vec!["intake turn 11"]);
    }

    #[tokio::test]
    async fn idle_engines_are_swept() {
        let f = fixture(Script::default(), Script::default()).await;
        turn(&f.hub, "one").await;
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(f.hub.sweep(later).await >= 1);

        turn(&f.hub, "two").await;
        assert_eq!(f.intake.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_initializer_is_retried_next_turn() {
        let qualification = Script {
            init_failures: Arc::new(AtomicUsize::new(1)),
            ..Script::default()
        };
        let f = fixture(handing_off(), qualification).await;

        let report = turn(&f.hub, "crm please").await;
        assert_eq!(report.kind, TurnKind::HandedOff);
        assert_eq!(report.replies, vec!["passing you along"]);

        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.current_role(), AgentRole::Qualification);
        assert_eq!(state.pending_handoff.as_ref().unwrap().attempts, 1);

        let report = turn(&f.hub, "still there?").await;
        assert_eq!(report.kind, TurnKind::Continued);
        assert_eq!(report.replies, vec!["qualification ready", "qualification turn 1"]);
        assert_eq!(f.qualification.inits.lock().unwrap().len(), 1);

        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert!(state.pending_handoff.is_none());
    }

    #[tokio::test]
    async fn disallowed_handoff_is_contained() {
        let intake = Script {
            handoff_on: Some(("jump", AgentRole::Scheduling)),
            ..Script::default()
        };
        let f = fixture(intake, Script::default()).await;
        turn(&f.hub, "hi").await;

        let report = turn(&f.hub, "jump ahead").await;
        assert_eq!(report.kind, TurnKind::Failed);
        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.current_role(), AgentRole::Intake);
        assert!(state.handoff_history.is_empty());
    }

    #[tokio::test]
    async fn concurrent_turns_for_one_contact_are_serialized() {
        let f = fixture(Script::default(), Script::default()).await;
        let hub = Arc::new(f.hub);
        let mut handles = Vec::new();
        for i in 0..8 {
            let hub = Arc::clone(&hub);
            handles.push(tokio::spawn(async move {
                hub.handle(&msg(&format!("m{i}")), VerificationStatus::None, Utc::now())
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().kind, TurnKind::Continued);
        }
        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.inbound_count, 8);
        assert_eq!(state.agent_state, json!({"turns": 8}));
    }

    #[tokio::test]
    async fn verification_status_is_recorded() {
        let f = fixture(Script::default(), Script::default()).await;
        f.hub
            .handle(&msg("hi"), VerificationStatus::Verified, Utc::now())
            .await
            .unwrap();
        let state = f.db.load_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(state.verification, VerificationStatus::Verified);
    }
}
