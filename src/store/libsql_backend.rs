//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases over a single shared
//! connection. Writes are serialized by `write_lock` so that a handoff
//! transaction never interleaves with another task's statements.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::classifier::verification::{VerificationChallenge, VerificationStatus};
use crate::error::DatabaseError;
use crate::hub::roles::AgentRole;
use crate::hub::state::{ConversationState, HandoffRecord, PendingHandoff};
use crate::store::migrations;
use crate::store::traits::{BlockedContact, Database};

const CONVERSATION_COLUMNS: &str = "contact_id, current_role, slots, agent_state, pending_handoff, \
     verification, inbound_count, outbound_count, version, created_at, updated_at";

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and `:memory:` runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed precision keeps lexical and
/// chronological order identical.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

/// Map a libsql Row to a ConversationState (without handoff history).
///
/// Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<ConversationState, DatabaseError> {
    let err = row_err("load_conversation");
    let contact_id: String = row.get(0).map_err(&err)?;
    let role_str: String = row.get(1).map_err(&err)?;
    let slots_str: String = row.get(2).map_err(&err)?;
    let agent_state_str: String = row.get(3).map_err(&err)?;
    let pending_str: Option<String> = row.get(4).ok();
    let verification_str: String = row.get(5).map_err(&err)?;
    let inbound_count: i64 = row.get(6).map_err(&err)?;
    let outbound_count: i64 = row.get(7).map_err(&err)?;
    let version: i64 = row.get(8).map_err(&err)?;
    let created_str: String = row.get(9).map_err(&err)?;
    let updated_str: String = row.get(10).map_err(&err)?;

    let current_role: AgentRole = role_str.parse().map_err(DatabaseError::Serialization)?;
    let slots: BTreeMap<String, Value> = from_json(&slots_str, "slots")?;
    let agent_state: Value = from_json(&agent_state_str, "agent_state")?;
    let pending_handoff: Option<PendingHandoff> = match pending_str {
        Some(s) => from_json(&s, "pending_handoff")?,
        None => None,
    };

    Ok(ConversationState {
        contact_id,
        current_role,
        slots,
        agent_state,
        pending_handoff,
        handoff_history: Vec::new(),
        verification: verification_str.parse().unwrap_or_default(),
        inbound_count: inbound_count.max(0) as u64,
        outbound_count: outbound_count.max(0) as u64,
        version,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_handoff(row: &libsql::Row) -> Result<HandoffRecord, DatabaseError> {
    let err = row_err("list_handoffs");
    let from: String = row.get(0).map_err(&err)?;
    let to: String = row.get(1).map_err(&err)?;
    let payload: String = row.get(2).map_err(&err)?;
    let created: String = row.get(3).map_err(&err)?;
    Ok(HandoffRecord {
        from: from.parse().map_err(DatabaseError::Serialization)?,
        to: to.parse().map_err(DatabaseError::Serialization)?,
        at: parse_datetime(&created),
        payload: from_json(&payload, "handoff payload")?,
    })
}

fn row_to_challenge(row: &libsql::Row) -> Result<VerificationChallenge, DatabaseError> {
    let err = row_err("get_verification");
    let contact_id: String = row.get(0).map_err(&err)?;
    let status: String = row.get(1).map_err(&err)?;
    let attempts: i64 = row.get(2).map_err(&err)?;
    let issued: String = row.get(3).map_err(&err)?;
    let updated: String = row.get(4).map_err(&err)?;
    Ok(VerificationChallenge {
        contact_id,
        status: status
            .parse::<VerificationStatus>()
            .map_err(DatabaseError::Serialization)?,
        attempts: attempts.max(0) as u32,
        issued_at: parse_datetime(&issued),
        updated_at: parse_datetime(&updated),
    })
}

/// Serialized column values for a conversation write.
struct ConversationColumns {
    slots: String,
    agent_state: String,
    pending_handoff: libsql::Value,
}

impl ConversationColumns {
    fn of(state: &ConversationState) -> Result<Self, DatabaseError> {
        let pending_handoff = match &state.pending_handoff {
            Some(p) => libsql::Value::Text(to_json(p, "pending_handoff")?),
            None => libsql::Value::Null,
        };
        Ok(Self {
            slots: to_json(&state.slots, "slots")?,
            agent_state: to_json(&state.agent_state, "agent_state")?,
            pending_handoff,
        })
    }
}

/// Versioned UPDATE shared by `save_conversation` and `commit_handoff`.
async fn update_conversation(
    conn: &Connection,
    state: &ConversationState,
) -> Result<i64, DatabaseError> {
    let cols = ConversationColumns::of(state)?;
    let affected = conn
        .execute(
            "UPDATE conversations SET current_role = ?1, slots = ?2, agent_state = ?3, \
             pending_handoff = ?4, verification = ?5, inbound_count = ?6, outbound_count = ?7, \
             version = version + 1, updated_at = ?8 \
             WHERE contact_id = ?9 AND version = ?10",
            params![
                state.current_role.as_str(),
                cols.slots,
                cols.agent_state,
                cols.pending_handoff,
                state.verification.as_str(),
                state.inbound_count as i64,
                state.outbound_count as i64,
                ts(state.updated_at),
                state.contact_id.as_str(),
                state.version
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_conversation: {e}")))?;

    if affected == 0 {
        return Err(DatabaseError::Conflict {
            entity: "conversation",
            id: state.contact_id.clone(),
            expected: state.version,
        });
    }
    Ok(state.version + 1)
}

// ── Database impl ───────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn load_conversation(
        &self,
        contact_id: &str,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE contact_id = ?1"),
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_conversation: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("load_conversation: {e}"))),
        };
        let mut state = row_to_conversation(&row)?;
        state.handoff_history = self.list_handoffs(contact_id).await?;
        Ok(Some(state))
    }

    async fn create_conversation(&self, state: &ConversationState) -> Result<i64, DatabaseError> {
        let cols = ConversationColumns::of(state)?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO conversations ({CONVERSATION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)"
                ),
                params![
                    state.contact_id.as_str(),
                    state.current_role.as_str(),
                    cols.slots,
                    cols.agent_state,
                    cols.pending_handoff,
                    state.verification.as_str(),
                    state.inbound_count as i64,
                    state.outbound_count as i64,
                    ts(state.created_at),
                    ts(state.updated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;
        debug!(contact = %state.contact_id, "Conversation created");
        Ok(1)
    }

    async fn save_conversation(&self, state: &ConversationState) -> Result<i64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        update_conversation(self.conn(), state).await
    }

    async fn commit_handoff(
        &self,
        state: &ConversationState,
        record: &HandoffRecord,
    ) -> Result<i64, DatabaseError> {
        let payload = to_json(&record.payload, "handoff payload")?;
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_handoff begin: {e}")))?;

        let version = match update_conversation(&tx, state).await {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };

        if let Err(e) = tx
            .execute(
                "INSERT INTO handoffs (id, contact_id, from_role, to_role, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    state.contact_id.as_str(),
                    record.from.as_str(),
                    record.to.as_str(),
                    payload,
                    ts(record.at)
                ],
            )
            .await
        {
            let _ = tx.rollback().await;
            return Err(DatabaseError::Query(format!("commit_handoff insert: {e}")));
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_handoff commit: {e}")))?;
        Ok(version)
    }

    async fn list_handoffs(&self, contact_id: &str) -> Result<Vec<HandoffRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT from_role, to_role, payload, created_at FROM handoffs \
                 WHERE contact_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_handoffs: {e}")))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => records.push(row_to_handoff(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_handoffs: {e}"))),
            }
        }
        Ok(records)
    }

    // ── Verification ────────────────────────────────────────────────

    async fn get_verification(
        &self,
        contact_id: &str,
    ) -> Result<Option<VerificationChallenge>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT contact_id, status, attempts, issued_at, updated_at \
                 FROM verification_challenges WHERE contact_id = ?1",
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_verification: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_challenge(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_verification: {e}"))),
        }
    }

    async fn save_verification(
        &self,
        challenge: &VerificationChallenge,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO verification_challenges \
                 (contact_id, status, attempts, issued_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(contact_id) DO UPDATE SET \
                 status = excluded.status, attempts = excluded.attempts, \
                 issued_at = excluded.issued_at, updated_at = excluded.updated_at",
                params![
                    challenge.contact_id.as_str(),
                    challenge.status.as_str(),
                    challenge.attempts as i64,
                    ts(challenge.issued_at),
                    ts(challenge.updated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_verification: {e}")))?;
        Ok(())
    }

    // ── Blocked contacts ────────────────────────────────────────────

    async fn block_contact(
        &self,
        contact_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO blocked_contacts (contact_id, reason, blocked_at) \
                 VALUES (?1, ?2, ?3)",
                params![contact_id, reason, ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("block_contact: {e}")))?;
        Ok(())
    }

    async fn get_block(&self, contact_id: &str) -> Result<Option<BlockedContact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT contact_id, reason, blocked_at FROM blocked_contacts WHERE contact_id = ?1",
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_block: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let err = row_err("get_block");
                let blocked_at: String = row.get(2).map_err(&err)?;
                Ok(Some(BlockedContact {
                    contact_id: row.get(0).map_err(&err)?,
                    reason: row.get(1).map_err(&err)?,
                    blocked_at: parse_datetime(&blocked_at),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_block: {e}"))),
        }
    }
}
