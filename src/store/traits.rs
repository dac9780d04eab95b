//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::classifier::verification::VerificationChallenge;
use crate::error::DatabaseError;
use crate::hub::state::{ConversationState, HandoffRecord};

/// A permanently blocked contact.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedContact {
    pub contact_id: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Load a conversation, including its handoff history.
    async fn load_conversation(
        &self,
        contact_id: &str,
    ) -> Result<Option<ConversationState>, DatabaseError>;

    /// Insert a new conversation at version 1. Fails if one already exists.
    async fn create_conversation(&self, state: &ConversationState) -> Result<i64, DatabaseError>;

    /// Write `state` if the stored version still equals `state.version`.
    /// Returns the new version; a stale version yields
    /// [`DatabaseError::Conflict`].
    async fn save_conversation(&self, state: &ConversationState) -> Result<i64, DatabaseError>;

    /// Append `record` and write `state` in one transaction, with the same
    /// version check as [`Database::save_conversation`].
    async fn commit_handoff(
        &self,
        state: &ConversationState,
        record: &HandoffRecord,
    ) -> Result<i64, DatabaseError>;

    /// Full handoff history for a contact, oldest first.
    async fn list_handoffs(&self, contact_id: &str) -> Result<Vec<HandoffRecord>, DatabaseError>;

    // ── Verification ────────────────────────────────────────────────

    async fn get_verification(
        &self,
        contact_id: &str,
    ) -> Result<Option<VerificationChallenge>, DatabaseError>;

    /// Insert or replace the challenge record.
    async fn save_verification(&self, challenge: &VerificationChallenge)
    -> Result<(), DatabaseError>;

    // ── Blocked contacts ────────────────────────────────────────────

    /// Record a permanent block. Idempotent; the first reason is kept.
    async fn block_contact(
        &self,
        contact_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn get_block(&self, contact_id: &str) -> Result<Option<BlockedContact>, DatabaseError>;

    async fn is_blocked(&self, contact_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.get_block(contact_id).await?.is_some())
    }
}
