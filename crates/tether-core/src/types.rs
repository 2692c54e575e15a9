//! # Domain Types
//!
//! Core types shared by the storage layer and the sync engine.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  SyncOperation  │   │   CacheEntry    │   │  QueueCounts    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  key            │   │  pending        │       │
//! │  │  seq            │   │  value (JSON)   │   │  failed         │       │
//! │  │  table / kind   │   │  stored_at      │   │  completed      │       │
//! │  │  payload (JSON) │   │  ttl_ms         │   └─────────────────┘       │
//! │  │  state/attempts │   └─────────────────┘                              │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SyncTable     │   │ OperationKind   │   │ OperationState  │       │
//! │  │  profiles       │   │  insert         │   │  pending        │       │
//! │  │  challenges     │   │  update         │   │  in_flight      │       │
//! │  │  challenge_     │   │  delete         │   │  failed         │       │
//! │  │   participants  │   └─────────────────┘   │  completed      │       │
//! │  │  activities     │                         └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::validation::resource_id_of;

// =============================================================================
// Sync Table
// =============================================================================

/// The remote tables the queue may write to.
///
/// A closed set: an operation can never target a table the backend
/// does not expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Profiles,
    Challenges,
    ChallengeParticipants,
    Activities,
}

impl SyncTable {
    /// Every table, in declaration order.
    pub const ALL: [SyncTable; 4] = [
        SyncTable::Profiles,
        SyncTable::Challenges,
        SyncTable::ChallengeParticipants,
        SyncTable::Activities,
    ];

    /// The remote table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTable::Profiles => "profiles",
            SyncTable::Challenges => "challenges",
            SyncTable::ChallengeParticipants => "challenge_participants",
            SyncTable::Activities => "activities",
        }
    }

    /// The entity segment used in cache keys for rows of this table.
    pub fn cache_entity(&self) -> &'static str {
        match self {
            SyncTable::Profiles => "profile",
            SyncTable::Challenges => "challenge",
            SyncTable::ChallengeParticipants => "participant",
            SyncTable::Activities => "activity",
        }
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncTable::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownValue {
                kind: "table",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Operation Kind
// =============================================================================

/// The mutation an operation replays against the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(CoreError::UnknownValue {
                kind: "operation kind",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Operation State
// =============================================================================

/// Lifecycle of a queued operation.
///
/// ## State Machine
/// ```text
///              claim                 remote ok
///  ┌─────────┐ ─────► ┌───────────┐ ─────────► ┌───────────┐
///  │ pending │        │ in_flight │            │ completed │
///  └─────────┘ ◄───── └───────────┘            └───────────┘
///    ▲    │  retryable /     │
///    │    │  interrupted     │ terminal / attempts exhausted
///    │    │                  ▼
///    │    │ corrupt     ┌────────┐
///    │    └───────────► │ failed │
///    │     retry_failed └────────┘
///    └─────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InFlight,
    Failed,
    Completed,
}

impl Default for OperationState {
    fn default() -> Self {
        OperationState::Pending
    }
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InFlight => "in_flight",
            OperationState::Failed => "failed",
            OperationState::Completed => "completed",
        }
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Failed)
                | (InFlight, Completed)
                | (InFlight, Failed)
                | (InFlight, Pending)
                | (Failed, Pending)
        )
    }

    /// Anything short of completed holds back later operations on the
    /// same resource. A failed operation keeps holding until it is retried
    /// to completion or discarded.
    pub fn holds_resource(&self) -> bool {
        !matches!(self, OperationState::Completed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "in_flight" => Ok(OperationState::InFlight),
            "failed" => Ok(OperationState::Failed),
            "completed" => Ok(OperationState::Completed),
            other => Err(CoreError::UnknownValue {
                kind: "operation state",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// A single queued mutation against the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// UUID v4 assigned at enqueue time.
    pub id: String,
    /// Local sequence number; replay order.
    pub seq: i64,
    pub table: SyncTable,
    pub kind: OperationKind,
    /// Row id the operation touches, taken from the payload's `id`.
    pub resource_id: Option<String>,
    pub payload: Value,
    pub state: OperationState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    /// Earliest time a retry may be attempted. `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    /// Creates a fresh pending operation.
    pub fn new(seq: i64, table: SyncTable, kind: OperationKind, payload: Value) -> Self {
        SyncOperation {
            id: Uuid::new_v4().to_string(),
            seq,
            table,
            kind,
            resource_id: resource_id_of(&payload),
            payload,
            state: OperationState::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            attempted_at: None,
            next_attempt_at: None,
            completed_at: None,
        }
    }

    /// Key used to keep same-resource operations in order.
    ///
    /// Operations without a resource id are only ordered against themselves.
    pub fn resource_key(&self) -> String {
        match &self.resource_id {
            Some(id) => format!("{}:{}", self.table, id),
            None => format!("{}:op:{}", self.table, self.id),
        }
    }

    /// Pending and past its backoff window.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == OperationState::Pending && self.next_attempt_at.map_or(true, |t| t <= now)
    }

    /// Moves to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: OperationState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached JSON value with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// Creates an entry stored now.
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration) -> Self {
        CacheEntry {
            key: key.into(),
            value,
            stored_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Stale once `now - stored_at >= ttl`.
    ///
    /// An entry with a `stored_at` in the future (clock moved back) is fresh.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.stored_at).to_std() {
            Ok(age) => age >= self.ttl(),
            Err(_) => false,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

// =============================================================================
// Queue Counts
// =============================================================================

/// Counters exposed to the status surface.
///
/// `pending` includes in-flight operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub failed: usize,
    pub completed: usize,
}

impl QueueCounts {
    /// Tallies a set of operations.
    pub fn tally<'a>(ops: impl IntoIterator<Item = &'a SyncOperation>) -> Self {
        ops.into_iter().fold(QueueCounts::default(), |mut c, op| {
            match op.state {
                OperationState::Pending | OperationState::InFlight => c.pending += 1,
                OperationState::Failed => c.failed += 1,
                OperationState::Completed => c.completed += 1,
            }
            c
        })
    }
}

// =============================================================================
// Sync Status Type
// =============================================================================

/// The single status badge shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatusType {
    Synced,
    Syncing,
    Pending,
    Offline,
    Error,
}

impl SyncStatusType {
    /// Derives the badge. First match wins:
    /// offline, error, syncing, pending, synced.
    pub fn derive(
        is_online: bool,
        is_syncing: bool,
        counts: QueueCounts,
        has_error: bool,
    ) -> Self {
        if !is_online {
            SyncStatusType::Offline
        } else if counts.failed > 0 && has_error {
            SyncStatusType::Error
        } else if is_syncing {
            SyncStatusType::Syncing
        } else if counts.pending > 0 {
            SyncStatusType::Pending
        } else {
            SyncStatusType::Synced
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatusType::Synced => "synced",
            SyncStatusType::Syncing => "syncing",
            SyncStatusType::Pending => "pending",
            SyncStatusType::Offline => "offline",
            SyncStatusType::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_round_trips_through_str() {
        for table in SyncTable::ALL {
            assert_eq!(table.as_str().parse::<SyncTable>().unwrap(), table);
        }
        assert!("users".parse::<SyncTable>().is_err());
    }

    #[test]
    fn test_state_transitions() {
        use OperationState::*;
        assert!(Pending.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Completed));
        assert!(InFlight.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(InFlight));

        assert!(Failed.holds_resource());
        assert!(InFlight.holds_resource());
        assert!(!Completed.holds_resource());
    }

    #[test]
    fn test_transition_rejects_invalid_move() {
        let mut op = SyncOperation::new(1, SyncTable::Profiles, OperationKind::Update, json!({"id": "u1"}));
        let err = op.transition(OperationState::Completed).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(op.state, OperationState::Pending);
    }

    #[test]
    fn test_operation_takes_resource_id_from_payload() {
        let op = SyncOperation::new(1, SyncTable::Challenges, OperationKind::Update, json!({"id": "c1", "title": "x"}));
        assert_eq!(op.resource_id.as_deref(), Some("c1"));
        assert_eq!(op.resource_key(), "challenges:c1");

        let anon = SyncOperation::new(2, SyncTable::Activities, OperationKind::Insert, json!({"steps": 10}));
        assert!(anon.resource_id.is_none());
        assert!(anon.resource_key().contains(&anon.id));
    }

    #[test]
    fn test_is_due_respects_backoff() {
        let now = Utc::now();
        let mut op = SyncOperation::new(1, SyncTable::Profiles, OperationKind::Update, json!({"id": "u1"}));
        assert!(op.is_due(now));

        op.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!op.is_due(now));
        assert!(op.is_due(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_staleness_boundary() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_secs(60));
        let t0 = entry.stored_at;

        assert!(!entry.is_stale_at(t0));
        assert!(!entry.is_stale_at(t0 + chrono::Duration::seconds(59)));
        assert!(entry.is_stale_at(t0 + chrono::Duration::seconds(60)));
        assert!(entry.is_stale_at(t0 + chrono::Duration::seconds(3600)));
    }

    #[test]
    fn test_staleness_is_monotonic() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_millis(1500));
        let t0 = entry.stored_at;
        let mut seen_stale = false;
        for ms in (0..5000).step_by(100) {
            let stale = entry.is_stale_at(t0 + chrono::Duration::milliseconds(ms));
            if seen_stale {
                assert!(stale, "entry became fresh again at +{ms}ms");
            }
            seen_stale |= stale;
        }
        assert!(seen_stale);
    }

    #[test]
    fn test_zero_ttl_is_immediately_stale() {
        let entry = CacheEntry::new("k", json!(1), Duration::ZERO);
        assert!(entry.is_stale_at(entry.stored_at));
    }

    #[test]
    fn test_future_stored_at_is_fresh() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_secs(1));
        assert!(!entry.is_stale_at(entry.stored_at - chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_counts_fold_in_flight_into_pending() {
        let mut a = SyncOperation::new(1, SyncTable::Profiles, OperationKind::Update, json!({"id": "a"}));
        let mut b = a.clone();
        let mut c = a.clone();
        a.state = OperationState::InFlight;
        b.state = OperationState::Failed;
        c.state = OperationState::Completed;
        let d = SyncOperation::new(4, SyncTable::Profiles, OperationKind::Update, json!({"id": "d"}));

        let counts = QueueCounts::tally([&a, &b, &c, &d]);
        assert_eq!(counts, QueueCounts { pending: 2, failed: 1, completed: 1 });
    }

    #[test]
    fn test_status_priority() {
        let pending = QueueCounts { pending: 3, failed: 0, completed: 0 };
        let failed = QueueCounts { pending: 0, failed: 1, completed: 0 };

        assert_eq!(SyncStatusType::derive(false, true, failed, true), SyncStatusType::Offline);
        assert_eq!(SyncStatusType::derive(true, true, failed, true), SyncStatusType::Error);
        assert_eq!(SyncStatusType::derive(true, true, failed, false), SyncStatusType::Syncing);
        assert_eq!(SyncStatusType::derive(true, false, pending, false), SyncStatusType::Pending);
        assert_eq!(SyncStatusType::derive(true, false, failed, false), SyncStatusType::Synced);
        assert_eq!(SyncStatusType::derive(true, false, QueueCounts::default(), false), SyncStatusType::Synced);
    }
}
