//! # Challenges
//!
//! `challenges` rows plus membership in `challenge_participants`.
//!
//! ```text
//!   challenge c1 ◄── participant "c1:u1" ── user u1
//!                ◄── participant "c1:u2" ── user u2
//! ```
//!
//! A participant row's id is `<challenge_id>:<user_id>`, so joining twice
//! is a conflict on the backend and leaving needs no lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::{validate_id, ListQuery, SyncTable};

use super::{to_row, DataResult, DataService, FetchOptions, WriteResult};
use crate::error::{SyncError, SyncResult};
use crate::service::SyncService;

pub const STATUS_ACTIVE: &str = "active";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub creator_id: String,
    #[serde(default = "default_status")]
    pub status: String,
    /// Target value, e.g. total minutes or repetitions.
    #[serde(default)]
    pub goal: Option<i64>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

fn default_status() -> String {
    STATUS_ACTIVE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChallenge {
    /// Client-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub creator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChallengeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub challenge_id: String,
    pub user_id: String,
    #[serde(default)]
    pub progress: i64,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn id_for(challenge_id: &str, user_id: &str) -> String {
        format!("{challenge_id}:{user_id}")
    }
}

#[derive(Clone)]
pub struct ChallengeService {
    challenges: DataService,
    participants: DataService,
}

impl ChallengeService {
    pub fn new(sync: SyncService) -> Self {
        ChallengeService {
            challenges: DataService::new(sync.clone(), SyncTable::Challenges),
            participants: DataService::new(sync, SyncTable::ChallengeParticipants),
        }
    }

    pub fn challenges(&self) -> &DataService {
        &self.challenges
    }

    pub fn participants(&self) -> &DataService {
        &self.participants
    }

    // =========================================================================
    // Challenges
    // =========================================================================

    pub async fn get_challenge(
        &self,
        id: &str,
        options: FetchOptions,
    ) -> SyncResult<DataResult<Challenge>> {
        self.challenges.fetch_by_id(id, options).await
    }

    pub async fn list_challenges(
        &self,
        query: &ListQuery,
        options: FetchOptions,
    ) -> DataResult<Vec<Challenge>> {
        self.challenges.fetch_list(query, options).await
    }

    pub async fn count_challenges(&self, query: &ListQuery, options: FetchOptions) -> DataResult<u64> {
        self.challenges.fetch_count(query, options).await
    }

    pub async fn create_challenge(&self, new: &NewChallenge) -> SyncResult<WriteResult<Challenge>> {
        if new.title.trim().is_empty() {
            return Err(SyncError::Validation("challenge title is empty".into()));
        }
        validate_id(&new.creator_id)?;

        let mut row = to_row(new)?;
        if let Value::Object(fields) = &mut row {
            fields.insert("status".into(), Value::String(STATUS_ACTIVE.into()));
        }
        Ok(self.challenges.insert_with_cache(row).await?.decode())
    }

    pub async fn update_challenge(
        &self,
        id: &str,
        update: &ChallengeUpdate,
    ) -> SyncResult<WriteResult<Challenge>> {
        if *update == ChallengeUpdate::default() {
            return Err(SyncError::Validation("challenge update has no fields".into()));
        }
        let result = self
            .challenges
            .update_with_optimistic_cache(id, to_row(update)?)
            .await?;
        Ok(result.decode())
    }

    pub async fn delete_challenge(&self, id: &str) -> SyncResult<WriteResult<()>> {
        self.challenges.delete_with_cache(id).await
    }

    // =========================================================================
    // Participants
    // =========================================================================

    pub async fn join_challenge(
        &self,
        challenge_id: &str,
        user_id: &str,
    ) -> SyncResult<WriteResult<Participant>> {
        validate_id(challenge_id)?;
        validate_id(user_id)?;

        let participant = Participant {
            id: Participant::id_for(challenge_id, user_id),
            challenge_id: challenge_id.to_string(),
            user_id: user_id.to_string(),
            progress: 0,
            joined_at: Some(Utc::now()),
        };
        let result = self.participants.insert_with_cache(to_row(&participant)?).await?;
        Ok(result.decode())
    }

    pub async fn leave_challenge(&self, challenge_id: &str, user_id: &str) -> SyncResult<WriteResult<()>> {
        validate_id(challenge_id)?;
        validate_id(user_id)?;
        self.participants
            .delete_with_cache(&Participant::id_for(challenge_id, user_id))
            .await
    }

    pub async fn list_participants(
        &self,
        challenge_id: &str,
        options: FetchOptions,
    ) -> DataResult<Vec<Participant>> {
        self.participants
            .fetch_list(&participants_of(challenge_id), options)
            .await
    }

    pub async fn count_participants(&self, challenge_id: &str, options: FetchOptions) -> DataResult<u64> {
        self.participants
            .fetch_count(&participants_of(challenge_id), options)
            .await
    }
}

fn participants_of(challenge_id: &str) -> ListQuery {
    ListQuery::new().where_eq("challenge_id", challenge_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TetherConfig;
    use crate::data::WriteStatus;
    use crate::remote::InMemoryBackend;
    use serde_json::json;
    use std::sync::Arc;
    use tether_db::{Database, DbConfig};

    async fn setup() -> (ChallengeService, Arc<InMemoryBackend>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let sync = SyncService::builder(TetherConfig::default())
            .with_database(db)
            .with_remote(backend.clone())
            .build()
            .unwrap();
        sync.initialize().await.unwrap();
        (ChallengeService::new(sync), backend)
    }

    fn plank() -> NewChallenge {
        NewChallenge {
            id: None,
            title: "Plank".into(),
            description: None,
            creator_id: "u1".into(),
            goal: Some(300),
            ends_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_list_and_count() {
        let (service, _backend) = setup().await;
        let all = ListQuery::new();

        assert_eq!(service.count_challenges(&all, FetchOptions::default()).await.data, Some(0));

        let created = service.create_challenge(&plank()).await.unwrap();
        assert_eq!(created.status, WriteStatus::Confirmed);
        let challenge = created.data.unwrap();
        assert_eq!(challenge.status, STATUS_ACTIVE);

        // The insert dropped the cached count, so this goes to the backend.
        let count = service.count_challenges(&all, FetchOptions::default()).await;
        assert!(!count.from_cache);
        assert_eq!(count.data, Some(1));

        let listed = service.list_challenges(&all, FetchOptions::default()).await;
        assert_eq!(listed.data.unwrap(), vec![challenge]);
    }

    #[tokio::test]
    async fn test_update_rejected_reverts_cache() {
        let (service, backend) = setup().await;
        backend.seed(
            SyncTable::Challenges,
            json!({"id": "c1", "title": "Plank", "creator_id": "u1"}),
        );
        service.get_challenge("c1", FetchOptions::default()).await.unwrap();

        backend.fail_next(SyncError::rejected("validation", "title too long"));
        let update = ChallengeUpdate {
            title: Some("x".repeat(500)),
            ..Default::default()
        };
        let result = service.update_challenge("c1", &update).await.unwrap();

        assert_eq!(result.status, WriteStatus::Rejected);
        assert_eq!(result.data.unwrap().title, "Plank");
        let cached = service.get_challenge("c1", FetchOptions::default()).await.unwrap();
        assert_eq!(cached.data.unwrap().title, "Plank");
    }

    #[tokio::test]
    async fn test_join_count_and_leave() {
        let (service, backend) = setup().await;

        let joined = service.join_challenge("c1", "u1").await.unwrap();
        assert!(joined.is_confirmed());
        assert_eq!(joined.data.unwrap().id, "c1:u1");
        service.join_challenge("c1", "u2").await.unwrap();
        service.join_challenge("c2", "u1").await.unwrap();

        assert_eq!(service.count_participants("c1", FetchOptions::default()).await.data, Some(2));

        let again = service.join_challenge("c1", "u1").await.unwrap();
        assert_eq!(again.status, WriteStatus::Rejected);

        let left = service.leave_challenge("c1", "u2").await.unwrap();
        assert!(left.is_confirmed());
        assert!(backend.row(SyncTable::ChallengeParticipants, "c1:u2").is_none());

        let members = service.list_participants("c1", FetchOptions::default()).await;
        assert_eq!(members.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_requires_title() {
        let (service, _backend) = setup().await;
        let mut bad = plank();
        bad.title = "  ".into();
        assert!(matches!(service.create_challenge(&bad).await, Err(SyncError::Validation(_))));
    }
}
