//! Logged workouts (`activities` table).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::{validate_id, ListQuery, SyncTable};

use super::{to_row, DataResult, DataService, FetchOptions, WriteResult};
use crate::error::{SyncError, SyncResult};
use crate::service::SyncService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub user_id: String,
    /// Free-form type, e.g. `run` or `yoga`.
    pub kind: String,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub challenge_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct ActivityService {
    data: DataService,
}

impl ActivityService {
    pub fn new(sync: SyncService) -> Self {
        ActivityService {
            data: DataService::new(sync, SyncTable::Activities),
        }
    }

    pub fn data(&self) -> &DataService {
        &self.data
    }

    /// A user's activities, cached per user.
    pub async fn list_activities(
        &self,
        user_id: &str,
        options: FetchOptions,
    ) -> SyncResult<DataResult<Vec<Activity>>> {
        validate_id(user_id)?;
        let query = ListQuery::new().where_eq("user_id", user_id);
        Ok(self.data.fetch_list(&query, options).await)
    }

    pub async fn log_activity(&self, new: &NewActivity) -> SyncResult<WriteResult<Activity>> {
        validate_id(&new.user_id)?;
        if new.kind.trim().is_empty() {
            return Err(SyncError::Validation("activity kind is empty".into()));
        }
        Ok(self.data.insert_with_cache(to_row(new)?).await?.decode())
    }

    pub async fn update_activity(
        &self,
        id: &str,
        update: &ActivityUpdate,
    ) -> SyncResult<WriteResult<Activity>> {
        if *update == ActivityUpdate::default() {
            return Err(SyncError::Validation("activity update has no fields".into()));
        }
        let result = self
            .data
            .update_with_optimistic_cache(id, to_row(update)?)
            .await?;
        Ok(result.decode())
    }

    pub async fn delete_activity(&self, id: &str) -> SyncResult<WriteResult<()>> {
        self.data.delete_with_cache(id).await
    }
}
