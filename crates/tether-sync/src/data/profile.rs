//! User profiles (`profiles` table).

use serde::{Deserialize, Serialize};

use tether_core::SyncTable;

use super::{to_row, DataResult, DataService, FetchOptions, WriteResult};
use crate::error::{SyncError, SyncResult};
use crate::service::SyncService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub total_xp: i64,
    #[serde(default)]
    pub level: u32,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_xp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        *self == ProfileUpdate::default()
    }
}

#[derive(Clone)]
pub struct ProfileService {
    data: DataService,
}

impl ProfileService {
    pub fn new(sync: SyncService) -> Self {
        ProfileService {
            data: DataService::new(sync, SyncTable::Profiles),
        }
    }

    pub fn data(&self) -> &DataService {
        &self.data
    }

    pub async fn get_profile(
        &self,
        user_id: &str,
        options: FetchOptions,
    ) -> SyncResult<DataResult<Profile>> {
        self.data.fetch_by_id(user_id, options).await
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> SyncResult<WriteResult<Profile>> {
        if update.is_empty() {
            return Err(SyncError::Validation("profile update has no fields".into()));
        }
        let result = self
            .data
            .update_with_optimistic_cache(user_id, to_row(update)?)
            .await?;
        Ok(result.decode())
    }
}
