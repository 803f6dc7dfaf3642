//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored URL and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(rename = "targetId")]
    pub id: String,
    pub url: String,
    pub active: bool,
    pub tags: Vec<String>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a target.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTarget {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Partial update of a target. Only these fields are mutable; anything else
/// in an update body is dropped during deserialization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TargetPatch {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TargetPatch {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.active.is_none() && self.tags.is_none() && self.notes.is_none()
    }

    /// Check the patch before it reaches the store.
    pub fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("no updatable fields".to_string());
        }
        if let Some(url) = &self.url {
            if url.trim().is_empty() {
                return Err("url cannot be empty".to_string());
            }
        }
        Ok(())
    }

    /// Apply the patch to a target in memory.
    pub fn apply_to(&self, target: &mut Target) {
        if let Some(url) = &self.url {
            target.url = url.trim().to_string();
        }
        if let Some(active) = self.active {
            target.active = active;
        }
        if let Some(tags) = &self.tags {
            target.tags = tags.clone();
        }
        if let Some(notes) = &self.notes {
            target.notes = notes.clone();
        }
    }
}
