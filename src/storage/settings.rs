use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::schema::Database;

// ============================================================================
// Settings Types
// ============================================================================

/// User-facing runtime settings, persisted one JSON value per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Item list filter: "", "unread" or "starred"
    pub filter: String,
    /// Selected feed or folder in the client
    pub feed: String,
    pub feed_list_width: u32,
    pub item_list_width: u32,
    pub sort_newest_first: bool,
    pub theme_name: String,
    pub theme_font: String,
    pub theme_size: f64,
    /// Auto-refresh period in minutes. `None` until a client sets it, in
    /// which case the configured default interval applies. 0 disables.
    pub refresh_rate: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            filter: String::new(),
            feed: String::new(),
            feed_list_width: 300,
            item_list_width: 300,
            sort_newest_first: true,
            theme_name: "light".to_string(),
            theme_font: String::new(),
            theme_size: 1.0,
            refresh_rate: None,
        }
    }
}

/// A partial settings update.
///
/// Deserializing rejects keys that are not settings, so a typo in a client
/// request is an error instead of a silently stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_list_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_list_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_newest_first: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_font: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_rate: Option<u64>,
}

impl SettingsPatch {
    /// Parse a JSON object, rejecting unknown keys and ill-typed values.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reject values no client could have meant.
    pub fn validate(&self) -> Result<()> {
        if let Some(filter) = &self.filter {
            if !matches!(filter.as_str(), "" | "unread" | "starred") {
                bail!("Invalid filter: {filter}");
            }
        }
        if let Some(size) = self.theme_size {
            if !size.is_finite() || size <= 0.0 {
                bail!("Invalid theme size: {size}");
            }
        }
        Ok(())
    }
}

impl Database {
    // ========================================================================
    // Settings Operations
    // ========================================================================

    /// Load settings, falling back to defaults for keys never stored.
    ///
    /// A stored value that no longer decodes is logged and ignored.
    pub async fn get_settings(&self) -> Result<Settings> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, val FROM settings")
            .fetch_all(&self.pool)
            .await?;

        let mut merged = match serde_json::to_value(Settings::default())? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        for (key, raw) in rows {
            if !merged.contains_key(&key) {
                tracing::warn!(key = %key, "Ignoring unknown stored setting");
                continue;
            }
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    let mut candidate = merged.clone();
                    candidate.insert(key.clone(), value);
                    if serde_json::from_value::<Settings>(Value::Object(candidate.clone())).is_ok()
                    {
                        merged = candidate;
                    } else {
                        tracing::warn!(key = %key, "Ignoring stored setting with invalid type");
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Ignoring undecodable stored setting");
                }
            }
        }

        Ok(serde_json::from_value(Value::Object(merged))?)
    }

    /// Store every field present in `patch`.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<()> {
        patch.validate()?;

        let Value::Object(fields) = serde_json::to_value(patch)? else {
            bail!("Settings patch did not serialize to an object");
        };

        let mut tx = self.pool.begin().await?;
        for (key, value) in fields {
            sqlx::query(
                "INSERT INTO settings (key, val) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET val = excluded.val",
            )
            .bind(&key)
            .bind(value.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
