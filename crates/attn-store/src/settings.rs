//! User settings (one JSON blob) and recent launch locations.

use attn_protocol::types::{RecentLocation, UserSettings};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::{Store, StoreError};

const SETTINGS_KEY: &str = "user_settings";
const RECENT_LOCATION_CAP: usize = 20;

impl Store {
    pub fn get_settings(&self) -> Result<UserSettings, StoreError> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(UserSettings::default()),
        }
    }

    pub fn set_settings(&self, settings: &UserSettings) -> Result<(), StoreError> {
        let json = serde_json::to_string(settings)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SETTINGS_KEY, json],
        )?;
        Ok(())
    }

    /// Record a launch location, bumping its recency and keeping the list
    /// bounded.
    pub fn touch_recent_location(&self, path: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO recent_locations (path, last_used_at) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET last_used_at = excluded.last_used_at",
            params![path, now],
        )?;
        conn.execute(
            "DELETE FROM recent_locations WHERE path NOT IN (
                SELECT path FROM recent_locations
                ORDER BY last_used_at DESC LIMIT ?1
            )",
            params![RECENT_LOCATION_CAP as i64],
        )?;
        Ok(())
    }

    pub fn list_recent_locations(&self) -> Result<Vec<RecentLocation>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT path, last_used_at FROM recent_locations ORDER BY last_used_at DESC")?;
        let locations = stmt
            .query_map([], |row| {
                let raw: String = row.get(1)?;
                Ok(RecentLocation {
                    path: row.get(0)?,
                    last_used_at: raw
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(locations)
    }
}
