use std::fs;
use std::path::Path;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde::Serialize;
use thiserror::Error;

use crate::matcher::normalize_name;

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    logo_address TEXT NOT NULL CHECK (length(trim(logo_address)) > 0),
    roster_address TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS athletes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id TEXT NOT NULL,
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    photo_address TEXT,
    profile_address TEXT,
    updated_at_unix INTEGER NOT NULL,
    UNIQUE (team_id, normalized_name),
    FOREIGN KEY (team_id) REFERENCES teams(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_athletes_team ON athletes(team_id);
CREATE INDEX IF NOT EXISTS idx_athletes_profile ON athletes(profile_address);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub logo_address: String,
    pub roster_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Athlete {
    pub id: i64,
    pub team_id: String,
    pub name: String,
    pub photo_address: Option<String>,
    pub profile_address: Option<String>,
}

/// Fields to change on one athlete; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AthletePatch {
    pub photo_address: Option<String>,
    pub profile_address: Option<String>,
}

impl AthletePatch {
    pub fn is_empty(&self) -> bool {
        self.photo_address.is_none() && self.profile_address.is_none()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        if error.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
            Self::Constraint(error.to_string())
        } else {
            Self::Backend(error.to_string())
        }
    }
}

/// Read/write contract of the canonical team/athlete store. Every write
/// touches exactly one row.
pub trait CanonicalStore {
    fn list_teams(&self) -> Result<Vec<Team>, StoreError>;
    fn get_team(&self, id: &str) -> Result<Option<Team>, StoreError>;
    fn list_athletes(&self, team_id: &str) -> Result<Vec<Athlete>, StoreError>;
    fn find_athletes_by_name(&self, team_id: &str, name: &str)
    -> Result<Vec<Athlete>, StoreError>;
    fn insert_athlete(
        &mut self,
        team_id: &str,
        name: &str,
        photo_address: Option<&str>,
        profile_address: Option<&str>,
    ) -> Result<i64, StoreError>;
    fn update_athlete(&mut self, id: i64, patch: &AthletePatch) -> Result<(), StoreError>;
    fn delete_athlete(&mut self, id: i64) -> Result<(), StoreError>;
    fn upsert_team(&mut self, team: &Team) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    connection: Connection,
    write_count: usize,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database parent directory {}",
                    parent.display()
                )
            })?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        connection
            .execute_batch(STORE_SCHEMA_SQL)
            .context("failed to initialize store schema")?;
        Ok(Self {
            connection,
            write_count: 0,
        })
    }

    /// Number of successful row writes issued through this handle.
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    fn query_athletes(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Athlete>, StoreError> {
        let mut statement = self.connection.prepare(sql)?;
        let rows = statement.query_map(params, athlete_from_row)?;
        let mut output = Vec::new();
        for row in rows {
            output.push(row?);
        }
        Ok(output)
    }
}

impl CanonicalStore for SqliteStore {
    fn list_teams(&self) -> Result<Vec<Team>, StoreError> {
        let mut statement = self.connection.prepare(
            "SELECT id, name, logo_address, roster_address FROM teams ORDER BY id ASC",
        )?;
        let rows = statement.query_map([], team_from_row)?;
        let mut output = Vec::new();
        for row in rows {
            output.push(row?);
        }
        Ok(output)
    }

    fn get_team(&self, id: &str) -> Result<Option<Team>, StoreError> {
        let team = self
            .connection
            .query_row(
                "SELECT id, name, logo_address, roster_address FROM teams WHERE id = ?1",
                [id],
                team_from_row,
            )
            .optional()?;
        Ok(team)
    }

    fn list_athletes(&self, team_id: &str) -> Result<Vec<Athlete>, StoreError> {
        self.query_athletes(
            "SELECT id, team_id, name, photo_address, profile_address
             FROM athletes
             WHERE team_id = ?1
             ORDER BY id ASC",
            [team_id],
        )
    }

    fn find_athletes_by_name(
        &self,
        team_id: &str,
        name: &str,
    ) -> Result<Vec<Athlete>, StoreError> {
        self.query_athletes(
            "SELECT id, team_id, name, photo_address, profile_address
             FROM athletes
             WHERE team_id = ?1 AND normalized_name = ?2
             ORDER BY id ASC",
            params![team_id, normalize_name(name)],
        )
    }

    fn insert_athlete(
        &mut self,
        team_id: &str,
        name: &str,
        photo_address: Option<&str>,
        profile_address: Option<&str>,
    ) -> Result<i64, StoreError> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Err(StoreError::Constraint(format!(
                "athlete name {name:?} normalizes to an empty string"
            )));
        }
        self.connection.execute(
            "INSERT INTO athletes (
                team_id,
                name,
                normalized_name,
                photo_address,
                profile_address,
                updated_at_unix
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                team_id,
                name.trim(),
                normalized,
                photo_address,
                profile_address,
                unix_timestamp()
            ],
        )?;
        self.write_count += 1;
        Ok(self.connection.last_insert_rowid())
    }

    fn update_athlete(&mut self, id: i64, patch: &AthletePatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let affected = self.connection.execute(
            "UPDATE athletes
             SET photo_address = COALESCE(?1, photo_address),
                 profile_address = COALESCE(?2, profile_address),
                 updated_at_unix = ?3
             WHERE id = ?4",
            params![
                patch.photo_address,
                patch.profile_address,
                unix_timestamp(),
                id
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "athlete",
                id: id.to_string(),
            });
        }
        self.write_count += 1;
        Ok(())
    }

    fn delete_athlete(&mut self, id: i64) -> Result<(), StoreError> {
        let affected = self
            .connection
            .execute("DELETE FROM athletes WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "athlete",
                id: id.to_string(),
            });
        }
        self.write_count += 1;
        Ok(())
    }

    fn upsert_team(&mut self, team: &Team) -> Result<(), StoreError> {
        if team.id.trim().is_empty() {
            return Err(StoreError::Constraint("team id must not be empty".to_string()));
        }
        self.connection.execute(
            "INSERT INTO teams (id, name, logo_address, roster_address)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 logo_address = excluded.logo_address,
                 roster_address = excluded.roster_address",
            params![team.id, team.name, team.logo_address, team.roster_address],
        )?;
        self.write_count += 1;
        Ok(())
    }
}

fn team_from_row(row: &Row<'_>) -> rusqlite::Result<Team> {
    Ok(Team {
        id: row.get(0)?,
        name: row.get(1)?,
        logo_address: row.get(2)?,
        roster_address: row.get(3)?,
    })
}

fn athlete_from_row(row: &Row<'_>) -> rusqlite::Result<Athlete> {
    Ok(Athlete {
        id: row.get(0)?,
        team_id: row.get(1)?,
        name: row.get(2)?,
        photo_address: row.get(3)?,
        profile_address: row.get(4)?,
    })
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{AthletePatch, CanonicalStore, SqliteStore, StoreError, Team};

    fn team(id: &str) -> Team {
        Team {
            id: id.to_string(),
            name: format!("Team {id}"),
            logo_address: format!("https://cdn.example.edu/logos/{id}.png"),
            roster_address: format!("https://{id}.example.edu/roster"),
        }
    }

    fn seeded() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().expect("store");
        store.upsert_team(&team("uw")).expect("team");
        store.upsert_team(&team("osu")).expect("team");
        store
    }

    #[test]
    fn insert_and_read_back_by_team_and_name() {
        let mut store = seeded();
        let id = store
            .insert_athlete(
                "uw",
                "John O'Brien",
                Some("https://cdn.example.edu/p.jpg"),
                Some("https://uw.example.edu/roster/john-o-brien/1"),
            )
            .expect("insert");

        let athletes = store.list_athletes("uw").expect("list");
        assert_eq!(athletes.len(), 1);
        assert_eq!(athletes[0].id, id);
        assert_eq!(athletes[0].name, "John O'Brien");

        let found = store.find_athletes_by_name("uw", "john obrien").expect("find");
        assert_eq!(found.len(), 1);
        assert!(store.find_athletes_by_name("osu", "John O'Brien").expect("find").is_empty());
    }

    #[test]
    fn normalized_name_is_unique_per_team() {
        let mut store = seeded();
        store.insert_athlete("uw", "John Smith", None, None).expect("insert");
        let error = store
            .insert_athlete("uw", "john  SMITH", None, None)
            .expect_err("duplicate must fail");
        assert!(matches!(error, StoreError::Constraint(_)));
        store
            .insert_athlete("osu", "John Smith", None, None)
            .expect("same name on another team is fine");
    }

    #[test]
    fn insert_requires_existing_team() {
        let mut store = seeded();
        let error = store
            .insert_athlete("missing", "Amy Lee", None, None)
            .expect_err("foreign key");
        assert!(matches!(error, StoreError::Constraint(_)));
    }

    #[test]
    fn update_patches_only_given_fields() {
        let mut store = seeded();
        let id = store
            .insert_athlete("uw", "Amy Lee", None, Some("https://uw.example.edu/roster/amy-lee/2"))
            .expect("insert");
        store
            .update_athlete(
                id,
                &AthletePatch {
                    photo_address: Some("https://cdn.example.edu/amy.jpg".to_string()),
                    profile_address: None,
                },
            )
            .expect("update");
        let athlete = store.list_athletes("uw").expect("list").remove(0);
        assert_eq!(athlete.photo_address.as_deref(), Some("https://cdn.example.edu/amy.jpg"));
        assert_eq!(
            athlete.profile_address.as_deref(),
            Some("https://uw.example.edu/roster/amy-lee/2")
        );

        let writes = store.write_count();
        store.update_athlete(id, &AthletePatch::default()).expect("noop");
        assert_eq!(store.write_count(), writes);

        let error = store
            .update_athlete(
                999,
                &AthletePatch {
                    photo_address: Some("x".to_string()),
                    profile_address: None,
                },
            )
            .expect_err("missing");
        assert!(matches!(error, StoreError::NotFound { .. }));
    }

    #[test]
    fn delete_removes_one_row() {
        let mut store = seeded();
        let id = store.insert_athlete("uw", "Amy Lee", None, None).expect("insert");
        store.insert_athlete("uw", "Bo Park", None, None).expect("insert");
        store.delete_athlete(id).expect("delete");
        assert_eq!(store.list_athletes("uw").expect("list").len(), 1);
        assert!(matches!(
            store.delete_athlete(id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn team_logo_must_not_be_empty() {
        let mut store = seeded();
        let mut bad = team("bad");
        bad.logo_address = "  ".to_string();
        assert!(matches!(store.upsert_team(&bad), Err(StoreError::Constraint(_))));
    }

    #[test]
    fn file_backed_store_persists_between_handles() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("nested").join("roster.db");
        {
            let mut store = SqliteStore::open(&db_path).expect("open");
            store.upsert_team(&team("uw")).expect("team");
        }
        let store = SqliteStore::open(&db_path).expect("reopen");
        let teams = store.list_teams().expect("teams");
        assert_eq!(teams.len(), 1);
        assert_eq!(store.get_team("uw").expect("get").map(|team| team.id), Some("uw".to_string()));
        assert!(store.get_team("nope").expect("get").is_none());
    }
}
