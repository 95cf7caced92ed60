//! SQLite implementation of `ProjectRepository`.
//!
//! Projects are stored as one JSON document per row; targeted updates are
//! applied to the decoded document inside a transaction, so concurrent
//! writers never lose each other's changes.
//!
//! # Schema Versioning
//!
//! The `schema_version` table tracks the schema version. When the schema
//! needs to change, increment `CURRENT_SCHEMA_VERSION` and add a migration in
//! `run_migrations()`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::warn;

use waypoint_core::{CommitSha, CommitVerdict, Project, ProjectId};

use super::{apply_all, AnalysisRecord, ProjectRepository, ProjectUpdate, RepositoryError};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite
/// operations without blocking the async runtime.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (creating if needed) the database at `path` and run pending
    /// migrations.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and `busy_timeout = 5000ms`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // Project documents hold repository metadata; keep them private.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // In-memory databases report "memory" as their journal mode.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    project_json TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS commit_analyses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    milestone_title TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    verdict_json TEXT NOT NULL,
                    applied INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_commit_analyses_project
                    ON commit_analyses(project_id, id);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }
}

fn decode_project(json: &str) -> Result<Project, RepositoryError> {
    serde_json::from_str(json).map_err(|_| RepositoryError::corruption("project JSON"))
}

fn encode_project(project: &Project) -> Result<String, RepositoryError> {
    serde_json::to_string(project)
        .map_err(|e| RepositoryError::storage("serialize project", e.to_string()))
}

/// Read, update and write back one project inside `tx`.
fn apply_in_tx(
    tx: &Transaction<'_>,
    id: &ProjectId,
    updates: &[ProjectUpdate],
) -> Result<Project, RepositoryError> {
    let json: Option<String> = tx
        .query_row(
            "SELECT project_json FROM projects WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| RepositoryError::storage("update", e.to_string()))?;

    let current = match json {
        Some(json) => decode_project(&json)?,
        None => return Err(RepositoryError::ProjectNotFound(id.clone())),
    };
    let next = apply_all(&current, updates)?;

    tx.execute(
        "UPDATE projects SET project_json = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), encode_project(&next)?, Utc::now().to_rfc3339()],
    )
    .map_err(|e| RepositoryError::storage("update", e.to_string()))?;

    Ok(next)
}

#[async_trait]
impl ProjectRepository for SqliteRepository {
    async fn get(&self, id: &ProjectId) -> Result<Option<Project>, RepositoryError> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let json: Option<String> = conn
                .query_row(
                    "SELECT project_json FROM projects WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get", e.to_string()))?;

            json.as_deref().map(decode_project).transpose()
        })
        .await
        .map_err(|e| RepositoryError::storage("get", e.to_string()))?
    }

    async fn put(&self, project: Project) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let id = project.id.to_string();
        let json = encode_project(&project)?;
        let now = Utc::now().to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            conn.execute(
                "INSERT INTO projects (id, project_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     project_json = excluded.project_json,
                     updated_at = excluded.updated_at",
                params![id, json, now],
            )
            .map_err(|e| RepositoryError::storage("put", e.to_string()))?;

            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("put", e.to_string()))?
    }

    async fn update(
        &self,
        id: &ProjectId,
        updates: Vec<ProjectUpdate>,
    ) -> Result<Project, RepositoryError> {
        let conn = self.conn.clone();
        let id = id.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction()
                .map_err(|e| RepositoryError::storage("begin update", e.to_string()))?;

            let next = apply_in_tx(&tx, &id, &updates)?;

            tx.commit()
                .map_err(|e| RepositoryError::storage("commit update", e.to_string()))?;

            Ok(next)
        })
        .await
        .map_err(|e| RepositoryError::storage("update", e.to_string()))?
    }

    async fn record_analysis(
        &self,
        record: AnalysisRecord,
        updates: Vec<ProjectUpdate>,
    ) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let verdict_json = serde_json::to_string(&record.verdict)
            .map_err(|e| RepositoryError::storage("serialize verdict", e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction()
                .map_err(|e| RepositoryError::storage("begin record analysis", e.to_string()))?;

            if !updates.is_empty() {
                apply_in_tx(&tx, &record.project_id, &updates)?;
            }

            tx.execute(
                "INSERT INTO commit_analyses
                     (project_id, milestone_title, commit_sha, verdict_json, applied, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.project_id.as_str(),
                    record.milestone_title,
                    record.commit_sha.as_str(),
                    verdict_json,
                    record.applied,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RepositoryError::storage("record analysis", e.to_string()))?;

            tx.commit()
                .map_err(|e| RepositoryError::storage("commit record analysis", e.to_string()))?;

            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("record analysis", e.to_string()))?
    }

    async fn analyses(&self, id: &ProjectId) -> Result<Vec<AnalysisRecord>, RepositoryError> {
        let conn = self.conn.clone();
        let id = id.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let mut stmt = conn
                .prepare(
                    "SELECT milestone_title, commit_sha, verdict_json, applied, created_at
                     FROM commit_analyses WHERE project_id = ?1 ORDER BY id ASC",
                )
                .map_err(|e| RepositoryError::storage("analyses", e.to_string()))?;

            let rows = stmt
                .query_map(params![id.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|e| RepositoryError::storage("analyses", e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                let (milestone_title, sha, verdict_json, applied, created_at) =
                    row.map_err(|e| RepositoryError::storage("analyses", e.to_string()))?;

                let verdict: CommitVerdict = serde_json::from_str(&verdict_json)
                    .map_err(|_| RepositoryError::corruption("verdict JSON"))?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|_| RepositoryError::corruption("analysis timestamp"))?
                    .with_timezone(&Utc);

                records.push(AnalysisRecord {
                    project_id: id.clone(),
                    milestone_title,
                    commit_sha: CommitSha::from(sha),
                    verdict,
                    applied,
                    created_at,
                });
            }

            Ok(records)
        })
        .await
        .map_err(|e| RepositoryError::storage("analyses", e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use proptest::prelude::*;
    use waypoint_core::Milestone;

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.put(project()).await.unwrap();
        assert_eq!(repo.get(&project_id()).await.unwrap(), Some(project()));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        assert_eq!(repo.get(&project_id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_applies_targeted_changes() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.put(project()).await.unwrap();

        let mut milestone = project().milestones[1].clone();
        milestone.detected = true;

        let updated = repo
            .update(
                &project_id(),
                vec![
                    ProjectUpdate::Milestone { index: 1, milestone },
                    ProjectUpdate::ProjectContext(Some("ctx".to_string())),
                ],
            )
            .await
            .unwrap();

        assert!(updated.milestones[1].detected);
        assert!(!updated.milestones[0].detected);
        assert_eq!(repo.get(&project_id()).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_failed_update_rolls_back() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.put(project()).await.unwrap();

        let err = repo
            .update(
                &project_id(),
                vec![
                    ProjectUpdate::Connection(None),
                    ProjectUpdate::Milestone {
                        index: 5,
                        milestone: Milestone::new("x", "y"),
                    },
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::MilestoneNotFound { .. }));
        assert_eq!(repo.get(&project_id()).await.unwrap(), Some(project()));
    }

    #[tokio::test]
    async fn test_update_missing_project() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let err = repo
            .update(&project_id(), vec![ProjectUpdate::ProjectContext(None)])
            .await
            .unwrap_err();
        assert_eq!(err, RepositoryError::ProjectNotFound(project_id()));
    }

    #[tokio::test]
    async fn test_analyses_are_append_only_in_order() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.record_analysis(record("aaaaaaa", false), vec![]).await.unwrap();
        repo.record_analysis(record("bbbbbbb", true), vec![]).await.unwrap();

        let records = repo.analyses(&project_id()).await.unwrap();
        let shas: Vec<&str> = records.iter().map(|r| r.commit_sha.as_str()).collect();
        assert_eq!(shas, vec!["aaaaaaa", "bbbbbbb"]);
        assert!(records[1].applied);
        assert_eq!(records[0].verdict.goals_achieved.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_audit_insert_rolls_back_milestone() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.put(project()).await.unwrap();
        {
            let conn = repo.conn.lock().unwrap();
            conn.execute("DROP TABLE commit_analyses", []).unwrap();
        }

        let mut milestone = project().milestones[0].clone();
        milestone.completed = true;
        let err = repo
            .record_analysis(
                record("abc1234", true),
                vec![ProjectUpdate::Milestone { index: 0, milestone }],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Storage { .. }));
        assert_eq!(repo.get(&project_id()).await.unwrap(), Some(project()));
    }

    #[tokio::test]
    async fn test_record_with_updates_commits_both() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.put(project()).await.unwrap();

        let mut milestone = project().milestones[0].clone();
        milestone.completed = true;
        repo.record_analysis(
            record("abc1234", true),
            vec![ProjectUpdate::Milestone { index: 0, milestone }],
        )
        .await
        .unwrap();

        let stored = repo.get(&project_id()).await.unwrap().unwrap();
        assert!(stored.milestones[0].completed);
        assert_eq!(repo.analyses(&project_id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        {
            let conn = repo.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO projects (id, project_json, updated_at) VALUES (?1, 'not json', 'now')",
                params![PROJECT_ID],
            )
            .unwrap();
        }
        let err = repo.get(&project_id()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Corruption { .. }));
    }

    #[test]
    fn test_reopen_file_database_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("waypoint.db");
        let rt = tokio::runtime::Runtime::new().unwrap();

        {
            let repo = SqliteRepository::new(&path).unwrap();
            rt.block_on(repo.put(project())).unwrap();
        }

        let repo = SqliteRepository::new(&path).unwrap();
        let stored = rt.block_on(repo.get(&project_id())).unwrap();
        assert_eq!(stored, Some(project()));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.db");
        drop(SqliteRepository::new(&path).unwrap());

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("UPDATE schema_version SET version = 99 WHERE id = 1", [])
                .unwrap();
        }

        assert!(SqliteRepository::new(&path).is_err());
    }

    proptest! {
        /// Any sequence of goal toggles written through `update` reads back
        /// exactly as applied in memory.
        #[test]
        fn updates_persist_like_in_memory(toggles in proptest::collection::vec((0usize..2, any::<bool>()), 0..12)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let repo = SqliteRepository::new_in_memory().unwrap();
                let mut expected = project();
                repo.put(expected.clone()).await.unwrap();

                for (goal_index, completed) in toggles {
                    let mut milestone = expected.milestones[0].clone();
                    let goal = milestone.goals[goal_index].clone();
                    if completed {
                        milestone.completed_goals.insert(goal);
                    } else {
                        milestone.completed_goals.remove(&goal);
                    }
                    expected.milestones[0] = milestone.clone();
                    repo.update(&project_id(), vec![ProjectUpdate::Milestone { index: 0, milestone }])
                        .await
                        .unwrap();
                }

                prop_assert_eq!(repo.get(&project_id()).await.unwrap(), Some(expected));
                Ok(())
            })?;
        }
    }
}
