use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Async-safe handle to the storyteller database.
///
/// Wraps `StorytellerDb` behind `Arc<Mutex>` and runs all access on
/// tokio's blocking thread pool via `spawn_blocking`, preventing
/// synchronous SQLite I/O from tying up async worker threads. Background
/// jobs and request handlers each call through their own clone; SQLite
/// sessions are never shared across the queue boundary in any other way.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StorytellerDb>>,
}

impl DbHandle {
    pub fn new(db: StorytellerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StorytellerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct StorytellerDb {
    conn: Connection,
}

impl StorytellerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    hashed_password TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    url TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    owner_id INTEGER NOT NULL REFERENCES users(id),
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    summary TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT
                );

                CREATE TABLE IF NOT EXISTS analysis_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    summary TEXT,
                    narrative TEXT,
                    file_count INTEGER NOT NULL DEFAULT 0,
                    commit_count INTEGER NOT NULL DEFAULT 0,
                    languages TEXT NOT NULL DEFAULT '{}',
                    open_issues_count INTEGER NOT NULL DEFAULT 0,
                    open_pull_requests_count INTEGER NOT NULL DEFAULT 0,
                    contributors TEXT NOT NULL DEFAULT '[]',
                    tech_stack TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_repositories_owner ON repositories(owner_id);
                CREATE INDEX IF NOT EXISTS idx_repositories_url ON repositories(url);
                CREATE INDEX IF NOT EXISTS idx_analysis_results_repo ON analysis_results(repository_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── User CRUD ─────────────────────────────────────────────────────

    pub fn create_user(&self, username: &str, hashed_password: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (username, hashed_password) VALUES (?1, ?2)",
                params![username, hashed_password],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, username, hashed_password FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        hashed_password: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query user by username")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, username, hashed_password FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        hashed_password: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query user")
    }

    // ── Repository CRUD ───────────────────────────────────────────────

    const REPO_COLUMNS: &'static str =
        "id, url, name, owner_id, status, summary, created_at, updated_at";

    fn map_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
        let status: String = row.get(4)?;
        Ok(Repository {
            id: row.get(0)?,
            url: row.get(1)?,
            name: row.get(2)?,
            owner_id: row.get(3)?,
            status: AnalysisStatus::from_str(&status).unwrap_or(AnalysisStatus::Pending),
            summary: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    pub fn create_repository(&self, url: &str, name: &str, owner_id: i64) -> Result<Repository> {
        self.conn
            .execute(
                "INSERT INTO repositories (url, name, owner_id, status) VALUES (?1, ?2, ?3, 'PENDING')",
                params![url, name, owner_id],
            )
            .context("Failed to insert repository")?;
        let id = self.conn.last_insert_rowid();
        self.get_repository(id)?
            .context("Repository not found after insert")
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM repositories WHERE id = ?1",
                    Self::REPO_COLUMNS
                ),
                params![id],
                Self::map_repository,
            )
            .optional()
            .context("Failed to query repository")
    }

    pub fn get_repository_by_url(&self, url: &str) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM repositories WHERE url = ?1",
                    Self::REPO_COLUMNS
                ),
                params![url],
                Self::map_repository,
            )
            .optional()
            .context("Failed to query repository by url")
    }

    pub fn list_repositories_by_owner(
        &self,
        owner_id: i64,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Repository>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM repositories WHERE owner_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                Self::REPO_COLUMNS
            ))
            .context("Failed to prepare list_repositories_by_owner")?;
        let rows = stmt
            .query_map(params![owner_id, limit, skip], Self::map_repository)
            .context("Failed to query repositories")?;
        let mut repositories = Vec::new();
        for row in rows {
            repositories.push(row.context("Failed to read repository row")?);
        }
        Ok(repositories)
    }

    pub fn update_repository_status(
        &self,
        id: i64,
        status: AnalysisStatus,
    ) -> Result<Option<Repository>> {
        self.conn
            .execute(
                "UPDATE repositories SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update repository status")?;
        self.get_repository(id)
    }

    /// Mark a repository `FAILED` and record the failure description.
    pub fn set_repository_failure(&self, id: i64, summary: &str) -> Result<Option<Repository>> {
        self.conn
            .execute(
                "UPDATE repositories SET status = 'FAILED', summary = ?1 WHERE id = ?2",
                params![summary, id],
            )
            .context("Failed to record repository failure")?;
        self.get_repository(id)
    }

    /// Refresh the modification timestamp. Runs whatever the analysis
    /// outcome was.
    pub fn touch_repository(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE repositories SET updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to touch repository")?;
        Ok(())
    }

    // ── Analysis results ──────────────────────────────────────────────

    const ANALYSIS_COLUMNS: &'static str = "id, repository_id, summary, narrative, file_count, \
         commit_count, languages, open_issues_count, open_pull_requests_count, contributors, \
         tech_stack, status, created_at";

    fn map_analysis_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisResult> {
        let languages: String = row.get(6)?;
        let contributors: String = row.get(9)?;
        let tech_stack: String = row.get(10)?;
        let status: String = row.get(11)?;
        Ok(AnalysisResult {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            summary: row.get(2)?,
            narrative: row.get(3)?,
            file_count: row.get(4)?,
            commit_count: row.get(5)?,
            languages: serde_json::from_str(&languages).unwrap_or_default(),
            open_issues_count: row.get(7)?,
            open_pull_requests_count: row.get(8)?,
            contributors: serde_json::from_str(&contributors).unwrap_or_default(),
            tech_stack: serde_json::from_str(&tech_stack).unwrap_or_default(),
            status: AnalysisStatus::from_str(&status).unwrap_or(AnalysisStatus::Pending),
            created_at: row.get(12)?,
        })
    }

    pub fn create_analysis_result(&self, new: NewAnalysisResult) -> Result<AnalysisResult> {
        let languages = serde_json::to_string(&new.languages)?;
        let contributors = serde_json::to_string(&new.contributors)?;
        let tech_stack = serde_json::to_string(&new.tech_stack)?;
        self.conn
            .execute(
                "INSERT INTO analysis_results (repository_id, summary, narrative, file_count, \
                 commit_count, languages, open_issues_count, open_pull_requests_count, \
                 contributors, tech_stack, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.repository_id,
                    new.summary,
                    new.narrative,
                    new.file_count,
                    new.commit_count,
                    languages,
                    new.open_issues_count,
                    new.open_pull_requests_count,
                    contributors,
                    tech_stack,
                    new.status.as_str(),
                ],
            )
            .context("Failed to insert analysis result")?;
        let id = self.conn.last_insert_rowid();
        self.get_analysis_result(id)?
            .context("Analysis result not found after insert")
    }

    pub fn get_analysis_result(&self, id: i64) -> Result<Option<AnalysisResult>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM analysis_results WHERE id = ?1",
                    Self::ANALYSIS_COLUMNS
                ),
                params![id],
                Self::map_analysis_result,
            )
            .optional()
            .context("Failed to query analysis result")
    }

    /// Most recently created analysis result for a repository, if any.
    pub fn latest_analysis_result(&self, repository_id: i64) -> Result<Option<AnalysisResult>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM analysis_results WHERE repository_id = ?1 \
                     ORDER BY id DESC LIMIT 1",
                    Self::ANALYSIS_COLUMNS
                ),
                params![repository_id],
                Self::map_analysis_result,
            )
            .optional()
            .context("Failed to query latest analysis result")
    }

    pub fn analysis_results_for_repository(
        &self,
        repository_id: i64,
    ) -> Result<Vec<AnalysisResult>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM analysis_results WHERE repository_id = ?1 ORDER BY id",
                Self::ANALYSIS_COLUMNS
            ))
            .context("Failed to prepare analysis_results_for_repository")?;
        let rows = stmt
            .query_map(params![repository_id], Self::map_analysis_result)
            .context("Failed to query analysis results")?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.context("Failed to read analysis result row")?);
        }
        Ok(results)
    }

    /// Attach generated narrative text to an existing analysis result.
    pub fn update_analysis_narratives(
        &self,
        id: i64,
        summary: &str,
        narrative: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE analysis_results SET summary = ?1, narrative = ?2 WHERE id = ?3",
                params![summary, narrative, id],
            )
            .context("Failed to update analysis narratives")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_db() -> StorytellerDb {
        StorytellerDb::new_in_memory().unwrap()
    }

    fn seed_user(db: &StorytellerDb) -> User {
        db.create_user("testuser", "salt$hash").unwrap()
    }

    fn sample_analysis(repository_id: i64) -> NewAnalysisResult {
        NewAnalysisResult {
            repository_id,
            summary: "Generating summary...".to_string(),
            narrative: "Generating narrative...".to_string(),
            file_count: 10,
            commit_count: 50,
            languages: BTreeMap::from([("Python".to_string(), 100)]),
            open_issues_count: 5,
            open_pull_requests_count: 2,
            contributors: vec!["octocat".to_string()],
            tech_stack: vec!["Python".to_string()],
            status: AnalysisStatus::InProgress,
        }
    }

    #[test]
    fn test_create_and_get_user() {
        let db = test_db();
        let user = seed_user(&db);
        assert_eq!(user.username, "testuser");

        let found = db.get_user_by_username("testuser").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.hashed_password, "salt$hash");
        assert!(db.get_user_by_username("nobody").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let db = test_db();
        seed_user(&db);
        assert!(db.create_user("testuser", "other").is_err());
    }

    #[test]
    fn test_create_repository_starts_pending() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository(
                "https://github.com/octocat/Spoon-Knife",
                "octocat/Spoon-Knife",
                user.id,
            )
            .unwrap();
        assert_eq!(repo.status, AnalysisStatus::Pending);
        assert_eq!(repo.name, "octocat/Spoon-Knife");
        assert!(repo.summary.is_none());
        assert!(repo.updated_at.is_none());
    }

    #[test]
    fn test_get_repository_by_url() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        let found = db
            .get_repository_by_url("https://github.com/a/b")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, repo.id);
        assert!(
            db.get_repository_by_url("https://github.com/a/c")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_duplicate_url_rejected() {
        let db = test_db();
        let user = seed_user(&db);
        db.create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        assert!(
            db.create_repository("https://github.com/a/b", "a/b", user.id)
                .is_err()
        );
    }

    #[test]
    fn test_list_repositories_by_owner_with_pagination() {
        let db = test_db();
        let user = seed_user(&db);
        let other = db.create_user("other", "x").unwrap();
        for i in 0..5 {
            db.create_repository(&format!("https://github.com/u/r{}", i), "u/r", user.id)
                .unwrap();
        }
        db.create_repository("https://github.com/o/r", "o/r", other.id)
            .unwrap();

        let all = db.list_repositories_by_owner(user.id, 0, 100).unwrap();
        assert_eq!(all.len(), 5);

        let page = db.list_repositories_by_owner(user.id, 2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].url, "https://github.com/u/r2");
    }

    #[test]
    fn test_update_repository_status() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        let updated = db
            .update_repository_status(repo.id, AnalysisStatus::InProgress)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, AnalysisStatus::InProgress);
    }

    #[test]
    fn test_update_status_unknown_repository_is_none() {
        let db = test_db();
        assert!(
            db.update_repository_status(999, AnalysisStatus::Completed)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_set_repository_failure() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        let failed = db
            .set_repository_failure(repo.id, "An unexpected error occurred during analysis: boom")
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, AnalysisStatus::Failed);
        assert!(failed.summary.unwrap().contains("boom"));
    }

    #[test]
    fn test_touch_repository_sets_updated_at() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        assert!(repo.updated_at.is_none());
        db.touch_repository(repo.id).unwrap();
        let touched = db.get_repository(repo.id).unwrap().unwrap();
        assert!(touched.updated_at.is_some());
    }

    #[test]
    fn test_create_and_read_analysis_result() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        let result = db.create_analysis_result(sample_analysis(repo.id)).unwrap();
        assert_eq!(result.file_count, 10);
        assert_eq!(result.commit_count, 50);
        assert_eq!(result.languages.get("Python"), Some(&100));
        assert_eq!(result.contributors, vec!["octocat"]);
        assert_eq!(result.status, AnalysisStatus::InProgress);

        let listed = db.analysis_results_for_repository(repo.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, result.id);
    }

    #[test]
    fn test_latest_analysis_result_orders_by_id() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        let first = db.create_analysis_result(sample_analysis(repo.id)).unwrap();
        let second = db.create_analysis_result(sample_analysis(repo.id)).unwrap();
        assert!(second.id > first.id);

        let latest = db.latest_analysis_result(repo.id).unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[test]
    fn test_latest_analysis_result_none_for_unknown_repo() {
        let db = test_db();
        assert!(db.latest_analysis_result(42).unwrap().is_none());
    }

    #[test]
    fn test_update_analysis_narratives() {
        let db = test_db();
        let user = seed_user(&db);
        let repo = db
            .create_repository("https://github.com/a/b", "a/b", user.id)
            .unwrap();
        let result = db.create_analysis_result(sample_analysis(repo.id)).unwrap();
        db.update_analysis_narratives(result.id, "Short summary", "Long narrative")
            .unwrap();
        let updated = db.get_analysis_result(result.id).unwrap().unwrap();
        assert_eq!(updated.summary.as_deref(), Some("Short summary"));
        assert_eq!(updated.narrative.as_deref(), Some("Long narrative"));
        // Metric fields are untouched by the narrative update
        assert_eq!(updated.file_count, 10);
    }

    #[test]
    fn test_open_on_disk_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyteller.db");
        {
            let db = StorytellerDb::new(&path).unwrap();
            db.create_user("disk-user", "hash").unwrap();
        }
        let db = StorytellerDb::new(&path).unwrap();
        let user = db.get_user_by_username("disk-user").unwrap().unwrap();
        assert_eq!(user.username, "disk-user");
    }

    #[tokio::test]
    async fn test_db_handle_call() {
        let handle = DbHandle::new(StorytellerDb::new_in_memory().unwrap());
        let user = handle
            .call(|db| db.create_user("async-user", "hash"))
            .await
            .unwrap();
        let found = handle
            .call(move |db| db.get_user(user.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.username, "async-user");
    }
}
