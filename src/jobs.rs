//! Background jobs driving the analysis lifecycle.
//!
//! Two chained jobs run on an in-process queue:
//!
//! - **analyze** moves a repository PENDING → IN_PROGRESS → COMPLETED or
//!   FAILED, persisting and broadcasting each transition, and enqueues
//!   **narrate** with the extracted payload once metrics are stored.
//! - **narrate** attaches generated narrative text to the analysis row it
//!   finds for the repository; it never touches the coarse status.
//!
//! Jobs are fire-and-forget: the worker logs failures and keeps draining;
//! nothing propagates back to the request that triggered the job. Within
//! one attempt the IN_PROGRESS broadcast always precedes the terminal one
//! because the job body is sequential.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::analyzer::Analyzer;
use crate::connections::ConnectionRegistry;
use crate::db::DbHandle;
use crate::models::{AnalysisStatus, NewAnalysisResult, Repository, RepositoryAnalysis};
use crate::narrative::Narrator;
use crate::ws::broadcast_status;

/// A unit of background work. Payloads stay JSON-serializable; the
/// narrate payload crosses the queue boundary as data, not references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Job {
    Analyze {
        repository_id: i64,
    },
    Narrate {
        repository_id: i64,
        analysis: RepositoryAnalysis,
    },
}

/// Everything a job needs: its own DB handle, the live connection
/// registry for broadcasts, and the two collaborators.
pub struct JobContext {
    pub db: DbHandle,
    pub registry: Arc<ConnectionRegistry>,
    pub analyzer: Arc<dyn Analyzer>,
    pub narrator: Arc<dyn Narrator>,
}

/// Handle for enqueueing jobs onto the worker.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Spawn the worker task and return the enqueue handle.
    pub fn start(ctx: Arc<JobContext>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let queue = Self { tx };
        let worker_queue = queue.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(&ctx, &worker_queue, job).await;
            }
        });
        queue
    }

    pub fn enqueue(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!("job queue worker is gone; dropping job");
        }
    }
}

/// Dispatch one job. Failures end here: logged, never rethrown.
pub async fn run_job(ctx: &JobContext, queue: &JobQueue, job: Job) {
    match job {
        Job::Analyze { repository_id } => {
            if let Err(e) = analyze_repository(ctx, queue, repository_id).await {
                error!("analyze job for repository {} failed: {:#}", repository_id, e);
            }
        }
        Job::Narrate {
            repository_id,
            analysis,
        } => {
            if let Err(e) = generate_narratives(ctx, repository_id, &analysis).await {
                error!("narrate job for repository {} failed: {:#}", repository_id, e);
            }
        }
    }
}

/// Job A: run the analysis pipeline for a repository.
///
/// An analysis error becomes a FAILED status with the error message stored
/// on the repository; only persistence errors while recording that outcome
/// surface to the worker. The modification timestamp is refreshed whatever
/// happens.
pub async fn analyze_repository(
    ctx: &JobContext,
    queue: &JobQueue,
    repository_id: i64,
) -> Result<()> {
    let repo = ctx
        .db
        .call(move |db| db.get_repository(repository_id))
        .await?;
    let Some(repo) = repo else {
        warn!("Repository with ID {} not found.", repository_id);
        return Ok(());
    };
    if repo.status == AnalysisStatus::InProgress {
        warn!(
            "Repository {} is already being analyzed; skipping duplicate job.",
            repository_id
        );
        return Ok(());
    }

    let outcome = run_analysis(ctx, queue, &repo).await;
    if let Err(e) = outcome {
        let message = format!("An unexpected error occurred during analysis: {:#}", e);
        error!("Error analyzing {}: {:#}", repo.url, e);
        ctx.db
            .call({
                let message = message.clone();
                move |db| db.set_repository_failure(repository_id, &message)
            })
            .await?;
        broadcast_status(&ctx.registry, repository_id, AnalysisStatus::Failed);
    }

    ctx.db
        .call(move |db| db.touch_repository(repository_id))
        .await?;
    Ok(())
}

/// The fallible middle of Job A; any error here collapses to FAILED.
async fn run_analysis(ctx: &JobContext, queue: &JobQueue, repo: &Repository) -> Result<()> {
    let repository_id = repo.id;
    ctx.db
        .call(move |db| db.update_repository_status(repository_id, AnalysisStatus::InProgress))
        .await?;
    broadcast_status(&ctx.registry, repository_id, AnalysisStatus::InProgress);

    let analysis = ctx.analyzer.analyze(&repo.url).await?;

    // Metrics are stored immediately with placeholder text; the narrate
    // job fills in the real narrative and summary afterwards.
    let new_result = NewAnalysisResult {
        repository_id,
        summary: "Generating summary...".to_string(),
        narrative: "Generating narrative...".to_string(),
        file_count: analysis.file_count,
        commit_count: analysis.commit_count,
        languages: analysis.languages.clone(),
        open_issues_count: analysis.open_issues_count,
        open_pull_requests_count: analysis.open_pull_requests_count,
        contributors: analysis.contributors.clone(),
        tech_stack: analysis.tech_stack.clone(),
        status: AnalysisStatus::InProgress,
    };
    ctx.db
        .call(move |db| db.create_analysis_result(new_result))
        .await?;
    queue.enqueue(Job::Narrate {
        repository_id,
        analysis,
    });

    ctx.db
        .call(move |db| db.update_repository_status(repository_id, AnalysisStatus::Completed))
        .await?;
    info!(
        "Repository {} analysis status set to COMPLETED.",
        repo.name
    );
    broadcast_status(&ctx.registry, repository_id, AnalysisStatus::Completed);
    Ok(())
}

/// Job B: generate and store narrative text for the latest analysis row.
///
/// With no analysis row present this is a logged no-op. The narrator
/// itself degrades to placeholder strings on generation errors, so the
/// only failures left are persistence ones.
pub async fn generate_narratives(
    ctx: &JobContext,
    repository_id: i64,
    analysis: &RepositoryAnalysis,
) -> Result<()> {
    let row = ctx
        .db
        .call(move |db| db.latest_analysis_result(repository_id))
        .await?;
    let Some(row) = row else {
        warn!(
            "AnalysisResult not found for repository ID {}. Cannot update narratives.",
            repository_id
        );
        return Ok(());
    };

    let narrative = ctx.narrator.generate_narrative(analysis).await;
    let summary = ctx.narrator.generate_recruiter_summary(analysis).await;

    let row_id = row.id;
    ctx.db
        .call(move |db| db.update_analysis_narratives(row_id, &summary, &narrative))
        .await?;
    info!(
        "Narratives generated and updated for repository ID {}.",
        repository_id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StorytellerDb;
    use crate::models::{CommitInfo, TreeEntry};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc as tokio_mpsc;

    struct StubAnalyzer {
        result: Result<RepositoryAnalysis, String>,
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn analyze(&self, _repository_url: &str) -> Result<RepositoryAnalysis> {
            match &self.result {
                Ok(analysis) => Ok(analysis.clone()),
                Err(message) => Err(anyhow!("{}", message)),
            }
        }
    }

    struct StubNarrator;

    #[async_trait]
    impl Narrator for StubNarrator {
        async fn generate_narrative(&self, analysis: &RepositoryAnalysis) -> String {
            format!("Narrative for {}", analysis.repo_name)
        }

        async fn generate_recruiter_summary(&self, analysis: &RepositoryAnalysis) -> String {
            format!("Summary for {}", analysis.repo_name)
        }
    }

    fn sample_analysis() -> RepositoryAnalysis {
        RepositoryAnalysis {
            name: Some("Spoon-Knife".to_string()),
            description: None,
            main_language: Some("Python".to_string()),
            owner: "octocat".to_string(),
            repo_name: "Spoon-Knife".to_string(),
            languages: BTreeMap::from([("Python".to_string(), 100)]),
            file_count: 10,
            commit_count: 50,
            open_issues_count: 5,
            open_pull_requests_count: 2,
            contributors: vec![],
            file_structure: vec![TreeEntry {
                path: "index.html".to_string(),
                kind: "blob".to_string(),
                size: Some(42),
            }],
            commit_history: vec![CommitInfo {
                sha: "abc".to_string(),
                message: "Initial commit".to_string(),
                author_name: "Octo Cat".to_string(),
                date: "2024-01-01T00:00:00Z".to_string(),
            }],
            tech_stack: vec!["Python".to_string()],
        }
    }

    fn context_with(analyzer: StubAnalyzer) -> (Arc<JobContext>, JobQueue) {
        let db = DbHandle::new(StorytellerDb::new_in_memory().unwrap());
        let ctx = Arc::new(JobContext {
            db,
            registry: Arc::new(ConnectionRegistry::new(100, 5)),
            analyzer: Arc::new(analyzer),
            narrator: Arc::new(StubNarrator),
        });
        let queue = JobQueue::start(Arc::clone(&ctx));
        (ctx, queue)
    }

    async fn seed_repository(ctx: &JobContext) -> Repository {
        ctx.db
            .call(|db| {
                let user = db.create_user("owner", "hash")?;
                db.create_repository(
                    "https://github.com/octocat/Spoon-Knife",
                    "octocat/Spoon-Knife",
                    user.id,
                )
            })
            .await
            .unwrap()
    }

    fn watch_broadcasts(
        ctx: &JobContext,
    ) -> tokio_mpsc::UnboundedReceiver<String> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        ctx.registry.connect("1", tx).unwrap();
        rx
    }

    #[tokio::test]
    async fn test_successful_analysis_reaches_completed() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Ok(sample_analysis()),
        });
        let repo = seed_repository(&ctx).await;
        let mut broadcasts = watch_broadcasts(&ctx);

        analyze_repository(&ctx, &queue, repo.id).await.unwrap();

        let updated = ctx
            .db
            .call(move |db| db.get_repository(repo.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, AnalysisStatus::Completed);
        assert!(updated.updated_at.is_some());

        // IN_PROGRESS strictly precedes the terminal broadcast
        let first = broadcasts.try_recv().unwrap();
        let second = broadcasts.try_recv().unwrap();
        assert!(first.contains("\"IN_PROGRESS\""));
        assert!(second.contains("\"COMPLETED\""));
        assert!(broadcasts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_successful_analysis_creates_one_result_row() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Ok(sample_analysis()),
        });
        let repo = seed_repository(&ctx).await;

        analyze_repository(&ctx, &queue, repo.id).await.unwrap();

        let results = ctx
            .db
            .call(move |db| db.analysis_results_for_repository(repo.id))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_count, 10);
        assert_eq!(results[0].commit_count, 50);
        assert_eq!(results[0].languages.get("Python"), Some(&100));
        assert_eq!(results[0].tech_stack, vec!["Python"]);
    }

    #[tokio::test]
    async fn test_failed_analysis_records_failure() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Err("GitHub API rate limit exceeded".to_string()),
        });
        let repo = seed_repository(&ctx).await;
        let mut broadcasts = watch_broadcasts(&ctx);

        analyze_repository(&ctx, &queue, repo.id).await.unwrap();

        let updated = ctx
            .db
            .call(move |db| db.get_repository(repo.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, AnalysisStatus::Failed);
        let summary = updated.summary.unwrap();
        assert!(summary.contains("An unexpected error occurred during analysis"));
        assert!(summary.contains("GitHub API rate limit exceeded"));
        assert!(updated.updated_at.is_some());

        let first = broadcasts.try_recv().unwrap();
        let second = broadcasts.try_recv().unwrap();
        assert!(first.contains("\"IN_PROGRESS\""));
        assert!(second.contains("\"FAILED\""));
    }

    #[tokio::test]
    async fn test_failed_analysis_leaves_no_result_row() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Err("boom".to_string()),
        });
        let repo = seed_repository(&ctx).await;

        analyze_repository(&ctx, &queue, repo.id).await.unwrap();

        let results = ctx
            .db
            .call(move |db| db.analysis_results_for_repository(repo.id))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_missing_repository_is_silent_noop() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Ok(sample_analysis()),
        });
        let mut broadcasts = watch_broadcasts(&ctx);

        analyze_repository(&ctx, &queue, 999).await.unwrap();
        assert!(broadcasts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_in_progress_repository_is_skipped() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Ok(sample_analysis()),
        });
        let repo = seed_repository(&ctx).await;
        ctx.db
            .call(move |db| db.update_repository_status(repo.id, AnalysisStatus::InProgress))
            .await
            .unwrap();
        let mut broadcasts = watch_broadcasts(&ctx);

        analyze_repository(&ctx, &queue, repo.id).await.unwrap();

        // No broadcasts, no result rows; the running attempt owns the record
        assert!(broadcasts.try_recv().is_err());
        let results = ctx
            .db
            .call(move |db| db.analysis_results_for_repository(repo.id))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_narrate_updates_latest_result() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Ok(sample_analysis()),
        });
        let repo = seed_repository(&ctx).await;
        analyze_repository(&ctx, &queue, repo.id).await.unwrap();

        generate_narratives(&ctx, repo.id, &sample_analysis())
            .await
            .unwrap();

        let result = ctx
            .db
            .call(move |db| db.latest_analysis_result(repo.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.summary.as_deref(), Some("Summary for Spoon-Knife"));
        assert_eq!(
            result.narrative.as_deref(),
            Some("Narrative for Spoon-Knife")
        );
    }

    #[tokio::test]
    async fn test_narrate_without_result_row_is_noop() {
        let (ctx, _queue) = context_with(StubAnalyzer {
            result: Ok(sample_analysis()),
        });
        let repo = seed_repository(&ctx).await;

        // No analyze ran, so no row exists; the job must not error
        generate_narratives(&ctx, repo.id, &sample_analysis())
            .await
            .unwrap();

        let results = ctx
            .db
            .call(move |db| db.analysis_results_for_repository(repo.id))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_worker_chains_narrate_after_analyze() {
        let (ctx, queue) = context_with(StubAnalyzer {
            result: Ok(sample_analysis()),
        });
        let repo = seed_repository(&ctx).await;

        queue.enqueue(Job::Analyze {
            repository_id: repo.id,
        });

        // Wait for the worker to drain both jobs
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let result = ctx
                .db
                .call(move |db| db.latest_analysis_result(repo.id))
                .await
                .unwrap();
            if let Some(result) = result {
                if result.summary.as_deref() == Some("Summary for Spoon-Knife") {
                    break;
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "narrate job never ran"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_job_payload_json_roundtrip() {
        let job = Job::Narrate {
            repository_id: 7,
            analysis: sample_analysis(),
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        match back {
            Job::Narrate {
                repository_id,
                analysis,
            } => {
                assert_eq!(repository_id, 7);
                assert_eq!(analysis.file_count, 10);
            }
            _ => panic!("Expected Narrate job"),
        }
    }

    #[test]
    fn test_analyze_job_serialization() {
        let job = Job::Analyze { repository_id: 3 };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"type\":\"Analyze\""));
        assert!(json.contains("\"repository_id\":3"));
    }
}
