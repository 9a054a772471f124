use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a repository analysis attempt.
///
/// Forward-only per attempt: `Pending` → `InProgress` → `Completed` or
/// `Failed`. The terminal states are never left automatically; a fresh
/// analysis re-enters at `InProgress`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// True for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid analysis status: {}", s)),
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account that can submit repositories. The hashed password never
/// leaves the persistence layer.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub hashed_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub url: String,
    /// `owner/repo` slug extracted from the URL.
    pub name: String,
    pub owner_id: i64,
    pub status: AnalysisStatus,
    /// Failure description when the last analysis attempt ended in `Failed`.
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: i64,
    pub repository_id: i64,
    pub summary: Option<String>,
    pub narrative: Option<String>,
    pub file_count: i64,
    pub commit_count: i64,
    pub languages: BTreeMap<String, i64>,
    pub open_issues_count: i64,
    pub open_pull_requests_count: i64,
    pub contributors: Vec<String>,
    pub tech_stack: Vec<String>,
    pub status: AnalysisStatus,
    pub created_at: String,
}

/// Insert payload for a new analysis result row.
#[derive(Debug, Clone)]
pub struct NewAnalysisResult {
    pub repository_id: i64,
    pub summary: String,
    pub narrative: String,
    pub file_count: i64,
    pub commit_count: i64,
    pub languages: BTreeMap<String, i64>,
    pub open_issues_count: i64,
    pub open_pull_requests_count: i64,
    pub contributors: Vec<String>,
    pub tech_stack: Vec<String>,
    pub status: AnalysisStatus,
}

/// One entry of a repository's file tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeEntry {
    pub path: String,
    /// `blob` for files, `tree` for directories.
    #[serde(rename = "type")]
    pub kind: String,
    /// Present for files only.
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub date: String,
}

/// Everything the analyzer extracts for one repository.
///
/// Crosses the job-queue boundary between the analyze and narrate jobs,
/// so it must stay plain serializable data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryAnalysis {
    pub name: Option<String>,
    pub description: Option<String>,
    pub main_language: Option<String>,
    pub owner: String,
    pub repo_name: String,
    pub languages: BTreeMap<String, i64>,
    pub file_count: i64,
    pub commit_count: i64,
    pub open_issues_count: i64,
    pub open_pull_requests_count: i64,
    pub contributors: Vec<String>,
    pub file_structure: Vec<TreeEntry>,
    pub commit_history: Vec<CommitInfo>,
    pub tech_stack: Vec<String>,
}

// API view types

/// A repository together with its analysis results, as served by the
/// read endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDetail {
    #[serde(flatten)]
    pub repository: Repository,
    pub analysis_results: Vec<AnalysisResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResultsList {
    pub analysis_results: Vec<AnalysisResult>,
}
