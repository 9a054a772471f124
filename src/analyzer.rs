//! Repository analysis pipeline.
//!
//! `GitHubAnalyzer` composes the GitHub client into one
//! `RepositoryAnalysis` payload: details, language statistics, open
//! issue/PR counts, contributor logins, the full commit history, the file
//! tree, and a tech stack detected from well-known manifest files. The
//! `Analyzer` trait is the seam the background jobs are tested through.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::errors::GitHubError;
use crate::github::GitHubClient;
use crate::models::{CommitInfo, RepositoryAnalysis, TreeEntry};
use crate::urls::parse_github_url;

const COMMITS_PER_PAGE: u32 = 100;

/// Manifest files that identify a technology when present at the repo root.
const MANIFEST_TECH: &[(&str, &str)] = &[
    ("package.json", "Node.js/npm"),
    ("requirements.txt", "Python/pip"),
    ("pom.xml", "Java/Maven"),
    ("build.gradle", "Java/Gradle"),
    ("go.mod", "Go Modules"),
    ("Cargo.toml", "Rust/Cargo"),
    ("Gemfile", "Ruby/Bundler"),
    ("composer.json", "PHP/Composer"),
    ("Dockerfile", "Docker"),
    (".nvmrc", "Node.js Version Manager"),
    (".tool-versions", "asdf-vm"),
    ("pyproject.toml", "Python/Poetry/Flit"),
    ("webpack.config.js", "Webpack"),
    ("vite.config.js", "Vite"),
    ("next.config.js", "Next.js"),
    ("angular.json", "Angular"),
    ("tsconfig.json", "TypeScript"),
    ("tailwind.config.js", "Tailwind CSS"),
    ("package-lock.json", "Node.js/npm"),
    ("yarn.lock", "Node.js/Yarn"),
    ("pnpm-lock.yaml", "Node.js/pnpm"),
];

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze the repository at `repository_url` and produce the full
    /// metrics payload.
    async fn analyze(&self, repository_url: &str) -> Result<RepositoryAnalysis>;
}

pub struct GitHubAnalyzer {
    github: Arc<GitHubClient>,
}

impl GitHubAnalyzer {
    pub fn new(github: Arc<GitHubClient>) -> Self {
        Self { github }
    }

    /// Walk the commit list page by page until exhausted.
    async fn all_commits(&self, owner: &str, repo: &str) -> Result<Vec<Value>, GitHubError> {
        let mut commits = Vec::new();
        let mut page = 1u32;
        loop {
            let batch = self
                .github
                .repository_commits(owner, repo, COMMITS_PER_PAGE, page)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();
            commits.extend(batch);
            if batch_len < COMMITS_PER_PAGE as usize {
                break;
            }
            page += 1;
        }
        Ok(commits)
    }

    /// File tree of the latest commit, flattened. Empty when the
    /// repository has no commits.
    async fn file_structure(
        &self,
        owner: &str,
        repo: &str,
        latest_commit_sha: Option<&str>,
    ) -> Result<Vec<TreeEntry>, GitHubError> {
        let Some(sha) = latest_commit_sha else {
            return Ok(Vec::new());
        };
        let commit = self.github.git_commit(owner, repo, sha).await?;
        let Some(tree_sha) = commit
            .get("tree")
            .and_then(|t| t.get("sha"))
            .and_then(Value::as_str)
        else {
            return Ok(Vec::new());
        };
        let tree = self.github.git_tree(owner, repo, tree_sha).await?;
        let entries = tree
            .get("tree")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(tree_entry_from_value).collect())
            .unwrap_or_default();
        Ok(entries)
    }

    /// Probe the manifest table and harvest dependency names from
    /// package.json and requirements.txt.
    async fn identify_tech_stack(&self, owner: &str, repo: &str) -> Result<Vec<String>, GitHubError> {
        let mut tech_stack = BTreeSet::new();
        for (file_name, tech_name) in MANIFEST_TECH {
            let Some(content) = self.github.file_content(owner, repo, file_name).await? else {
                continue;
            };
            debug!("found manifest {} in {}/{}", file_name, owner, repo);
            tech_stack.insert(tech_name.to_string());
            match *file_name {
                "package.json" => {
                    tech_stack.extend(package_json_dependencies(&content));
                }
                "requirements.txt" => {
                    tech_stack.extend(requirements_dependencies(&content));
                }
                _ => {}
            }
        }
        Ok(tech_stack.into_iter().collect())
    }
}

#[async_trait]
impl Analyzer for GitHubAnalyzer {
    async fn analyze(&self, repository_url: &str) -> Result<RepositoryAnalysis> {
        let (owner, repo_name) = parse_github_url(repository_url)?;

        let details = self
            .github
            .repository_details(&owner, &repo_name)
            .await
            .context("Failed to fetch repository details")?;
        let languages = self
            .github
            .repository_languages(&owner, &repo_name)
            .await
            .context("Failed to fetch repository languages")?;
        let issues = self
            .github
            .repository_issues(&owner, &repo_name, "open")
            .await
            .context("Failed to fetch repository issues")?;
        let pulls = self
            .github
            .repository_pulls(&owner, &repo_name, "open")
            .await
            .context("Failed to fetch repository pull requests")?;
        let contributors: Vec<String> = self
            .github
            .repository_contributors(&owner, &repo_name)
            .await
            .context("Failed to fetch repository contributors")?
            .iter()
            .filter_map(|c| c.get("login").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        let raw_commits = self
            .all_commits(&owner, &repo_name)
            .await
            .context("Failed to fetch commit history")?;
        let commit_history: Vec<CommitInfo> =
            raw_commits.iter().filter_map(commit_info_from_value).collect();
        let latest_sha = raw_commits
            .first()
            .and_then(|c| c.get("sha"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let file_structure = self
            .file_structure(&owner, &repo_name, latest_sha.as_deref())
            .await
            .context("Failed to fetch file structure")?;
        let tech_stack = self
            .identify_tech_stack(&owner, &repo_name)
            .await
            .context("Failed to identify tech stack")?;

        Ok(RepositoryAnalysis {
            name: details.get("name").and_then(Value::as_str).map(str::to_string),
            description: details
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            main_language: details
                .get("language")
                .and_then(Value::as_str)
                .map(str::to_string),
            owner,
            repo_name,
            languages,
            file_count: file_structure.len() as i64,
            commit_count: raw_commits.len() as i64,
            open_issues_count: issues.len() as i64,
            open_pull_requests_count: pulls.len() as i64,
            contributors,
            file_structure,
            commit_history,
            tech_stack,
        })
    }
}

fn tree_entry_from_value(value: &Value) -> Option<TreeEntry> {
    Some(TreeEntry {
        path: value.get("path")?.as_str()?.to_string(),
        kind: value.get("type")?.as_str()?.to_string(),
        size: value.get("size").and_then(Value::as_i64),
    })
}

fn commit_info_from_value(value: &Value) -> Option<CommitInfo> {
    let commit = value.get("commit")?;
    let author = commit.get("author")?;
    Some(CommitInfo {
        sha: value.get("sha")?.as_str()?.to_string(),
        message: commit.get("message")?.as_str()?.to_string(),
        author_name: author.get("name")?.as_str()?.to_string(),
        date: author.get("date")?.as_str()?.to_string(),
    })
}

/// Dependency names from package.json, scope prefixes stripped.
fn package_json_dependencies(content: &str) -> Vec<String> {
    let Ok(parsed) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    let mut deps = Vec::new();
    for section in ["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(map) = parsed.get(section).and_then(Value::as_object) {
            for name in map.keys() {
                let unscoped = name.split('/').next().unwrap_or(name);
                deps.push(unscoped.to_string());
            }
        }
    }
    deps
}

/// Package names from requirements.txt, version constraints stripped.
fn requirements_dependencies(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let name = line
                .split(&['=', '<', '>', '~'][..])
                .next()
                .unwrap_or(line)
                .trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}
