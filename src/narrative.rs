//! Narrative generation via the Gemini API.
//!
//! Two flavors of text per analysis: a long-form narrative for a technical
//! audience and a recruiter-facing summary capped at 200 characters.
//! Calls retry with exponential backoff (3 attempts); a generation that
//! still fails degrades to a fixed placeholder string rather than failing
//! the job that requested it.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::models::RepositoryAnalysis;

pub const MAX_SUMMARY_LENGTH: usize = 200;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
const GEMINI_MODEL: &str = "gemini-pro";
const RETRY_ATTEMPTS: u32 = 3;
const NARRATIVE_FALLBACK: &str = "Error generating narrative.";
const SUMMARY_FALLBACK: &str = "Error generating recruiter summary.";

#[async_trait]
pub trait Narrator: Send + Sync {
    /// Long-form narrative for a technical audience. Never fails; degrades
    /// to a placeholder on generation errors.
    async fn generate_narrative(&self, analysis: &RepositoryAnalysis) -> String;

    /// Concise business-value summary, at most [`MAX_SUMMARY_LENGTH`]
    /// characters. Never fails; degrades to a placeholder.
    async fn generate_recruiter_summary(&self, analysis: &RepositoryAnalysis) -> String;
}

pub struct GeminiNarrator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiNarrator {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, GEMINI_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    /// One model call with retry. Waits 4s then 8s between attempts.
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, GEMINI_MODEL, self.api_key
        );
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });

        let mut last_error = anyhow!("no attempts made");
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                let backoff =
                    Duration::from_secs(4u64 << (attempt - 1)).min(Duration::from_secs(10));
                debug!("retrying generation after {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
            match self.try_generate(&url, &body).await {
                Ok(text) => return Ok(text),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    async fn try_generate(&self, url: &str, body: &Value) -> Result<String> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to reach the generation API")?
            .error_for_status()
            .context("Generation API returned error status")?;
        let parsed: Value = response
            .json()
            .await
            .context("Failed to parse generation response")?;
        extract_text(&parsed).context("Generation response contained no text")
    }
}

#[async_trait]
impl Narrator for GeminiNarrator {
    async fn generate_narrative(&self, analysis: &RepositoryAnalysis) -> String {
        match self.generate(&narrative_prompt(analysis)).await {
            Ok(text) => text,
            Err(e) => {
                error!("Error generating narrative: {:#}", e);
                NARRATIVE_FALLBACK.to_string()
            }
        }
    }

    async fn generate_recruiter_summary(&self, analysis: &RepositoryAnalysis) -> String {
        match self.generate(&summary_prompt(analysis)).await {
            Ok(text) => truncate_summary(&text),
            Err(e) => {
                error!("Error generating recruiter summary: {:#}", e);
                SUMMARY_FALLBACK.to_string()
            }
        }
    }
}

fn extract_text(response: &Value) -> Option<String> {
    response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

/// Cap a summary at [`MAX_SUMMARY_LENGTH`] characters, ellipsis included.
fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= MAX_SUMMARY_LENGTH {
        return summary.to_string();
    }
    let head: String = summary.chars().take(MAX_SUMMARY_LENGTH - 3).collect();
    format!("{}...", head)
}

fn or_na(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("N/A")
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "None".to_string()
    } else {
        items.join(", ")
    }
}

fn narrative_prompt(analysis: &RepositoryAnalysis) -> String {
    let file_lines: Vec<String> = analysis
        .file_structure
        .iter()
        .take(10)
        .map(|f| format!("- {}", f.path))
        .collect();
    let commit_lines: Vec<String> = analysis
        .commit_history
        .iter()
        .take(5)
        .map(|c| format!("- {} by {} on {}", c.message, c.author_name, c.date))
        .collect();

    format!(
        "Generate a comprehensive narrative for a software project based on the following information:\n\n\
         Repository Details:\n\
         - Name: {name}\n\
         - Description: {description}\n\
         - Main Language: {main_language}\n\
         - Languages: {languages}\n\
         - Tech Stack: {tech_stack}\n\
         - Open Issues: {open_issues}\n\
         - Open Pull Requests: {open_pulls}\n\
         - Contributors: {contributors}\n\
         - Total Files: {file_count}\n\
         - Total Commits: {commit_count}\n\n\
         File Structure (first 10 files):\n{files}\n\n\
         Commit History (last 5 commits):\n{commits}\n\n\
         Based on this data, provide a narrative that covers:\n\
         1. Project Overview: What is the project about? What problem does it solve?\n\
         2. Technical Aspects: Highlight key technologies, architectural patterns, and notable features.\n\
         3. Development Activity: Summarize the recent development efforts and project maturity.\n\
         4. Potential Impact/Value: What is the significance or potential of this project?\n\n\
         Ensure the narrative is engaging, informative, and suitable for a technical audience.",
        name = or_na(&analysis.name),
        description = or_na(&analysis.description),
        main_language = or_na(&analysis.main_language),
        languages = serde_json::to_string(&analysis.languages).unwrap_or_default(),
        tech_stack = join_or_none(&analysis.tech_stack),
        open_issues = analysis.open_issues_count,
        open_pulls = analysis.open_pull_requests_count,
        contributors = join_or_none(&analysis.contributors),
        file_count = analysis.file_count,
        commit_count = analysis.commit_count,
        files = file_lines.join("\n"),
        commits = commit_lines.join("\n"),
    )
}

fn summary_prompt(analysis: &RepositoryAnalysis) -> String {
    format!(
        "Generate a concise, non-technical summary (2-3 sentences, max {max_len} characters) for a \
         recruiter about the following software project. Focus on business value, key features, and \
         the impact of the technologies used, avoiding deep technical jargon.\n\n\
         Project Name: {name}\n\
         Description: {description}\n\
         Main Language: {main_language}\n\
         Languages: {languages}\n\
         Tech Stack: {tech_stack}\n\
         Open Issues Count: {open_issues}\n\
         Open Pull Requests Count: {open_pulls}\n\
         Contributors: {contributors}\n\
         Total Files: {file_count}\n\
         Total Commits: {commit_count}\n\n\
         Highlight how this project demonstrates valuable skills and delivers practical solutions.",
        max_len = MAX_SUMMARY_LENGTH,
        name = or_na(&analysis.name),
        description = or_na(&analysis.description),
        main_language = or_na(&analysis.main_language),
        languages = serde_json::to_string(&analysis.languages).unwrap_or_default(),
        tech_stack = join_or_none(&analysis.tech_stack),
        open_issues = analysis.open_issues_count,
        open_pulls = analysis.open_pull_requests_count,
        contributors = join_or_none(&analysis.contributors),
        file_count = analysis.file_count,
        commit_count = analysis.commit_count,
    )
}
