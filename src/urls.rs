use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;

static OWNER_REPO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"github\.com/([^/]+)/([^/]+?)(?:\.git)?/?$").expect("valid owner/repo regex")
});

/// Parse a GitHub repository URL into `(owner, repo)`.
///
/// Accepts `https://github.com/owner/repo` with an optional `.git` suffix
/// or trailing slash. Anything not hosted on github.com is rejected.
pub fn parse_github_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    if !rest.starts_with("github.com/") {
        bail!("Invalid GitHub URL: Host is not github.com in {}", url);
    }
    match OWNER_REPO_RE.captures(url) {
        Some(caps) => Ok((caps[1].to_string(), caps[2].to_string())),
        None => bail!("Invalid GitHub URL format: {}", url),
    }
}

/// Extract the `owner/repo` slug from a GitHub repository URL.
pub fn extract_repo_slug(url: &str) -> Result<String> {
    let (owner, repo) = parse_github_url(url)?;
    Ok(format!("{}/{}", owner, repo))
}
