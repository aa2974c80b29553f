use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use vigil_core::{ChangedFile, FileStatus, SourceControl, VigilError};

const GITHUB_API: &str = "https://api.github.com";
const FILES_PER_PAGE: usize = 100;
/// GitHub stops listing pull request files after 3000 entries.
const MAX_FILE_PAGES: usize = 30;

#[derive(Deserialize)]
struct PrFile {
    filename: String,
    status: String,
    #[serde(default)]
    additions: u32,
    #[serde(default)]
    deletions: u32,
    #[serde(default)]
    patch: Option<String>,
    #[serde(default)]
    previous_filename: Option<String>,
}

#[derive(Deserialize)]
struct PullRequest {
    head: Head,
}

#[derive(Deserialize)]
struct Head {
    sha: String,
}

/// GitHub pull request access for the review pipeline.
///
/// Subjects are pull request references of the form `owner/repo#number`.
///
/// # Examples
///
/// ```
/// use vigil_review::github::parse_pr_reference;
///
/// let (owner, repo, number) = parse_pr_reference("rust-lang/rust#12345").unwrap();
/// assert_eq!(owner, "rust-lang");
/// assert_eq!(repo, "rust");
/// assert_eq!(number, 12345);
/// ```
pub struct GitHubClient {
    octocrab: octocrab::Octocrab,
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl GitHubClient {
    /// Create a client from an explicit token or the `GITHUB_TOKEN` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if no token is available, or
    /// [`VigilError::SourceControl`] if the client cannot be built.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vigil_review::github::GitHubClient;
    ///
    /// let client = GitHubClient::new(Some("ghp_xxxx")).unwrap();
    /// ```
    pub fn new(token: Option<&str>) -> Result<Self, VigilError> {
        Self::with_api_base(token, GITHUB_API)
    }

    /// Like [`new`](Self::new), against a different API root (GitHub Enterprise, tests).
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_api_base(token: Option<&str>, api_base: &str) -> Result<Self, VigilError> {
        let token = match token {
            Some(t) => t.to_string(),
            None => std::env::var("GITHUB_TOKEN").map_err(|_| {
                VigilError::Config(
                    "GITHUB_TOKEN not set. Pass --github-token or set GITHUB_TOKEN env var".into(),
                )
            })?,
        };
        let api_base = api_base.trim_end_matches('/').to_string();

        let octocrab = octocrab::Octocrab::builder()
            .personal_token(token.clone())
            .base_uri(api_base.as_str())
            .map_err(|e| VigilError::SourceControl(format!("invalid GitHub API base: {e}")))?
            .build()
            .map_err(|e| VigilError::SourceControl(format!("failed to create GitHub client: {e}")))?;

        let http = reqwest::Client::new();

        Ok(Self {
            octocrab,
            http,
            token,
            api_base,
        })
    }

    async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response, VigilError> {
        let response = self
            .http
            .get(url)
            .header("Accept", accept)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "vigil")
            .send()
            .await
            .map_err(|e| VigilError::SourceControl(format!("GitHub request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VigilError::SourceControl(format!(
                "GitHub API error {status}: {body}"
            )));
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, VigilError> {
        self.get(url, "application/vnd.github+json")
            .await?
            .json()
            .await
            .map_err(|e| VigilError::SourceControl(format!("unreadable GitHub response: {e}")))
    }
}

#[async_trait]
impl SourceControl for GitHubClient {
    async fn changed_files(&self, subject: &str) -> Result<Vec<ChangedFile>, VigilError> {
        let (owner, repo, number) = parse_pr_reference(subject)?;
        let mut files = Vec::new();

        for page in 1..=MAX_FILE_PAGES {
            let url = format!(
                "{}/repos/{owner}/{repo}/pulls/{number}/files?per_page={FILES_PER_PAGE}&page={page}",
                self.api_base
            );
            let batch: Vec<PrFile> = self.get_json(&url).await?;
            let last = batch.len() < FILES_PER_PAGE;

            for entry in batch {
                let status = entry.status.parse::<FileStatus>().unwrap_or_else(|_| {
                    debug!(status = %entry.status, path = %entry.filename, "unrecognized file status");
                    FileStatus::Modified
                });
                files.push(ChangedFile {
                    path: entry.filename,
                    status,
                    additions: entry.additions,
                    deletions: entry.deletions,
                    patch: entry.patch.unwrap_or_default(),
                    previous_path: entry.previous_filename,
                });
            }
            if last {
                break;
            }
        }

        debug!(subject, files = files.len(), "fetched changed files");
        Ok(files)
    }

    async fn file_content(
        &self,
        subject: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<String, VigilError> {
        let (owner, repo, _) = parse_pr_reference(subject)?;
        let url = format!(
            "{}/repos/{owner}/{repo}/contents/{path}?ref={git_ref}",
            self.api_base
        );
        self.get(&url, "application/vnd.github.raw")
            .await?
            .text()
            .await
            .map_err(|e| VigilError::SourceControl(format!("failed to read {path}: {e}")))
    }

    async fn head_ref(&self, subject: &str) -> Result<String, VigilError> {
        let (owner, repo, number) = parse_pr_reference(subject)?;
        let url = format!("{}/repos/{owner}/{repo}/pulls/{number}", self.api_base);
        let pr: PullRequest = self.get_json(&url).await?;
        Ok(pr.head.sha)
    }

    async fn post_review_comment(&self, subject: &str, body: &str) -> Result<(), VigilError> {
        let (owner, repo, number) = parse_pr_reference(subject)?;
        let route = format!("/repos/{owner}/{repo}/issues/{number}/comments");
        let body = serde_json::json!({ "body": body });

        let _response: serde_json::Value = self
            .octocrab
            .post(route, Some(&body))
            .await
            .map_err(|e| VigilError::SourceControl(format!("failed to post review: {e}")))?;

        Ok(())
    }
}

/// Parse a PR reference string (`owner/repo#number`) into its components.
///
/// # Errors
///
/// Returns [`VigilError::InvalidRequest`] if the format is invalid.
///
/// # Examples
///
/// ```
/// use vigil_review::github::parse_pr_reference;
///
/// let (owner, repo, num) = parse_pr_reference("octocat/hello-world#42").unwrap();
/// assert_eq!(owner, "octocat");
/// assert_eq!(repo, "hello-world");
/// assert_eq!(num, 42);
/// ```
pub fn parse_pr_reference(pr_ref: &str) -> Result<(String, String, u64), VigilError> {
    let invalid =
        || VigilError::InvalidRequest(format!("invalid PR reference '{pr_ref}', expected owner/repo#number"));
    let (owner_repo, number_str) = pr_ref.split_once('#').ok_or_else(invalid)?;
    let (owner, repo) = owner_repo.split_once('/').ok_or_else(invalid)?;
    if owner.is_empty() || repo.is_empty() {
        return Err(invalid());
    }
    let number: u64 = number_str
        .parse()
        .map_err(|_| VigilError::InvalidRequest(format!("invalid PR number: {number_str}")))?;
    Ok((owner.to_string(), repo.to_string(), number))
}
