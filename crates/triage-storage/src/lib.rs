//! Issue-tracker gateway, retry policy and run-report storage.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "triage-storage";

pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-count retry without backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub per_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            per_attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub enum AttemptFailure<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(err) => write!(f, "{err}"),
            Self::TimedOut(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Debug + std::fmt::Display> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: AttemptFailure<E>,
    },
    #[error("non-retryable failure on attempt {attempt}: {error}")]
    Permanent { attempt: usize, error: E },
}

impl<E: std::fmt::Debug + std::fmt::Display> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Permanent { attempt, .. } => *attempt,
        }
    }
}

/// Runs `operation` up to `policy.attempts` times, each bounded by
/// `policy.per_attempt_timeout`. Errors rejected by `is_retryable` end the
/// loop immediately.
pub async fn retry_fixed<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Debug + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.per_attempt_timeout, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => {
                if !is_retryable(&error) {
                    return Err(RetryError::Permanent { attempt, error });
                }
                warn!(attempt, attempts, %error, "attempt failed; retrying");
                last = Some(AttemptFailure::Failed(error));
            }
            Err(_elapsed) => {
                warn!(attempt, attempts, "attempt timed out; retrying");
                last = Some(AttemptFailure::TimedOut(policy.per_attempt_timeout));
            }
        }
    }
    Err(RetryError::Exhausted {
        attempts,
        last: last.unwrap_or(AttemptFailure::TimedOut(policy.per_attempt_timeout)),
    })
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("tracker returned status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding tracker response: {0}")]
    Decode(String),
    #[error("tracker unavailable: {0}")]
    Unavailable(String),
}

impl TrackerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            Self::Decode(_) => false,
            Self::Unavailable(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedIssue {
    pub number: i64,
    pub url: String,
}

/// Outbound side of the issue tracker. One call is one attempt; retries are
/// the gateway's business.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, repo: &str, issue: &NewIssue)
        -> Result<CreatedIssue, TrackerError>;

    /// Comments on an issue or pull request; both share one number space.
    async fn post_comment(&self, repo: &str, issue_id: &str, body: &str)
        -> Result<(), TrackerError>;
}

/// Issue number from a tracker URL such as `.../issues/123`.
pub fn issue_id_from_url(url: &str) -> Option<&str> {
    let (_, tail) = url.rsplit_once("/issues/")?;
    let id = tail.split(['/', '#', '?']).next().unwrap_or_default();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct GithubTrackerConfig {
    pub api_base: String,
    pub token: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for GithubTrackerConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GITHUB_API_BASE.to_string(),
            token: String::new(),
            user_agent: "ci-triage-bot/0.1".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubIssueResponse {
    number: i64,
    url: String,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GithubTracker {
    http: reqwest::Client,
    api_base: String,
}

impl GithubTracker {
    pub fn new(config: GithubTrackerConfig) -> anyhow::Result<Self> {
        if config.token.trim().is_empty() {
            anyhow::bail!("GITHUB_TOKEN is required for live tracker calls");
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.token.trim()))
                .context("invalid github authorization header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building github client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn expect_created(response: reqwest::Response) -> Result<reqwest::Response, TrackerError> {
        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(TrackerError::HttpStatus {
            status: status.as_u16(),
            url,
            body: body.chars().take(800).collect(),
        })
    }
}

#[async_trait]
impl IssueTracker for GithubTracker {
    async fn create_issue(
        &self,
        repo: &str,
        issue: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        let url = format!("{}/repos/{}/issues", self.api_base, repo);
        info!(%url, title = %issue.title, "creating issue");
        let response = self.http.post(&url).json(issue).send().await?;
        let response = Self::expect_created(response).await?;
        let created: GithubIssueResponse = response
            .json()
            .await
            .map_err(|e| TrackerError::Decode(e.to_string()))?;
        Ok(CreatedIssue {
            number: created.number,
            url: created.html_url.unwrap_or(created.url),
        })
    }

    async fn post_comment(
        &self,
        repo: &str,
        issue_id: &str,
        body: &str,
    ) -> Result<(), TrackerError> {
        let url = format!("{}/repos/{}/issues/{}/comments", self.api_base, repo, issue_id);
        info!(%url, "posting comment");
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        Self::expect_created(response).await?;
        Ok(())
    }
}

/// Logs instead of calling out. Issue numbers count down from -1 so they
/// never collide with real ones.
#[derive(Debug, Default)]
pub struct DryRunTracker {
    issued: AtomicI64,
}

#[async_trait]
impl IssueTracker for DryRunTracker {
    async fn create_issue(
        &self,
        repo: &str,
        issue: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        let number = -(self.issued.fetch_add(1, Ordering::SeqCst) + 1);
        info!(repo, title = %issue.title, labels = ?issue.labels, "dry-run: would create issue");
        Ok(CreatedIssue {
            number,
            url: format!("dry-run://{repo}/issues/{number}"),
        })
    }

    async fn post_comment(
        &self,
        repo: &str,
        issue_id: &str,
        body: &str,
    ) -> Result<(), TrackerError> {
        info!(repo, issue_id, body, "dry-run: would post comment");
        Ok(())
    }
}

/// Every outbound tracker call goes through here: fixed retries, a
/// per-attempt timeout, and the optional sandbox redirect.
pub struct TrackerGateway {
    tracker: Box<dyn IssueTracker>,
    policy: RetryPolicy,
    sandbox_repo: Option<String>,
}

impl TrackerGateway {
    pub fn new(tracker: Box<dyn IssueTracker>, policy: RetryPolicy) -> Self {
        Self {
            tracker,
            policy,
            sandbox_repo: None,
        }
    }

    pub fn with_sandbox_repo(mut self, repo: Option<String>) -> Self {
        self.sandbox_repo = repo.filter(|r| !r.trim().is_empty());
        self
    }

    fn target<'a>(&'a self, repo: &'a str) -> &'a str {
        self.sandbox_repo.as_deref().unwrap_or(repo)
    }

    pub async fn create_issue(
        &self,
        repo: &str,
        issue: &NewIssue,
    ) -> Result<CreatedIssue, RetryError<TrackerError>> {
        let target = self.target(repo);
        let span = info_span!("tracker_call", operation = "create_issue", repo = target);
        retry_fixed(&self.policy, TrackerError::is_retryable, || {
            self.tracker.create_issue(target, issue)
        })
        .instrument(span)
        .await
    }

    pub async fn post_comment(
        &self,
        repo: &str,
        issue_id: &str,
        body: &str,
    ) -> Result<(), RetryError<TrackerError>> {
        let target = self.target(repo);
        let span = info_span!("tracker_call", operation = "post_comment", repo = target, issue_id);
        retry_fixed(&self.policy, TrackerError::is_retryable, || {
            self.tracker.post_comment(target, issue_id, body)
        })
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredReport {
    pub name: String,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once report files under `<root>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Writes through a temp file and an atomic rename; an existing file
    /// is left untouched.
    pub async fn store_report(
        &self,
        run_id: Uuid,
        name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredReport> {
        let relative_path = PathBuf::from(run_id.to_string()).join(name);
        let absolute_path = self.root.join(&relative_path);
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating report directory {}", dir.display()))?;

        let stored = |deduplicated| StoredReport {
            name: name.to_string(),
            content_hash: Self::sha256_hex(bytes),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking report path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp report {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[test]
    fn report_hashing_is_stable() {
        let hash = ReportStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn reports_are_written_once_per_run() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let first = store
            .store_report(run_id, "triage.json", b"{\"filed\":[]}")
            .await
            .expect("first store");
        let second = store
            .store_report(run_id, "triage.json", b"{\"filed\":[1]}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert!(first.absolute_path.exists());
        let on_disk = std::fs::read(&first.absolute_path).unwrap();
        assert_eq!(on_disk, b"{\"filed\":[]}");
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            RetryDisposition::NonRetryable
        );
        let err = TrackerError::HttpStatus {
            status: 503,
            url: "u".into(),
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(!TrackerError::Decode("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn retry_stops_after_fixed_attempts() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), _> = retry_fixed(&policy, TrackerError::is_retryable, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TrackerError::Unavailable("down".into())) }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), 3);
        assert!(matches!(err, RetryError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_fixed(&RetryPolicy::default(), TrackerError::is_retryable, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TrackerError::Unavailable("blip".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_fixed(&RetryPolicy::default(), TrackerError::is_retryable, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TrackerError::HttpStatus {
                    status: 422,
                    url: "u".into(),
                    body: "validation failed".into(),
                })
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Permanent { attempt: 1, .. })));
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy {
            attempts: 2,
            per_attempt_timeout: Duration::from_millis(20),
        };
        let result: Result<(), RetryError<TrackerError>> =
            retry_fixed(&policy, TrackerError::is_retryable, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last: AttemptFailure::TimedOut(_)
            })
        ));
    }

    #[test]
    fn issue_ids_parse_from_tracker_urls() {
        assert_eq!(
            issue_id_from_url("https://github.com/pingcap/tidb/issues/4021"),
            Some("4021")
        );
        assert_eq!(
            issue_id_from_url("https://api.github.com/repos/tikv/pd/issues/77#issuecomment-1"),
            Some("77")
        );
        assert_eq!(issue_id_from_url("https://github.com/pingcap/tidb/pull/12"), None);
    }

    #[derive(Default)]
    struct RecordingTracker {
        comments: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl IssueTracker for RecordingTracker {
        async fn create_issue(
            &self,
            repo: &str,
            _issue: &NewIssue,
        ) -> Result<CreatedIssue, TrackerError> {
            Ok(CreatedIssue {
                number: 1,
                url: format!("https://github.com/{repo}/issues/1"),
            })
        }

        async fn post_comment(
            &self,
            repo: &str,
            issue_id: &str,
            _body: &str,
        ) -> Result<(), TrackerError> {
            self.comments
                .lock()
                .unwrap()
                .push((repo.to_string(), issue_id.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn sandbox_repo_redirects_outbound_calls() {
        let gateway = TrackerGateway::new(Box::new(RecordingTracker::default()), RetryPolicy::default())
            .with_sandbox_repo(Some("ci-bot/sandbox".to_string()));
        let created = gateway
            .create_issue(
                "pingcap/tidb",
                &NewIssue {
                    title: "t".into(),
                    body: "b".into(),
                    labels: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(created.url, "https://github.com/ci-bot/sandbox/issues/1");
    }

    #[tokio::test]
    async fn dry_run_tracker_hands_out_negative_numbers() {
        let tracker = DryRunTracker::default();
        let issue = NewIssue {
            title: "TestA failed".into(),
            body: String::new(),
            labels: vec!["component/test".into()],
        };
        let first = tracker.create_issue("a/b", &issue).await.unwrap();
        let second = tracker.create_issue("a/b", &issue).await.unwrap();
        assert_eq!(first.number, -1);
        assert_eq!(second.number, -2);
        assert!(tracker.post_comment("a/b", "1", "hi").await.is_ok());
    }
}
