//! Triage orchestration: history aggregation, recurrence detection, issue
//! state resolution and the lifecycle decisions that drive the tracker.

pub mod mysql;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, info_span, warn, Instrument};
use triage_adapters::{
    load_fixture_rows, CaseExtractor, FixtureFile, FixtureRow, RepoClassifier, RowKind,
};
use triage_core::{
    issue_link, CaseIssue, CaseOccurrence, JobLinkTemplate, LifecycleCode, RecencyInterval,
    RepoCase, TimeWindow, TriageWindows, WarehouseRow, DEFAULT_HISTORY_DAYS,
    DEFAULT_JOB_LINK_TEMPLATE, DEFAULT_SEARCH_INTERVAL_HOURS, NIGHTLY_PR,
};
use triage_storage::{
    issue_id_from_url, GithubTrackerConfig, NewIssue, ReportStore, RetryError, RetryPolicy,
    TrackerError, TrackerGateway, DEFAULT_GITHUB_API_BASE,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "triage-sync";

pub const DEFAULT_ISSUE_LABEL: &str = "component/test";

#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub ci_database_url: String,
    pub github_database_url: String,
    pub github_token: String,
    pub github_api_base: String,
    pub history_days: i64,
    pub search_interval_hours: i64,
    pub retry_attempts: usize,
    pub http_timeout_secs: u64,
    pub job_link_template: String,
    pub issue_labels: Vec<String>,
    pub sandbox_repo: Option<String>,
    pub repo_rules_path: Option<PathBuf>,
    pub user_agent: String,
    pub reports_dir: PathBuf,
}

impl TriageConfig {
    pub fn from_env() -> Self {
        Self {
            ci_database_url: std::env::var("CI_DATABASE_URL")
                .unwrap_or_else(|_| "mysql://root@127.0.0.1:4000/ci_data".to_string()),
            github_database_url: std::env::var("GITHUB_DATABASE_URL")
                .unwrap_or_else(|_| "mysql://root@127.0.0.1:4000/github_info".to_string()),
            github_token: std::env::var("GITHUB_TOKEN").unwrap_or_default(),
            github_api_base: std::env::var("GITHUB_API_BASE")
                .unwrap_or_else(|_| DEFAULT_GITHUB_API_BASE.to_string()),
            history_days: env_parse("TRIAGE_HISTORY_DAYS", DEFAULT_HISTORY_DAYS),
            search_interval_hours: env_parse(
                "TRIAGE_SEARCH_INTERVAL_HOURS",
                DEFAULT_SEARCH_INTERVAL_HOURS,
            ),
            retry_attempts: env_parse("TRIAGE_RETRY_ATTEMPTS", 3),
            http_timeout_secs: env_parse("TRIAGE_HTTP_TIMEOUT_SECS", 10),
            job_link_template: std::env::var("TRIAGE_JOB_LINK_TEMPLATE")
                .unwrap_or_else(|_| DEFAULT_JOB_LINK_TEMPLATE.to_string()),
            issue_labels: std::env::var("TRIAGE_ISSUE_LABELS")
                .map(|v| split_labels(&v))
                .unwrap_or_else(|_| vec![DEFAULT_ISSUE_LABEL.to_string()]),
            sandbox_repo: std::env::var("TRIAGE_SANDBOX_REPO")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            repo_rules_path: std::env::var("TRIAGE_REPO_RULES")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: std::env::var("TRIAGE_USER_AGENT")
                .unwrap_or_else(|_| "ci-triage-bot/0.1".to_string()),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            per_attempt_timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
        }
    }

    pub fn recency(&self) -> RecencyInterval {
        RecencyInterval::from_hours(self.search_interval_hours)
    }

    pub fn history_span(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_days.max(1))
    }

    pub fn github_tracker_config(&self) -> GithubTrackerConfig {
        GithubTrackerConfig {
            api_base: self.github_api_base.clone(),
            token: self.github_token.clone(),
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
        }
    }

    pub fn load_extractor(&self) -> Result<CaseExtractor> {
        let classifier = match &self.repo_rules_path {
            Some(path) => RepoClassifier::from_yaml_file(path)
                .with_context(|| format!("loading repo rules from {}", path.display()))?,
            None => RepoClassifier::builtin(),
        };
        Ok(CaseExtractor::new(
            classifier,
            JobLinkTemplate::new(self.job_link_template.clone()),
        ))
    }

    pub fn engine_settings(&self, dry_run: bool) -> EngineSettings {
        EngineSettings {
            recency: self.recency(),
            labels: self.issue_labels.clone(),
            persist: !dry_run,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn split_labels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read side of the CI warehouse. Rows come back oldest first.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn pr_case_rows(&self, window: &TimeWindow) -> Result<Vec<WarehouseRow>>;

    async fn nightly_case_rows(&self, window: &TimeWindow) -> Result<Vec<WarehouseRow>>;
}

/// Append-only log of filing decisions.
#[async_trait]
pub trait CaseIssueStore: Send + Sync {
    /// Issue number of the most recent filed record for the case.
    async fn latest_issue_number(&self, key: &RepoCase) -> Result<Option<String>>;

    async fn append(&self, record: &CaseIssue) -> Result<()>;
}

/// Read-only mirror of tracker issues.
#[async_trait]
pub trait IssueProjection: Send + Sync {
    /// URL of the issue if it is open and was active within `interval`.
    async fn open_issue_url(
        &self,
        issue_number: &str,
        repo: &str,
        interval: RecencyInterval,
    ) -> Result<Option<String>>;

    /// Whether the issue was closed within `interval`.
    async fn closed_recently(
        &self,
        issue_number: &str,
        repo: &str,
        interval: RecencyInterval,
    ) -> Result<bool>;
}

#[async_trait]
impl<T: CaseIssueStore + ?Sized> CaseIssueStore for Arc<T> {
    async fn latest_issue_number(&self, key: &RepoCase) -> Result<Option<String>> {
        (**self).latest_issue_number(key).await
    }

    async fn append(&self, record: &CaseIssue) -> Result<()> {
        (**self).append(record).await
    }
}

#[async_trait]
impl<T: IssueProjection + ?Sized> IssueProjection for Arc<T> {
    async fn open_issue_url(
        &self,
        issue_number: &str,
        repo: &str,
        interval: RecencyInterval,
    ) -> Result<Option<String>> {
        (**self).open_issue_url(issue_number, repo, interval).await
    }

    async fn closed_recently(
        &self,
        issue_number: &str,
        repo: &str,
        interval: RecencyInterval,
    ) -> Result<bool> {
        (**self).closed_recently(issue_number, repo, interval).await
    }
}

/// Serves captured warehouse rows. Rows without a pull request are nightly.
#[derive(Debug, Clone)]
pub struct FixtureWarehouse {
    rows: Vec<FixtureRow>,
}

impl FixtureWarehouse {
    pub fn new(fixture: FixtureFile) -> Self {
        Self { rows: fixture.rows }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_rows(path)?))
    }

    fn rows_in(&self, window: &TimeWindow, nightly: bool) -> Vec<WarehouseRow> {
        self.rows
            .iter()
            .filter(|r| window.contains(r.reported_at) && r.row.pr.is_none() == nightly)
            .map(|r| r.row.clone())
            .collect()
    }
}

#[async_trait]
impl Warehouse for FixtureWarehouse {
    async fn pr_case_rows(&self, window: &TimeWindow) -> Result<Vec<WarehouseRow>> {
        Ok(self.rows_in(window, false))
    }

    async fn nightly_case_rows(&self, window: &TimeWindow) -> Result<Vec<WarehouseRow>> {
        Ok(self.rows_in(window, true))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCaseIssueStore {
    records: RwLock<Vec<CaseIssue>>,
}

impl InMemoryCaseIssueStore {
    pub async fn records(&self) -> Vec<CaseIssue> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl CaseIssueStore for InMemoryCaseIssueStore {
    async fn latest_issue_number(&self, key: &RepoCase) -> Result<Option<String>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.repo == key.repo && r.case == key.case)
            .find_map(|r| r.issue_number)
            .map(|n| n.to_string()))
    }

    async fn append(&self, record: &CaseIssue) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProjectedIssue {
    Open { url: String },
    Closed,
}

/// Projection backed by a map; every entry counts as recent.
#[derive(Debug, Default)]
pub struct InMemoryIssueProjection {
    issues: RwLock<BTreeMap<(String, String), ProjectedIssue>>,
}

impl InMemoryIssueProjection {
    pub async fn set_open(&self, repo: &str, issue_number: &str, url: impl Into<String>) {
        self.issues.write().await.insert(
            (repo.to_string(), issue_number.to_string()),
            ProjectedIssue::Open { url: url.into() },
        );
    }

    pub async fn set_closed(&self, repo: &str, issue_number: &str) {
        self.issues.write().await.insert(
            (repo.to_string(), issue_number.to_string()),
            ProjectedIssue::Closed,
        );
    }

    async fn lookup(&self, repo: &str, issue_number: &str) -> Option<ProjectedIssue> {
        self.issues
            .read()
            .await
            .get(&(repo.to_string(), issue_number.to_string()))
            .cloned()
    }
}

#[async_trait]
impl IssueProjection for InMemoryIssueProjection {
    async fn open_issue_url(
        &self,
        issue_number: &str,
        repo: &str,
        _interval: RecencyInterval,
    ) -> Result<Option<String>> {
        Ok(match self.lookup(repo, issue_number).await {
            Some(ProjectedIssue::Open { url }) => Some(url),
            _ => None,
        })
    }

    async fn closed_recently(
        &self,
        issue_number: &str,
        repo: &str,
        _interval: RecencyInterval,
    ) -> Result<bool> {
        Ok(matches!(
            self.lookup(repo, issue_number).await,
            Some(ProjectedIssue::Closed)
        ))
    }
}

/// Job links and pull requests seen for one case. Links are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseHistory {
    pub links: Vec<String>,
    pub prs: BTreeSet<String>,
}

impl CaseHistory {
    pub fn latest_link(&self) -> Option<&str> {
        self.links.first().map(String::as_str)
    }

    fn record(&mut self, occurrence: &CaseOccurrence) {
        self.links.insert(0, occurrence.job_link.clone());
        self.prs.insert(occurrence.pr.clone());
    }
}

/// Everything seen in the history window, keyed by (repo, case).
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    cases: BTreeMap<RepoCase, CaseHistory>,
    repeats: usize,
}

impl HistoryWindow {
    /// Occurrences must be in chronological order.
    pub fn aggregate(occurrences: &[CaseOccurrence]) -> Self {
        let mut window = Self::default();
        for occurrence in occurrences {
            let entry = window.cases.entry(occurrence.key()).or_default();
            if entry.prs.iter().any(|pr| pr != &occurrence.pr) {
                window.repeats += 1;
            }
            entry.record(occurrence);
        }
        window
    }

    pub fn get(&self, key: &RepoCase) -> Option<&CaseHistory> {
        self.cases.get(key)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Occurrences that hit a case already seen under another pull request.
    pub fn repeats(&self) -> usize {
        self.repeats
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recurrence {
    /// Cases seen in history under a pull request other than one of the
    /// recent ones. Links are every recent one, newest first, then the
    /// history chain.
    pub duplicates: BTreeMap<RepoCase, CaseHistory>,
    /// Every case seen in the recent window.
    pub recent: BTreeMap<RepoCase, CaseHistory>,
}

impl Recurrence {
    /// Recent occurrences must be in chronological order. Membership is
    /// decided over the whole batch, so row order only affects link order.
    pub fn detect(history: &HistoryWindow, recent: &[CaseOccurrence]) -> Self {
        let mut out = Self::default();
        for occurrence in recent {
            out.recent
                .entry(occurrence.key())
                .or_default()
                .record(occurrence);
        }

        for (key, seen) in &out.recent {
            let Some(previous) = history.get(key) else {
                continue;
            };
            let cross_pr = seen
                .prs
                .iter()
                .any(|recent_pr| previous.prs.iter().any(|pr| pr != recent_pr));
            if !cross_pr {
                continue;
            }
            let mut links = seen.links.clone();
            links.extend(previous.links.iter().cloned());
            out.duplicates.insert(
                key.clone(),
                CaseHistory {
                    links,
                    prs: seen.prs.clone(),
                },
            );
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IssueState {
    NoIssue,
    OpenRecent { issue_number: String, url: String },
    Closed { issue_number: String },
    /// Filed before, but neither open nor closed within the search interval.
    Stale { issue_number: String },
}

pub struct IssueStateResolver<'a> {
    store: &'a dyn CaseIssueStore,
    projection: &'a dyn IssueProjection,
    interval: RecencyInterval,
}

impl<'a> IssueStateResolver<'a> {
    pub fn new(
        store: &'a dyn CaseIssueStore,
        projection: &'a dyn IssueProjection,
        interval: RecencyInterval,
    ) -> Self {
        Self {
            store,
            projection,
            interval,
        }
    }

    pub async fn resolve(&self, key: &RepoCase) -> Result<IssueState> {
        let Some(issue_number) = self
            .store
            .latest_issue_number(key)
            .await
            .with_context(|| format!("reading issue record for {key}"))?
        else {
            return Ok(IssueState::NoIssue);
        };

        if let Some(url) = self
            .projection
            .open_issue_url(&issue_number, &key.repo, self.interval)
            .await
            .with_context(|| format!("checking open issue #{issue_number} for {key}"))?
        {
            return Ok(IssueState::OpenRecent { issue_number, url });
        }

        let closed = self
            .projection
            .closed_recently(&issue_number, &key.repo, self.interval)
            .await
            .with_context(|| format!("checking closed issue #{issue_number} for {key}"))?;
        Ok(if closed {
            IssueState::Closed { issue_number }
        } else {
            IssueState::Stale { issue_number }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionMode {
    Skip,
    Announce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LifecycleAction {
    CreateNew,
    MarkRetriggered,
    MentionExisting { issue_number: String, url: String },
    RemindPrAuthor { issue_number: String, issue_link: String },
}

impl LifecycleAction {
    pub fn lifecycle_code(&self) -> Option<LifecycleCode> {
        match self {
            Self::CreateNew => Some(LifecycleCode::NewCase),
            Self::MarkRetriggered => Some(LifecycleCode::RetriggeredCase),
            _ => None,
        }
    }
}

/// Filing decision for a duplicate case. Open wins over closed.
pub fn decide(state: &IssueState, mentions: MentionMode) -> Option<LifecycleAction> {
    match state {
        IssueState::NoIssue | IssueState::Stale { .. } => Some(LifecycleAction::CreateNew),
        IssueState::Closed { .. } => Some(LifecycleAction::MarkRetriggered),
        IssueState::OpenRecent { issue_number, url } => match mentions {
            MentionMode::Announce => Some(LifecycleAction::MentionExisting {
                issue_number: issue_number.clone(),
                url: url.clone(),
            }),
            MentionMode::Skip => None,
        },
    }
}

/// A recent case with an open tracked issue earns its pull requests a reminder.
pub fn decide_reminder(state: &IssueState, repo: &str) -> Option<LifecycleAction> {
    match state {
        IssueState::OpenRecent { issue_number, .. } => Some(LifecycleAction::RemindPrAuthor {
            issue_number: issue_number.clone(),
            issue_link: issue_link(repo, issue_number),
        }),
        _ => None,
    }
}

pub fn mention_body(job_link: &str) -> String {
    format!("Yet another case failure: <a href=\"{job_link}\">{job_link}</a>")
}

pub fn reminder_body(case: &str, issue_link: &str) -> String {
    format!(
        "Case `{case}` failed in this pull request and is a known unstable case tracked in {issue_link}. Please check whether the failure is related to this change."
    )
}

pub fn unlogged_body(case: &str, job_link: &str) -> String {
    format!(
        "Case `{case}` failed in this pull request and has also failed on other pull requests. A tracking issue will be filed. Latest build: <a href=\"{job_link}\">{job_link}</a>"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    PullRequest,
    Nightly,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PullRequest => "pull_request",
            Self::Nightly => "nightly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateIssue,
    Mention,
    RemindPr,
    RemindUnlogged,
    Persist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub repo: String,
    pub case: String,
    /// Issue or pull request number the comment went to.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: ActionKind,
    pub repo: String,
    pub case: String,
    #[serde(default)]
    pub target: Option<String>,
    pub attempts: usize,
    pub error: String,
}

impl ActionFailure {
    fn from_retry(
        kind: ActionKind,
        key: &RepoCase,
        target: Option<&str>,
        err: &RetryError<TrackerError>,
    ) -> Self {
        Self {
            kind,
            repo: key.repo.clone(),
            case: key.case.clone(),
            target: target.map(str::to_string),
            attempts: err.attempts(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindows {
    #[serde(default)]
    pub history: Option<TimeWindow>,
    pub recent: TimeWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageOutcome {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub windows: RunWindows,
    pub scanned_rows: usize,
    pub skipped_rows: usize,
    pub history_cases: usize,
    pub duplicate_cases: usize,
    pub recent_cases: usize,
    pub filed: Vec<CaseIssue>,
    pub mentions: Vec<ActionRecord>,
    pub reminders: Vec<ActionRecord>,
    pub failures: Vec<ActionFailure>,
}

impl TriageOutcome {
    fn start(mode: RunMode, windows: RunWindows) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: now,
            finished_at: now,
            windows,
            scanned_rows: 0,
            skipped_rows: 0,
            history_cases: 0,
            duplicate_cases: 0,
            recent_cases: 0,
            filed: Vec::new(),
            mentions: Vec::new(),
            reminders: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub recency: RecencyInterval,
    pub labels: Vec<String>,
    /// Dry runs leave the case-issue store untouched.
    pub persist: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recency: RecencyInterval::default(),
            labels: vec![DEFAULT_ISSUE_LABEL.to_string()],
            persist: true,
        }
    }
}

type StateCache = BTreeMap<RepoCase, IssueState>;

pub struct TriagePipeline {
    warehouse: Box<dyn Warehouse>,
    store: Box<dyn CaseIssueStore>,
    projection: Box<dyn IssueProjection>,
    gateway: TrackerGateway,
    extractor: CaseExtractor,
    settings: EngineSettings,
}

impl TriagePipeline {
    pub fn new(
        warehouse: Box<dyn Warehouse>,
        store: Box<dyn CaseIssueStore>,
        projection: Box<dyn IssueProjection>,
        gateway: TrackerGateway,
        extractor: CaseExtractor,
    ) -> Self {
        Self {
            warehouse,
            store,
            projection,
            gateway,
            extractor,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Pull-request triage over a history window and the recent window
    /// that follows it.
    pub async fn run_pr_triage(&self, windows: TriageWindows) -> Result<TriageOutcome> {
        let mut outcome = TriageOutcome::start(
            RunMode::PullRequest,
            RunWindows {
                history: Some(windows.history),
                recent: windows.recent,
            },
        );
        let span = info_span!("triage_run", run_id = %outcome.run_id, mode = "pull_request");
        async move {
            let history_rows = self
                .warehouse
                .pr_case_rows(&windows.history)
                .await
                .with_context(|| format!("querying history window {}", windows.history))?;
            let history_batch = self.extractor.extract_batch(&history_rows, RowKind::PullRequest);
            let history = HistoryWindow::aggregate(&history_batch.occurrences);

            let recent_rows = self
                .warehouse
                .pr_case_rows(&windows.recent)
                .await
                .with_context(|| format!("querying recent window {}", windows.recent))?;
            let recent_batch = self.extractor.extract_batch(&recent_rows, RowKind::PullRequest);

            outcome.scanned_rows = history_batch.scanned_rows + recent_batch.scanned_rows;
            outcome.skipped_rows = history_batch.skipped_rows + recent_batch.skipped_rows;

            let recurrence = Recurrence::detect(&history, &recent_batch.occurrences);
            outcome.history_cases = history.len();
            outcome.duplicate_cases = recurrence.duplicates.len();
            outcome.recent_cases = recurrence.recent.len();
            info!(
                history_cases = history.len(),
                history_repeats = history.repeats(),
                duplicates = recurrence.duplicates.len(),
                recent = recurrence.recent.len(),
                skipped_rows = outcome.skipped_rows,
                "recurrence detected"
            );

            let mut states = StateCache::new();
            self.remind_pr_authors(&recurrence.recent, &mut states, &mut outcome)
                .await?;
            let candidates = self
                .collect_candidates(&recurrence.duplicates, &mut states, true, &mut outcome)
                .await?;
            self.announce_existing(&recurrence.duplicates, &mut states, &mut outcome)
                .await?;
            self.file_issues(candidates, &mut outcome).await;

            Ok::<_, anyhow::Error>(outcome.finish())
        }
        .instrument(span)
        .await
    }

    /// Nightly triage: every case failing in the window is a candidate.
    pub async fn run_nightly_triage(&self, window: TimeWindow) -> Result<TriageOutcome> {
        let mut outcome = TriageOutcome::start(
            RunMode::Nightly,
            RunWindows {
                history: None,
                recent: window,
            },
        );
        let span = info_span!("triage_run", run_id = %outcome.run_id, mode = "nightly");
        async move {
            let rows = self
                .warehouse
                .nightly_case_rows(&window)
                .await
                .with_context(|| format!("querying nightly window {window}"))?;
            let batch = self.extractor.extract_batch(&rows, RowKind::Nightly);
            outcome.scanned_rows = batch.scanned_rows;
            outcome.skipped_rows = batch.skipped_rows;

            let mut cases: BTreeMap<RepoCase, CaseHistory> = BTreeMap::new();
            for occurrence in &batch.occurrences {
                cases.entry(occurrence.key()).or_default().record(occurrence);
            }
            outcome.duplicate_cases = cases.len();
            outcome.recent_cases = cases.len();
            info!(cases = cases.len(), skipped_rows = outcome.skipped_rows, "nightly cases collected");

            let mut states = StateCache::new();
            let candidates = self
                .collect_candidates(&cases, &mut states, false, &mut outcome)
                .await?;
            self.announce_existing(&cases, &mut states, &mut outcome).await?;
            self.file_issues(candidates, &mut outcome).await;

            Ok::<_, anyhow::Error>(outcome.finish())
        }
        .instrument(span)
        .await
    }

    /// Each key is resolved at most once per run.
    async fn state_of(&self, key: &RepoCase, states: &mut StateCache) -> Result<IssueState> {
        if let Some(state) = states.get(key) {
            return Ok(state.clone());
        }
        let resolver = IssueStateResolver::new(
            self.store.as_ref(),
            self.projection.as_ref(),
            self.settings.recency,
        );
        let state = resolver.resolve(key).await?;
        states.insert(key.clone(), state.clone());
        Ok(state)
    }

    async fn remind_pr_authors(
        &self,
        recent: &BTreeMap<RepoCase, CaseHistory>,
        states: &mut StateCache,
        outcome: &mut TriageOutcome,
    ) -> Result<()> {
        for (key, history) in recent {
            let prs: Vec<&str> = history
                .prs
                .iter()
                .map(String::as_str)
                .filter(|pr| *pr != NIGHTLY_PR)
                .collect();
            if prs.is_empty() {
                continue;
            }
            let state = self.state_of(key, states).await?;
            let Some(LifecycleAction::RemindPrAuthor { issue_link, .. }) =
                decide_reminder(&state, &key.repo)
            else {
                continue;
            };
            let body = reminder_body(&key.case, &issue_link);
            for pr in prs {
                self.comment(ActionKind::RemindPr, key, pr, &body, outcome)
                    .await;
            }
        }
        Ok(())
    }

    /// First pass over the candidates: decides what gets filed and warns
    /// the pull requests of cases nobody has logged yet.
    async fn collect_candidates(
        &self,
        cases: &BTreeMap<RepoCase, CaseHistory>,
        states: &mut StateCache,
        remind_unlogged: bool,
        outcome: &mut TriageOutcome,
    ) -> Result<Vec<CaseIssue>> {
        let mut candidates = Vec::new();
        for (key, history) in cases {
            let Some(job_link) = history.latest_link() else {
                continue;
            };
            let state = self.state_of(key, states).await?;
            let Some(code) = decide(&state, MentionMode::Skip).and_then(|a| a.lifecycle_code())
            else {
                continue;
            };
            candidates.push(CaseIssue::new(code, key, job_link));

            if remind_unlogged && state == IssueState::NoIssue {
                let body = unlogged_body(&key.case, job_link);
                for pr in history.prs.iter().filter(|pr| pr.as_str() != NIGHTLY_PR) {
                    self.comment(ActionKind::RemindUnlogged, key, pr, &body, outcome)
                        .await;
                }
            }
        }
        Ok(candidates)
    }

    /// Second pass: tells open issues about the new failure.
    async fn announce_existing(
        &self,
        cases: &BTreeMap<RepoCase, CaseHistory>,
        states: &mut StateCache,
        outcome: &mut TriageOutcome,
    ) -> Result<()> {
        for (key, history) in cases {
            let Some(job_link) = history.latest_link() else {
                continue;
            };
            let state = self.state_of(key, states).await?;
            let Some(LifecycleAction::MentionExisting { issue_number, url }) =
                decide(&state, MentionMode::Announce)
            else {
                continue;
            };
            let Some(issue_id) = issue_id_from_url(&url) else {
                warn!(%key, %url, "open issue url has no issue number");
                outcome.failures.push(ActionFailure {
                    kind: ActionKind::Mention,
                    repo: key.repo.clone(),
                    case: key.case.clone(),
                    target: Some(issue_number),
                    attempts: 0,
                    error: format!("cannot parse issue number from {url}"),
                });
                continue;
            };
            self.comment(ActionKind::Mention, key, issue_id, &mention_body(job_link), outcome)
                .await;
        }
        Ok(())
    }

    async fn file_issues(&self, candidates: Vec<CaseIssue>, outcome: &mut TriageOutcome) {
        for mut record in candidates {
            let key = record.key();
            let issue = NewIssue {
                title: record.title(),
                body: record.body(),
                labels: self.settings.labels.clone(),
            };
            let created = match self.gateway.create_issue(&record.repo, &issue).await {
                Ok(created) => created,
                Err(err) => {
                    error!(%key, lifecycle = record.lifecycle.as_str(), error = %err, "issue creation failed");
                    outcome
                        .failures
                        .push(ActionFailure::from_retry(ActionKind::CreateIssue, &key, None, &err));
                    continue;
                }
            };
            record.mark_filed(created.number, created.url);
            info!(%key, issue = created.number, lifecycle = record.lifecycle.as_str(), "issue filed");

            if self.settings.persist {
                if let Err(err) = self.store.append(&record).await {
                    error!(%key, issue = created.number, error = %err, "recording filed issue failed");
                    outcome.failures.push(ActionFailure {
                        kind: ActionKind::Persist,
                        repo: key.repo.clone(),
                        case: key.case.clone(),
                        target: Some(created.number.to_string()),
                        attempts: 1,
                        error: format!("{err:#}"),
                    });
                }
            }
            outcome.filed.push(record);
        }
    }

    async fn comment(
        &self,
        kind: ActionKind,
        key: &RepoCase,
        target: &str,
        body: &str,
        outcome: &mut TriageOutcome,
    ) {
        match self.gateway.post_comment(&key.repo, target, body).await {
            Ok(()) => {
                let record = ActionRecord {
                    kind,
                    repo: key.repo.clone(),
                    case: key.case.clone(),
                    target: target.to_string(),
                };
                if kind == ActionKind::Mention {
                    outcome.mentions.push(record);
                } else {
                    outcome.reminders.push(record);
                }
            }
            Err(err) => {
                error!(%key, comment_target = target, ?kind, error = %err, "comment failed");
                outcome
                    .failures
                    .push(ActionFailure::from_retry(kind, key, Some(target), &err));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<RunManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
}

pub fn brief_markdown(outcome: &TriageOutcome) -> String {
    let mut lines = vec![
        format!("# CI Triage Brief ({})", outcome.mode.as_str()),
        String::new(),
        format!("- Run ID: `{}`", outcome.run_id),
        format!("- Started: {}", outcome.started_at),
        format!("- Finished: {}", outcome.finished_at),
    ];
    if let Some(history) = outcome.windows.history {
        lines.push(format!("- History window: {history}"));
    }
    lines.push(format!("- Recent window: {}", outcome.windows.recent));
    lines.push(format!(
        "- Rows scanned: {} (skipped {})",
        outcome.scanned_rows, outcome.skipped_rows
    ));
    lines.push(format!("- Duplicate cases: {}", outcome.duplicate_cases));
    lines.push(format!("- Recent cases: {}", outcome.recent_cases));
    lines.push(String::new());

    lines.push("## Filed".to_string());
    if outcome.filed.is_empty() {
        lines.push("- none".to_string());
    }
    for record in &outcome.filed {
        lines.push(format!(
            "- {} `{}` in {}: {}",
            record.lifecycle.as_str(),
            record.case,
            record.repo,
            record.issue_link.as_deref().unwrap_or("-")
        ));
    }
    lines.push(String::new());

    lines.push(format!(
        "## Comments\n- mentions: {}\n- reminders: {}",
        outcome.mentions.len(),
        outcome.reminders.len()
    ));
    lines.push(String::new());

    if outcome.has_failures() {
        lines.push("## Failures".to_string());
        for failure in &outcome.failures {
            lines.push(format!(
                "- {:?} `{}` in {} after {} attempt(s): {}",
                failure.kind, failure.case, failure.repo, failure.attempts, failure.error
            ));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Writes `triage.json`, `brief.md` and `manifest.json` for the run.
pub async fn write_run_reports(store: &ReportStore, outcome: &TriageOutcome) -> Result<PathBuf> {
    let triage_json =
        serde_json::to_vec_pretty(outcome).context("serializing triage outcome")?;
    let brief = brief_markdown(outcome);

    let mut files = Vec::new();
    for (name, bytes) in [
        ("triage.json", triage_json.as_slice()),
        ("brief.md", brief.as_bytes()),
    ] {
        let stored = store
            .store_report(outcome.run_id, name, bytes)
            .await
            .with_context(|| format!("writing {name}"))?;
        files.push(RunManifestFile {
            name: stored.name,
            path: stored.relative_path.display().to_string(),
            sha256: stored.content_hash,
            bytes: stored.byte_size,
        });
    }

    let manifest = RunManifest {
        schema_version: 1,
        run_id: outcome.run_id,
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
    store
        .store_report(outcome.run_id, "manifest.json", &bytes)
        .await
        .context("writing manifest.json")?;

    Ok(store.run_dir(outcome.run_id))
}

/// Markdown digest of the latest `runs` reports under `reports_root`.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("triage.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# CI Triage Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let triage_path = dir.path().join("triage.json");
        let outcome: TriageOutcome = serde_json::from_str(
            &std::fs::read_to_string(&triage_path)
                .with_context(|| format!("reading {}", triage_path.display()))?,
        )
        .with_context(|| format!("parsing {}", triage_path.display()))?;

        lines.push(format!("## Run `{}` ({})", outcome.run_id, outcome.mode.as_str()));
        lines.push(format!("- finished: {}", outcome.finished_at));
        lines.push(format!("- duplicate cases: {}", outcome.duplicate_cases));
        lines.push(format!("- filed: {}", outcome.filed.len()));
        lines.push(format!(
            "- comments: {} mentions, {} reminders",
            outcome.mentions.len(),
            outcome.reminders.len()
        ));
        lines.push(format!("- failures: {}", outcome.failures.len()));
        let brief_path = dir.path().join("brief.md");
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn occ(repo: &str, case: &str, pr: &str, job_id: &str) -> CaseOccurrence {
        CaseOccurrence {
            repo: repo.to_string(),
            case: case.to_string(),
            pr: pr.to_string(),
            job_name: "job".to_string(),
            job_id: job_id.to_string(),
            job_link: format!("link-{job_id}"),
        }
    }

    #[test]
    fn history_keeps_links_newest_first_and_counts_cross_pr_repeats() {
        let history = HistoryWindow::aggregate(&[
            occ("r", "T1", "100", "1"),
            occ("r", "T1", "100", "2"),
            occ("r", "T1", "101", "3"),
            occ("r", "T2", "100", "4"),
        ]);
        assert_eq!(history.len(), 2);
        assert_eq!(history.repeats(), 1);
        let t1 = history.get(&RepoCase::new("r", "T1")).unwrap();
        assert_eq!(t1.links, vec!["link-3", "link-2", "link-1"]);
        assert_eq!(t1.prs.len(), 2);
    }

    #[test]
    fn duplicate_requires_history_under_another_pr() {
        let history = HistoryWindow::aggregate(&[
            occ("r", "T1", "100", "1"),
            occ("r", "T2", "300", "2"),
        ]);
        let recurrence = Recurrence::detect(
            &history,
            &[
                occ("r", "T1", "200", "10"),
                occ("r", "T2", "300", "11"),
                occ("r", "T3", "200", "12"),
            ],
        );
        assert_eq!(recurrence.recent.len(), 3);
        assert_eq!(
            recurrence.duplicates.keys().collect::<Vec<_>>(),
            vec![&RepoCase::new("r", "T1")]
        );
        let dup = &recurrence.duplicates[&RepoCase::new("r", "T1")];
        assert_eq!(dup.links, vec!["link-10", "link-1"]);
        assert_eq!(dup.prs.iter().collect::<Vec<_>>(), vec!["200"]);
    }

    #[test]
    fn duplicate_set_does_not_depend_on_recent_row_order() {
        let history = HistoryWindow::aggregate(&[occ("r", "T1", "100", "1")]);
        let same_pr_first = Recurrence::detect(
            &history,
            &[occ("r", "T1", "100", "10"), occ("r", "T1", "200", "11")],
        );
        let other_pr_first = Recurrence::detect(
            &history,
            &[occ("r", "T1", "200", "10"), occ("r", "T1", "100", "11")],
        );
        let key = RepoCase::new("r", "T1");
        for recurrence in [&same_pr_first, &other_pr_first] {
            let dup = &recurrence.duplicates[&key];
            assert_eq!(dup.links, vec!["link-11", "link-10", "link-1"]);
            assert_eq!(dup.prs.iter().collect::<Vec<_>>(), vec!["100", "200"]);
        }
    }

    #[test]
    fn later_recent_links_are_prepended() {
        let history = HistoryWindow::aggregate(&[occ("r", "T1", "100", "1")]);
        let recurrence = Recurrence::detect(
            &history,
            &[occ("r", "T1", "200", "10"), occ("r", "T1", "201", "11")],
        );
        let dup = &recurrence.duplicates[&RepoCase::new("r", "T1")];
        assert_eq!(dup.latest_link(), Some("link-11"));
        assert_eq!(dup.links, vec!["link-11", "link-10", "link-1"]);
    }

    #[test]
    fn decisions_follow_issue_state() {
        let open = IssueState::OpenRecent {
            issue_number: "7".to_string(),
            url: "https://github.com/r/issues/7".to_string(),
        };
        let closed = IssueState::Closed {
            issue_number: "7".to_string(),
        };
        let stale = IssueState::Stale {
            issue_number: "7".to_string(),
        };
        assert_eq!(
            decide(&IssueState::NoIssue, MentionMode::Skip),
            Some(LifecycleAction::CreateNew)
        );
        assert_eq!(decide(&stale, MentionMode::Skip), Some(LifecycleAction::CreateNew));
        assert_eq!(
            decide(&closed, MentionMode::Announce),
            Some(LifecycleAction::MarkRetriggered)
        );
        assert_eq!(decide(&open, MentionMode::Skip), None);
        assert!(matches!(
            decide(&open, MentionMode::Announce),
            Some(LifecycleAction::MentionExisting { .. })
        ));
        assert_eq!(
            decide_reminder(&open, "pingcap/tidb"),
            Some(LifecycleAction::RemindPrAuthor {
                issue_number: "7".to_string(),
                issue_link: "https://github.com/pingcap/tidb/issues/7".to_string(),
            })
        );
        assert_eq!(decide_reminder(&closed, "pingcap/tidb"), None);
    }

    #[tokio::test]
    async fn resolver_prefers_open_over_closed() {
        let store = InMemoryCaseIssueStore::default();
        let projection = InMemoryIssueProjection::default();
        let key = RepoCase::new("pingcap/tidb", "T1");
        let resolver = IssueStateResolver::new(&store, &projection, RecencyInterval::default());
        assert_eq!(resolver.resolve(&key).await.unwrap(), IssueState::NoIssue);

        let mut record = CaseIssue::new(LifecycleCode::NewCase, &key, "link");
        record.mark_filed(42, "https://github.com/pingcap/tidb/issues/42");
        store.append(&record).await.unwrap();
        assert_eq!(
            resolver.resolve(&key).await.unwrap(),
            IssueState::Stale {
                issue_number: "42".to_string()
            }
        );

        projection.set_closed("pingcap/tidb", "42").await;
        assert!(matches!(
            resolver.resolve(&key).await.unwrap(),
            IssueState::Closed { .. }
        ));

        projection
            .set_open("pingcap/tidb", "42", "https://github.com/pingcap/tidb/issues/42")
            .await;
        assert!(matches!(
            resolver.resolve(&key).await.unwrap(),
            IssueState::OpenRecent { .. }
        ));
    }

    #[tokio::test]
    async fn fixture_warehouse_splits_pr_and_nightly_rows() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let warehouse =
            FixtureWarehouse::from_path(root.join("fixtures/warehouse/sample/rows.json")).unwrap();
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).single().unwrap(),
        );
        let pr_rows = warehouse.pr_case_rows(&window).await.unwrap();
        let nightly_rows = warehouse.nightly_case_rows(&window).await.unwrap();
        assert_eq!(pr_rows.len(), 2);
        assert_eq!(nightly_rows.len(), 2);
        assert!(nightly_rows.iter().all(|r| r.pr.is_none()));
    }

    #[tokio::test]
    async fn reports_are_written_with_manifest_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).single().unwrap();
        let mut outcome = TriageOutcome::start(
            RunMode::PullRequest,
            RunWindows {
                history: None,
                recent: TimeWindow::new(now - chrono::Duration::hours(4), now),
            },
        );
        let mut record = CaseIssue::new(
            LifecycleCode::NewCase,
            &RepoCase::new("pingcap/tidb", "T1"),
            "link",
        );
        record.mark_filed(9, "https://github.com/pingcap/tidb/issues/9");
        outcome.filed.push(record);
        let outcome = outcome.finish();

        let run_dir = write_run_reports(&store, &outcome).await.unwrap();
        let manifest: RunManifest = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert!(std::fs::read_to_string(run_dir.join("brief.md"))
            .unwrap()
            .contains("NEW_CASE `T1` in pingcap/tidb"));

        let digest = report_recent_markdown(5, dir.path()).unwrap();
        assert!(digest.contains(&outcome.run_id.to_string()));
        assert!(digest.contains("- filed: 1"));
    }

    #[test]
    fn labels_are_split_and_trimmed() {
        assert_eq!(
            split_labels(" component/test, , type/bug "),
            vec!["component/test".to_string(), "type/bug".to_string()]
        );
    }
}
