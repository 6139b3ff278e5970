//! Core domain model for CI case triage.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "triage-core";

/// Pull-request id used for nightly jobs, which have no pull request.
pub const NIGHTLY_PR: &str = "none";

/// Repository assigned to jobs whose owner cannot be determined.
pub const UNKNOWN_REPO: &str = "others";

pub const WINDOW_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DEFAULT_JOB_LINK_TEMPLATE: &str =
    "https://internal.pingcap.net/idc-jenkins/job/{job}/{id}/display/redirect";

pub const DEFAULT_SEARCH_INTERVAL_HOURS: i64 = 178;

pub const DEFAULT_HISTORY_DAYS: i64 = 7;

/// Composite key for everything tracked per (repository, case).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoCase {
    pub repo: String,
    pub case: String,
}

impl RepoCase {
    pub fn new(repo: impl Into<String>, case: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            case: case.into(),
        }
    }
}

impl fmt::Display for RepoCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.repo, self.case)
    }
}

/// One warehouse row: a job run and the serialized list of cases it reported.
///
/// `repo` and `pr` are absent for nightly rows. `cases` is kept in its
/// serialized form; decoding it is the extractor's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseRow {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub pr: Option<String>,
    pub cases: String,
    pub job_id: String,
    pub job_name: String,
}

/// A single failing case attributed to a repository and a job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOccurrence {
    pub repo: String,
    pub case: String,
    pub pr: String,
    pub job_name: String,
    pub job_id: String,
    pub job_link: String,
}

impl CaseOccurrence {
    pub fn key(&self) -> RepoCase {
        RepoCase::new(self.repo.clone(), self.case.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleCode {
    NewCase,
    RetriggeredCase,
}

impl LifecycleCode {
    /// Numeric code stored in the `issue_case.lifecycle` column.
    pub fn code(self) -> i64 {
        match self {
            Self::NewCase => 0,
            Self::RetriggeredCase => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::NewCase),
            1 => Some(Self::RetriggeredCase),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewCase => "NEW_CASE",
            Self::RetriggeredCase => "RETRIGGERED_CASE",
        }
    }
}

/// Append-only record of one filing decision.
///
/// `issue_number` and `issue_link` stay empty until the tracker has
/// accepted the issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseIssue {
    pub lifecycle: LifecycleCode,
    pub repo: String,
    pub issue_number: Option<i64>,
    pub issue_link: Option<String>,
    pub case: String,
    pub job_link: String,
}

impl CaseIssue {
    pub fn new(lifecycle: LifecycleCode, key: &RepoCase, job_link: impl Into<String>) -> Self {
        Self {
            lifecycle,
            repo: key.repo.clone(),
            issue_number: None,
            issue_link: None,
            case: key.case.clone(),
            job_link: job_link.into(),
        }
    }

    pub fn key(&self) -> RepoCase {
        RepoCase::new(self.repo.clone(), self.case.clone())
    }

    pub fn mark_filed(&mut self, number: i64, link: impl Into<String>) {
        self.issue_number = Some(number);
        self.issue_link = Some(link.into());
    }

    pub fn title(&self) -> String {
        match self.lifecycle {
            LifecycleCode::NewCase => format!("{} failed", self.case),
            LifecycleCode::RetriggeredCase => {
                format!("Resolved unstable case failure: {}", self.case)
            }
        }
    }

    pub fn body(&self) -> String {
        format!(
            "Latest build: <a href=\"{link}\">{link}</a>",
            link = self.job_link
        )
    }
}

pub fn issue_link(repo: &str, issue_number: &str) -> String {
    format!("https://github.com/{repo}/issues/{issue_number}")
}

pub fn format_window_time(t: DateTime<Utc>) -> String {
    t.format(WINDOW_TIME_FORMAT).to_string()
}

/// Closed time range `[start, end]` scanned in the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn formatted_start(&self) -> String {
        format_window_time(self.start)
    }

    pub fn formatted_end(&self) -> String {
        format_window_time(self.end)
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.formatted_start(), self.formatted_end())
    }
}

/// The history window ends where the recent window starts; both share the
/// boundary instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageWindows {
    pub history: TimeWindow,
    pub recent: TimeWindow,
}

impl TriageWindows {
    pub fn new(recent_start: DateTime<Utc>, now: DateTime<Utc>, history_span: Duration) -> Self {
        let recent_start = recent_start.min(now);
        Self {
            history: TimeWindow::new(recent_start - history_span, recent_start),
            recent: TimeWindow::new(recent_start, now),
        }
    }
}

/// How far back the tracker projection is searched for issue activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyInterval {
    hours: i64,
}

impl RecencyInterval {
    pub fn from_hours(hours: i64) -> Self {
        Self {
            hours: hours.max(1),
        }
    }

    pub fn hours(&self) -> i64 {
        self.hours
    }
}

impl Default for RecencyInterval {
    fn default() -> Self {
        Self::from_hours(DEFAULT_SEARCH_INTERVAL_HOURS)
    }
}

impl fmt::Display for RecencyInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.hours)
    }
}

/// URL template with `{job}` and `{id}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLinkTemplate(String);

impl JobLinkTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, job_name: &str, job_id: &str) -> String {
        self.0.replace("{job}", job_name).replace("{id}", job_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobLinkTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_LINK_TEMPLATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).single().unwrap()
    }

    #[test]
    fn window_bounds_use_warehouse_format() {
        let window = TimeWindow::new(ts(1), ts(9));
        assert_eq!(window.formatted_start(), "2026-03-02 01:00:00");
        assert_eq!(window.formatted_end(), "2026-03-02 09:00:00");
        assert!(window.contains(ts(9)));
        assert!(!window.contains(ts(10)));
    }

    #[test]
    fn history_window_shares_boundary_with_recent_window() {
        let windows = TriageWindows::new(ts(8), ts(12), Duration::days(DEFAULT_HISTORY_DAYS));
        assert_eq!(windows.history.end, windows.recent.start);
        assert_eq!(windows.history.start, ts(8) - Duration::days(7));
        assert_eq!(windows.recent.end, ts(12));
    }

    #[test]
    fn recent_start_after_now_is_clamped() {
        let windows = TriageWindows::new(ts(14), ts(12), Duration::hours(2));
        assert_eq!(windows.recent.start, ts(12));
        assert_eq!(windows.recent.end, ts(12));
        assert_eq!(windows.history.start, ts(10));
    }

    #[test]
    fn job_link_template_fills_job_and_run() {
        let link = JobLinkTemplate::default().render("tidb_ghpr_unit_test", "4412");
        assert_eq!(
            link,
            "https://internal.pingcap.net/idc-jenkins/job/tidb_ghpr_unit_test/4412/display/redirect"
        );
    }

    #[test]
    fn issue_titles_follow_lifecycle() {
        let key = RepoCase::new("pingcap/tidb", "TestIndexMerge");
        let fresh = CaseIssue::new(LifecycleCode::NewCase, &key, "link");
        let again = CaseIssue::new(LifecycleCode::RetriggeredCase, &key, "link");
        assert_eq!(fresh.title(), "TestIndexMerge failed");
        assert_eq!(again.title(), "Resolved unstable case failure: TestIndexMerge");
        assert_eq!(fresh.body(), "Latest build: <a href=\"link\">link</a>");
    }

    #[test]
    fn lifecycle_codes_match_store_encoding() {
        assert_eq!(LifecycleCode::NewCase.code(), 0);
        assert_eq!(LifecycleCode::from_code(1), Some(LifecycleCode::RetriggeredCase));
        assert_eq!(LifecycleCode::from_code(7), None);
        let json = serde_json::to_string(&LifecycleCode::RetriggeredCase).unwrap();
        assert_eq!(json, "\"RETRIGGERED_CASE\"");
    }

    #[test]
    fn recency_interval_renders_as_hours() {
        let interval = RecencyInterval::default();
        assert_eq!(interval.to_string(), "178h");
        assert_eq!(RecencyInterval::from_hours(0).hours(), 1);
    }
}
