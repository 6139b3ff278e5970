//! Row extraction, repository classification and case-name normalization.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use triage_core::{CaseOccurrence, JobLinkTemplate, WarehouseRow, NIGHTLY_PR, UNKNOWN_REPO};

pub const CRATE_NAME: &str = "triage-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("malformed case list for job {job_name}#{job_id}: {source}")]
    MalformedCases {
        job_name: String,
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("row is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading repo rules {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing repo rules: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("repo rule #{index} has an empty {field}")]
    Empty { index: usize, field: &'static str },
}

/// Which of a job's reported cases take part in triage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSelection {
    /// Only the first reported case per job run; the rest is noise from the
    /// same breakage.
    #[default]
    FirstOnly,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRule {
    pub prefix: String,
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RepoRulesFile {
    #[serde(default)]
    rules: Vec<RepoRule>,
}

/// Maps CI job names to the repository that owns them, first matching
/// prefix wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoClassifier {
    rules: Vec<RepoRule>,
}

impl RepoClassifier {
    pub fn new(rules: Vec<RepoRule>) -> Self {
        Self { rules }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            RepoRule {
                prefix: "tidb_ghpr".to_string(),
                repo: "pingcap/tidb".to_string(),
            },
            RepoRule {
                prefix: "tikv_ghpr".to_string(),
                repo: "tikv/tikv".to_string(),
            },
            RepoRule {
                prefix: "pd_ghpr".to_string(),
                repo: "tikv/pd".to_string(),
            },
        ])
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleError> {
        let file: RepoRulesFile = serde_yaml::from_str(text)?;
        for (index, rule) in file.rules.iter().enumerate() {
            if rule.prefix.trim().is_empty() {
                return Err(RuleError::Empty {
                    index,
                    field: "prefix",
                });
            }
            if rule.repo.trim().is_empty() {
                return Err(RuleError::Empty {
                    index,
                    field: "repo",
                });
            }
        }
        Ok(Self::new(file.rules))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn classify(&self, job_name: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| job_name.starts_with(rule.prefix.as_str()))
            .map(|rule| rule.repo.as_str())
            .unwrap_or(UNKNOWN_REPO)
    }
}

impl Default for RepoClassifier {
    fn default() -> Self {
        Self::builtin()
    }
}

/// A family of case names whose instances should collapse into one tracked
/// case.
pub trait CaseNameMatcher: Send + Sync {
    fn family(&self) -> &'static str;
    fn matches(&self, name: &str) -> bool;
    fn canonicalize(&self, name: &str) -> String;
}

fn sql_statement_case_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<test>\S+)\s+sql:\s*(?P<stmt>\S.*)$").expect("static regex is valid")
    })
}

fn sql_string_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#).expect("static regex is valid"))
}

fn sql_number_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("static regex is valid"))
}

/// Statement tests reported as `<test> sql:<statement>`; instances differing
/// only in literals share one canonical name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlStatementMatcher;

impl CaseNameMatcher for SqlStatementMatcher {
    fn family(&self) -> &'static str {
        "sql-statement"
    }

    fn matches(&self, name: &str) -> bool {
        sql_statement_case_re().is_match(name)
    }

    fn canonicalize(&self, name: &str) -> String {
        let Some(caps) = sql_statement_case_re().captures(name) else {
            return name.to_string();
        };
        let stmt = sql_string_literal_re().replace_all(&caps["stmt"], "?");
        let stmt = sql_number_literal_re().replace_all(&stmt, "?");
        let stmt = stmt.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{} sql:{}", &caps["test"], stmt)
    }
}

pub struct CaseNormalizer {
    matchers: Vec<Box<dyn CaseNameMatcher>>,
}

impl CaseNormalizer {
    pub fn empty() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: Box<dyn CaseNameMatcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn canonical(&self, name: &str) -> String {
        self.matchers
            .iter()
            .find(|m| m.matches(name))
            .map(|m| m.canonicalize(name))
            .unwrap_or_else(|| name.to_string())
    }
}

impl Default for CaseNormalizer {
    fn default() -> Self {
        Self::empty().with_matcher(Box::new(SqlStatementMatcher))
    }
}

/// Decodes the case list keeping payload positions; blank names stay in
/// place so first-case selection sees the payload as reported.
pub fn decode_case_list(raw: &str) -> Result<Vec<String>, serde_json::Error> {
    let cases: Vec<String> = serde_json::from_str(raw)?;
    Ok(cases.into_iter().map(|c| c.trim().to_string()).collect())
}

/// Turns warehouse rows into case occurrences.
pub struct CaseExtractor {
    classifier: RepoClassifier,
    normalizer: CaseNormalizer,
    links: JobLinkTemplate,
    selection: CaseSelection,
}

impl CaseExtractor {
    pub fn new(classifier: RepoClassifier, links: JobLinkTemplate) -> Self {
        Self {
            classifier,
            normalizer: CaseNormalizer::default(),
            links,
            selection: CaseSelection::default(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: CaseNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_selection(mut self, selection: CaseSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Pull-request row. The warehouse repository wins; job-name
    /// classification is the fallback when it is missing.
    pub fn extract_pr_row(&self, row: &WarehouseRow) -> Result<Vec<CaseOccurrence>, ExtractError> {
        let repo = match row.repo.as_deref().map(str::trim) {
            Some(repo) if !repo.is_empty() => repo.to_string(),
            _ => self.classifier.classify(&row.job_name).to_string(),
        };
        let pr = row
            .pr
            .as_deref()
            .map(str::trim)
            .filter(|pr| !pr.is_empty())
            .unwrap_or(NIGHTLY_PR)
            .to_string();
        self.extract(row, repo, pr)
    }

    /// Nightly row: no pull request, repository always from the job name.
    pub fn extract_nightly_row(
        &self,
        row: &WarehouseRow,
    ) -> Result<Vec<CaseOccurrence>, ExtractError> {
        let repo = self.classifier.classify(&row.job_name).to_string();
        self.extract(row, repo, NIGHTLY_PR.to_string())
    }

    fn extract(
        &self,
        row: &WarehouseRow,
        repo: String,
        pr: String,
    ) -> Result<Vec<CaseOccurrence>, ExtractError> {
        if row.job_name.trim().is_empty() {
            return Err(ExtractError::MissingField("job_name"));
        }
        if row.job_id.trim().is_empty() {
            return Err(ExtractError::MissingField("job_id"));
        }
        let cases = decode_case_list(&row.cases).map_err(|source| ExtractError::MalformedCases {
            job_name: row.job_name.clone(),
            job_id: row.job_id.clone(),
            source,
        })?;
        if repo == UNKNOWN_REPO {
            return Ok(Vec::new());
        }

        let take = match self.selection {
            CaseSelection::FirstOnly => 1,
            CaseSelection::All => cases.len(),
        };
        let job_link = self.links.render(&row.job_name, &row.job_id);
        Ok(cases
            .iter()
            .take(take)
            .filter(|case| !case.is_empty())
            .map(|case| CaseOccurrence {
                repo: repo.clone(),
                case: self.normalizer.canonical(case),
                pr: pr.clone(),
                job_name: row.job_name.clone(),
                job_id: row.job_id.clone(),
                job_link: job_link.clone(),
            })
            .collect())
    }
}

impl Default for CaseExtractor {
    fn default() -> Self {
        Self::new(RepoClassifier::builtin(), JobLinkTemplate::default())
    }
}

/// Occurrences extracted from a batch, plus the rows that could not be read.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBatch {
    pub occurrences: Vec<CaseOccurrence>,
    pub scanned_rows: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    PullRequest,
    Nightly,
}

impl CaseExtractor {
    /// Extracts a whole batch. Bad rows are logged and skipped.
    pub fn extract_batch(&self, rows: &[WarehouseRow], kind: RowKind) -> ExtractedBatch {
        let mut batch = ExtractedBatch {
            scanned_rows: rows.len(),
            ..Default::default()
        };
        for row in rows {
            let extracted = match kind {
                RowKind::PullRequest => self.extract_pr_row(row),
                RowKind::Nightly => self.extract_nightly_row(row),
            };
            match extracted {
                Ok(occurrences) => batch.occurrences.extend(occurrences),
                Err(err) => {
                    tracing::warn!(job = %row.job_name, job_id = %row.job_id, error = %err, "skipping warehouse row");
                    batch.skipped_rows += 1;
                }
            }
        }
        batch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureRow {
    pub reported_at: DateTime<Utc>,
    #[serde(flatten)]
    pub row: WarehouseRow,
}

/// Captured warehouse rows used for offline runs and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    pub fixture_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub rows: Vec<FixtureRow>,
}

pub fn load_fixture_rows(path: impl AsRef<Path>) -> Result<FixtureFile> {
    let mut file: FixtureFile = read_json_file(path)?;
    file.rows.sort_by_key(|r| r.reported_at);
    Ok(file)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
