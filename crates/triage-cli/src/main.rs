use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use triage_adapters::load_fixture_rows;
use triage_core::{TimeWindow, TriageWindows};
use triage_storage::{DryRunTracker, GithubTracker, IssueTracker, ReportStore, TrackerGateway};
use triage_sync::mysql::{self, MySqlCaseIssueStore, MySqlIssueProjection, MySqlWarehouse};
use triage_sync::{
    report_recent_markdown, write_run_reports, CaseIssueStore, FixtureWarehouse,
    InMemoryCaseIssueStore, InMemoryIssueProjection, IssueProjection, TriageConfig,
    TriageOutcome, TriagePipeline, Warehouse,
};

#[derive(Debug, Parser)]
#[command(name = "triage-cli")]
#[command(about = "CI case-failure triage")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Files issues for cases failing on more than one pull request.
    Pr(RunArgs),
    /// Files issues for cases failing in nightly jobs.
    Nightly(RunArgs),
    /// Applies the issue_case migrations to the CI database.
    Migrate,
    /// Prints a digest of the latest runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Length of the recent window, ending now.
    #[arg(long, default_value_t = 4)]
    recent_hours: i64,
    /// History look-back before the recent window.
    #[arg(long)]
    history_days: Option<i64>,
    /// Start of the recent window (RFC 3339); wins over --recent-hours.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    /// End of the recent window (RFC 3339). Defaults to now, or to the
    /// capture time when running from fixtures.
    #[arg(long)]
    now: Option<DateTime<Utc>>,
    /// Log tracker calls instead of making them and skip store writes.
    #[arg(long)]
    dry_run: bool,
    /// Read warehouse rows from a JSON fixture instead of MySQL.
    #[arg(long)]
    fixtures: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "triage=info,triage_sync=info,triage_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = TriageConfig::from_env();

    match cli.command.unwrap_or(Commands::Pr(RunArgs::default_run())) {
        Commands::Pr(args) => {
            if let Some(days) = args.history_days {
                config.history_days = days;
            }
            let (pipeline, now) = build_pipeline(&config, &args).await?;
            let recent_start = args
                .since
                .unwrap_or_else(|| now - Duration::hours(args.recent_hours.max(1)));
            let windows = TriageWindows::new(recent_start, now, config.history_span());
            let outcome = pipeline.run_pr_triage(windows).await?;
            finish_run(&config, &outcome).await?;
        }
        Commands::Nightly(args) => {
            let (pipeline, now) = build_pipeline(&config, &args).await?;
            let start = args
                .since
                .unwrap_or_else(|| now - Duration::hours(args.recent_hours.max(1)));
            let outcome = pipeline
                .run_nightly_triage(TimeWindow::new(start, now))
                .await?;
            finish_run(&config, &outcome).await?;
        }
        Commands::Migrate => {
            let pool = mysql::connect(&config.ci_database_url).await?;
            mysql::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}

impl RunArgs {
    fn default_run() -> Self {
        Self {
            recent_hours: 4,
            history_days: None,
            since: None,
            now: None,
            dry_run: false,
            fixtures: None,
        }
    }
}

async fn build_pipeline(
    config: &TriageConfig,
    args: &RunArgs,
) -> Result<(TriagePipeline, DateTime<Utc>)> {
    let extractor = config.load_extractor()?;

    let tracker: Box<dyn IssueTracker> = if args.dry_run {
        Box::<DryRunTracker>::default()
    } else {
        Box::new(GithubTracker::new(config.github_tracker_config())?)
    };
    let gateway = TrackerGateway::new(tracker, config.retry_policy())
        .with_sandbox_repo(config.sandbox_repo.clone());

    let (warehouse, store, projection, now): (
        Box<dyn Warehouse>,
        Box<dyn CaseIssueStore>,
        Box<dyn IssueProjection>,
        DateTime<Utc>,
    ) = match &args.fixtures {
        Some(path) => {
            let fixture = load_fixture_rows(path)
                .with_context(|| format!("loading fixtures from {}", path.display()))?;
            let now = args.now.unwrap_or(fixture.captured_at);
            (
                Box::new(FixtureWarehouse::new(fixture)),
                Box::<InMemoryCaseIssueStore>::default(),
                Box::<InMemoryIssueProjection>::default(),
                now,
            )
        }
        None => {
            let ci_pool = mysql::connect(&config.ci_database_url).await?;
            let github_pool = mysql::connect(&config.github_database_url).await?;
            (
                Box::new(MySqlWarehouse::new(ci_pool.clone())),
                Box::new(MySqlCaseIssueStore::new(ci_pool)),
                Box::new(MySqlIssueProjection::new(github_pool)),
                args.now.unwrap_or_else(Utc::now),
            )
        }
    };

    let pipeline = TriagePipeline::new(warehouse, store, projection, gateway, extractor)
        .with_settings(config.engine_settings(args.dry_run));
    Ok((pipeline, now))
}

async fn finish_run(config: &TriageConfig, outcome: &TriageOutcome) -> Result<()> {
    let reports = ReportStore::new(config.reports_dir.clone());
    let run_dir = write_run_reports(&reports, outcome).await?;
    println!(
        "triage complete: run_id={} mode={} duplicates={} filed={} mentions={} reminders={} failures={} reports={}",
        outcome.run_id,
        outcome.mode.as_str(),
        outcome.duplicate_cases,
        outcome.filed.len(),
        outcome.mentions.len(),
        outcome.reminders.len(),
        outcome.failures.len(),
        run_dir.display()
    );
    Ok(())
}
