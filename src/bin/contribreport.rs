use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use clap::{Args, Parser, Subcommand};

use contribreport::date_util::parse_date;
use contribreport::{
    BuildReport, Config, ConfigStore, ContribReport, DateRange, DetailSource, FixtureSource,
    Metric, PagedSource, Period, ProgressEvent, ProgressReporter, Selector,
};

#[derive(Parser)]
#[command(name = "contribreport", about = "Per-contributor activity reports")]
struct Cli {
    /// Config file path (default: ~/.contribreport/config.json)
    #[arg(long)]
    config: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Rows per upstream page (default: 50)
    #[arg(long)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a report and print it
    Report(ReportArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct ReportArgs {
    /// Repository to include (repeatable, or comma-separated)
    #[arg(long = "repo", value_delimiter = ',', required = true)]
    repos: Vec<String>,

    /// Start date (YYYY-MM-DD)
    #[arg(long, conflicts_with = "period")]
    since: Option<String>,

    /// End date (YYYY-MM-DD, default: today)
    #[arg(long, conflicts_with = "period")]
    until: Option<String>,

    /// Named period: 2025, 2025-Q1, 2025-01, 2025-W05, 30d, ytd, qtd, mtd
    #[arg(long)]
    period: Option<String>,

    /// Fetch task/PR details for each contributor-day
    #[arg(long)]
    details: bool,

    /// Number of contributors to list
    #[arg(long, default_value_t = 10)]
    top: usize,

    /// Metric to rank by
    #[arg(long, default_value = "contributions")]
    metric: String,

    /// Only show these identities (comma-separated canonical keys)
    #[arg(long, value_delimiter = ',')]
    visible: Vec<String>,

    /// Print the per-date series of one identity
    #[arg(long, value_name = "IDENTITY")]
    series: Option<String>,

    /// Print the detail records gathered for one identity
    #[arg(long, value_name = "IDENTITY")]
    records: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Read records from a JSON fixture instead of the upstream
    #[arg(long, value_name = "FILE")]
    fixture: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

/// Progress reporter that writes to stderr.
#[derive(Default)]
struct StderrProgress {
    line_open: AtomicBool,
}

impl ProgressReporter for StderrProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        if event.processed >= event.total {
            eprint!("\r  {}: {}/{}   \n", event.label, event.processed, event.total);
            self.line_open.store(false, Ordering::SeqCst);
        } else {
            eprint!("\r  {}: {}/{}   ", event.label, event.processed, event.total);
            self.line_open.store(true, Ordering::SeqCst);
        }
        let _ = std::io::stderr().flush();
    }

    fn on_clear(&self) {
        if self.line_open.swap(false, Ordering::SeqCst) {
            eprintln!();
        }
    }
}

fn resolve_range(args: &ReportArgs, today: NaiveDate) -> anyhow::Result<DateRange> {
    if let Some(period) = &args.period {
        return Ok(Period::parse_as_of(period, today)?.date_range()?);
    }
    let until = match &args.until {
        Some(s) => parse_date(s)?,
        None => today,
    };
    let since = match &args.since {
        Some(s) => parse_date(s)?,
        None => until - Duration::days(29),
    };
    Ok(DateRange::new(since, until)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut store = match &cli.config {
        Some(path) => ConfigStore::open_at(path)?,
        None => ConfigStore::open()?,
    };

    match cli.command {
        Commands::Config { action } => handle_config(&mut store, action)?,
        Commands::Report(args) => {
            let mut config = Config::load(&store)?;
            if let Some(page_size) = cli.page_size {
                config = config.with_page_size(page_size);
            }
            match &args.fixture {
                Some(path) => {
                    let app = ContribReport::new(FixtureSource::from_file(path)?, config);
                    handle_report(app, &args).await?;
                }
                None => handle_report(ContribReport::from_config(config)?, &args).await?,
            }
        }
    }
    Ok(())
}

fn handle_config(store: &mut ConfigStore, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match store.get(&key) {
            Some(v) if key == "token" => println!("{key} = {}", mask(v)),
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            store.set(&key, &value)?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = store.list();
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    if k == "token" {
                        println!("{k} = {}", mask(&v));
                    } else {
                        println!("{k} = {v}");
                    }
                }
            }
        }
    }
    Ok(())
}

fn mask(token: &str) -> String {
    let tail: String = token.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{tail}")
}

async fn handle_report<S: PagedSource + DetailSource>(
    app: ContribReport<S>,
    args: &ReportArgs,
) -> anyhow::Result<()> {
    let metric: Metric = args.metric.parse()?;
    if metric.is_detail() && !args.details {
        log::warn!("{metric} is only filled in by enrichment; pass --details");
    }
    let range = resolve_range(args, chrono::Local::now().date_naive())?;
    let selector = Selector::new(args.repos.iter().map(String::as_str));

    app.on_progress(Arc::new(StderrProgress::default()));
    let report = app.start_build(selector, range, args.details).await?;
    if !args.visible.is_empty() {
        app.set_visible_identities(args.visible.iter().map(String::as_str));
    }

    if args.json {
        let output = serde_json::json!({
            "build": report,
            "snapshot": app.snapshot(),
            "summary": app.snapshot().map(|s| s.summary()),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print_report(&app, &report, metric, args.top);
    if let Some(identity) = &args.series {
        print_series(&app, identity);
    }
    if let Some(identity) = &args.records {
        print_records(&app, identity);
    }
    Ok(())
}

fn print_report<S: PagedSource + DetailSource>(
    app: &ContribReport<S>,
    report: &BuildReport,
    metric: Metric,
    top: usize,
) {
    println!("Contributors: {} over {}", report.selector, report.range);
    if let Some(error) = &report.error {
        println!("  warning: {error}");
    }

    let ranked = app.top_n(metric, top);
    if ranked.is_empty() {
        println!("No contributions found.");
        return;
    }
    println!("\nTop {} by {metric}", ranked.len());
    println!(
        "  {:>4}  {:<28} {:>10} {:>10} {:>10} {:>8}",
        "#", "contributor", "commits", "added", "removed", "tasks"
    );
    for (i, row) in ranked.iter().enumerate() {
        println!(
            "  {:>4}  {:<28} {:>10} {:>10} {:>10} {:>8}",
            i + 1,
            truncate(&row.display_label, 28),
            row.totals.get(Metric::Contributions),
            row.totals.get(Metric::AddedLines),
            row.totals.get(Metric::RemovedLines),
            row.totals.get(Metric::Tasks),
        );
    }

    if let Some(snapshot) = app.snapshot() {
        let summary = snapshot.summary();
        println!(
            "\n{} contributors across {} repositories, {} active days",
            summary.identities, summary.repositories, summary.active_days
        );
        for repo in snapshot.repository_totals() {
            println!(
                "  {}: {} contributors, {} commits",
                repo.repository,
                repo.contributors,
                repo.totals.get(Metric::Contributions)
            );
        }
    }
}

fn print_series<S: PagedSource + DetailSource>(app: &ContribReport<S>, identity: &str) {
    let label = app.display_label(identity).unwrap_or_else(|| identity.to_string());
    let points = app.time_series(identity);
    if points.is_empty() {
        println!("\nNo activity for {label}.");
        return;
    }
    println!("\nDaily activity for {label}");
    for point in points {
        let values: Vec<String> = point
            .values
            .iter()
            .filter(|(_, v)| *v > 0)
            .map(|(m, v)| format!("{m}={v}"))
            .collect();
        println!("  {}  {}", point.date, values.join(" "));
    }
}

fn print_records<S: PagedSource + DetailSource>(app: &ContribReport<S>, identity: &str) {
    let records = app.details_for(identity);
    if records.is_empty() {
        println!("\nNo detail records for {identity} (run with --details).");
        return;
    }
    println!("\nDetail records for {identity}");
    for r in records {
        let task = r.task_ref.as_deref().unwrap_or(&r.id);
        let branch = r.branch_name.as_deref().unwrap_or("-");
        let approver = r.approver.as_deref().unwrap_or("-");
        println!(
            "  {} {task} [{branch}] +{} -{} ~{} approved by {approver}",
            r.date, r.files_added, r.files_deleted, r.files_modified
        );
        if let Some(link) = &r.external_link {
            println!("    {link}");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('~');
        out
    }
}
