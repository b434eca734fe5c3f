use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rostersync_core::config::{RosterConfig, RunMode, SourceProfile, load_config};
use rostersync_core::document::Document;
use rostersync_core::extract::extract_ranked;
use rostersync_core::reconcile::{
    CancelFlag, EntryReport, FlagReason, NoopObserver, Outcome, RunObserver, RunOptions,
    RunReport, run_reconciliation,
};
use rostersync_core::resolve::resolve_address;
use rostersync_core::roster::discover_entries;
use rostersync_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready, init_layout,
    inspect_runtime, resolve_paths,
};
use rostersync_core::source::{HttpSource, HttpSourceConfig, PageSource};
use rostersync_core::store::{CanonicalStore, SqliteStore, Team};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "rostersync=info,rostersync_core=info";

#[derive(Debug, Parser)]
#[command(
    name = "rostersync",
    version,
    about = "Reconcile athlete rosters and photos from school athletics sites"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, help = "Emit machine-readable JSON output")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    db: Option<PathBuf>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            db: cli.db.clone(),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Reconcile rosters against the canonical store (default)")]
    Run(RunArgs),
    #[command(about = "Create the state directory, default config and database")]
    Init(InitArgs),
    Team(TeamArgs),
    Athletes(AthletesArgs),
    #[command(about = "Fetch one page and show roster entries and ranked photo candidates")]
    Inspect(InspectArgs),
    #[command(about = "Apply proxy decoding and quality upgrade to one address")]
    Resolve(ResolveArgs),
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    #[arg(long, help = "Report decisions without writing to the store")]
    dry_run: bool,
    #[arg(long = "team", value_name = "ID", help = "Limit the run to these team ids")]
    teams: Vec<String>,
    #[arg(long, value_name = "MODE", help = "update-only or update-and-insert")]
    mode: Option<String>,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct TeamArgs {
    #[command(subcommand)]
    command: TeamSubcommand,
}

#[derive(Debug, Subcommand)]
enum TeamSubcommand {
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_name = "URL")]
        logo: String,
        #[arg(long, value_name = "URL")]
        roster: String,
    },
    List,
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct AthletesArgs {
    #[arg(value_name = "TEAM_ID")]
    team_id: Option<String>,
    #[command(subcommand)]
    command: Option<AthletesSubcommand>,
}

#[derive(Debug, Subcommand)]
enum AthletesSubcommand {
    Delete {
        #[arg(value_name = "ATHLETE_ID")]
        id: i64,
    },
}

#[derive(Debug, Args)]
struct InspectArgs {
    url: String,
    #[arg(long, value_name = "NAME", help = "Use a named [[sources]] profile")]
    source: Option<String>,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    url: String,
    #[arg(long, value_name = "NAME", help = "Use a named [[sources]] profile")]
    source: Option<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Run(args)) => run_reconcile(&runtime, args),
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Team(TeamArgs { command })) => match command {
            TeamSubcommand::Add {
                id,
                name,
                logo,
                roster,
            } => run_team_add(
                &runtime,
                Team {
                    id,
                    name,
                    logo_address: logo,
                    roster_address: roster,
                },
            ),
            TeamSubcommand::List => run_team_list(&runtime),
        },
        Some(Commands::Athletes(args)) => match (args.command, args.team_id) {
            (Some(AthletesSubcommand::Delete { id }), _) => run_athlete_delete(&runtime, id),
            (None, Some(team_id)) => run_athlete_list(&runtime, &team_id),
            (None, None) => bail!("athletes requires a TEAM_ID or the `delete` subcommand"),
        },
        Some(Commands::Inspect(args)) => run_inspect(&runtime, args),
        Some(Commands::Resolve(args)) => run_resolve(&runtime, args),
        None => run_reconcile(&runtime, RunArgs::default()),
    }
}

/// Prints one stdout line per finished entry.
struct LineObserver;

impl RunObserver for LineObserver {
    fn team_started(&mut self, team: &Team, entries: usize) {
        println!("team: {} ({}) entries={entries}", team.id, team.name);
    }

    fn team_failed(&mut self, team_id: &str, error: &str) {
        println!("team: {team_id} failed: {error}");
    }

    fn entry_finished(&mut self, entry: &EntryReport) {
        println!("{}", format_entry(entry));
    }
}

fn format_entry(entry: &EntryReport) -> String {
    let mut line = format!(
        "[{}] {} | {} | {}",
        entry.outcome.label(),
        entry.team_id,
        entry.display_name,
        entry.profile_address
    );
    if let Some(photo) = &entry.photo_address {
        line.push_str(&format!(" | photo={photo}"));
        if entry.used_fallback {
            line.push_str(" (logo fallback)");
        }
    }
    if let Some(id) = entry.athlete_id {
        line.push_str(&format!(" | athlete={id}"));
    }
    match &entry.outcome {
        Outcome::Flagged { reason } => match reason {
            FlagReason::DuplicateMatch { athlete_ids } => {
                let ids = athlete_ids
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                line.push_str(&format!(" | candidates={ids}"));
            }
            FlagReason::StoreWrite { message } => {
                line.push_str(&format!(" | error={message}"));
            }
        },
        _ => {
            if let Some(detail) = &entry.detail {
                line.push_str(&format!(" | {detail}"));
            }
        }
    }
    line
}

fn run_reconcile(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;

    let mut options = RunOptions::from_config(&config)?;
    if let Some(mode) = args.mode.as_deref() {
        options.mode = RunMode::parse(mode)?;
    }
    if !args.teams.is_empty() {
        options.teams = args.teams;
    }
    options.dry_run |= args.dry_run;

    let mut store = SqliteStore::open(&paths.db_path)?;
    let mut source = HttpSource::new(HttpSourceConfig::from_section(&config.http))?;

    if runtime.json {
        for warning in &status.warnings {
            eprintln!("warning: {warning}");
        }
    } else {
        println!("reconcile run");
        println!("config_exists: {}", format_flag(status.config_exists));
        println!("db_path: {}", normalize_path(&paths.db_path));
        println!("db_exists: {}", format_flag(status.db_exists));
        println!(
            "db_size_bytes: {}",
            status
                .db_size_bytes
                .map(|size| size.to_string())
                .unwrap_or_else(|| "n/a".to_string())
        );
        println!("mode: {}", options.mode.as_str());
        println!("dry_run: {}", options.dry_run);
        if !status.warnings.is_empty() {
            println!("warnings:");
            for warning in &status.warnings {
                println!("  - {warning}");
            }
        }
    }
    let mut observer: Box<dyn RunObserver> = if runtime.json {
        Box::new(NoopObserver)
    } else {
        Box::new(LineObserver)
    };
    let report = run_reconciliation(
        &config,
        &options,
        &mut source,
        &mut store,
        observer.as_mut(),
        &CancelFlag::default(),
    )?;

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_summary(&report, source.request_count());
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_run_summary(report: &RunReport, requests: usize) {
    let failed_teams = report
        .teams
        .iter()
        .filter(|team| team.error.is_some())
        .count();
    println!("summary.teams: {}", report.teams.len());
    println!("summary.teams_failed: {failed_teams}");
    println!("summary.entries: {}", report.entries.len());
    println!("summary.updated: {}", report.counts.updated);
    println!("summary.inserted: {}", report.counts.inserted);
    println!("summary.unchanged: {}", report.counts.unchanged);
    println!("summary.skipped: {}", report.counts.skipped);
    println!("summary.flagged: {}", report.counts.flagged);
    println!("summary.writes: {}", report.counts.writes);
    println!("summary.requests: {requests}");
    if report.cancelled {
        println!("summary.cancelled: yes");
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let mut paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;
    let config = load_config(&paths.config_path)?;
    paths.apply_config(&config);
    SqliteStore::open(&paths.db_path)?;

    println!("Initialized rostersync runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_team_add(runtime: &RuntimeOptions, team: Team) -> Result<()> {
    let (paths, _) = load_runtime(runtime)?;
    let mut store = SqliteStore::open(&paths.db_path)?;
    store
        .upsert_team(&team)
        .with_context(|| format!("failed to save team {}", team.id))?;
    println!("team saved: {}", team.id);
    Ok(())
}

fn run_team_list(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, _) = load_runtime(runtime)?;
    let store = SqliteStore::open(&paths.db_path)?;
    let teams = store.list_teams().context("failed to list teams")?;
    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&teams)?);
        return Ok(());
    }
    println!("teams.count: {}", teams.len());
    for team in teams {
        println!(
            "team: {} | {} | roster={} | logo={}",
            team.id, team.name, team.roster_address, team.logo_address
        );
    }
    Ok(())
}

fn run_athlete_list(runtime: &RuntimeOptions, team_id: &str) -> Result<()> {
    let (paths, _) = load_runtime(runtime)?;
    let store = SqliteStore::open(&paths.db_path)?;
    if store.get_team(team_id)?.is_none() {
        bail!("unknown team: {team_id}");
    }
    let athletes = store
        .list_athletes(team_id)
        .with_context(|| format!("failed to list athletes for {team_id}"))?;
    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&athletes)?);
        return Ok(());
    }
    println!("athletes.count: {}", athletes.len());
    for athlete in athletes {
        println!(
            "athlete: {} | {} | photo={} | profile={}",
            athlete.id,
            athlete.name,
            athlete.photo_address.as_deref().unwrap_or("<none>"),
            athlete.profile_address.as_deref().unwrap_or("<none>")
        );
    }
    Ok(())
}

fn run_athlete_delete(runtime: &RuntimeOptions, id: i64) -> Result<()> {
    let (paths, _) = load_runtime(runtime)?;
    let mut store = SqliteStore::open(&paths.db_path)?;
    store
        .delete_athlete(id)
        .with_context(|| format!("failed to delete athlete {id}"))?;
    println!("athlete deleted: {id}");
    Ok(())
}

fn run_inspect(runtime: &RuntimeOptions, args: InspectArgs) -> Result<()> {
    let (_, config) = load_runtime(runtime)?;
    let profile = select_profile(&config, &args.url, args.source.as_deref())?;
    let mut source = HttpSource::new(HttpSourceConfig::from_section(&config.http))?;
    let document = source
        .fetch(&args.url)
        .with_context(|| format!("failed to fetch {}", args.url))?;

    let entries = discover_entries(&document, &profile.roster);
    let extraction = extract_ranked(&document, &profile.extraction);

    if runtime.json {
        let payload = serde_json::json!({
            "address": document.address(),
            "source": profile.name,
            "entries": entries,
            "ranked": extraction.ranked,
            "rejected": extraction.rejected,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("inspect");
    println!("address: {}", document.address());
    println!("source: {}", profile.name);
    println!("roster_entries.count: {}", entries.len());
    for entry in &entries {
        println!("roster_entry: {} | {}", entry.display_name, entry.profile_address);
    }
    println!("candidates.count: {}", extraction.ranked.len());
    for candidate in &extraction.ranked {
        let resolution = resolve_address(&candidate.address, &profile.resolver);
        println!(
            "candidate: {}x{} ratio={:.3} | {} -> {}",
            candidate.width,
            candidate.height,
            candidate.aspect_ratio,
            candidate.address,
            resolution.resolved
        );
    }
    println!("rejected.count: {}", extraction.rejected.len());
    for rejection in &extraction.rejected {
        println!("rejected: {:?} | {}", rejection.reason, rejection.address);
    }
    Ok(())
}

fn run_resolve(runtime: &RuntimeOptions, args: ResolveArgs) -> Result<()> {
    let (_, config) = load_runtime(runtime)?;
    let profile = select_profile(&config, &args.url, args.source.as_deref())?;
    let resolution = resolve_address(&args.url, &profile.resolver);
    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&resolution)?);
        return Ok(());
    }
    println!("source: {}", profile.name);
    println!("original: {}", resolution.original);
    println!("resolved: {}", resolution.resolved);
    println!("proxy_decoded: {}", format_flag(resolution.proxy_decoded));
    println!("upgraded: {}", format_flag(resolution.upgraded));
    Ok(())
}

fn select_profile(
    config: &RosterConfig,
    address: &str,
    name: Option<&str>,
) -> Result<SourceProfile> {
    match name {
        Some(name) => config.profile_named(name),
        None => Ok(config.profile_for_address(address)),
    }
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, RosterConfig)> {
    let mut paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    paths.apply_config(&config);
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
        db: runtime.db.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
