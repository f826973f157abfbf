use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use skill_unlocks_core::cache::CacheStore;
use skill_unlocks_core::client::MediaWikiClient;
use skill_unlocks_core::config::{ResolvedSettings, load_config, write_default_config};
use skill_unlocks_core::model::{Skill, SkillData, Unlock};
use skill_unlocks_core::parser::parse_skill_page;
use skill_unlocks_core::repository::{InitOutcome, UnlockRepository};
use skill_unlocks_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, inspect_runtime, normalize_for_display,
    resolve_paths,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "skill_unlocks",
    version,
    about = "Reads skill level up tables from the wiki and answers unlock queries"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Write a config.toml populated with defaults")]
    Init(InitArgs),
    #[command(about = "Load unlock data from cache or fetch it from the wiki")]
    Sync(SyncArgs),
    #[command(about = "Clear the cache and fetch every skill again")]
    Refresh,
    #[command(about = "Show unlocks for a skill")]
    Show(ShowArgs),
    #[command(about = "Show the next unlocks above a level")]
    Next(NextArgs),
    #[command(about = "Search unlock names and descriptions across all skills")]
    Search(SearchArgs),
    #[command(about = "Parse a saved level up table page without touching the network")]
    Parse(ParseArgs),
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, help = "Ignore a fresh cache and fetch from the wiki")]
    force: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    skill: Skill,
    #[arg(long, value_parser = level_parser(), conflicts_with = "up_to")]
    level: Option<u8>,
    #[arg(long, value_parser = level_parser())]
    up_to: Option<u8>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct NextArgs {
    skill: Skill,
    #[arg(value_parser = level_parser())]
    level: u8,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    term: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ParseArgs {
    skill: Skill,
    file: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Debug, Subcommand)]
enum CacheSubcommand {
    Status,
    Clear,
}

fn level_parser() -> clap::builder::RangedI64ValueParser<u8> {
    clap::value_parser!(u8).range(1..=99)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Refresh) => run_refresh(&runtime),
        Some(Commands::Show(args)) => run_show(&runtime, args),
        Some(Commands::Next(args)) => run_next(&runtime, args),
        Some(Commands::Search(args)) => run_search(&runtime, args),
        Some(Commands::Parse(args)) => run_parse(args),
        Some(Commands::Cache(CacheArgs { command })) => match command {
            CacheSubcommand::Status => run_cache_status(&runtime),
            CacheSubcommand::Clear => run_cache_clear(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let wrote = write_default_config(&paths.config_path, args.force)?;

    println!("init");
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("wrote_config: {}", format_flag(wrote));
    if !wrote {
        println!("hint: pass --force to overwrite the existing file");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let repository = UnlockRepository::open(&paths, &settings)?;

    let outcome = repository.initialize(
        args.force || settings.refresh_on_startup,
        settings.cache_expiry_hours,
    );
    repository.shutdown();

    print_outcome("sync", &outcome, &repository);
    print_diagnostics(runtime, &paths);
    ensure_ready(outcome)
}

fn run_refresh(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let repository = UnlockRepository::open(&paths, &settings)?;

    let outcome = repository.refresh_data();
    repository.shutdown();

    print_outcome("refresh", &outcome, &repository);
    print_diagnostics(runtime, &paths);
    ensure_ready(outcome)
}

fn run_show(runtime: &RuntimeOptions, args: ShowArgs) -> Result<()> {
    let (paths, repository) = ready_repository(runtime)?;

    if let Some(level) = args.level {
        let unlocks = repository.get_unlocks_for_level(args.skill, level);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&unlocks)?);
        } else {
            println!("{} level {level}", args.skill);
            print_unlocks(&unlocks);
        }
    } else if let Some(max_level) = args.up_to {
        let groups = repository.get_unlocks_up_to_level(args.skill, max_level);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&groups)?);
        } else {
            println!("{} up to level {max_level}", args.skill);
            print_groups(&groups);
        }
    } else {
        match repository.get_skill_data(args.skill) {
            Some(data) if args.json => println!("{}", serde_json::to_string_pretty(&data)?),
            Some(data) => print_skill_data(&data),
            None => println!("no unlock data for {}", args.skill),
        }
    }

    repository.shutdown();
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_next(runtime: &RuntimeOptions, args: NextArgs) -> Result<()> {
    let (paths, repository) = ready_repository(runtime)?;

    let next = repository.get_next_unlock(args.skill, args.level);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&next)?);
    } else {
        match next {
            Some(group) => {
                println!("{} next unlocks at level {}", args.skill, group.level);
                print_unlocks(&group.unlocks);
            }
            None => println!("no unlocks for {} above level {}", args.skill, args.level),
        }
    }

    repository.shutdown();
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let (paths, repository) = ready_repository(runtime)?;

    let matches = repository.search_unlocks(&args.term);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&matches)?);
    } else {
        println!("search: {}", args.term);
        println!("matches: {}", matches.len());
        for found in &matches {
            println!(
                "  [{} {}] {}",
                found.skill, found.unlock.level, found.unlock.name
            );
        }
    }

    repository.shutdown();
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_parse(args: ParseArgs) -> Result<()> {
    let wikitext = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let data = parse_skill_page(args.skill, &wikitext);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        print_skill_data(&data);
    }
    Ok(())
}

fn run_cache_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let status = inspect_runtime(&paths)?;
    let store = CacheStore::new(&paths.cache_path);

    println!("cache status");
    println!("cache_path: {}", normalize_for_display(&paths.cache_path));
    println!("cache_exists: {}", format_flag(status.cache_exists));
    println!(
        "cache_size_bytes: {}",
        status
            .cache_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "<missing>".to_string())
    );
    println!(
        "cache_modified_at: {}",
        status
            .cache_modified_at
            .map(|modified| modified.to_rfc3339())
            .unwrap_or_else(|| "<missing>".to_string())
    );
    println!("expiry_hours: {}", settings.cache_expiry_hours);
    println!(
        "expired: {}",
        format_flag(store.is_expired(settings.cache_expiry_hours))
    );
    match store.read() {
        Ok(Some(snapshot)) => {
            let unlocks: usize = snapshot.skill_data.values().map(SkillData::unlock_count).sum();
            println!("last_updated: {}", snapshot.last_updated.to_rfc3339());
            println!("skills: {}", snapshot.skill_data.len());
            println!("unlocks: {unlocks}");
        }
        Ok(None) => println!("skills: 0"),
        Err(error) => println!("unreadable: {error:#}"),
    }
    println!("config_exists: {}", format_flag(status.config_exists));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_cache_clear(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let removed = CacheStore::new(&paths.cache_path).remove()?;

    println!("cache clear");
    println!("cache_path: {}", normalize_for_display(&paths.cache_path));
    println!("removed: {}", format_flag(removed));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn ready_repository(
    runtime: &RuntimeOptions,
) -> Result<(ResolvedPaths, UnlockRepository<MediaWikiClient>)> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let repository = UnlockRepository::open(&paths, &settings)?;
    let outcome = repository.initialize(settings.refresh_on_startup, settings.cache_expiry_hours);
    if !outcome.is_ready() {
        repository.shutdown();
        bail!("unlock data unavailable: {outcome}");
    }
    Ok((paths, repository))
}

fn ensure_ready(outcome: InitOutcome) -> Result<()> {
    if outcome.is_ready() {
        return Ok(());
    }
    bail!("unlock data unavailable: {outcome}")
}

fn load_settings(paths: &ResolvedPaths) -> Result<ResolvedSettings> {
    let settings = load_config(&paths.config_path)?.resolve();
    debug!(
        config = %normalize_for_display(&paths.config_path),
        api_url = %settings.api_url,
        rate_limit_ms = settings.rate_limit_ms,
        "resolved settings"
    );
    Ok(settings)
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let data_env = initial.data_dir.join(".env");
    if data_env.exists() {
        let _ = dotenvy::from_path_override(&data_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_outcome(
    action: &str,
    outcome: &InitOutcome,
    repository: &UnlockRepository<MediaWikiClient>,
) {
    println!("{action}");
    println!("outcome: {outcome}");
    println!(
        "cache_path: {}",
        normalize_for_display(repository.cache_path())
    );
    let skills = repository.loaded_skills();
    println!("skills_loaded: {}", skills.len());
    for skill in skills {
        let unlocks = repository
            .get_skill_data(skill)
            .map(|data| data.unlock_count())
            .unwrap_or(0);
        println!("  - {skill}: {unlocks}");
    }
}

fn print_skill_data(data: &SkillData) {
    println!("{}", data.skill);
    println!("last_updated: {}", data.last_updated.to_rfc3339());
    println!("unlocks: {}", data.unlock_count());
    let groups: BTreeMap<u8, Vec<Unlock>> = data
        .level_data
        .iter()
        .map(|(level, group)| (*level, group.unlocks.clone()))
        .collect();
    print_groups(&groups);
}

fn print_groups(groups: &BTreeMap<u8, Vec<Unlock>>) {
    if groups.is_empty() {
        println!("  <none>");
    }
    for (level, unlocks) in groups {
        println!("level {level}");
        print_unlocks(unlocks);
    }
}

fn print_unlocks(unlocks: &[Unlock]) {
    if unlocks.is_empty() {
        println!("  <none>");
    }
    for unlock in unlocks {
        println!("  - {} [{}]", unlock.name, unlock.category);
        if !unlock.requirements.is_empty() {
            println!("      requires: {}", unlock.requirements);
        }
        if unlock.is_members_only() {
            println!("      members only");
        }
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
