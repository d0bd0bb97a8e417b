use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ifind_core::IssueMatch;
use ifind_storage::{StateStats, StateStore};
use ifind_sync::{default_config_path, AppConfig, ConfigOverrides, Progress};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "ISSUE_FINDER_LOG";
const RECENT_MATCHES_SHOWN: usize = 5;

#[derive(Debug, Parser)]
#[command(name = "issue-finder", version)]
#[command(about = "Find GitHub issues that match your skills")]
struct Cli {
    /// Config file (default ~/.issue-finder.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Log at info level on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search for new contribution opportunities
    Search(SearchArgs),
    /// Inspect or reset the state file
    #[command(subcommand)]
    State(StateCommands),
    /// Create or inspect the config file
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Debug, Default, Args)]
struct SearchArgs {
    /// Comma-separated skills
    #[arg(long, value_delimiter = ',')]
    skills: Option<Vec<String>>,
    /// Comma-separated interests
    #[arg(long, value_delimiter = ',')]
    interests: Option<Vec<String>>,
    /// Years of experience
    #[arg(long)]
    experience: Option<i32>,
    /// Markdown report path
    #[arg(long)]
    output: Option<String>,
    /// State file path
    #[arg(long)]
    state: Option<String>,
    /// Skip the desktop notification
    #[arg(long)]
    no_notify: bool,
}

#[derive(Debug, Subcommand)]
enum StateCommands {
    /// Forget every processed issue and saved match
    Clear {
        #[arg(long)]
        state: Option<String>,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Print state statistics and the most recent matches
    Show {
        #[arg(long)]
        state: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Write a commented config template
    Init,
    /// Print the resolved configuration
    Show,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Search(SearchArgs::default())) {
        Commands::Search(args) => {
            let overrides = ConfigOverrides {
                skills: args.skills,
                interests: args.interests,
                experience_years: args.experience,
                output_path: args.output,
                state_path: args.state,
                no_notify: args.no_notify,
            };
            let config = AppConfig::load(cli.config.as_deref(), &overrides)?;
            let progress = Progress::new(cli.quiet);
            ifind_sync::run_search(&config, &progress).await?;
        }
        Commands::State(StateCommands::Clear { state, yes }) => {
            let config = load_with_state(cli.config.as_deref(), state)?;
            clear_state(&config.state_path, yes).await?;
        }
        Commands::State(StateCommands::Show { state }) => {
            let config = load_with_state(cli.config.as_deref(), state)?;
            show_state(&config.state_path).await?;
        }
        Commands::Config(ConfigCommands::Init) => {
            let path = match cli.config {
                Some(path) => path,
                None => default_config_path()?,
            };
            ifind_sync::write_config_template(&path).await?;
            println!("Created config file at {}", path.display());
            println!("Edit it with your profile, then set the API key environment variables.");
        }
        Commands::Config(ConfigCommands::Show) => {
            let config = AppConfig::load(cli.config.as_deref(), &ConfigOverrides::default())?;
            show_config(&config);
        }
    }

    Ok(())
}

fn load_with_state(config: Option<&Path>, state: Option<String>) -> Result<AppConfig> {
    let overrides = ConfigOverrides {
        state_path: state,
        ..Default::default()
    };
    Ok(AppConfig::load(config, &overrides)?)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y"))
}

async fn clear_state(path: &Path, yes: bool) -> Result<()> {
    let store = StateStore::new(path);
    if !store.exists().await {
        println!("No state file found at {}. Nothing to clear.", path.display());
        return Ok(());
    }

    if !yes {
        println!("This will clear all processed issues and saved matches.");
        println!("State file: {}", path.display());
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    store
        .clear()
        .await
        .with_context(|| format!("clearing state at {}", path.display()))?;
    println!("State cleared. The next search will re-evaluate all issues.");
    Ok(())
}

async fn show_state(path: &Path) -> Result<()> {
    let store = StateStore::new(path);
    if !store.exists().await {
        println!("No state file found at {}.", path.display());
        println!("Run 'issue-finder search' first.");
        return Ok(());
    }

    let stats = store
        .stats()
        .await
        .with_context(|| format!("reading state stats from {}", path.display()))?;
    let recent = if stats.matches > 0 {
        store.load().await.recent_matches(RECENT_MATCHES_SHOWN).to_vec()
    } else {
        Vec::new()
    };
    print!("{}", render_state_report(path, &stats, &recent));
    Ok(())
}

fn render_state_report(path: &Path, stats: &StateStats, recent: &[IssueMatch]) -> String {
    let mut out = format!("State file: {}\n", path.display());
    match stats.last_run {
        Some(ts) => out.push_str(&format!("Last run: {}\n", ts.format("%Y-%m-%d %H:%M:%S"))),
        None => out.push_str("Last run: never\n"),
    }
    out.push_str(&format!("Processed issues: {}\n", stats.processed_issues));
    out.push_str(&format!("Saved matches: {}\n", stats.matches));

    if !recent.is_empty() {
        out.push_str("\nRecent matches:\n");
        for m in recent {
            out.push_str(&format!("  - [{}] {}\n    {}\n", m.repo, m.title, m.url));
        }
        if stats.matches > recent.len() {
            out.push_str(&format!("  ... and {} more\n", stats.matches - recent.len()));
        }
    }
    out
}

fn secret_status(env_name: &str) -> String {
    match std::env::var(env_name) {
        Ok(value) if !value.is_empty() => format!("set ({} chars)", value.chars().count()),
        _ => "not set".to_string(),
    }
}

fn show_config(config: &AppConfig) {
    match &config.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: none (using defaults)"),
    }
    println!();
    println!("Profile:");
    println!("  Name: {}", config.profile.name);
    println!("  Skills: {}", config.profile.skills.join(", "));
    println!("  Interests: {}", config.profile.interests.join(", "));
    println!("  Experience: {} years", config.profile.experience_years);
    if let Err(err) = config.profile.validate() {
        println!("  Invalid: {err}");
    }
    println!();
    println!("Preferences:");
    println!("  Output: {}", config.output_path.display());
    println!("  State: {}", config.state_path.display());
    println!("  Notify: {}", config.notify_on_completion);
    println!("  Max matches: {}", config.max_matches);
    println!();
    println!("API:");
    println!("  {}: {}", config.anthropic_key_env, secret_status(&config.anthropic_key_env));
    println!("  {}: {}", config.github_token_env, secret_status(&config.github_token_env));
    println!("  Model: {}", config.anthropic_model);
}
