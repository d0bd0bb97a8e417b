//! Search pipeline orchestration, configuration, and report output.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use ifind_adapters::{AnthropicRanker, GitHubIssueSource, IssueSource, Ranker, DEFAULT_ANTHROPIC_MODEL};
use ifind_core::{add_matches, filter_new_issues, Profile, State, FOUND_AT_FORMAT};
use ifind_storage::{write_atomic, StateStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_FILE: &str = ".issue-finder.yaml";
pub const DEFAULT_OUTPUT_FILE: &str = "contributions.md";
pub const DEFAULT_STATE_FILE: &str = ".issue-finder-state.json";
pub const DEFAULT_MAX_MATCHES: usize = 100;
pub const DEFAULT_ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const DEFAULT_GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const NOTIFICATION_TITLE: &str = "Issue Finder";

pub const CONFIG_TEMPLATE: &str = r#"# Issue Finder configuration
# Edit this file to describe yourself, then run `issue-finder search`.

profile:
  name: "Your Name"
  skills:
    - Go
    - Python
    - PostgreSQL
  interests:
    - Backend development
    - Databases
  experience_years: 5

preferences:
  # Markdown report with every retained match
  output_path: "~/contributions.md"

  # Processed issues and match history
  state_path: "~/.issue-finder-state.json"

  notify_on_completion: true

  # Matches kept in history (newest first)
  max_matches: 100

api:
  # Environment variables holding the credentials
  anthropic_key_env: "ANTHROPIC_API_KEY"
  github_token_env: "GITHUB_TOKEN"
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("reading {path}: {source}", path = .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}", path = .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0} environment variable not set")]
    MissingSecret(String),
    #[error("could not determine the home directory")]
    NoHomeDir,
}

/// On-disk YAML shape. Every section and key is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub preferences: PreferencesSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PreferencesSection {
    pub output_path: Option<String>,
    pub state_path: Option<String>,
    pub notify_on_completion: Option<bool>,
    pub max_matches: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiSection {
    pub anthropic_key_env: Option<String>,
    pub github_token_env: Option<String>,
    pub anthropic_model: Option<String>,
}

/// Command-line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub skills: Option<Vec<String>>,
    pub interests: Option<Vec<String>>,
    pub experience_years: Option<i32>,
    pub output_path: Option<String>,
    pub state_path: Option<String>,
    pub no_notify: bool,
}

/// Fully resolved settings, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub config_file: Option<PathBuf>,
    pub profile: Profile,
    pub output_path: PathBuf,
    pub state_path: PathBuf,
    pub notify_on_completion: bool,
    pub max_matches: usize,
    pub anthropic_key_env: String,
    pub github_token_env: String,
    pub anthropic_model: String,
}

/// Expands a leading `~/` against `home`.
pub fn expand_path(raw: &str, home: &Path) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(raw),
    }
}

/// Non-positive caps are a configuration anomaly and retain nothing.
pub fn resolve_max_matches(configured: Option<i64>) -> usize {
    match configured {
        None => DEFAULT_MAX_MATCHES,
        Some(cap) if cap <= 0 => {
            warn!(max_matches = cap, "non-positive max_matches; no match history will be kept");
            0
        }
        Some(cap) => usize::try_from(cap).unwrap_or(usize::MAX),
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_CONFIG_FILE))
        .ok_or(ConfigError::NoHomeDir)
}

impl AppConfig {
    /// Reads the YAML file (if any) and applies `overrides`.
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => home.join(DEFAULT_CONFIG_FILE),
        };

        let (file, source) = match std::fs::read_to_string(&path) {
            Ok(text) => (Self::parse_file(&path, &text)?, Some(path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if explicit.is_some() {
                    return Err(ConfigError::NotFound(path));
                }
                (ConfigFile::default(), None)
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        Ok(Self::resolve(file, overrides, &home, source))
    }

    pub fn parse_file(path: &Path, text: &str) -> Result<ConfigFile, ConfigError> {
        if text.trim().is_empty() {
            return Ok(ConfigFile::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn resolve(
        file: ConfigFile,
        overrides: &ConfigOverrides,
        home: &Path,
        config_file: Option<PathBuf>,
    ) -> Self {
        let mut profile = file.profile;
        if let Some(skills) = &overrides.skills {
            profile.skills = skills.clone();
        }
        if let Some(interests) = &overrides.interests {
            profile.interests = interests.clone();
        }
        if let Some(years) = overrides.experience_years {
            profile.experience_years = years;
        }

        let prefs = file.preferences;
        let output_path = overrides
            .output_path
            .as_deref()
            .or(prefs.output_path.as_deref())
            .filter(|p| !p.is_empty())
            .map(|p| expand_path(p, home))
            .unwrap_or_else(|| home.join(DEFAULT_OUTPUT_FILE));
        let state_path = overrides
            .state_path
            .as_deref()
            .or(prefs.state_path.as_deref())
            .filter(|p| !p.is_empty())
            .map(|p| expand_path(p, home))
            .unwrap_or_else(|| home.join(DEFAULT_STATE_FILE));

        let non_empty = |value: Option<String>, default: &str| {
            value
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            config_file,
            profile,
            output_path,
            state_path,
            notify_on_completion: !overrides.no_notify && prefs.notify_on_completion.unwrap_or(true),
            max_matches: resolve_max_matches(prefs.max_matches),
            anthropic_key_env: non_empty(file.api.anthropic_key_env, DEFAULT_ANTHROPIC_KEY_ENV),
            github_token_env: non_empty(file.api.github_token_env, DEFAULT_GITHUB_TOKEN_ENV),
            anthropic_model: non_empty(file.api.anthropic_model, DEFAULT_ANTHROPIC_MODEL),
        }
    }

    pub fn secret(&self, env_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_name)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingSecret(env_name.to_string()))
    }
}

/// Writes the commented template, refusing to replace an existing file.
pub async fn write_config_template(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "config file already exists at {}; use a different path or delete it first",
            path.display()
        );
    }
    write_atomic(path, CONFIG_TEMPLATE.as_bytes())
        .await
        .with_context(|| format!("writing config template {}", path.display()))
}

/// Markdown rendering of every retained match, in stored order.
pub fn render_markdown_report(state: &State, updated_at: NaiveDateTime) -> String {
    let mut out = String::new();
    out.push_str("# GitHub OSS Contribution Opportunities\n\n");
    out.push_str(&format!("Last updated: {}\n\n", updated_at.format(FOUND_AT_FORMAT)));
    out.push_str(&format!("Total opportunities: {}\n\n", state.match_count()));
    out.push_str("---\n\n");

    if state.all_matches.is_empty() {
        out.push_str("No OSS opportunities found yet. Check back later!\n");
        return out;
    }

    for m in &state.all_matches {
        out.push_str(&format!("## [{}] {}\n\n", m.repo, m.title));
        out.push_str(&format!("- **URL**: {}\n", m.url));
        out.push_str(&format!("- **Effort**: {}\n", m.estimated_effort));
        out.push_str(&format!("- **Created**: {}\n", m.created_at));
        out.push_str(&format!("- **Found**: {}\n", m.found_at));
        if !m.labels.is_empty() {
            out.push_str(&format!("- **Labels**: {}\n", m.labels.join(", ")));
        }
        out.push_str(&format!("\n**Why this fits you:**\n{}\n\n", m.match_reason));
        out.push_str("---\n\n");
    }
    out
}

pub async fn write_markdown_report(path: &Path, state: &State) -> Result<()> {
    let text = render_markdown_report(state, Local::now().naive_local());
    write_atomic(path, text.as_bytes())
        .await
        .with_context(|| format!("writing report {}", path.display()))
}

/// Step-by-step console output for interactive runs.
#[derive(Debug)]
pub struct Progress {
    quiet: bool,
    total_steps: usize,
    started: Instant,
}

impl Progress {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            total_steps: 4,
            started: Instant::now(),
        }
    }

    pub fn header(&self, profile: &Profile) {
        if self.quiet {
            return;
        }
        println!("Issue Finder v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Profile:");
        println!("  Skills: {}", profile.skills.join(", "));
        if !profile.interests.is_empty() {
            println!("  Interests: {}", profile.interests.join(", "));
        }
        println!("  Experience: {} years", profile.experience_years);
        println!();
    }

    pub fn step(&self, step: usize, message: &str) {
        if !self.quiet {
            println!("[{step}/{}] {message}", self.total_steps);
        }
    }

    pub fn detail(&self, message: &str) {
        if !self.quiet {
            println!("      {message}");
        }
    }

    pub fn blank(&self) {
        if !self.quiet {
            println!();
        }
    }

    pub fn warning(&self, message: &str) {
        if !self.quiet {
            println!("Warning: {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.quiet {
            return;
        }
        println!("\n{message}");
        println!("Completed in {:.1} seconds", self.started.elapsed().as_secs_f64());
    }
}

pub trait CompletionNotifier: Send + Sync {
    fn notify(&self, title: &str, message: &str) -> Result<()>;
}

#[derive(Default)]
pub struct NoopNotifier;

impl CompletionNotifier for NoopNotifier {
    fn notify(&self, _title: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Desktop notification through the platform's stock tooling.
#[derive(Default)]
pub struct DesktopNotifier;

fn applescript_quote(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn powershell_quote(text: &str) -> String {
    text.replace('\'', "''")
}

/// Program and arguments that raise a notification on `os`.
pub fn notification_command(os: &str, title: &str, message: &str) -> Result<(String, Vec<String>)> {
    match os {
        "macos" => Ok((
            "osascript".to_string(),
            vec![
                "-e".to_string(),
                format!(
                    "display notification \"{}\" with title \"{}\" sound name \"Glass\"",
                    applescript_quote(message),
                    applescript_quote(title)
                ),
            ],
        )),
        "linux" => Ok((
            "notify-send".to_string(),
            vec![title.to_string(), message.to_string()],
        )),
        "windows" => {
            let script = format!(
                "[Windows.UI.Notifications.ToastNotificationManager, Windows.UI.Notifications, ContentType = WindowsRuntime] | Out-Null; \
                 $xml = [Windows.UI.Notifications.ToastNotificationManager]::GetTemplateContent([Windows.UI.Notifications.ToastTemplateType]::ToastText02); \
                 $text = $xml.GetElementsByTagName('text'); \
                 $text.Item(0).AppendChild($xml.CreateTextNode('{title}')) | Out-Null; \
                 $text.Item(1).AppendChild($xml.CreateTextNode('{message}')) | Out-Null; \
                 [Windows.UI.Notifications.ToastNotificationManager]::CreateToastNotifier('{title}').Show([Windows.UI.Notifications.ToastNotification]::new($xml))",
                title = powershell_quote(title),
                message = powershell_quote(message),
            );
            Ok(("powershell".to_string(), vec!["-Command".to_string(), script]))
        }
        other => bail!("notifications not supported on {other}"),
    }
}

impl CompletionNotifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<()> {
        let (program, args) = notification_command(std::env::consts::OS, title, message)?;
        let status = Command::new(&program)
            .args(&args)
            .status()
            .with_context(|| format!("running {program}"))?;
        if !status.success() {
            bail!("{program} exited with {status}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SearchRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_candidates: usize,
    pub already_processed: usize,
    pub new_candidates: usize,
    pub new_matches: usize,
    pub total_matches: usize,
    pub ranker_failed: bool,
    pub report_path: String,
    pub state_path: String,
}

impl SearchRunSummary {
    pub fn from_history(&self) -> usize {
        self.total_matches.saturating_sub(self.new_matches)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct SearchPipeline {
    profile: Profile,
    store: StateStore,
    source: Box<dyn IssueSource>,
    ranker: Box<dyn Ranker>,
    notifier: Box<dyn CompletionNotifier>,
    report_path: PathBuf,
    max_matches: usize,
}

impl SearchPipeline {
    pub fn new(config: &AppConfig, source: Box<dyn IssueSource>, ranker: Box<dyn Ranker>) -> Self {
        let notifier: Box<dyn CompletionNotifier> = if config.notify_on_completion {
            Box::<DesktopNotifier>::default()
        } else {
            Box::<NoopNotifier>::default()
        };
        Self {
            profile: config.profile.clone(),
            store: StateStore::new(config.state_path.clone()),
            source,
            ranker,
            notifier,
            report_path: config.output_path.clone(),
            max_matches: config.max_matches,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn CompletionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    /// Load, search, filter, rank, merge, report, save.
    ///
    /// Candidates are marked processed before ranking, so a ranker failure
    /// still consumes them. Report and state write failures are fatal.
    pub async fn run_once(&self, progress: &Progress) -> Result<SearchRunSummary> {
        let started_at = Utc::now();
        self.profile.validate()?;
        progress.header(&self.profile);

        let mut state = self.store.load().await;

        progress.step(1, "Searching GitHub for relevant issues...");
        let candidates = match self.source.fetch_candidates(&self.profile).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(source = self.source.source_id(), error = %err, "issue search failed");
                progress.warning(&format!("issue search failed: {err}"));
                Vec::new()
            }
        };
        let fetched_candidates = candidates.len();
        progress.detail(&format!("Found {fetched_candidates} issues across multiple queries"));
        progress.blank();

        progress.step(2, "Filtering processed issues...");
        let fresh = filter_new_issues(&mut state, candidates);
        let already_processed = fetched_candidates - fresh.len();
        progress.detail(&format!(
            "{already_processed} already evaluated, {} new issues to process",
            fresh.len()
        ));
        progress.blank();

        progress.step(3, "Evaluating with AI...");
        let mut ranker_failed = false;
        let matches = if fresh.is_empty() {
            progress.detail("No new issues to evaluate");
            Vec::new()
        } else {
            progress.detail(&format!("Sending {} issues for evaluation...", fresh.len()));
            match self.ranker.rank(&self.profile, &fresh).await {
                Ok(matches) => matches,
                Err(err) => {
                    warn!(ranker = self.ranker.ranker_id(), error = %err, "ranking failed");
                    progress.warning(&format!("ranking failed: {err}"));
                    ranker_failed = true;
                    Vec::new()
                }
            }
        };
        let new_matches = matches.len();
        if !fresh.is_empty() {
            progress.detail(&format!("Received {new_matches} high-quality matches"));
        }
        progress.blank();
        add_matches(&mut state, matches, self.max_matches);

        progress.step(4, "Writing results...");
        write_markdown_report(&self.report_path, &state).await?;
        self.store.save(&mut state).await.with_context(|| {
            format!(
                "failed to save state to {}; this run's results will not be remembered",
                self.store.path().display()
            )
        })?;

        let summary = SearchRunSummary {
            started_at,
            finished_at: Utc::now(),
            fetched_candidates,
            already_processed,
            new_candidates: fresh.len(),
            new_matches,
            total_matches: state.match_count(),
            ranker_failed,
            report_path: self.report_path.display().to_string(),
            state_path: self.store.path().display().to_string(),
        };
        info!(
            fetched = summary.fetched_candidates,
            new_candidates = summary.new_candidates,
            new_matches = summary.new_matches,
            total = summary.total_matches,
            elapsed_ms = summary.elapsed().num_milliseconds(),
            "search run complete"
        );

        progress.detail(&format!("Updated {}", summary.report_path));
        progress.detail(&format!(
            "Total opportunities: {} ({} new, {} from history)",
            summary.total_matches,
            summary.new_matches,
            summary.from_history()
        ));
        progress.success(&format!("Done! Open {} to view results.", summary.report_path));

        let message = if new_matches > 0 {
            format!("Found {new_matches} new opportunities")
        } else {
            "No new opportunities found".to_string()
        };
        if let Err(err) = self.notifier.notify(NOTIFICATION_TITLE, &message) {
            warn!(error = %err, "notification failed");
            progress.warning(&format!("failed to send notification: {err}"));
        }

        Ok(summary)
    }
}

/// Builds the GitHub source and Anthropic ranker from `config` and runs once.
pub async fn run_search(config: &AppConfig, progress: &Progress) -> Result<SearchRunSummary> {
    config.profile.validate()?;
    let github_token = config.secret(&config.github_token_env)?;
    let anthropic_key = config.secret(&config.anthropic_key_env)?;

    let source = GitHubIssueSource::new(github_token)?;
    let ranker = AnthropicRanker::new(anthropic_key, config.anthropic_model.clone())?;
    let pipeline = SearchPipeline::new(config, Box::new(source), Box::new(ranker));
    pipeline.run_once(progress).await
}
