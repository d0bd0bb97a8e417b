//! Durable state persistence + HTTP fetch utilities for issue-finder.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Local, SubsecRound};
use ifind_core::State;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{action} {path}: {source}", path = .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why [`StateStore::load`] fell back to an empty state.
#[derive(Debug)]
pub enum RecoveryCause {
    Missing,
    Unreadable(std::io::Error),
    Malformed(serde_json::Error),
}

impl RecoveryCause {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Unreadable(_) => "unreadable",
            Self::Malformed(_) => "malformed",
        }
    }
}

impl fmt::Display for RecoveryCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("state file does not exist"),
            Self::Unreadable(err) => write!(f, "state file unreadable: {err}"),
            Self::Malformed(err) => write!(f, "state file malformed: {err}"),
        }
    }
}

/// Observes load recoveries without changing the outcome of the load.
pub trait RecoveryHook: Send + Sync {
    fn on_recovery(&self, path: &Path, cause: &RecoveryCause);
}

#[derive(Default)]
pub struct TracingRecoveryHook;

impl RecoveryHook for TracingRecoveryHook {
    fn on_recovery(&self, path: &Path, cause: &RecoveryCause) {
        match cause {
            RecoveryCause::Missing => {
                debug!(path = %path.display(), "no state file yet; starting with empty history")
            }
            _ => warn!(
                path = %path.display(),
                cause = cause.kind(),
                "{cause}; starting with empty history"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateStats {
    pub processed_issues: usize,
    pub matches: usize,
    pub last_run: Option<DateTime<FixedOffset>>,
}

/// JSON state file at a fixed location.
///
/// `load` never fails: a missing or damaged file yields an empty state and is
/// reported to the [`RecoveryHook`]. There is no locking; the last `save` wins.
#[derive(Clone)]
pub struct StateStore {
    path: PathBuf,
    recovery: Arc<dyn RecoveryHook>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recovery: Arc::new(TracingRecoveryHook),
        }
    }

    pub fn with_recovery_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.recovery = hook;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn load(&self) -> State {
        match fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(state) => state,
                Err(err) => self.recover(RecoveryCause::Malformed(err)),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.recover(RecoveryCause::Missing)
            }
            Err(err) => self.recover(RecoveryCause::Unreadable(err)),
        }
    }

    fn recover(&self, cause: RecoveryCause) -> State {
        self.recovery.on_recovery(&self.path, &cause);
        State::empty()
    }

    /// Stamps `last_run` and atomically replaces the state file.
    pub async fn save(&self, state: &mut State) -> Result<(), StoreError> {
        state.last_run = Some(Local::now().fixed_offset().trunc_subsecs(0));
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(
            path = %self.path.display(),
            processed = state.processed_count(),
            matches = state.match_count(),
            "state saved"
        );
        Ok(())
    }

    /// Discards all history by persisting a fresh empty state.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut fresh = State::empty();
        self.save(&mut fresh).await
    }

    pub async fn stats(&self) -> Result<StateStats, StoreError> {
        let state = self.load().await;
        Ok(StateStats {
            processed_issues: state.processed_count(),
            matches: state.match_count(),
            last_run: state.last_run,
        })
    }
}

/// Writes `bytes` to a temp file beside `path`, syncs it, and renames it over
/// `path`. Readers see either the old or the new content, never a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StoreError::io("creating directory", &parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = match write_temp(&temp_path, bytes).await {
        Ok(()) => fs::rename(&temp_path, path)
            .await
            .map_err(|e| StoreError::io("renaming temp file onto", path, e)),
        Err(err) => Err(err),
    };

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|e| StoreError::io("opening temp file", temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io("writing temp file", temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io("syncing temp file", temp_path, e))
}

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between consecutive logical requests.
    pub min_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(concat!("issue-finder/", env!("CARGO_PKG_VERSION")).to_string()),
            backoff: BackoffPolicy::default(),
            min_interval: None,
        }
    }
}

/// Spaces requests at least `interval` apart; the first request never waits.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(FetchError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
        headers: HeaderMap,
    },
    #[error("decoding response body: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            pacer: config.min_interval.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    /// Sends the request produced by `build`, retrying transient failures.
    ///
    /// `build` runs once per attempt so headers and bodies are re-created. Any
    /// non-success status that is not retryable is returned as
    /// [`FetchError::HttpStatus`] with the response body and headers.
    pub async fn send<F>(&self, label: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        if let Some(pacer) = &self.pacer {
            pacer.wait_turn().await;
        }

        self.send_with_retries(&build)
            .instrument(info_span!("http_request", label))
            .await
    }

    async fn send_with_retries<F>(&self, build: &F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let headers = resp.headers().clone();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                        headers,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ifind_core::{add_matches_at, filter_new_issues, CandidateIssue, IssueMatch};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingHook {
        seen: StdMutex<Vec<&'static str>>,
    }

    impl RecoveryHook for RecordingHook {
        fn on_recovery(&self, _path: &Path, cause: &RecoveryCause) {
            self.seen.lock().unwrap().push(cause.kind());
        }
    }

    fn store_with_hook(path: PathBuf) -> (StateStore, Arc<RecordingHook>) {
        let hook = Arc::new(RecordingHook::default());
        let store = StateStore::new(path).with_recovery_hook(hook.clone());
        (store, hook)
    }

    fn populated_state() -> State {
        let mut state = State::empty();
        let candidates = (1..=3)
            .map(|n| CandidateIssue {
                repo: "rust-lang/cargo".to_string(),
                number: n,
                title: format!("issue {n}"),
                url: format!("https://github.com/rust-lang/cargo/issues/{n}"),
                labels: vec![],
                body: String::new(),
                created_at: chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            })
            .collect();
        filter_new_issues(&mut state, candidates);
        let found_at = chrono::NaiveDate::from_ymd_opt(2025, 3, 2)
            .unwrap()
            .and_hms_opt(8, 15, 0)
            .unwrap();
        add_matches_at(
            &mut state,
            vec![IssueMatch {
                repo: "rust-lang/cargo".to_string(),
                issue_number: 2,
                title: "issue 2".to_string(),
                url: "https://github.com/rust-lang/cargo/issues/2".to_string(),
                match_reason: "Rust CLI work".to_string(),
                estimated_effort: "medium".to_string(),
                labels: vec!["help wanted".to_string()],
                created_at: "2025-03-01".to_string(),
                found_at: String::new(),
            }],
            100,
            found_at,
        );
        state
    }

    #[tokio::test]
    async fn null_labels_in_existing_file_keep_the_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"last_run":"2025-03-02T08:15:00Z","processed_issues":{"a/b/1":true,"a/b/2":true},
               "all_matches":[{"repo":"a/b","issue_number":1,"title":"t","url":"u","match_reason":"r",
               "estimated_effort":"small","labels":null,"created_at":"2025-03-01","found_at":"2025-03-02 08:15"}]}"#,
        )
        .unwrap();
        let (store, hook) = store_with_hook(path);

        let state = store.load().await;
        assert_eq!(state.processed_count(), 2);
        assert_eq!(state.match_count(), 1);
        assert!(state.all_matches[0].labels.is_empty());
        assert!(hook.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_file_loads_empty_and_reports_recovery() {
        let dir = tempdir().expect("tempdir");
        let (store, hook) = store_with_hook(dir.path().join("state.json"));

        assert_eq!(store.load().await, State::empty());
        assert!(!store.exists().await);
        assert_eq!(*hook.seen.lock().unwrap(), vec!["missing"]);
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty_without_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"processed_issues\": {\"a/b/1\": tr").expect("write");
        let (store, hook) = store_with_hook(path);

        let state = store.load().await;
        assert!(state.processed_issues.is_empty());
        assert!(state.all_matches.is_empty());
        assert_eq!(*hook.seen.lock().unwrap(), vec!["malformed"]);
    }

    #[tokio::test]
    async fn non_json_bytes_load_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x12]).expect("write");
        let (store, _hook) = store_with_hook(path);
        assert_eq!(store.load().await, State::empty());
    }

    #[tokio::test]
    async fn unreadable_path_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let (store, hook) = store_with_hook(dir.path().to_path_buf());

        assert_eq!(store.load().await, State::empty());
        assert_eq!(*hook.seen.lock().unwrap(), vec!["unreadable"]);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let (store, hook) = store_with_hook(dir.path().join("nested").join("state.json"));
        let mut state = populated_state();

        store.save(&mut state).await.expect("save");
        assert!(state.last_run.is_some());

        let loaded = store.load().await;
        assert_eq!(loaded, state);
        assert!(hook.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn saved_file_uses_map_to_true_shape() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        let mut state = populated_state();
        store.save(&mut state).await.expect("save");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["processed_issues"]["rust-lang/cargo/2"], true);
        assert_eq!(raw["all_matches"][0]["estimated_effort"], "medium");
        assert_eq!(raw["all_matches"][0]["found_at"], "2025-03-02 08:15");
        assert!(DateTime::parse_from_rfc3339(raw["last_run"].as_str().expect("str")).is_ok());
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files_behind() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = populated_state();
        store.save(&mut state).await.expect("first save");
        store.save(&mut state).await.expect("overwrite");

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[tokio::test]
    async fn save_to_unwritable_location_fails() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write");
        let store = StateStore::new(blocker.join("state.json"));

        let err = store.save(&mut State::empty()).await.expect_err("must fail");
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[tokio::test]
    async fn clear_replaces_history_with_empty_state() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&mut populated_state()).await.expect("save");

        store.clear().await.expect("clear");
        let loaded = store.load().await;
        assert!(loaded.processed_issues.is_empty());
        assert!(loaded.all_matches.is_empty());
        assert!(loaded.last_run.is_some());
    }

    #[tokio::test]
    async fn stats_measure_without_mutating() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        store.save(&mut populated_state()).await.expect("save");
        let before = std::fs::read(&path).expect("read");

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.processed_issues, 3);
        assert_eq!(stats.matches, 1);
        assert!(stats.last_run.is_some());
        assert_eq!(std::fs::read(&path).expect("read"), before);
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let start = Instant::now();
        pacer.wait_turn().await;
        assert!(start.elapsed() < Duration::from_millis(40));
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }
}
