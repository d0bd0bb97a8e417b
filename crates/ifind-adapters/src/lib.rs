//! Collaborator contracts (issue sources, rankers) + GitHub and Anthropic implementations.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ifind_core::{null_as_default, truncate_body, CandidateIssue, IssueMatch, Profile};
use ifind_storage::{FetchError, HttpClientConfig, HttpFetcher};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const GITHUB_SEARCH_URL: &str = "https://api.github.com/search/issues";
pub const SEARCH_BASE_CONSTRAINTS: &str =
    "is:issue is:open no:assignee created:>2024-10-01 comments:>=1";
pub const CONTRIBUTOR_LABELS: [&str; 2] = ["good first issue", "help wanted"];
pub const SEARCH_PAGE_SIZE: &str = "30";
pub const QUERY_SPACING: Duration = Duration::from_secs(2);

pub const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const RANKER_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Produces candidate issues for a profile, deduplicated by URL within one call.
#[async_trait]
pub trait IssueSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_candidates(&self, profile: &Profile) -> Result<Vec<CandidateIssue>, AdapterError>;
}

/// Picks the best-fitting candidates for a profile. May return nothing.
#[async_trait]
pub trait Ranker: Send + Sync {
    fn ranker_id(&self) -> &'static str;

    async fn rank(
        &self,
        profile: &Profile,
        candidates: &[CandidateIssue],
    ) -> Result<Vec<IssueMatch>, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<GitHubIssue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubIssue {
    pub number: u64,
    pub title: String,
    pub html_url: String,
    #[serde(default)]
    pub labels: Vec<GitHubLabel>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub body: Option<String>,
    pub repository_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubLabel {
    pub name: String,
}

/// Maps a lower-cased skill to a GitHub search qualifier.
pub fn skill_qualifier(skill: &str) -> String {
    let mapped = match skill {
        "python" => "language:python",
        "ruby on rails" => "language:ruby topic:rails",
        "ruby" => "language:ruby",
        "go" | "golang" => "language:go",
        "rust" => "language:rust",
        "javascript" => "language:javascript",
        "typescript" => "language:typescript",
        "java" => "language:java",
        "c++" => "language:c++",
        "c" => "language:c",
        "php" => "language:php",
        "swift" => "language:swift",
        "kotlin" => "language:kotlin",
        "postgresql" | "postgres" => "topic:postgresql",
        "sqlite" => "topic:sqlite",
        "mysql" => "topic:mysql",
        "mongodb" => "topic:mongodb",
        "redis" => "topic:redis",
        "message queues" => "topic:message-queue OR topic:rabbitmq OR topic:kafka",
        "event-driven" => "topic:event-driven",
        other => return format!("topic:{other}"),
    };
    mapped.to_string()
}

/// One query per (skill, contributor label) pair, skills in profile order.
pub fn build_search_queries(profile: &Profile) -> Vec<String> {
    profile
        .skills
        .iter()
        .flat_map(|skill| {
            let qualifier = skill_qualifier(&skill.to_lowercase());
            CONTRIBUTOR_LABELS
                .into_iter()
                .map(move |label| format!("{SEARCH_BASE_CONSTRAINTS} {qualifier} label:\"{label}\""))
        })
        .collect()
}

/// `https://api.github.com/repos/owner/name` -> `owner/name`.
pub fn repo_from_api_url(repository_url: &str) -> String {
    let parts: Vec<&str> = repository_url.split('/').collect();
    match parts.as_slice() {
        [.., owner, name] => format!("{owner}/{name}"),
        _ => "unknown".to_string(),
    }
}

impl GitHubIssue {
    pub fn into_candidate(self) -> CandidateIssue {
        CandidateIssue {
            repo: repo_from_api_url(&self.repository_url),
            number: self.number,
            title: self.title,
            url: self.html_url,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            body: truncate_body(self.body.as_deref().unwrap_or_default()),
            created_at: self.created_at.date_naive(),
        }
    }
}

/// Accumulates search result pages, keeping the first occurrence of each URL.
#[derive(Debug, Default)]
pub struct CandidateCollector {
    seen_urls: HashSet<String>,
    candidates: Vec<CandidateIssue>,
}

impl CandidateCollector {
    pub fn push_batch(&mut self, items: Vec<GitHubIssue>) -> usize {
        let before = self.candidates.len();
        for item in items {
            if self.seen_urls.insert(item.html_url.clone()) {
                self.candidates.push(item.into_candidate());
            }
        }
        self.candidates.len() - before
    }

    pub fn into_candidates(self) -> Vec<CandidateIssue> {
        self.candidates
    }
}

/// Human-readable reason for a failed search request.
pub fn describe_search_failure(err: &AdapterError) -> String {
    let AdapterError::Fetch(FetchError::HttpStatus {
        status,
        body,
        headers,
        ..
    }) = err
    else {
        return format!("GitHub request failed: {err}");
    };

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    match *status {
        401 => "GitHub authentication failed (401): the token may be invalid or expired; \
                create a new one at https://github.com/settings/tokens"
            .to_string(),
        403 if body.contains("secondary rate limit") => {
            "hit GitHub secondary rate limit; wait 5-10 minutes before trying again".to_string()
        }
        403 if header("x-ratelimit-remaining") == "0" => format!(
            "GitHub primary rate limit exceeded; resets at {}",
            header("x-ratelimit-reset")
        ),
        403 => "GitHub API access denied (403)".to_string(),
        other => format!("GitHub API error {other}: {body}"),
    }
}

pub struct GitHubIssueSource {
    http: HttpFetcher,
    token: String,
    search_url: String,
}

impl GitHubIssueSource {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_config(
            token,
            HttpClientConfig {
                min_interval: Some(QUERY_SPACING),
                ..Default::default()
            },
        )
    }

    pub fn with_config(token: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            token: token.into(),
            search_url: GITHUB_SEARCH_URL.to_string(),
        })
    }

    pub fn with_search_url(mut self, search_url: impl Into<String>) -> Self {
        self.search_url = search_url.into();
        self
    }

    async fn search(&self, query: &str) -> Result<Vec<GitHubIssue>, AdapterError> {
        let resp = self
            .http
            .send("github_search", |client| {
                client
                    .get(&self.search_url)
                    .query(&[
                        ("q", query),
                        ("sort", "created"),
                        ("order", "desc"),
                        ("per_page", SEARCH_PAGE_SIZE),
                    ])
                    .header(AUTHORIZATION, format!("token {}", self.token))
                    .header(ACCEPT, "application/vnd.github.v3+json")
            })
            .await?;
        let parsed: SearchResponse = resp.json()?;
        Ok(parsed.items)
    }
}

#[async_trait]
impl IssueSource for GitHubIssueSource {
    fn source_id(&self) -> &'static str {
        "github"
    }

    /// Failing queries are logged and skipped; the rest still contribute.
    async fn fetch_candidates(&self, profile: &Profile) -> Result<Vec<CandidateIssue>, AdapterError> {
        let queries = build_search_queries(profile);
        let mut collector = CandidateCollector::default();

        for query in &queries {
            match self.search(query).await {
                Ok(items) => {
                    let fetched = items.len();
                    let added = collector.push_batch(items);
                    debug!(query = %query, fetched, added, "search query complete");
                }
                Err(err) => warn!(query = %query, "{}", describe_search_failure(&err)),
            }
        }

        let candidates = collector.into_candidates();
        info!(queries = queries.len(), candidates = candidates.len(), "github search finished");
        Ok(candidates)
    }
}

pub fn build_ranking_prompt(
    profile: &Profile,
    candidates: &[CandidateIssue],
) -> Result<String, AdapterError> {
    let profile_json = serde_json::to_string(profile)
        .map_err(|e| AdapterError::Message(format!("serializing profile: {e}")))?;
    let issues_json = serde_json::to_string(candidates)
        .map_err(|e| AdapterError::Message(format!("serializing candidates: {e}")))?;

    Ok(format!(
        r#"You are helping a developer with {years} years of experience find open source contribution opportunities on GitHub.

Developer profile:
{profile_json}

Issues to evaluate:
{issues_json}

Pick ONLY the 3-5 issues that would be genuinely good first contributions. Every pick must satisfy all of:
1. Clear scope: a well-defined problem and expected outcome.
2. Skill match: needs skills listed in the profile.
3. Right size: not trivial, but doable in a few hours to a day.
4. Active project: recent activity and an apparently maintained repository.
5. Welcoming: the description is friendly and gives context.
6. Realistic: not vague, not huge, no deep domain knowledge required.

For each pick, give a specific reason naming the profile skills that apply, why the size fits, and what makes it a good entry point into the project.

Reply with JSON only, in this shape:
{{
  "matches": [
    {{
      "repo": "owner/repo-name",
      "issue_number": 123,
      "title": "Issue title",
      "url": "https://github.com/...",
      "match_reason": "Which skills apply, why the scope fits, what makes it welcoming",
      "estimated_effort": "small|medium|large",
      "labels": ["label1", "label2"],
      "created_at": "2024-01-01"
    }}
  ]
}}

Be very selective. Return at most 5 matches, and an empty matches array if nothing fits."#,
        years = profile.experience_years,
    ))
}

/// Removes a surrounding markdown code fence (with optional language tag).
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    if !text.starts_with("```") {
        return text;
    }
    let Some(start) = text.find('\n') else {
        return text;
    };
    match text.rfind("```") {
        Some(end) if end > start => text[start + 1..end].trim(),
        _ => text,
    }
}

#[derive(Debug, Deserialize)]
struct RankerReply {
    #[serde(default, deserialize_with = "null_as_default")]
    matches: Vec<IssueMatch>,
}

pub fn parse_ranker_reply(text: &str) -> Result<Vec<IssueMatch>, AdapterError> {
    let reply: RankerReply = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| AdapterError::Message(format!("parsing ranker reply: {e}")))?;
    Ok(reply.matches)
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicRanker {
    http: HttpFetcher,
    api_key: String,
    model: String,
    endpoint: String,
}

impl AnthropicRanker {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_config(
            api_key,
            model,
            HttpClientConfig {
                timeout: Duration::from_secs(120),
                ..Default::default()
            },
        )
    }

    pub fn with_config(
        api_key: impl Into<String>,
        model: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: ANTHROPIC_MESSAGES_URL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Ranker for AnthropicRanker {
    fn ranker_id(&self) -> &'static str {
        "anthropic"
    }

    async fn rank(
        &self,
        profile: &Profile,
        candidates: &[CandidateIssue],
    ) -> Result<Vec<IssueMatch>, AdapterError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.model,
            "max_tokens": RANKER_MAX_TOKENS,
            "messages": [
                { "role": "user", "content": build_ranking_prompt(profile, candidates)? }
            ]
        });

        let resp = self
            .http
            .send("anthropic_messages", |client| {
                client
                    .post(&self.endpoint)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header(CONTENT_TYPE, "application/json")
                    .json(&body)
            })
            .await?;

        let parsed: MessagesResponse = resp.json()?;
        let text = parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| AdapterError::Message("ranker reply had no text content".to_string()))?;

        let matches = parse_ranker_reply(&text).inspect_err(|_| {
            debug!(reply = %text, "unparseable ranker reply");
        })?;
        info!(candidates = candidates.len(), matches = matches.len(), "ranking complete");
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ifind_storage::BackoffPolicy;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn profile(skills: &[&str]) -> Profile {
        Profile {
            name: "Dev".to_string(),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            interests: vec!["Backend".to_string()],
            experience_years: 5,
        }
    }

    fn test_http_config() -> HttpClientConfig {
        HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            min_interval: None,
            ..Default::default()
        }
    }

    fn api_issue(repo: &str, number: u64) -> serde_json::Value {
        json!({
            "number": number,
            "title": format!("Issue {number}"),
            "html_url": format!("https://github.com/{repo}/issues/{number}"),
            "labels": [{"name": "good first issue"}],
            "created_at": "2025-01-20T10:30:00Z",
            "body": "Please help",
            "repository_url": format!("https://api.github.com/repos/{repo}"),
        })
    }

    fn query_for(qualifier: &str, label: &str) -> String {
        format!("{SEARCH_BASE_CONSTRAINTS} {qualifier} label:\"{label}\"")
    }

    #[test]
    fn skills_map_to_search_qualifiers() {
        assert_eq!(skill_qualifier("golang"), "language:go");
        assert_eq!(skill_qualifier("postgres"), "topic:postgresql");
        assert_eq!(skill_qualifier("ruby on rails"), "language:ruby topic:rails");
        assert_eq!(skill_qualifier("webassembly"), "topic:webassembly");
    }

    #[test]
    fn queries_cover_every_skill_label_pair() {
        let queries = build_search_queries(&profile(&["Go", "Redis"]));
        assert_eq!(
            queries,
            vec![
                query_for("language:go", "good first issue"),
                query_for("language:go", "help wanted"),
                query_for("topic:redis", "good first issue"),
                query_for("topic:redis", "help wanted"),
            ]
        );
    }

    #[test]
    fn repo_is_taken_from_last_two_segments() {
        assert_eq!(repo_from_api_url("https://api.github.com/repos/tokio-rs/tokio"), "tokio-rs/tokio");
        assert_eq!(repo_from_api_url("bare"), "unknown");
    }

    #[test]
    fn api_issue_converts_to_candidate() {
        let mut raw = api_issue("serde-rs/serde", 7);
        raw["body"] = json!("x".repeat(600));
        let issue: GitHubIssue = serde_json::from_value(raw).unwrap();
        let candidate = issue.into_candidate();

        assert_eq!(candidate.repo, "serde-rs/serde");
        assert_eq!(candidate.key(), "serde-rs/serde/7");
        assert_eq!(candidate.labels, vec!["good first issue".to_string()]);
        assert_eq!(candidate.created_at.to_string(), "2025-01-20");
        assert!(candidate.body.ends_with(ifind_core::TRUNCATION_MARKER));
    }

    #[test]
    fn null_body_becomes_empty() {
        let mut raw = api_issue("a/b", 1);
        raw["body"] = serde_json::Value::Null;
        let issue: GitHubIssue = serde_json::from_value(raw).unwrap();
        assert_eq!(issue.into_candidate().body, "");
    }

    #[test]
    fn collector_keeps_first_occurrence_of_each_url() {
        let parse = |v: serde_json::Value| -> GitHubIssue { serde_json::from_value(v).unwrap() };
        let mut collector = CandidateCollector::default();
        assert_eq!(collector.push_batch(vec![parse(api_issue("a/b", 1)), parse(api_issue("a/b", 2))]), 2);
        assert_eq!(collector.push_batch(vec![parse(api_issue("a/b", 2)), parse(api_issue("c/d", 1))]), 1);

        let keys: Vec<String> = collector.into_candidates().iter().map(|c| c.key()).collect();
        assert_eq!(keys, vec!["a/b/1", "a/b/2", "c/d/1"]);
    }

    #[test]
    fn fence_stripping_handles_common_shapes() {
        assert_eq!(strip_code_fence("```json\n{\"matches\": []}\n```"), "{\"matches\": []}");
        assert_eq!(strip_code_fence("  {\"matches\": []}  "), "{\"matches\": []}");
        assert_eq!(strip_code_fence("```"), "```");
    }

    #[test]
    fn ranker_reply_passes_unknown_effort_through() {
        let matches = parse_ranker_reply(
            r#"```json
{"matches":[{"repo":"a/b","issue_number":3,"title":"T","url":"u","match_reason":"r","estimated_effort":"huge","labels":[],"created_at":"2025-01-01"}]}
```"#,
        )
        .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].estimated_effort, "huge");
        assert_eq!(matches[0].found_at, "");
    }

    #[test]
    fn ranker_reply_with_null_fields_keeps_the_batch() {
        let matches = parse_ranker_reply(
            r#"{"matches":[{"repo":"a/b","issue_number":4,"title":"Fix it","url":"https://github.com/a/b/issues/4","match_reason":"fits","estimated_effort":"small","labels":null,"created_at":null}]}"#,
        )
        .unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].labels.is_empty());
        assert!(matches[0].created_at.is_empty());
        assert!(parse_ranker_reply(r#"{"matches":null}"#).unwrap().is_empty());
    }

    #[test]
    fn garbage_ranker_reply_is_an_error() {
        assert!(parse_ranker_reply("I could not find anything suitable.").is_err());
        assert!(parse_ranker_reply("{}").unwrap().is_empty());
    }

    #[test]
    fn prompt_embeds_profile_and_candidates() {
        let mut raw = api_issue("a/b", 9);
        raw["title"] = json!("Add retry flag");
        let issue: GitHubIssue = serde_json::from_value(raw).unwrap();
        let prompt = build_ranking_prompt(&profile(&["Rust"]), &[issue.into_candidate()]).unwrap();
        assert!(prompt.contains("5 years of experience"));
        assert!(prompt.contains("\"skills\":[\"Rust\"]"));
        assert!(prompt.contains("Add retry flag"));
        assert!(prompt.contains("\"matches\": ["));
    }

    #[tokio::test]
    async fn github_source_merges_queries_and_skips_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/issues"))
            .and(query_param("q", query_for("language:go", "good first issue")))
            .and(header("authorization", "token secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [api_issue("a/b", 1), api_issue("a/b", 2)]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/issues"))
            .and(query_param("q", query_for("language:go", "help wanted")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [api_issue("a/b", 2), api_issue("c/d", 5)]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/issues"))
            .and(query_param("q", query_for("topic:redis", "good first issue")))
            .respond_with(
                ResponseTemplate::new(403).set_body_string("You have exceeded a secondary rate limit"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/issues"))
            .and(query_param("q", query_for("topic:redis", "help wanted")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [api_issue("r/s", 8)]
            })))
            .mount(&server)
            .await;

        let source = GitHubIssueSource::with_config("secret", test_http_config())
            .unwrap()
            .with_search_url(format!("{}/search/issues", server.uri()));
        let candidates = source.fetch_candidates(&profile(&["Go", "Redis"])).await.unwrap();

        let keys: Vec<String> = candidates.iter().map(|c| c.key()).collect();
        assert_eq!(keys, vec!["a/b/1", "a/b/2", "c/d/5", "r/s/8"]);
    }

    #[tokio::test]
    async fn search_failures_are_described() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "1735689600"),
            )
            .mount(&server)
            .await;

        let source = GitHubIssueSource::with_config("t", test_http_config())
            .unwrap()
            .with_search_url(format!("{}/search/issues", server.uri()));
        let err = source.search("anything").await.unwrap_err();
        assert_eq!(
            describe_search_failure(&err),
            "GitHub primary rate limit exceeded; resets at 1735689600"
        );
        let unauthorized = AdapterError::Fetch(FetchError::HttpStatus {
            status: 401,
            url: "u".into(),
            body: String::new(),
            headers: reqwest::header::HeaderMap::new(),
        });
        assert!(describe_search_failure(&unauthorized).contains("401"));
    }

    #[tokio::test]
    async fn anthropic_ranker_parses_fenced_reply() {
        let server = MockServer::start().await;
        let reply = "```json\n{\"matches\":[{\"repo\":\"a/b\",\"issue_number\":1,\"title\":\"Issue 1\",\"url\":\"https://github.com/a/b/issues/1\",\"match_reason\":\"Go CLI\",\"estimated_effort\":\"small\",\"labels\":[\"good first issue\"],\"created_at\":\"2025-01-20\"}]}\n```";
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": reply}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ranker = AnthropicRanker::with_config("key", DEFAULT_ANTHROPIC_MODEL, test_http_config())
            .unwrap()
            .with_endpoint(format!("{}/v1/messages", server.uri()));
        let issue: GitHubIssue = serde_json::from_value(api_issue("a/b", 1)).unwrap();
        let matches = ranker
            .rank(&profile(&["Go"]), &[issue.into_candidate()])
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].key(), "a/b/1");
        assert_eq!(matches[0].match_reason, "Go CLI");
    }

    #[tokio::test]
    async fn anthropic_ranker_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ranker = AnthropicRanker::with_config("key", DEFAULT_ANTHROPIC_MODEL, test_http_config())
            .unwrap()
            .with_endpoint(format!("{}/v1/messages", server.uri()));
        let issue: GitHubIssue = serde_json::from_value(api_issue("a/b", 1)).unwrap();
        let result = ranker.rank(&profile(&["Go"]), &[issue.into_candidate()]).await;
        assert!(matches!(
            result,
            Err(AdapterError::Fetch(FetchError::HttpStatus { status: 500, .. }))
        ));
    }

    #[tokio::test]
    async fn empty_candidate_list_skips_the_call() {
        let ranker = AnthropicRanker::with_config("key", DEFAULT_ANTHROPIC_MODEL, test_http_config())
            .unwrap()
            .with_endpoint("http://127.0.0.1:9/unreachable");
        assert!(ranker.rank(&profile(&["Go"]), &[]).await.unwrap().is_empty());
    }
}
