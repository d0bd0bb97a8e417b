//! Core domain model, issue identity, and the dedup/merge engine for issue-finder.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BODY_PREVIEW_CHARS: usize = 500;
pub const TRUNCATION_MARKER: &str = "... [truncated]";
pub const FOUND_AT_FORMAT: &str = "%Y-%m-%d %H:%M";
pub const MAX_EXPERIENCE_YEARS: i32 = 50;

/// Developer profile handed to the issue source and the ranker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Profile {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub skills: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub interests: Vec<String>,
    #[serde(default)]
    pub experience_years: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("no skills specified (use --skills or set profile.skills in the config file)")]
    NoSkills,
    #[error("experience years must be between 0 and 50, got {0}")]
    ExperienceOutOfRange(i32),
}

impl Profile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.skills.is_empty() {
            return Err(ProfileError::NoSkills);
        }
        if !(0..=MAX_EXPERIENCE_YEARS).contains(&self.experience_years) {
            return Err(ProfileError::ExperienceOutOfRange(self.experience_years));
        }
        Ok(())
    }
}

/// Composite identity of an issue across runs: `<repo>/<number>`.
///
/// Repository ids already contain a `/`; the key is only ever compared for
/// equality and never split back into parts.
pub fn issue_key(repo: &str, number: u64) -> String {
    format!("{repo}/{number}")
}

/// Issue fetched during the current run, not yet classified as new or seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateIssue {
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub body: String,
    pub created_at: NaiveDate,
}

impl CandidateIssue {
    pub fn key(&self) -> String {
        issue_key(&self.repo, self.number)
    }
}

/// Caps an issue body at [`BODY_PREVIEW_CHARS`] characters, appending the
/// truncation marker when anything was cut.
pub fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(BODY_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &body[..cut]),
        None => body.to_string(),
    }
}

/// Ranked match as persisted in the state file.
///
/// Everything but the identity is defaulted on read: ranker output is
/// untrusted and `estimated_effort` is passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueMatch {
    pub repo: String,
    pub issue_number: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub match_reason: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub estimated_effort: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub found_at: String,
}

impl IssueMatch {
    pub fn key(&self) -> String {
        issue_key(&self.repo, self.issue_number)
    }
}

/// Durable record of processed issue identities and retained match history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct State {
    #[serde(default, with = "rfc3339_or_empty")]
    pub last_run: Option<DateTime<FixedOffset>>,
    #[serde(default, with = "processed_set")]
    pub processed_issues: HashSet<String>,
    /// Newest first.
    #[serde(default, deserialize_with = "null_as_default")]
    pub all_matches: Vec<IssueMatch>,
}

impl State {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.processed_issues.contains(key)
    }

    pub fn processed_count(&self) -> usize {
        self.processed_issues.len()
    }

    pub fn match_count(&self) -> usize {
        self.all_matches.len()
    }

    /// First `limit` matches in stored (newest first) order.
    pub fn recent_matches(&self, limit: usize) -> &[IssueMatch] {
        &self.all_matches[..limit.min(self.all_matches.len())]
    }
}

/// Splits `candidates` into the ones never seen before, in input order, and
/// marks each of them processed as it is classified.
///
/// Marking happens before any ranking, so an issue whose ranking fails is not
/// retried on the next run. Calling this once per incoming batch is equivalent
/// to calling it on the concatenation.
pub fn filter_new_issues(state: &mut State, candidates: Vec<CandidateIssue>) -> Vec<CandidateIssue> {
    candidates
        .into_iter()
        .filter(|candidate| state.processed_issues.insert(candidate.key()))
        .collect()
}

/// Prepends `matches` to the history, stamping them with the current local
/// minute, then keeps only the first `max_matches` entries.
pub fn add_matches(state: &mut State, matches: Vec<IssueMatch>, max_matches: usize) {
    add_matches_at(state, matches, max_matches, Local::now().naive_local());
}

/// [`add_matches`] with an explicit merge timestamp.
///
/// Only the incoming matches are stamped; entries already in the history keep
/// the `found_at` they were merged with. A cap of zero retains nothing.
pub fn add_matches_at(
    state: &mut State,
    matches: Vec<IssueMatch>,
    max_matches: usize,
    found_at: NaiveDateTime,
) {
    let stamp = found_at.format(FOUND_AT_FORMAT).to_string();
    let mut merged = Vec::with_capacity(matches.len() + state.all_matches.len());
    merged.extend(matches.into_iter().map(|mut m| {
        m.found_at = stamp.clone();
        m
    }));
    merged.append(&mut state.all_matches);
    merged.truncate(max_matches);
    state.all_matches = merged;
}

/// Reads an explicit `null` as the type's default, the same as a missing key.
///
/// Other writers of the state file, and ranker replies, emit `null` for empty
/// lists and strings.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The processed set is stored as `{"<key>": true}` for portability.
mod processed_set {
    use std::collections::{BTreeMap, HashMap, HashSet};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(set: &HashSet<String>, serializer: S) -> Result<S::Ok, S::Error> {
        let sorted: BTreeMap<&str, bool> = set.iter().map(|key| (key.as_str(), true)).collect();
        sorted.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HashSet<String>, D::Error> {
        let map = Option::<HashMap<String, bool>>::deserialize(deserializer)?.unwrap_or_default();
        Ok(map
            .into_iter()
            .filter_map(|(key, seen)| seen.then_some(key))
            .collect())
    }
}

mod rfc3339_or_empty {
    use chrono::{DateTime, FixedOffset};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<FixedOffset>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_str(""),
        }
    }

    // Unparseable stamps read as absent rather than invalidating the history.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<FixedOffset>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok()))
    }
}
