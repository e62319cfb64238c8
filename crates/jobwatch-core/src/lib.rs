//! Core domain model for jobwatch: raw listings, identity keys, lifecycle and annotations.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod region;

pub use region::{city_tokens, Region, RegionLookup, UnknownRegion};

pub const CRATE_NAME: &str = "jobwatch-core";

/// Field names a page fetcher may populate on a [`RawListing`].
pub mod fields {
    pub const JOB_ID: &str = "job_id";
    pub const WRAPPER_ID: &str = "wrapper_id";
    pub const DATA_JOBID: &str = "data-jobid";
    pub const DATA_ID: &str = "data-id";
    pub const HREF: &str = "href";
    pub const TITLE: &str = "title";
    pub const JOB_URL: &str = "job_url";
    pub const COMPANY: &str = "company";
    pub const COMPANY_URL: &str = "company_url";
    pub const LOCATION: &str = "location";
    pub const PUBLICATION_DATE: &str = "publication_date";
    pub const DESCRIPTION: &str = "description";
}

const WRAPPER_ID_PREFIX: &str = "jobad-wrapper-";
const LISTING_LINK_MARKERS: [&str; 3] = ["/vis-job/", "/job/", "/jobannonce/"];

/// Stable identity of a listing, as extracted from the source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("listing carries no identity field (job_id, wrapper id, data attribute or listing link)")]
    Missing,
    #[error("listing identity field is empty")]
    Empty,
}

/// Untyped field mapping handed over by a page fetcher, one per listing card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl RawListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Stores a value unless it is blank.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            self.fields.insert(name.to_string(), trimmed.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Derives the identity key of a raw listing.
///
/// Sources are tried in a fixed order so the same card yields the same key on
/// every run: explicit `job_id`, the `jobad-wrapper-` element id, the
/// `data-jobid` / `data-id` attributes, then the last digit-bearing path
/// segment of the listing link.
pub fn extract_key(raw: &RawListing) -> Result<JobKey, KeyError> {
    if let Some(id) = raw.get(fields::JOB_ID) {
        return JobKey::new(id);
    }

    if let Some(wrapper) = raw.get(fields::WRAPPER_ID) {
        if let Some(id) = wrapper.strip_prefix(WRAPPER_ID_PREFIX) {
            if !id.trim().is_empty() {
                return JobKey::new(id);
            }
        }
    }

    for attr in [fields::DATA_JOBID, fields::DATA_ID] {
        if let Some(id) = raw.get(attr) {
            return JobKey::new(id);
        }
    }

    if let Some(href) = raw.get(fields::HREF) {
        if let Some(id) = key_from_listing_link(href) {
            return JobKey::new(id);
        }
    }

    Err(KeyError::Missing)
}

fn key_from_listing_link(href: &str) -> Option<String> {
    if !LISTING_LINK_MARKERS.iter().any(|m| href.contains(m)) {
        return None;
    }
    let path = href.split(['?', '#']).next().unwrap_or(href);
    path.split('/')
        .filter(|segment| !segment.is_empty() && segment.chars().any(|c| c.is_ascii_digit()))
        .last()
        .map(str::to_string)
}

/// Descriptive fields of a listing. Every field is optional so enrichment can backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttributes {
    pub title: Option<String>,
    pub job_url: Option<String>,
    pub company: Option<String>,
    pub company_url: Option<String>,
    pub location: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub description: Option<String>,
}

impl JobAttributes {
    pub const BACKFILLABLE: [&'static str; 5] = [
        fields::TITLE,
        fields::COMPANY,
        fields::COMPANY_URL,
        fields::LOCATION,
        fields::DESCRIPTION,
    ];

    pub fn from_raw(raw: &RawListing) -> Self {
        Self {
            title: raw.get(fields::TITLE).map(str::to_string),
            job_url: raw.get(fields::JOB_URL).map(str::to_string),
            company: raw.get(fields::COMPANY).map(str::to_string),
            company_url: raw.get(fields::COMPANY_URL).map(str::to_string),
            location: raw.get(fields::LOCATION).map(str::to_string),
            publication_date: raw
                .get(fields::PUBLICATION_DATE)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            description: raw.get(fields::DESCRIPTION).map(str::to_string),
        }
    }

    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            fields::TITLE => Some(&mut self.title),
            fields::COMPANY => Some(&mut self.company),
            fields::COMPANY_URL => Some(&mut self.company_url),
            fields::LOCATION => Some(&mut self.location),
            fields::DESCRIPTION => Some(&mut self.description),
            _ => None,
        }
    }

    fn value(&self, name: &str) -> Option<&str> {
        match name {
            fields::TITLE => self.title.as_deref(),
            fields::COMPANY => self.company.as_deref(),
            fields::COMPANY_URL => self.company_url.as_deref(),
            fields::LOCATION => self.location.as_deref(),
            fields::DESCRIPTION => self.description.as_deref(),
            _ => None,
        }
    }

    /// Backfillable fields that are absent or blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        Self::BACKFILLABLE
            .into_iter()
            .filter(|name| is_blank(self.value(name)))
            .collect()
    }

    /// Copies values from `scraped` into fields that are currently blank.
    /// Existing values are never overwritten. Returns the names filled.
    pub fn fill_missing_from(&mut self, scraped: &JobAttributes) -> Vec<&'static str> {
        let mut filled = Vec::new();
        for name in Self::BACKFILLABLE {
            let Some(incoming) = scraped.value(name).map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            let incoming = incoming.to_string();
            if let Some(slot) = self.slot(name) {
                if is_blank(slot.as_deref()) {
                    *slot = Some(incoming);
                    filled.push(name);
                }
            }
        }
        filled
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

/// Soft-delete state of a stored record. Persisted as a nullable `deleted_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Deleted { at: DateTime<Utc> },
}

impl Lifecycle {
    pub fn from_deleted_at(deleted_at: Option<DateTime<Utc>>) -> Self {
        match deleted_at {
            Some(at) => Self::Deleted { at },
            None => Self::Active,
        }
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Active => None,
            Self::Deleted { at } => Some(*at),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("score {0} is outside 0..=3")]
    OutOfRange(i64),
    #[error("could not read a score from reply {0:?}")]
    Unparsable(String),
}

/// AI-derived relevance classification, always within `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct RelevanceScore(u8);

impl RelevanceScore {
    pub const MAX: u8 = 3;
    /// Lowest score worth embedding.
    pub const RELEVANT: Self = Self(1);

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_relevant(self) -> bool {
        self >= Self::RELEVANT
    }

    /// Parses a model reply that should consist of a single digit.
    pub fn parse_reply(reply: &str) -> Result<Self, ScoreError> {
        let cleaned = reply.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim_end_matches('.');
        let parsed: i64 = cleaned
            .trim()
            .parse()
            .map_err(|_| ScoreError::Unparsable(reply.trim().to_string()))?;
        Self::try_from(parsed)
    }
}

impl TryFrom<i64> for RelevanceScore {
    type Error = ScoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (0..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(ScoreError::OutOfRange(value))
        }
    }
}

impl From<RelevanceScore> for i64 {
    fn from(score: RelevanceScore) -> Self {
        i64::from(score.0)
    }
}

impl fmt::Display for RelevanceScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbeddingError {
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding contains a non-finite component")]
    NonFinite,
}

/// Fixed-length semantic vector used for similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>, expected_dims: usize) -> Result<Self, EmbeddingError> {
        if values.len() != expected_dims {
            return Err(EmbeddingError::Dimension {
                expected: expected_dims,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }
}

/// Record handed to the store for first insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub key: JobKey,
    pub attributes: JobAttributes,
}

/// Persisted job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub attributes: JobAttributes,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub lifecycle: Lifecycle,
    pub relevance_score: Option<RelevanceScore>,
    pub scored_at: Option<DateTime<Utc>>,
    pub embedding: Option<Embedding>,
    pub embedded_at: Option<DateTime<Utc>>,
    pub region: Option<Region>,
}

impl JobRecord {
    pub fn new(job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            key: job.key,
            attributes: job.attributes,
            created_at: now,
            last_seen: Some(now),
            lifecycle: Lifecycle::Active,
            relevance_score: None,
            scored_at: None,
            embedding: None,
            embedded_at: None,
            region: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Timestamp staleness is judged by: `last_seen`, or `created_at` if never re-observed.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(self.created_at)
    }
}
