//! Page fetcher contracts + the Jobindex listing/detail adapters.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use jobwatch_core::{JobAttributes, JobKey, RawListing};
use jobwatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod dates;
mod fixture;
mod jobindex;

pub use dates::parse_listing_date;
pub use fixture::{FixtureDetailSource, FixtureListingSource};
pub use jobindex::{
    parse_detail_page, parse_listing_page, JobindexSource, ParsedListingPage, EXPIRED_MARKER, JOBINDEX_BASE_URL,
};

pub const CRATE_NAME: &str = "jobwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("page not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Message(String),
}

/// How a source is crawled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Live,
    Fixture,
}

/// One page of listing cards, in on-page order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub page_no: u32,
    pub url: String,
    pub listings: Vec<RawListing>,
    pub has_next: bool,
}

/// Detail page of a single listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailPage {
    pub url: String,
    pub attributes: JobAttributes,
    pub expired_marker: bool,
    pub body_is_empty: bool,
}

/// Restartable, finite sequence of listing pages. Pages are numbered from 1.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, page_no: u32) -> Result<ListingPage, AdapterError>;
}

#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_detail(&self, key: &JobKey, url: Option<&str>) -> Result<DetailPage, AdapterError>;
}

/// Outcome of checking a listing's own page for the expiry marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageVerdict {
    /// The page explicitly says the listing has expired.
    Expired,
    Live,
    /// Fetch failed or the page was empty; never grounds for deletion.
    Unknown,
}

impl PageVerdict {
    pub fn from_fetch(result: &Result<DetailPage, AdapterError>) -> Self {
        match result {
            Ok(page) if page.expired_marker => Self::Expired,
            Ok(page) if page.body_is_empty => Self::Unknown,
            Ok(_) => Self::Live,
            Err(_) => Self::Unknown,
        }
    }
}

/// Source registry entry, as read from `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

/// Listing and detail adapters for one configured source.
pub struct SourceAdapters {
    pub listing: Box<dyn ListingSource>,
    pub detail: Box<dyn DetailSource>,
}

pub fn adapters_for_source(
    config: &SourceConfig,
    http: Arc<HttpFetcher>,
    workspace_root: &std::path::Path,
) -> Result<SourceAdapters, AdapterError> {
    match config.mode {
        SourceMode::Live => {
            let search_url = config.search_url.clone().ok_or_else(|| {
                AdapterError::Message(format!("source {} is live but has no search_url", config.source_id))
            })?;
            let source = JobindexSource::new(&config.source_id, search_url, http);
            Ok(SourceAdapters {
                listing: Box::new(source.clone()),
                detail: Box::new(source),
            })
        }
        SourceMode::Fixture => {
            let dir = config
                .fixture_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("fixtures").join(&config.source_id));
            let dir = workspace_root.join(dir);
            Ok(SourceAdapters {
                listing: Box::new(FixtureListingSource::new(&config.source_id, dir.clone())),
                detail: Box::new(FixtureDetailSource::new(dir)),
            })
        }
    }
}
