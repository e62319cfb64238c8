use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use jobwatch_core::JobKey;
use tracing::debug;

use crate::jobindex::{parse_detail_page, parse_listing_page, JOBINDEX_BASE_URL};
use crate::{AdapterError, DetailPage, DetailSource, ListingPage, ListingSource};

/// Listing pages saved to disk as `listing_page_{n}.html`.
///
/// A missing page file ends the sequence.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    source_id: String,
    dir: PathBuf,
}

impl FixtureListingSource {
    pub fn new(source_id: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            source_id: source_id.into(),
            dir,
        }
    }

    fn page_path(&self, page_no: u32) -> PathBuf {
        self.dir.join(format!("listing_page_{page_no}.html"))
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, page_no: u32) -> Result<ListingPage, AdapterError> {
        let path = self.page_path(page_no);
        let url = format!("file://{}", path.display());
        let html = match tokio::fs::read_to_string(&path).await {
            Ok(html) => html,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(page_no, path = %path.display(), "no fixture page; end of listing");
                return Ok(ListingPage {
                    page_no,
                    url,
                    listings: Vec::new(),
                    has_next: false,
                });
            }
            Err(err) => {
                return Err(AdapterError::Message(format!("reading {}: {err}", path.display())));
            }
        };

        let parsed = parse_listing_page(&html, JOBINDEX_BASE_URL, Utc::now().date_naive())?;
        let has_next = parsed.next_link || self.page_path(page_no + 1).exists();
        Ok(ListingPage {
            page_no,
            url,
            listings: parsed.listings,
            has_next,
        })
    }
}

/// Detail pages saved to disk as `detail_{key}.html`.
#[derive(Debug, Clone)]
pub struct FixtureDetailSource {
    dir: PathBuf,
}

impl FixtureDetailSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl DetailSource for FixtureDetailSource {
    async fn fetch_detail(&self, key: &JobKey, url: Option<&str>) -> Result<DetailPage, AdapterError> {
        let path = self.dir.join(format!("detail_{key}.html"));
        let html = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| AdapterError::NotFound(path.display().to_string()))?;
        let url = url
            .map(str::to_string)
            .unwrap_or_else(|| format!("{JOBINDEX_BASE_URL}/vis-job/{key}"));
        parse_detail_page(&html, JOBINDEX_BASE_URL, &url)
    }
}
