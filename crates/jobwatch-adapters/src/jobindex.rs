use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use jobwatch_core::{fields, JobAttributes, JobKey, RawListing};
use jobwatch_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::{dates::parse_listing_date, AdapterError, DetailPage, DetailSource, ListingPage, ListingSource};

pub const JOBINDEX_BASE_URL: &str = "https://www.jobindex.dk";
pub const EXPIRED_MARKER: &str = "Annoncen er udløbet!";

const CARD_SELECTORS: [&str; 6] = [
    r#"[id^="jobad-wrapper-"]"#,
    ".job-listing",
    ".job-item",
    r#"[data-testid="job-listing"]"#,
    ".job-card",
    ".job-ad",
];
const LISTING_LINK: &str = r#"a[href*="/vis-job/"], a[href*="/job/"], a[href*="/jobannonce/"]"#;
const CARD_TITLE: &str = "h4 a, .job-title a, .title a";
const CARD_COMPANY: &str = ".jix-toolbar-top__company, .company, .employer, .job-company";
const CARD_LOCATION: &str = ".jix_robotjob--area, .location, .job-location, .place";
const CARD_DATE: &str = ".date, .job-date, .published";
const CARD_DESCRIPTION: &str = ".jix_robotjob--description, .description, .job-description, .summary, .job-summary";
const NEXT_PAGE: &str = r#"a[rel="next"], .jix_pagination a.next, a.page-link--next"#;

const DETAIL_TITLES: [&str; 3] = ["h1.sr-only", "h4 a", "h1"];
const DETAIL_COMPANY: &str = ".jix-toolbar-top__company";
const DETAIL_LOCATION: &str = ".jix_robotjob--area, .jobtext-jobad__location, .location";
const DETAIL_DESCRIPTION: &str = ".jobtext-jobad__body, .job-description, .jix_robotjob--description";
const COMPANY_FOR_CLIENT_SUFFIX: &str = " søger for kunde";
const TITLE_PREFIX: &str = "Jobannonce: ";

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    let text = normalize_whitespace(&el.text().collect::<String>());
    (!text.is_empty()).then_some(text)
}

fn first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).find_map(element_text))
}

fn first_attr(scope: ElementRef<'_>, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .find_map(|el| el.value().attr(attr))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string))
}

pub(crate) fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

/// Listing cards and pagination state parsed from one search result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedListingPage {
    pub listings: Vec<RawListing>,
    pub next_link: bool,
}

/// Parses a search result page into raw listing field maps, in on-page order.
///
/// The first card selector that matches anything wins. Cards are not filtered
/// here; key extraction decides which of them are usable.
pub fn parse_listing_page(html: &str, base_url: &str, today: NaiveDate) -> Result<ParsedListingPage, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut cards = Vec::new();
    for css in CARD_SELECTORS {
        let sel = selector(css)?;
        cards = root.select(&sel).collect::<Vec<_>>();
        if !cards.is_empty() {
            break;
        }
    }

    let mut listings = Vec::with_capacity(cards.len());
    for card in cards {
        let mut raw = RawListing::new();
        let el = card.value();
        if let Some(id) = el.attr("id") {
            raw.insert(fields::WRAPPER_ID, id);
        }
        for attr in [fields::DATA_JOBID, fields::DATA_ID] {
            if let Some(value) = el.attr(attr) {
                raw.insert(attr, value);
            }
        }
        if let Some(href) = first_attr(card, LISTING_LINK, "href")? {
            raw.insert(fields::JOB_URL, absolute_url(base_url, &href));
            raw.insert(fields::HREF, href);
        }
        if let Some(title) = first_text(card, CARD_TITLE)? {
            raw.insert(fields::TITLE, title);
        }
        if let Some(company) = first_text(card, CARD_COMPANY)? {
            raw.insert(fields::COMPANY, company);
        }
        if let Some(location) = first_text(card, CARD_LOCATION)? {
            raw.insert(fields::LOCATION, location);
        }
        if let Some(date) = first_text(card, CARD_DATE)?.and_then(|t| parse_listing_date(&t, today)) {
            raw.insert(fields::PUBLICATION_DATE, date.format("%Y-%m-%d").to_string());
        }
        if let Some(description) = first_text(card, CARD_DESCRIPTION)? {
            raw.insert(fields::DESCRIPTION, description);
        }
        listings.push(raw);
    }

    let next_link = first_attr(root, NEXT_PAGE, "href")?.is_some();
    Ok(ParsedListingPage { listings, next_link })
}

/// Parses a listing's own page: descriptive fields for backfill plus the expiry marker.
pub fn parse_detail_page(html: &str, base_url: &str, url: &str) -> Result<DetailPage, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let body_text = normalize_whitespace(&root.text().collect::<String>());

    let mut title = None;
    for css in DETAIL_TITLES {
        if let Some(found) = first_text(root, css)? {
            title = Some(found);
            break;
        }
    }
    if title.is_none() {
        title = first_text(root, "title")?
            .and_then(|t| t.split_once(" | Job").map(|(head, _)| head.trim().to_string()))
            .filter(|t| !t.is_empty());
    }
    let title = title.map(|t| t.strip_prefix(TITLE_PREFIX).map(str::to_string).unwrap_or(t));

    let company = first_text(root, DETAIL_COMPANY)?.map(|c| {
        c.strip_suffix(COMPANY_FOR_CLIENT_SUFFIX)
            .map(|s| s.trim().to_string())
            .unwrap_or(c)
    });
    let company_url = first_attr(root, &format!("{DETAIL_COMPANY} a"), "href")?.map(|href| absolute_url(base_url, &href));

    Ok(DetailPage {
        url: url.to_string(),
        attributes: JobAttributes {
            title,
            job_url: Some(url.to_string()),
            company: company.filter(|c| !c.is_empty()),
            company_url,
            location: first_text(root, DETAIL_LOCATION)?,
            publication_date: None,
            description: first_text(root, DETAIL_DESCRIPTION)?,
        },
        expired_marker: body_text.contains(EXPIRED_MARKER),
        body_is_empty: body_text.is_empty(),
    })
}

/// Live Jobindex search results, fetched over HTTP.
#[derive(Debug, Clone)]
pub struct JobindexSource {
    source_id: String,
    base_url: String,
    search_url: String,
    http: Arc<HttpFetcher>,
}

impl JobindexSource {
    pub fn new(source_id: impl Into<String>, search_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: JOBINDEX_BASE_URL.to_string(),
            search_url: search_url.into(),
            http,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn page_url(&self, page_no: u32) -> String {
        if page_no <= 1 {
            return self.search_url.clone();
        }
        let separator = if self.search_url.contains('?') { '&' } else { '?' };
        format!("{}{}page={}", self.search_url, separator, page_no)
    }

    pub fn detail_url(&self, key: &JobKey) -> String {
        format!("{}/vis-job/{}", self.base_url.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl ListingSource for JobindexSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, page_no: u32) -> Result<ListingPage, AdapterError> {
        let url = self.page_url(page_no);
        let response = self.http.fetch_bytes(&self.source_id, &url).await?;
        let parsed = parse_listing_page(&response.text(), &self.base_url, Utc::now().date_naive())?;
        debug!(page_no, cards = parsed.listings.len(), next = parsed.next_link, "parsed listing page");
        // No explicit next link: keep paging while cards keep coming.
        let has_next = parsed.next_link || !parsed.listings.is_empty();
        Ok(ListingPage {
            page_no,
            url: response.final_url,
            listings: parsed.listings,
            has_next,
        })
    }
}

#[async_trait]
impl DetailSource for JobindexSource {
    async fn fetch_detail(&self, key: &JobKey, url: Option<&str>) -> Result<DetailPage, AdapterError> {
        let url = url.map(str::to_string).unwrap_or_else(|| self.detail_url(key));
        let response = self.http.fetch_bytes(&self.source_id, &url).await?;
        parse_detail_page(&response.text(), &self.base_url, &response.final_url)
    }
}
